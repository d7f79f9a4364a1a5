// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The channel table of one SSH connection.
//!
//! A [Connection] is driven by the SSH handler through one method per
//! channel event (`open`, `set_env`, `exec`, `close`) and by the
//! connection supervisor through [Connection::shutdown]. Apart from the
//! outbound connect of a direct-tcpip open, which is bounded by
//! [Config::connect_timeout], none of the event methods wait on I/O.
//! Byte movement runs in a task per bound channel, which reports the
//! channel's close to a [ChannelSink] when it ends.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::channel::{ChannelKind, ChannelState, Phase, Teardown};
use crate::console::Console;
use crate::endpoint::Endpoint;
use crate::router::{route, Binding};
use crate::{bridge, connector, CloseReason, Config, Error};

/// Where channel closes are reported.
///
/// The server implementation closes the SSH channel. Closing an
/// already closed channel must be harmless.
pub trait ChannelSink: Clone + Send + Sync + 'static {
    type Id: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn close(&self, id: Self::Id, reason: &CloseReason) -> impl Future<Output = ()> + Send;
}

/// Result of a bind request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The channel is now spliced to a fresh backend.
    Bound,
    /// The channel was already bound. Nothing changed.
    AlreadyBound,
}

/// Result of an environment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvUpdate {
    /// The variable will be passed to the console when the channel binds.
    Recorded,
    /// The channel is already bound, or is not a session.
    Ignored,
}

pub struct Connection<S: ChannelSink> {
    shared: Arc<Shared<S>>,
}

impl<S: ChannelSink> Clone for Connection<S> {
    fn clone(&self) -> Self {
        Connection {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<S: ChannelSink> {
    config: Arc<Config>,
    console: Arc<dyn Console>,
    table: Mutex<Table<S>>,
}

struct Table<S: ChannelSink> {
    entries: HashMap<S::Id, ChannelState<S>>,
    next_serial: u64,
    closed: bool,
}

impl<S: ChannelSink> Table<S> {
    /// Whether a new entry may be inserted under `id`.
    fn admit(&self, id: &S::Id) -> Result<(), Error> {
        if self.closed {
            Err(Error::ConnectionClosed)
        } else if self.entries.contains_key(id) {
            Err(Error::ChannelInUse)
        } else {
            Ok(())
        }
    }
}

impl<S: ChannelSink> Shared<S> {
    fn lock(&self) -> MutexGuard<'_, Table<S>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget a channel whose task has ended, unless the entry has been
    /// replaced in the meantime.
    fn release(&self, id: S::Id, serial: u64) -> bool {
        let mut table = self.lock();
        if table.entries.get(&id).map(|s| s.serial) == Some(serial) {
            table.entries.remove(&id);
            true
        } else {
            false
        }
    }
}

impl<S: ChannelSink> Connection<S> {
    pub fn new(config: Arc<Config>, console: Arc<dyn Console>) -> Self {
        Connection {
            shared: Arc::new(Shared {
                config,
                console,
                table: Mutex::new(Table {
                    entries: HashMap::new(),
                    next_serial: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Accept or refuse a channel open.
    ///
    /// Session channels wait for [exec](Self::exec). Direct-tcpip
    /// channels are connected before this returns, so an unreachable
    /// target refuses the open with `ConnectFailed`. On error the
    /// endpoint is dropped and the table is unchanged.
    pub async fn open(
        &self,
        id: S::Id,
        kind: ChannelKind,
        endpoint: Endpoint,
        sink: S,
    ) -> Result<(), Error> {
        let binding = route(&kind)?;
        self.shared.lock().admit(&id)?;

        let dialed = match binding {
            Binding::ExecBridge => None,
            Binding::Connector(target) => {
                debug!("channel {id:?}: connecting to {target}");
                let stream = connector::dial(&target, self.shared.config.connect_timeout)
                    .await
                    .map_err(|e| {
                        info!("channel {id:?}: {e}");
                        e
                    })?;
                info!("channel {id:?}: connected to {target}");
                Some(stream)
            }
        };

        let mut table = self.shared.lock();
        table.admit(&id)?;
        let serial = table.next_serial;
        table.next_serial += 1;

        let phase = match dialed {
            None => Phase::Open { endpoint, sink },
            Some(stream) => {
                let (cancel, rx) = oneshot::channel();
                let work = connector::forward(
                    stream,
                    endpoint,
                    self.shared.config.splice.clone(),
                    cancelled(rx),
                );
                // Spawned under the lock so that the task cannot release
                // the entry before it is inserted.
                let task = self.spawn(id, serial, sink, work);
                Phase::Bound { cancel, task }
            }
        };
        info!("channel {id:?}: opened {}", kind.name());
        table
            .entries
            .insert(id, ChannelState::new(serial, kind, phase));
        Ok(())
    }

    /// Record an environment variable for a session that is not bound yet.
    pub fn set_env(&self, id: S::Id, name: &str, value: &str) -> Result<EnvUpdate, Error> {
        let mut table = self.shared.lock();
        let state = table.entries.get_mut(&id).ok_or(Error::UnknownChannel)?;
        if state.is_bound() || state.kind != ChannelKind::Session {
            debug!("channel {id:?}: ignoring {name}");
            return Ok(EnvUpdate::Ignored);
        }
        state.env.set(name, value);
        Ok(EnvUpdate::Recorded)
    }

    /// Bind a session channel to a fresh console.
    ///
    /// A second request on the same channel changes nothing. If the
    /// console cannot be started the channel is dropped from the table
    /// and the caller is expected to close it.
    pub fn exec(&self, id: S::Id) -> Result<BindOutcome, Error> {
        let (serial, kind, env, endpoint, sink) = {
            let mut table = self.shared.lock();
            let state = table.entries.remove(&id).ok_or(Error::UnknownChannel)?;
            let ChannelState {
                serial,
                kind,
                env,
                phase,
            } = state;
            match phase {
                Phase::Open { endpoint, sink } => (serial, kind, env, endpoint, sink),
                phase => {
                    table.entries.insert(
                        id,
                        ChannelState {
                            serial,
                            kind,
                            env,
                            phase,
                        },
                    );
                    return Ok(BindOutcome::AlreadyBound);
                }
            }
        };

        let splice = bridge::attach(
            self.shared.console.as_ref(),
            &env,
            endpoint,
            self.shared.config.splice.clone(),
        )
        .map_err(|e| {
            warn!("channel {id:?}: {e}");
            e
        })?;

        let mut table = self.shared.lock();
        table.admit(&id)?;
        let (cancel, rx) = oneshot::channel();
        let task = self.spawn(id, serial, sink, bridge::run(splice, cancelled(rx)));
        let mut state = ChannelState::new(serial, kind, Phase::Bound { cancel, task });
        state.env = env;
        table.entries.insert(id, state);
        info!("channel {id:?}: bound to console");
        Ok(BindOutcome::Bound)
    }

    /// Tear down one channel. Returns `false` if it was not open.
    ///
    /// With [CloseReason::PeerClosed] the channel task still delivers
    /// what the client sent before closing. Any other reason cuts both
    /// directions.
    pub fn close(&self, id: S::Id, reason: CloseReason) -> bool {
        let state = self.shared.lock().entries.remove(&id);
        match state {
            Some(state) => {
                debug!("channel {id:?}: closing ({reason})");
                drop(state.cancel(reason));
                true
            }
            None => false,
        }
    }

    /// Close every channel with [CloseReason::ConnectionClosed] and wait
    /// until all backends are released. Later opens are refused.
    ///
    /// Returns the number of channels that were torn down.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<_> = {
            let mut table = self.shared.lock();
            table.closed = true;
            table.entries.drain().collect()
        };
        let count = drained.len();

        let mut tasks = Vec::new();
        let mut unbound = Vec::new();
        for (id, state) in drained {
            match state.cancel(CloseReason::ConnectionClosed) {
                Teardown::Running(task) => tasks.push(task),
                Teardown::Unbound(sink) => unbound.push((id, sink)),
            }
        }
        let reason = CloseReason::ConnectionClosed;
        futures::future::join_all(unbound.iter().map(|(id, sink)| sink.close(*id, &reason)))
            .await;
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("channel task failed: {e}");
            }
        }
        if count > 0 {
            info!("tore down {count} channel(s)");
        }
        count
    }

    pub fn active_channels(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    fn spawn<W>(&self, id: S::Id, serial: u64, sink: S, work: W) -> JoinHandle<()>
    where
        W: Future<Output = CloseReason> + Send + 'static,
    {
        let shared: Weak<Shared<S>> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let reason = work.await;
            if let Some(shared) = shared.upgrade() {
                shared.release(id, serial);
            }
            if reason.is_clean() {
                info!("channel {id:?}: {reason}");
            } else {
                warn!("channel {id:?}: {reason}");
            }
            sink.close(id, &reason).await;
        })
    }
}

async fn cancelled(rx: oneshot::Receiver<CloseReason>) -> CloseReason {
    rx.await.unwrap_or(CloseReason::ConnectionClosed)
}
