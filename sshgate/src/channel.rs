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

//! Per-channel state kept by a [Connection](crate::Connection).

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::{CloseReason, Endpoint};

/// Where a direct-tcpip channel wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u32,
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The type a channel was opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    DirectTcpip(Target),
    ForwardedTcpip,
}

impl ChannelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip(_) => "direct-tcpip",
            ChannelKind::ForwardedTcpip => "forwarded-tcpip",
        }
    }
}

/// Environment variables requested for one channel. Last write wins.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Lifecycle of a channel. A channel leaves the table when it closes,
/// so there is no closed phase.
pub(crate) enum Phase<S> {
    /// A session channel waiting for `exec` or `shell`.
    Open { endpoint: Endpoint, sink: S },
    /// A task owns the channel's splice (or its outbound connect).
    Bound {
        cancel: oneshot::Sender<CloseReason>,
        task: JoinHandle<()>,
    },
}

pub(crate) struct ChannelState<S> {
    /// Distinguishes this channel from an earlier one with the same id.
    pub(crate) serial: u64,
    pub(crate) kind: ChannelKind,
    pub(crate) env: Environment,
    pub(crate) phase: Phase<S>,
}

impl<S> ChannelState<S> {
    pub(crate) fn new(serial: u64, kind: ChannelKind, phase: Phase<S>) -> Self {
        ChannelState {
            serial,
            kind,
            env: Environment::new(),
            phase,
        }
    }

    pub(crate) fn is_bound(&self) -> bool {
        matches!(self.phase, Phase::Bound { .. })
    }

    /// Stop whatever runs for this channel.
    pub(crate) fn cancel(self, reason: CloseReason) -> Teardown<S> {
        match self.phase {
            Phase::Open { sink, .. } => Teardown::Unbound(sink),
            Phase::Bound { cancel, task } => {
                let _ = cancel.send(reason);
                Teardown::Running(task)
            }
        }
    }
}

/// What is left to wait for after a channel was cancelled.
pub(crate) enum Teardown<S> {
    /// Nothing was attached. The sink has not been told yet.
    Unbound(S),
    /// The task will report the close to its sink once the backend is
    /// released.
    Running(JoinHandle<()>),
}
