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

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};

use crate::auth::{AuthGate, Credential};
use crate::channel::{ChannelKind, Target};
use crate::connection::{BindOutcome, ChannelSink, Connection, EnvUpdate};
use crate::endpoint::Endpoint;
use crate::{CloseReason, Error};

/// Closes SSH channels on behalf of finished channel tasks.
#[derive(Clone)]
pub struct HandleSink(pub Handle);

impl ChannelSink for HandleSink {
    type Id = ChannelId;

    fn close(&self, id: ChannelId, _reason: &CloseReason) -> impl Future<Output = ()> + Send {
        let handle = self.0.clone();
        async move {
            if handle.close(id).await.is_err() {
                // The session is gone, so is the channel.
                debug!("channel {id:?}: session already closed");
            }
        }
    }
}

/// The russh handler of one client connection.
pub struct GatewayHandler {
    peer: SocketAddr,
    gate: Arc<AuthGate>,
    connection: Connection<HandleSink>,
    user: Option<String>,
}

impl GatewayHandler {
    pub fn new(peer: SocketAddr, gate: Arc<AuthGate>, connection: Connection<HandleSink>) -> Self {
        GatewayHandler {
            peer,
            gate,
            connection,
            user: None,
        }
    }

    fn check(&mut self, user: &str, credential: Credential<'_>) -> Auth {
        match self.gate.authenticate(user, credential) {
            Ok(()) => {
                self.user = Some(user.to_string());
                Auth::Accept
            }
            Err(e) => {
                info!("{}: {e} for {user:?}", self.peer);
                Auth::Reject {
                    proceed_with_methods: Some(MethodSet::from(&[MethodKind::Password][..])),
                    partial_success: false,
                }
            }
        }
    }

    /// Direct-tcpip opens wait here for the outbound connect, so that a
    /// refused target is reported as a failed channel open.
    async fn open(
        &mut self,
        channel: Channel<Msg>,
        kind: ChannelKind,
        session: &mut Session,
    ) -> bool {
        let id = channel.id();
        let name = kind.name();
        let sink = HandleSink(session.handle());
        let endpoint = Endpoint::from_stream(channel.into_stream());
        match self.connection.open(id, kind, endpoint, sink).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: refusing {name} channel {id:?}: {e}", self.peer);
                false
            }
        }
    }

    fn bind(&mut self, channel: ChannelId, session: &mut Session) {
        match self.connection.exec(channel) {
            Ok(BindOutcome::Bound) => {
                let _ = session.channel_success(channel);
            }
            Ok(BindOutcome::AlreadyBound) => {
                debug!("channel {channel:?}: already bound");
                let _ = session.channel_failure(channel);
            }
            Err(e) => {
                warn!("{}: channel {channel:?}: {e}", self.peer);
                let _ = session.channel_failure(channel);
                let _ = session.close(channel);
            }
        }
    }
}

impl russh::server::Handler for GatewayHandler {
    type Error = Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        Ok(self.check(user, Credential::None))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(self.check(user, Credential::Password(password)))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open(channel, ChannelKind::Session, session).await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            "{}: direct-tcpip to {host_to_connect}:{port_to_connect} from {originator_address}:{originator_port}",
            self.peer
        );
        let target = Target {
            host: host_to_connect.to_string(),
            port: port_to_connect,
        };
        Ok(self
            .open(channel, ChannelKind::DirectTcpip(target), session)
            .await)
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .open(channel, ChannelKind::ForwardedTcpip, session)
            .await)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self
            .connection
            .set_env(channel, variable_name, variable_value)
        {
            Ok(EnvUpdate::Recorded) => {
                let _ = session.channel_success(channel);
            }
            Ok(EnvUpdate::Ignored) | Err(_) => {
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // The console is fixed, so the command line is only logged.
        debug!(
            "channel {channel:?}: exec {:?}",
            String::from_utf8_lossy(data)
        );
        self.bind(channel, session);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.bind(channel, session);
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "channel {channel:?}: dropping {} bytes of extended data ({code})",
            data.len()
        );
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.connection.close(channel, CloseReason::PeerClosed);
        Ok(())
    }
}

impl Drop for GatewayHandler {
    fn drop(&mut self) {
        debug!(
            "{}: handler dropped (user {:?}, {} channel(s) left)",
            self.peer,
            self.user,
            self.connection.active_channels()
        );
    }
}
