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

#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! An SSH gateway built on russh.
//!
//! One authenticated SSH connection carries any number of channels,
//! and each of them ends up spliced to one of two kinds of backend:
//!
//! * *session* channels (`exec` / `shell`) are joined to the console
//!   of a hosted process, i.e. a pair of pipes supplied by a
//!   [Console](console::Console);
//! * *direct-tcpip* channels are joined to a fresh outbound TCP
//!   connection to the host and port named by the client.
//!
//! *forwarded-tcpip* channels are refused.
//!
//! # Layout
//!
//! The SSH protocol itself is entirely russh's business. The
//! [server] module glues a russh [Handler](russh::server::Handler) to
//! a [Connection], which holds the table of live channels and exposes
//! one dispatch method per channel event. Byte movement happens in
//! [Splice], which runs in its own task per bound channel.
//!
//! # Closing
//!
//! Every channel close carries a [CloseReason]. When one direction of
//! a splice ends, the destination of that direction is half-closed
//! and the other direction keeps flowing. A hosted process that exits
//! closes its channel once its output is drained. When the SSH
//! transport goes away, [Connection::shutdown] cancels every splice and
//! waits for the backends to be released.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use thiserror::Error;


pub mod auth;
mod bridge;
pub mod channel;
pub mod connection;
mod connector;
pub mod console;
pub mod endpoint;
mod router;
pub mod server;
pub mod splice;

pub use auth::{AuthGate, Credential};
pub use channel::{ChannelKind, Environment, Target};
pub use connection::{BindOutcome, ChannelSink, Connection, EnvUpdate};
pub use console::{CommandConsole, Console};
pub use endpoint::Endpoint;
pub use router::{route, Binding};
pub use splice::{Splice, SpliceConfig, SpliceReport, StreamEnd, Transfer};

#[derive(Debug, Error)]
pub enum Error {
    /// The credentials did not match the configured username or password.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The client asked for a channel type this gateway does not serve.
    #[error("Unsupported channel type")]
    UnsupportedChannelType,

    /// The hosted process console could not be started.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(#[source] std::io::Error),

    /// The outbound TCP connection for a direct-tcpip channel failed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// A stream ended on an I/O error instead of a clean EOF.
    #[error("Stream truncated: {0}")]
    TruncatedStream(#[source] std::io::Error),

    /// No channel with this id is known to the connection.
    #[error("Unknown channel")]
    UnknownChannel,

    /// A channel with this id is already open.
    #[error("Channel id already in use")]
    ChannelInUse,

    /// The connection is being torn down.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Host key error: {0}")]
    HostKey(String),

    /// Fault in the underlying SSH transport.
    #[error(transparent)]
    Transport(#[from] russh::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a channel was closed.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// The remote side closed, or both directions reached a clean EOF.
    PeerClosed,
    /// The connection owning the channel went away.
    ConnectionClosed,
    /// The channel failed.
    Failed(Arc<Error>),
}

impl CloseReason {
    pub fn failed(error: Error) -> Self {
        CloseReason::Failed(Arc::new(error))
    }

    /// The error behind this close, if it was not a clean one.
    pub fn error(&self) -> Option<&Error> {
        match self {
            CloseReason::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_clean(&self) -> bool {
        !matches!(self, CloseReason::Failed(_))
    }
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::ConnectionClosed => write!(f, "connection closed"),
            CloseReason::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Gateway behaviour shared by every connection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on an outbound connect for direct-tcpip channels.
    pub connect_timeout: std::time::Duration,
    /// Copy loop settings.
    pub splice: SpliceConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            connect_timeout: std::time::Duration::from_secs(10),
            splice: SpliceConfig::default(),
        }
    }
}
