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

//! Accepting SSH connections and wiring them to a [Connection].
//!
//! ```no_run
//! use std::sync::Arc;
//! use sshgate::server::{load_host_key, ssh_config, Gateway};
//! use sshgate::{AuthGate, CommandConsole, Config};
//!
//! # async fn run() -> Result<(), sshgate::Error> {
//! let key = load_host_key(None)?;
//! let gateway = Gateway::new(
//!     ssh_config(key),
//!     Config::default(),
//!     AuthGate::new(Some("alice".into()), Some("s3cret".into())),
//!     Arc::new(CommandConsole::new("/bin/sh")),
//! );
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:2222").await?;
//! gateway.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use russh::keys::ssh_key::{Algorithm, PrivateKey};
use russh::{MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};

use crate::auth::AuthGate;
use crate::connection::Connection;
use crate::console::Console;
use crate::{Config, Error};

mod handler;
pub use handler::{GatewayHandler, HandleSink};

/// A russh server configuration offering password authentication
/// with the given host key.
pub fn ssh_config(host_key: PrivateKey) -> russh::server::Config {
    russh::server::Config {
        methods: MethodSet::from(&[MethodKind::Password][..]),
        keys: vec![host_key],
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    }
}

/// Load the host key from `path`, or generate a fresh Ed25519 key.
///
/// A generated key lives only as long as the process, so clients will
/// see a different host identity after every restart.
pub fn load_host_key(path: Option<&Path>) -> Result<PrivateKey, Error> {
    match path {
        Some(path) => {
            info!("loading host key from {}", path.display());
            russh::keys::load_secret_key(path, None)
                .map_err(|e| Error::HostKey(format!("{}: {e}", path.display())))
        }
        None => {
            info!("generating an ephemeral Ed25519 host key");
            PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519)
                .map_err(|e| Error::HostKey(e.to_string()))
        }
    }
}

/// Accepts connections and supervises one [Connection] per client.
#[derive(Clone)]
pub struct Gateway {
    ssh: Arc<russh::server::Config>,
    config: Arc<Config>,
    gate: Arc<AuthGate>,
    console: Arc<dyn Console>,
}

impl Gateway {
    pub fn new(
        ssh: russh::server::Config,
        config: Config,
        gate: AuthGate,
        console: Arc<dyn Console>,
    ) -> Self {
        Gateway {
            ssh: Arc::new(ssh),
            config: Arc::new(config),
            gate: Arc::new(gate),
            console,
        }
    }

    /// Accept connections until the listener fails. Each connection is
    /// served by its own task.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        if let Ok(addr) = listener.local_addr() {
            info!("listening on {addr}");
        }
        loop {
            let (stream, peer) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("could not set TCP_NODELAY for {peer}: {e}");
            }
            let this = self.clone();
            tokio::spawn(async move { this.supervise(stream, peer).await });
        }
    }

    /// Run one SSH connection to completion, then tear down every
    /// channel it still has.
    pub async fn supervise(&self, stream: TcpStream, peer: SocketAddr) {
        info!("connection from {peer}");
        let connection = Connection::new(self.config.clone(), self.console.clone());
        let handler = GatewayHandler::new(peer, self.gate.clone(), connection.clone());

        match russh::server::run_stream(self.ssh.clone(), stream, handler).await {
            Ok(session) => {
                if let Err(e) = session.await {
                    error!("connection from {peer} failed: {e}");
                }
            }
            Err(e) => error!("handshake with {peer} failed: {e}"),
        }

        let released = connection.shutdown().await;
        info!("connection from {peer} closed, {released} channel(s) released");
    }
}
