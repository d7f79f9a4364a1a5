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

//! Serve a program's console over SSH:
//!
//! sshgate --port 2222 --username alice --password s3cret -- /bin/sh -i

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use sshgate::server::{load_host_key, ssh_config, Gateway};
use sshgate::{AuthGate, CommandConsole, Config, SpliceConfig};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if cli.username.is_none() && cli.password.is_none() {
        warn!("no --username or --password given, every client will be let in");
    }

    let host_key = load_host_key(cli.host_key.as_deref())?;
    let config = Config {
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        splice: SpliceConfig {
            half_close_linger: cli.half_close_linger.map(Duration::from_secs),
            ..Default::default()
        },
    };
    let console = CommandConsole::new(&cli.program).args(&cli.args);
    let gateway = Gateway::new(
        ssh_config(host_key),
        config,
        AuthGate::new(cli.username, cli.password),
        Arc::new(console),
    );

    info!("starting on {}:{}", cli.ip, cli.port);
    let listener = tokio::net::TcpListener::bind((cli.ip.as_str(), cli.port)).await?;
    tokio::select! {
        res = gateway.serve(listener) => res?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, stopping"),
    }
    Ok(())
}

#[derive(clap::Parser)]
#[clap(trailing_var_arg = true)]
pub struct Cli {
    /// Program whose console is served to session channels.
    #[clap(index = 1)]
    program: String,

    /// Arguments passed to the program.
    #[clap(multiple = true, index = 2)]
    args: Vec<String>,

    #[clap(long, default_value = "0.0.0.0")]
    ip: String,

    #[clap(long, short, default_value_t = 2222)]
    port: u16,

    #[clap(long, short)]
    username: Option<String>,

    #[clap(long)]
    password: Option<String>,

    /// OpenSSH private key to use as host key. Generated on every start if absent.
    #[clap(long, short = 'k')]
    host_key: Option<PathBuf>,

    /// Seconds before an outbound direct-tcpip connect is abandoned.
    #[clap(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Seconds a splice keeps running one direction after the other has ended.
    #[clap(long)]
    half_close_linger: Option<u64>,
}
