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

//! The hosted process whose console session channels are attached to.

use std::ffi::OsString;
use std::io;
use std::process::Stdio;

use log::{debug, info};
use tokio::process::Command;

use crate::channel::Environment;
use crate::endpoint::Endpoint;

/// Source of console pipes for session channels.
///
/// `start` is called once per bound channel with the environment the
/// client asked for. The returned endpoint reads the process output
/// and writes its input. The process must be stopped when the endpoint
/// is dropped, and its termination should be reported through the
/// endpoint's exit signal.
pub trait Console: Send + Sync + 'static {
    fn start(&self, env: &Environment) -> io::Result<Endpoint>;
}

/// Runs a fresh instance of a program for every channel.
///
/// The program's stdout and stdin become the channel's output and
/// input, stderr is discarded. The process is killed when the channel
/// is torn down.
#[derive(Debug, Clone)]
pub struct CommandConsole {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandConsole {
    pub fn new<P: Into<OsString>>(program: P) -> Self {
        CommandConsole {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Console for CommandConsole {
    fn start(&self, env: &Environment) -> io::Result<Endpoint> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(env.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin not captured"))?;

        info!(
            "started {:?} (pid {:?}) with {} environment variable(s)",
            self.program,
            child.id(),
            env.len()
        );
        let program = self.program.clone();
        Ok(Endpoint::from_pipes(stdout, stdin).with_exit(async move {
            match child.wait().await {
                Ok(status) => debug!("{program:?} exited: {status}"),
                Err(e) => debug!("waiting for {program:?} failed: {e}"),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::Splice;

    #[tokio::test]
    async fn cat_echoes_through_a_splice() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let backend = CommandConsole::new("cat").start(&Environment::new()).unwrap();

        let splice = tokio::spawn(Splice::new(Endpoint::from_stream(ours), backend).run());

        let (mut reader, mut writer) = tokio::io::split(theirs);
        writer.write_all(b"hello console").await.unwrap();
        writer.shutdown().await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();

        assert_eq!(buf, b"hello console");
        assert!(splice.await.unwrap().reason.is_clean());
    }

    #[tokio::test]
    async fn process_exit_ends_the_splice() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let backend = CommandConsole::new("sh")
            .args(["-c", "printf done"])
            .start(&Environment::new())
            .unwrap();

        let splice = tokio::spawn(Splice::new(Endpoint::from_stream(ours), backend).run());

        // Nothing is ever written to or shut down on our side.
        let mut buf = Vec::new();
        theirs.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"done");

        let report = tokio::time::timeout(std::time::Duration::from_secs(5), splice)
            .await
            .unwrap()
            .unwrap();
        assert!(report.reason.is_clean());
    }

    #[tokio::test]
    async fn environment_reaches_the_process() {
        let mut env = Environment::new();
        env.set("SSHGATE_GREETING", "hi there");
        let console = CommandConsole::new("sh").args(["-c", "printf '%s' \"$SSHGATE_GREETING\""]);
        let mut endpoint = console.start(&env).unwrap();

        let mut buf = Vec::new();
        endpoint
            .reader
            .as_mut()
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"hi there");
    }

    #[test]
    fn missing_program_fails_to_start() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let console = CommandConsole::new("/nonexistent/sshgate-console");
        assert!(console.start(&Environment::new()).is_err());
    }
}
