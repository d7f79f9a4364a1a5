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

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type ExitSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A full-duplex byte stream whose read and write halves can be
/// closed independently.
///
/// An endpoint may also carry a guard, an arbitrary value dropped
/// together with the endpoint, and an exit signal that resolves once
/// whatever sits behind the pipes is gone for good. A splice stops
/// feeding an endpoint whose exit signal fired and whose output has
/// been drained.
pub struct Endpoint {
    pub(crate) reader: Option<BoxedReader>,
    pub(crate) writer: Option<BoxedWriter>,
    pub(crate) exit: Option<ExitSignal>,
    guard: Option<Box<dyn Send>>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("readable", &self.reader.is_some())
            .field("writable", &self.writer.is_some())
            .field("guarded", &self.guard.is_some())
            .field("exit_signal", &self.exit.is_some())
            .finish()
    }
}

impl Endpoint {
    /// Build an endpoint out of two separate pipes.
    pub fn from_pipes<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Endpoint {
            reader: Some(Box::new(reader)),
            writer: Some(Box::new(writer)),
            exit: None,
            guard: None,
        }
    }

    /// Split a bidirectional stream, such as an SSH channel stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_pipes(reader, writer)
    }

    /// A TCP socket. Closing the write half sends a FIN.
    pub fn tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_pipes(reader, writer)
    }

    /// Attach a value that lives exactly as long as this endpoint.
    pub fn with_guard<G: Send + 'static>(mut self, guard: G) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    /// Attach a future that resolves once the other side of the pipes
    /// has terminated. It is dropped with the endpoint if it never fired.
    pub fn with_exit<F>(mut self, exit: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.exit = Some(Box::pin(exit));
        self
    }

    pub fn is_readable(&self) -> bool {
        self.reader.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.writer.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }

    /// Drop the read half. No-op if it is already gone.
    pub fn close_read(&mut self) {
        self.reader.take();
    }

    /// Shut down and drop the write half. No-op if it is already gone.
    pub async fn close_write(&mut self) {
        close_writer(&mut self.writer).await
    }

    /// Close both halves. The guard stays until the endpoint is dropped.
    pub async fn close(&mut self) {
        self.close_read();
        self.close_write().await;
    }
}

pub(crate) async fn close_writer(writer: &mut Option<BoxedWriter>) {
    if let Some(mut writer) = writer.take() {
        if let Err(e) = writer.shutdown().await {
            debug!("shutdown of write half failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;

    use super::*;

    struct Released(Arc<AtomicUsize>);

    impl Drop for Released {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn close_write_sends_eof_and_is_idempotent() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let mut endpoint = Endpoint::from_stream(ours);

        endpoint.close_write().await;
        endpoint.close_write().await;
        assert!(!endpoint.is_writable());
        assert!(endpoint.is_readable());

        let mut buf = Vec::new();
        assert_eq!(theirs.read_to_end(&mut buf).await.unwrap(), 0);

        endpoint.close().await;
        assert!(endpoint.is_closed());
    }

    #[tokio::test]
    async fn guard_is_released_with_the_endpoint() {
        let released = Arc::new(AtomicUsize::new(0));
        let (ours, _theirs) = tokio::io::duplex(64);
        let mut endpoint =
            Endpoint::from_stream(ours).with_guard(Released(released.clone()));

        endpoint.close().await;
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(endpoint);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
