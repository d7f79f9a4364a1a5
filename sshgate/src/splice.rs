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
use std::io;
use std::time::Duration;

use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::endpoint::{close_writer, BoxedReader, BoxedWriter, Endpoint, ExitSignal};
use crate::{CloseReason, Error};

#[derive(Debug, Clone)]
pub struct SpliceConfig {
    /// Size of the chunk read from one side before it is written to the other.
    pub buffer_size: usize,
    /// Once one direction has ended, how long the other one may keep
    /// going before it is cut. `None` waits for it indefinitely.
    pub half_close_linger: Option<Duration>,
}

impl Default for SpliceConfig {
    fn default() -> SpliceConfig {
        SpliceConfig {
            buffer_size: 32768,
            half_close_linger: None,
        }
    }
}

/// How one direction of a splice ended.
#[derive(Debug)]
pub enum StreamEnd {
    /// The source reached a clean end of stream.
    Eof,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
    /// The splice was cancelled while this direction was still running.
    Cancelled,
    /// The other direction ended and the linger delay ran out.
    Abandoned,
    /// The destination exited and everything it wrote was drained.
    Closed,
}

impl StreamEnd {
    fn io_error(&self) -> Option<&io::Error> {
        match self {
            StreamEnd::ReadFailed(e) | StreamEnd::WriteFailed(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Transfer {
    pub bytes: u64,
    pub end: StreamEnd,
}

#[derive(Debug)]
pub struct SpliceReport {
    pub a_to_b: Transfer,
    pub b_to_a: Transfer,
    pub reason: CloseReason,
}

/// Two endpoints joined by a copy loop in each direction.
///
/// Bytes read from `a` are written verbatim to `b` and vice versa. When
/// a direction ends, the write half it was feeding is shut down and the
/// opposite direction keeps running. When both are done the splice
/// closes whatever is left of both endpoints and drops them, releasing
/// their guards.
#[derive(Debug)]
pub struct Splice {
    a: Endpoint,
    b: Endpoint,
    config: SpliceConfig,
}

impl Splice {
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        Splice {
            a,
            b,
            config: SpliceConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SpliceConfig) -> Self {
        self.config = config;
        self
    }

    /// Run until both directions have ended.
    pub async fn run(self) -> SpliceReport {
        self.run_until(std::future::pending()).await
    }

    /// Run until both directions have ended or `cancel` resolves. Its
    /// output becomes the close reason.
    ///
    /// A `PeerClosed` cancel means the peer of `a` went away: nothing
    /// more is sent to `a`, but what `a` already delivered keeps flowing
    /// into `b` until its end of stream. Any other reason stops both
    /// directions at once.
    pub async fn run_until<F>(self, cancel: F) -> SpliceReport
    where
        F: Future<Output = CloseReason>,
    {
        let Splice {
            mut a,
            mut b,
            config,
        } = self;
        let mut a_exit = a.exit.take();
        let mut b_exit = b.exit.take();
        let mut a_gone = false;
        let mut b_gone = false;
        let mut a_to_b = 0u64;
        let mut b_to_a = 0u64;

        let (a_to_b_end, b_to_a_end, cancelled) = {
            let Endpoint {
                reader: a_reader,
                writer: a_writer,
                ..
            } = &mut a;
            let Endpoint {
                reader: b_reader,
                writer: b_writer,
                ..
            } = &mut b;
            let forward = pump(a_reader, b_writer, config.buffer_size, &mut a_to_b);
            let backward = pump(b_reader, a_writer, config.buffer_size, &mut b_to_a);
            tokio::pin!(forward, backward, cancel);

            let mut forward_end = None;
            let mut backward_end = None;
            let mut cancelled = None;
            let mut deadline = None;
            loop {
                // An endpoint that exited and whose output is drained
                // takes no more input.
                if b_gone && backward_end.is_some() && forward_end.is_none() {
                    debug!("b exited, a -> b stopped");
                    forward_end = Some(StreamEnd::Closed);
                }
                if a_gone && forward_end.is_some() && backward_end.is_none() {
                    debug!("a exited, b -> a stopped");
                    backward_end = Some(StreamEnd::Closed);
                }
                if forward_end.is_some() && backward_end.is_some() {
                    break;
                }
                tokio::select! {
                    end = &mut forward, if forward_end.is_none() => {
                        trace!("a -> b ended: {end:?}");
                        forward_end = Some(end);
                    }
                    end = &mut backward, if backward_end.is_none() => {
                        trace!("b -> a ended: {end:?}");
                        backward_end = Some(end);
                    }
                    reason = &mut cancel, if cancelled.is_none() => {
                        let drain = matches!(reason, CloseReason::PeerClosed);
                        cancelled = Some(reason);
                        if !drain {
                            break;
                        }
                        if backward_end.is_none() {
                            backward_end = Some(StreamEnd::Cancelled);
                        }
                    }
                    _ = exited(&mut a_exit), if a_exit.is_some() => a_gone = true,
                    _ = exited(&mut b_exit), if b_exit.is_some() => b_gone = true,
                    _ = linger(deadline), if deadline.is_some() => {
                        debug!("half-close linger expired");
                        break;
                    }
                }
                if deadline.is_none() && (forward_end.is_some() || backward_end.is_some()) {
                    deadline = config.half_close_linger.map(|d| Instant::now() + d);
                }
            }

            let unfinished = || {
                if cancelled.is_some() {
                    StreamEnd::Cancelled
                } else {
                    StreamEnd::Abandoned
                }
            };
            (
                forward_end.unwrap_or_else(unfinished),
                backward_end.unwrap_or_else(unfinished),
                cancelled,
            )
        };

        a.close().await;
        b.close().await;
        drop(a_exit);
        drop(b_exit);
        drop(a);
        drop(b);

        let reason = cancelled.unwrap_or_else(|| close_reason(&a_to_b_end, &b_to_a_end));
        debug!("splice done ({a_to_b} bytes a -> b, {b_to_a} bytes b -> a): {reason}");
        SpliceReport {
            a_to_b: Transfer {
                bytes: a_to_b,
                end: a_to_b_end,
            },
            b_to_a: Transfer {
                bytes: b_to_a,
                end: b_to_a_end,
            },
            reason,
        }
    }
}

async fn exited(exit: &mut Option<ExitSignal>) {
    match exit.as_mut() {
        Some(signal) => {
            signal.await;
            *exit = None;
        }
        None => std::future::pending().await,
    }
}

async fn linger(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn close_reason(a_to_b: &StreamEnd, b_to_a: &StreamEnd) -> CloseReason {
    match a_to_b.io_error().or_else(|| b_to_a.io_error()) {
        Some(e) => CloseReason::failed(Error::TruncatedStream(io::Error::new(
            e.kind(),
            e.to_string(),
        ))),
        None => CloseReason::PeerClosed,
    }
}

/// One direction: copy until the source ends, then drop the source and
/// half-close the destination.
async fn pump(
    reader: &mut Option<BoxedReader>,
    writer: &mut Option<BoxedWriter>,
    buffer_size: usize,
    bytes: &mut u64,
) -> StreamEnd {
    let end = match (reader.as_mut(), writer.as_mut()) {
        (Some(reader), Some(writer)) => copy(reader, writer, buffer_size, bytes).await,
        _ => StreamEnd::Eof,
    };
    reader.take();
    close_writer(writer).await;
    end
}

async fn copy(
    reader: &mut BoxedReader,
    writer: &mut BoxedWriter,
    buffer_size: usize,
    bytes: &mut u64,
) -> StreamEnd {
    let mut buf = vec![0; buffer_size.max(1)];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return StreamEnd::Eof,
            Ok(n) => n,
            Err(e) => return StreamEnd::ReadFailed(e),
        };
        #[allow(clippy::indexing_slicing)] // n <= buf.len()
        let chunk = &buf[..n];
        if let Err(e) = writer.write_all(chunk).await {
            return StreamEnd::WriteFailed(e);
        }
        if let Err(e) = writer.flush().await {
            return StreamEnd::WriteFailed(e);
        }
        *bytes += n as u64;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]

    use std::pin::Pin;
    use std::task::{Context, Poll};

    use rand::RngCore;
    use tokio::io::{AsyncRead, DuplexStream, ReadBuf};

    use super::*;

    fn pair() -> (Endpoint, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        (Endpoint::from_stream(ours), theirs)
    }

    fn payload(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    /// Yields `data` once, then fails as if the peer had reset the connection.
    struct Severed {
        data: Option<Vec<u8>>,
    }

    impl AsyncRead for Severed {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(&data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::ErrorKind::ConnectionReset.into())),
            }
        }
    }

    #[tokio::test]
    async fn preserves_order_in_both_directions() {
        let _ = env_logger::try_init();

        let (a, a_peer) = pair();
        let (b, b_peer) = pair();
        let up = payload(100_000);
        let down = payload(70_001);

        let splice = tokio::spawn(Splice::new(a, b).run());

        let exchange = |peer: DuplexStream, data: Vec<u8>| async move {
            let (mut reader, mut writer) = tokio::io::split(peer);
            let (_, received) = tokio::join!(
                async {
                    writer.write_all(&data).await.unwrap();
                    writer.shutdown().await.unwrap();
                },
                async {
                    let mut buf = Vec::new();
                    reader.read_to_end(&mut buf).await.unwrap();
                    buf
                }
            );
            received
        };
        let (at_a, at_b) = tokio::join!(exchange(a_peer, up.clone()), exchange(b_peer, down.clone()));

        assert_eq!(at_b, up);
        assert_eq!(at_a, down);

        let report = splice.await.unwrap();
        assert!(matches!(report.reason, CloseReason::PeerClosed));
        assert_eq!(report.a_to_b.bytes, up.len() as u64);
        assert_eq!(report.b_to_a.bytes, down.len() as u64);
        assert!(matches!(report.a_to_b.end, StreamEnd::Eof));
        assert!(matches!(report.b_to_a.end, StreamEnd::Eof));
    }

    #[tokio::test]
    async fn half_close_keeps_the_other_direction_open() {
        let (a, a_peer) = pair();
        let (b, b_peer) = pair();
        let (mut a_read, mut a_write) = tokio::io::split(a_peer);
        let (mut b_read, mut b_write) = tokio::io::split(b_peer);

        let splice = tokio::spawn(Splice::new(a, b).run());

        b_write.write_all(b"last words").await.unwrap();
        b_write.shutdown().await.unwrap();

        let mut buf = Vec::new();
        a_read.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"last words");

        // a -> b is still flowing after b's EOF reached a.
        a_write.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        b_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
        assert!(!splice.is_finished());

        a_write.shutdown().await.unwrap();
        let mut rest = Vec::new();
        b_read.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let report = splice.await.unwrap();
        assert!(report.reason.is_clean());
        assert_eq!(report.a_to_b.bytes, 10);
    }

    #[tokio::test]
    async fn severed_source_surfaces_as_truncated_stream() {
        let (b, b_peer) = pair();
        let (sink, _keep) = tokio::io::duplex(64);
        let a = Endpoint::from_pipes(
            Severed {
                data: Some(b"partial".to_vec()),
            },
            sink,
        );
        let (mut b_read, mut b_write) = tokio::io::split(b_peer);
        b_write.shutdown().await.unwrap();

        let report = Splice::new(a, b).run().await;

        let mut buf = Vec::new();
        b_read.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"partial");
        assert!(matches!(report.a_to_b.end, StreamEnd::ReadFailed(_)));
        match report.reason.error() {
            Some(Error::TruncatedStream(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionReset)
            }
            other => panic!("unexpected reason {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_closes_both_sides() {
        let (a, mut a_peer) = pair();
        let (b, mut b_peer) = pair();
        let (cancel, cancelled) = tokio::sync::oneshot::channel();

        let splice = tokio::spawn(Splice::new(a, b).run_until(async move {
            cancelled.await.unwrap_or(CloseReason::ConnectionClosed)
        }));
        cancel.send(CloseReason::ConnectionClosed).unwrap();

        let mut buf = Vec::new();
        assert_eq!(a_peer.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(b_peer.read_to_end(&mut buf).await.unwrap(), 0);

        let report = splice.await.unwrap();
        assert!(matches!(report.reason, CloseReason::ConnectionClosed));
        assert!(matches!(report.a_to_b.end, StreamEnd::Cancelled));
        assert!(matches!(report.b_to_a.end, StreamEnd::Cancelled));
    }

    #[tokio::test]
    async fn peer_close_still_delivers_what_the_peer_sent() {
        let (a, a_peer) = pair();
        let (b, mut b_peer) = pair();
        let (mut a_read, mut a_write) = tokio::io::split(a_peer);
        let (cancel, cancelled) = tokio::sync::oneshot::channel();

        let splice = tokio::spawn(Splice::new(a, b).run_until(async move {
            cancelled.await.unwrap_or(CloseReason::ConnectionClosed)
        }));
        a_write.write_all(b"last command\n").await.unwrap();
        a_write.shutdown().await.unwrap();
        cancel.send(CloseReason::PeerClosed).unwrap();

        let mut buf = Vec::new();
        b_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"last command\n");
        let mut buf = Vec::new();
        assert_eq!(a_read.read_to_end(&mut buf).await.unwrap(), 0);

        let report = splice.await.unwrap();
        assert!(matches!(report.reason, CloseReason::PeerClosed));
        assert!(matches!(report.a_to_b.end, StreamEnd::Eof));
        assert!(matches!(report.b_to_a.end, StreamEnd::Cancelled));
        assert_eq!(report.a_to_b.bytes, 13);
    }

    #[tokio::test]
    async fn exited_destination_ends_the_splice() {
        let (a, mut a_peer) = pair();
        let (ours, mut b_peer) = tokio::io::duplex(4096);
        let (alive, gone) = tokio::sync::oneshot::channel::<()>();
        let b = Endpoint::from_stream(ours).with_exit(async move {
            let _ = gone.await;
        });

        let splice = tokio::spawn(Splice::new(a, b).run());

        b_peer.write_all(b"done").await.unwrap();
        drop(b_peer);
        drop(alive);

        // a never half-closes, the splice ends anyway.
        let mut buf = Vec::new();
        a_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"done");

        let report = tokio::time::timeout(Duration::from_secs(5), splice)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report.reason, CloseReason::PeerClosed));
        assert!(matches!(report.b_to_a.end, StreamEnd::Eof));
        assert!(matches!(report.a_to_b.end, StreamEnd::Closed));
    }

    #[tokio::test]
    async fn linger_cuts_the_remaining_direction() {
        let (a, _a_peer) = pair();
        let (b, b_peer) = pair();
        let (_b_read, mut b_write) = tokio::io::split(b_peer);
        b_write.shutdown().await.unwrap();

        let report = Splice::new(a, b)
            .with_config(SpliceConfig {
                half_close_linger: Some(Duration::from_millis(50)),
                ..Default::default()
            })
            .run()
            .await;

        assert!(matches!(report.b_to_a.end, StreamEnd::Eof));
        assert!(matches!(report.a_to_b.end, StreamEnd::Abandoned));
        assert!(matches!(report.reason, CloseReason::PeerClosed));
    }
}
