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
use std::time::Duration;

use log::debug;
use tokio::net::TcpStream;

use crate::channel::Target;
use crate::endpoint::Endpoint;
use crate::splice::{Splice, SpliceConfig};
use crate::{CloseReason, Error};

/// Open a TCP connection to `target`, giving up after `timeout`.
pub(crate) async fn dial(target: &Target, timeout: Duration) -> Result<TcpStream, Error> {
    let port = u16::try_from(target.port)
        .map_err(|_| Error::ConnectFailed(format!("invalid port {}", target.port)))?;
    let connect = TcpStream::connect((target.host.as_str(), port));
    let stream = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(Error::ConnectFailed(format!("{target}: {e}"))),
        Err(_) => {
            return Err(Error::ConnectFailed(format!(
                "{target}: timed out after {timeout:?}"
            )))
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not set TCP_NODELAY on connection to {target}: {e}");
    }
    Ok(stream)
}

/// Serve a connected direct-tcpip channel until either side is done
/// or `cancel` resolves.
pub(crate) async fn forward<F>(
    stream: TcpStream,
    channel: Endpoint,
    splice: SpliceConfig,
    cancel: F,
) -> CloseReason
where
    F: Future<Output = CloseReason>,
{
    Splice::new(channel, Endpoint::tcp(stream))
        .with_config(splice)
        .run_until(cancel)
        .await
        .reason
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn refused_connection_is_connect_failed() {
        let target = Target {
            host: "127.0.0.1".into(),
            port: closed_port().await.into(),
        };
        let err = dial(&target, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn forward_carries_bytes_both_ways() {
        let _ = env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            buf.reverse();
            socket.write_all(&buf).await.unwrap();
        });

        let target = Target {
            host: "127.0.0.1".into(),
            port: port.into(),
        };
        let stream = dial(&target, Duration::from_secs(5)).await.unwrap();
        let (ours, theirs) = tokio::io::duplex(1024);
        let task = tokio::spawn(forward(
            stream,
            Endpoint::from_stream(ours),
            SpliceConfig::default(),
            std::future::pending(),
        ));

        let (mut reader, mut writer) = tokio::io::split(theirs);
        writer.write_all(b"abc").await.unwrap();
        writer.shutdown().await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();

        assert_eq!(buf, b"cba");
        assert!(matches!(task.await.unwrap(), CloseReason::PeerClosed));
    }

    #[tokio::test]
    async fn unanswered_connect_times_out() {
        // 192.0.2.0/24 is reserved for documentation and never answers.
        let target = Target {
            host: "192.0.2.1".into(),
            port: 9,
        };
        let err = dial(&target, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(_)));
    }
}
