//! Plain TCP channels with newline framing.

use async_trait::async_trait;
use tether_core::{TetherError, TetherResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, instrument};

use crate::channel::{Channel, ChannelFactory, FrameSink, FrameSource};
use crate::codec::DEFAULT_MAX_FRAME_SIZE;

/// Opens TCP channels to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpChannelFactory {
    address: String,
    max_frame_size: usize,
}

impl TcpChannelFactory {
    /// Create a factory for `address` (`host:port`).
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the longest line accepted from the peer.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

#[async_trait]
impl ChannelFactory for TcpChannelFactory {
    #[instrument(skip(self), fields(address = %self.address))]
    async fn open(&self) -> TetherResult<Channel> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| TetherError::Transport(format!("tcp connect failed: {e}")))?;
        stream.set_nodelay(true)?;
        debug!("tcp channel open");
        let (read, write) = stream.into_split();
        Ok(Channel {
            sink: Box::new(TcpSink { inner: write }),
            source: Box::new(TcpSource {
                inner: BufReader::new(read),
                line: String::new(),
                max_frame_size: self.max_frame_size,
            }),
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

struct TcpSink {
    inner: OwnedWriteHalf,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send(&mut self, frame: String) -> TetherResult<()> {
        let mut line = frame.into_bytes();
        line.push(b'\n');
        self.inner
            .write_all(&line)
            .await
            .map_err(|e| TetherError::Transport(format!("tcp write failed: {e}")))?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> TetherResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

struct TcpSource {
    inner: BufReader<OwnedReadHalf>,
    line: String,
    max_frame_size: usize,
}

#[async_trait]
impl FrameSource for TcpSource {
    async fn recv(&mut self) -> Option<TetherResult<String>> {
        self.line.clear();
        match self.inner.read_line(&mut self.line).await {
            Ok(0) => None,
            Ok(read) if read > self.max_frame_size + 2 => Some(Err(TetherError::Codec(format!(
                "line of {read} bytes exceeds limit of {}",
                self.max_frame_size
            )))),
            Ok(_) => Some(Ok(self.line.trim_end_matches(['\r', '\n']).to_string())),
            Err(e) => Some(Err(TetherError::Transport(format!("tcp read failed: {e}")))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn lines_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut reader = BufReader::new(read);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            write.write_all(b"PONG\r\n").await.unwrap();
            line
        });

        let factory = TcpChannelFactory::new(addr.to_string());
        let mut channel = factory.open().await.unwrap();
        channel.sink.send("PING".into()).await.unwrap();
        assert_eq!(channel.source.recv().await.unwrap().unwrap(), "PONG");
        assert_eq!(server.await.unwrap(), "PING\n");
    }

    #[tokio::test]
    async fn oversized_line_is_codec_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut payload = "x".repeat(64).into_bytes();
            payload.push(b'\n');
            socket.write_all(&payload).await.unwrap();
        });

        let factory = TcpChannelFactory::new(addr.to_string()).with_max_frame_size(16);
        let mut channel = factory.open().await.unwrap();
        assert!(matches!(
            channel.source.recv().await,
            Some(Err(TetherError::Codec(_)))
        ));
    }
}
