//! WebSocket channels.
//!
//! Each push-channel frame travels as one WebSocket text message. Protocol
//! level ping/pong is answered by tungstenite and never surfaces as a frame.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tether_core::{TetherError, TetherResult};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, instrument};
use url::Url;

use crate::channel::{Channel, ChannelFactory, FrameSink, FrameSource};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket channels to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebSocketChannelFactory {
    url: Url,
}

impl WebSocketChannelFactory {
    /// Create a factory for `url` (`ws://` or `wss://`).
    ///
    /// # Errors
    /// Returns [`TetherError::Config`] for unparsable or non-WebSocket URLs.
    pub fn new(url: &str) -> TetherResult<Self> {
        let url = Url::parse(url).map_err(|e| TetherError::Config(format!("invalid url {url}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(TetherError::Config(format!(
                "unsupported websocket scheme: {other}"
            ))),
        }
    }

    /// Target URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ChannelFactory for WebSocketChannelFactory {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn open(&self) -> TetherResult<Channel> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TetherError::Transport(format!("websocket connect failed: {e}")))?;
        debug!("websocket handshake complete");
        let (write, read) = stream.split();
        Ok(Channel {
            sink: Box::new(WsSink {
                inner: write,
                closed: false,
            }),
            source: Box::new(WsSource { inner: read }),
        })
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> TetherResult<()> {
        if self.closed {
            return Err(TetherError::Transport("websocket is closed".into()));
        }
        self.inner
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TetherError::Transport(format!("websocket send failed: {e}")))
    }

    async fn close(&mut self) -> TetherResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner
            .close()
            .await
            .map_err(|e| TetherError::Transport(format!("websocket close failed: {e}")))
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<TetherResult<String>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes.to_vec()).map_err(|e| {
                        TetherError::Codec(format!("binary frame is not utf-8: {e}"))
                    }));
                }
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "websocket closed by peer");
                    return None;
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => {
                    return Some(Err(TetherError::Transport(format!(
                        "websocket receive failed: {e}"
                    ))));
                }
            }
        }
    }
}
