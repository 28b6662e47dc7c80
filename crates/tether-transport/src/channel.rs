//! Duplex frame channels.
//!
//! A [`ChannelFactory`] opens one [`Channel`] per transport connection. The
//! write half ([`FrameSink`]) and read half ([`FrameSource`]) are driven by
//! separate tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tether_core::{TetherError, TetherResult};
use tokio::sync::mpsc;

/// Write half of a channel.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame.
    ///
    /// # Errors
    /// Returns a transport error if the peer is gone.
    async fn send(&mut self, frame: String) -> TetherResult<()>;

    /// Flush and close the write half.
    ///
    /// # Errors
    /// Returns a transport error if closing fails.
    async fn close(&mut self) -> TetherResult<()>;
}

/// Read half of a channel.
#[async_trait]
pub trait FrameSource: Send {
    /// Read the next frame. `None` means the peer closed the channel.
    async fn recv(&mut self) -> Option<TetherResult<String>>;
}

/// An open duplex channel.
pub struct Channel {
    /// Write half.
    pub sink: Box<dyn FrameSink>,
    /// Read half.
    pub source: Box<dyn FrameSource>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

/// Opens channels to the remote service.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Open a new channel.
    ///
    /// # Errors
    /// Returns a transport error if the endpoint cannot be reached.
    async fn open(&self) -> TetherResult<Channel>;

    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory channels
// ─────────────────────────────────────────────────────────────────────────────

/// Create a connected in-memory factory/listener pair.
#[must_use]
pub fn memory_channel() -> (MemoryChannelFactory, MemoryListener) {
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));
    (
        MemoryChannelFactory {
            peers: peers_tx,
            refuse: Arc::clone(&refuse),
        },
        MemoryListener {
            peers: peers_rx,
            refuse,
        },
    )
}

/// Client side of an in-memory transport.
#[derive(Debug, Clone)]
pub struct MemoryChannelFactory {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: Arc<AtomicBool>,
}

/// Server side of an in-memory transport; yields one [`MemoryPeer`] per open.
#[derive(Debug)]
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    refuse: Arc<AtomicBool>,
}

impl MemoryListener {
    /// Wait for the next client channel.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Make subsequent opens fail (or succeed again).
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

/// Server end of one in-memory channel.
#[derive(Debug)]
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl MemoryPeer {
    /// Next frame written by the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Push a frame to the client. Returns `false` if the client is gone.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(frame.into()).is_ok()
    }

    /// Drop the server end, which the client observes as a closed channel.
    pub fn close(self) {}
}

struct MemorySink {
    to_peer: Option<mpsc::UnboundedSender<String>>,
}

struct MemorySource {
    from_peer: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> TetherResult<()> {
        let Some(to_peer) = &self.to_peer else {
            return Err(TetherError::Transport("memory channel closed".into()));
        };
        to_peer
            .send(frame)
            .map_err(|_| TetherError::Transport("memory peer dropped".into()))
    }

    async fn close(&mut self) -> TetherResult<()> {
        self.to_peer = None;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<TetherResult<String>> {
        self.from_peer.recv().await.map(Ok)
    }
}

#[async_trait]
impl ChannelFactory for MemoryChannelFactory {
    async fn open(&self) -> TetherResult<Channel> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TetherError::Transport("connection refused".into()));
        }
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        self.peers
            .send(MemoryPeer {
                from_client: client_rx,
                to_client: server_tx,
            })
            .map_err(|_| TetherError::Transport("memory listener dropped".into()))?;
        Ok(Channel {
            sink: Box::new(MemorySink {
                to_peer: Some(client_tx),
            }),
            source: Box::new(MemorySource {
                from_peer: server_rx,
            }),
        })
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}
