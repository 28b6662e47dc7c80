//! Tether transport - the persistent push channel.
//!
//! Layers, bottom to top:
//!
//! - **[`ChannelFactory`]**: opens a raw text-frame channel (WebSocket, TCP,
//!   or in-memory for tests)
//! - **[`CommandCodec`]**: turns frames into [`Command`]s and keepalives
//! - **[`SignalConnection`]**: owns the live channel, runs PING/PONG
//!   keepalives, and reports connects and disconnects
//! - **[`ReconnectStrategy`]**: decides when a dropped channel is re-opened
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_transport::{
//!     ConnectionConfig, ExponentialBackoffStrategy, ReconnectConfig, SignalConnection,
//!     WebSocketChannelFactory,
//! };
//!
//! let factory = Arc::new(WebSocketChannelFactory::new("wss://push.example.com/signals")?);
//! let connection = SignalConnection::builder(factory)
//!     .config(ConnectionConfig::default())
//!     .reconnect_strategy(Arc::new(ExponentialBackoffStrategy::new(ReconnectConfig::default())))
//!     .build()?;
//! let connected = connection.connect()?.wait().await;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod channel;
mod codec;
mod command;
mod config;
mod connection;
mod reconnect;
mod tcp;
mod websocket;

pub use channel::*;
pub use codec::*;
pub use command::*;
pub use config::*;
pub use connection::*;
pub use reconnect::*;
pub use tcp::*;
pub use websocket::*;
