//! Tether client - session orchestration over the push channel.
//!
//! [`SignalClient`] is the entry point. Its single-flight
//! [`connect`](SignalClient::connect):
//!
//! 1. checks the API session is authenticated
//! 2. reconciles the stored session identity with the live one
//! 3. opens the channel through the [`SignalProvider`]
//! 4. when the server assigns a new client id, unsubscribes the old id (best
//!    effort) and runs the `signals/connect` round-trip
//! 5. resolves once the server confirms the subscription
//!
//! [`SignalClient::is_connected`] holds only while the transport is
//! authenticated and the subscription is confirmed for the same client id.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_client::{DefaultSignalProvider, HttpSignalsApi, SignalClient};
//!
//! let provider = Arc::new(DefaultSignalProvider::new(connection));
//! let api = Arc::new(HttpSignalsApi::new("https://api.example.com/", timeout)?.with_session_key(key));
//! let client = SignalClient::builder(provider, api).build()?;
//! let handle = client.connect(None)?.wait().await.into_result()?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod client;
mod config;
mod connect_task;
pub mod logging;
mod provider;
mod remote;
mod settings;
mod state;
mod versions;

pub use client::{DEFAULT_SIGNALS_CONNECT_TIMEOUT, SignalClient, SignalClientBuilder};
pub use config::*;
pub use logging::{LoggingConfig, init_tracing};
pub use provider::*;
pub use remote::*;
pub use settings::*;
pub use state::*;
pub use versions::*;
