//! Tether core - completion primitives for a persistent push channel.
//!
//! This crate provides the leaf building blocks the connection layers are
//! assembled from:
//!
//! - **[`ObservableFuture`]**: single-assignment result cell with observers and
//!   nested binding
//! - **[`EventBus`]**: publish/subscribe with explicit subscription ids and
//!   self-detaching listeners
//! - **[`Scheduler`]**: keyed deadline timers ([`TimerScheduler`] on tokio)
//! - **[`TaskExecutor`]**: runs async work off the caller's task and races it
//!   against a per-request deadline
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tether_core::{ExecutorConfig, ObservableFuture, TaskExecutor};
//!
//! let executor = TaskExecutor::new(ExecutorConfig::default())?;
//! let future = executor.enqueue(
//!     || async { Ok(ObservableFuture::succeeded(42)) },
//!     Some(Duration::from_secs(5)),
//! );
//! assert_eq!(future.wait().await.into_result()?, 42);
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod events;
mod executor;
mod future;
mod scheduler;

pub use error::*;
pub use events::*;
pub use executor::*;
pub use future::*;
pub use scheduler::*;
