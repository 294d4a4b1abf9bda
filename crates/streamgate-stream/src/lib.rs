//! StreamGate Stream
//!
//! Fan-out multiplexing between many downstream streams and one upstream
//! stream per topic partition.
//!
//! - **Fetch**: the first consumer of a partition opens an upstream fetch;
//!   records are written once into a cache partition and every attached
//!   member replays them through its own cursor, filters and window.
//! - **Produce**: producers of a partition append into a shared cache
//!   partition; a single upstream produce stream forwards it and acks flow
//!   back to each producer in offset order.
//!
//! Both directions share one flow-control budget per fan-out, timers via a
//! [`Signaler`], and run on a [`Shard`] event loop.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamgate_stream::{BudgetPool, GatewayConfig, Shard, StaticRouter};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = GatewayConfig::load("streamgate.toml")?;
//! let (outbound, mut frames) = tokio::sync::mpsc::unbounded_channel();
//! let shard = Shard::spawn(
//!     &config,
//!     Arc::new(StaticRouter::new(&config)),
//!     Arc::new(BudgetPool::new(config.budget_slots)),
//!     outbound,
//! );
//! while let Some(frame) = frames.recv().await {
//!     println!("{:?}", frame.kind());
//! }
//! shard.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod budget;
pub mod config;
pub mod context;
pub mod error;
pub mod fetch;
pub mod outbox;
pub mod produce;
pub mod router;
pub mod shard;
pub mod signaler;

#[cfg(test)]
mod test_support;

pub use backoff::ReconnectBackoff;
pub use budget::{BudgetPool, CreditorIndex, DebitorIndex, Flusher};
pub use config::{GatewayConfig, PartitionConfig, TopicConfig};
pub use context::StreamContext;
pub use error::{Result, StreamError};
pub use fetch::{FetchFactory, FetchFactoryOptions, FetchFan, FetchMember};
pub use outbox::Outbox;
pub use produce::{ProduceFactory, ProduceFactoryOptions, ProduceFan, ProduceMember};
pub use router::{PartitionKey, Route, Router, StaticRouter, TopicOptions};
pub use shard::{Shard, ShardHandle};
pub use signaler::{ManualSignaler, Signaler, TimerHandle, TokioSignaler};
