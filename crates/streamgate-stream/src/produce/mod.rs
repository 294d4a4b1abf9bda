//! Produce direction: producers of one topic partition share a cache
//! partition and a single upstream produce stream.

pub mod factory;
pub mod fan;
pub mod member;

pub use factory::{ProduceFactory, ProduceFactoryOptions};
pub use fan::{ProduceFan, ProduceFanOptions};
pub use member::{ProduceMember, WindowGrant};
