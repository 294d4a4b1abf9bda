//! Fetch direction: one upstream fetch per topic partition, cached and
//! replayed to every attached consumer.

pub mod factory;
pub mod fan;
pub mod member;

pub use factory::{FetchFactory, FetchFactoryOptions};
pub use fan::{FetchFan, FetchFanOptions};
pub use member::FetchMember;
