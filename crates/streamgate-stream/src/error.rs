use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Core error: {0}")]
    Core(#[from] streamgate_core::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] streamgate_cache::CacheError),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("No route for topic {topic} partition {partition}")]
    NoRoute { topic: String, partition: i32 },

    #[error("Budget pool exhausted for budget {0}")]
    BudgetExhausted(u64),

    #[error("Shard closed")]
    ShardClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;
