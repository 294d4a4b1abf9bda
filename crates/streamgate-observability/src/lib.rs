//! StreamGate Observability
//!
//! Provides metrics and logging for the streamgate data plane.
//!
//! # Features
//!
//! - Prometheus metrics in a shared registry
//! - Structured logging with tracing
//!
//! # Usage
//!
//! ```no_run
//! use streamgate_observability::{logging, metrics};
//!
//! logging::init("info");
//! metrics::init();
//!
//! let families = metrics::REGISTRY.gather();
//! ```

pub mod logging;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize all observability components
pub fn init(default_level: &str) {
    logging::init(default_level);
    metrics::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_init_is_safe() {
        init("warn");
        init("warn");
    }

    #[test]
    fn test_registry_accessible() {
        init_metrics();
        let _registry = &*REGISTRY;
    }
}
