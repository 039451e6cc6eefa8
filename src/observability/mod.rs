//! Observability: structured logging and in-process metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, BridgeState, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{device_span, lifecycle_span, mqtt_span, poll_span};
