//! Structured logging using the tracing crate
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! ```bash
//! # Add-on container
//! LOG_FORMAT=json LOG_LEVEL=INFO solarbridge run
//!
//! # Bench testing against a controller
//! LOG_FORMAT=pretty solarbridge -vv read
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are too chatty at the bridge's own level
const QUIET_TARGETS: [&str; 2] = ["rumqttc=warn", "tokio=warn"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string, defaulting to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a `LOG_LEVEL` value, defaulting to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Raise the base level by CLI verbosity (`-v` = DEBUG, `-vv` = TRACE)
pub fn level_for_verbosity(base: Level, verbose: u8) -> Level {
    match verbose {
        0 => base,
        1 => std::cmp::max(base, Level::DEBUG),
        _ => Level::TRACE,
    }
}

/// Build the event filter; a `RUST_LOG` value replaces it entirely
pub fn build_filter(level: Level, rust_log: Option<&str>) -> EnvFilter {
    if let Some(rust_log) = rust_log {
        return EnvFilter::new(rust_log);
    }

    QUIET_TARGETS
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

/// Initialize logging with manual configuration
///
/// A second call is a no-op; the first installed subscriber wins.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let rust_log = env::var("RUST_LOG").ok();
    let filter = build_filter(level, rust_log.as_deref());
    let span_events = if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// Initialize logging from environment variables plus CLI verbosity
pub fn init_default_logging(verbose: u8) {
    let base = env::var("LOG_LEVEL")
        .map(|s| parse_level(&s))
        .unwrap_or(Level::INFO);
    let level = level_for_verbosity(base, verbose);

    let format = env::var("LOG_FORMAT")
        .map(|s| LogFormat::parse(&s))
        .unwrap_or(LogFormat::Json);

    let include_spans = env::var("LOG_SPANS")
        .map(|s| s.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

/// Span for one poll cycle
#[macro_export]
macro_rules! poll_span {
    ($($field:tt)*) => {
        tracing::info_span!("poll_cycle", $($field)*)
    };
}

/// Span for device link operations
#[macro_export]
macro_rules! device_span {
    ($($field:tt)*) => {
        tracing::info_span!("device_operation", $($field)*)
    };
}

/// Create an MQTT operation span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Create a lifecycle event span
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

pub use {device_span, lifecycle_span, mqtt_span, poll_span};
