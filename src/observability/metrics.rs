//! Thread-safe in-process counters
//!
//! Counts what the bridge did (poll cycles, reads, publishes, sessions) so the
//! supervisor can log a summary on shutdown. Nothing is exported over the
//! network.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Lifecycle phase of the bridge process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Starting,
    Connecting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Starting => "starting",
            BridgeState::Connecting => "connecting",
            BridgeState::Running => "running",
            BridgeState::Stopping => "stopping",
            BridgeState::Stopped => "stopped",
            BridgeState::Failed => "failed",
        }
    }
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    cycles_started: AtomicU64,
    cycles_published: AtomicU64,
    device_read_failures: AtomicU64,
    decode_failures: AtomicU64,
    fields_published: AtomicU64,
    field_publish_failures: AtomicU64,
    connect_attempts: AtomicU64,
    reconnects: AtomicU64,
    state_transitions: AtomicU64,
    started_at: AtomicU64,
    state: Mutex<BridgeState>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            cycles_started: AtomicU64::new(0),
            cycles_published: AtomicU64::new(0),
            device_read_failures: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            fields_published: AtomicU64::new(0),
            field_publish_failures: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
            state: Mutex::new(BridgeState::Starting),
        }
    }

    // Poll loop
    pub fn record_cycle_started(&self) {
        self.cycles_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle_published(&self) {
        self.cycles_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_read_failure(&self) {
        self.device_read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_field_published(&self) {
        self.fields_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_field_publish_failure(&self) {
        self.field_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Session
    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle
    pub fn set_state(&self, state: BridgeState) {
        if let Ok(mut current) = self.state.lock() {
            if *current != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current = state;
            }
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(BridgeState::Failed)
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.cycles_started,
            &self.cycles_published,
            &self.device_read_failures,
            &self.decode_failures,
            &self.fields_published,
            &self.field_publish_failures,
            &self.connect_attempts,
            &self.reconnects,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.started_at.store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut state) = self.state.lock() {
            *state = BridgeState::Starting;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            state: self.state().as_str().to_string(),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            poll: PollMetrics {
                cycles_started: self.cycles_started.load(Ordering::Relaxed),
                cycles_published: self.cycles_published.load(Ordering::Relaxed),
                device_read_failures: self.device_read_failures.load(Ordering::Relaxed),
                decode_failures: self.decode_failures.load(Ordering::Relaxed),
                fields_published: self.fields_published.load(Ordering::Relaxed),
                field_publish_failures: self.field_publish_failures.load(Ordering::Relaxed),
            },
            session: SessionMetrics {
                connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub state: String,
    pub state_transitions: u64,
    pub poll: PollMetrics,
    pub session: SessionMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollMetrics {
    pub cycles_started: u64,
    pub cycles_published: u64,
    pub device_read_failures: u64,
    pub decode_failures: u64,
    pub fields_published: u64,
    pub field_publish_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub connect_attempts: u64,
    pub reconnects: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let collector = MetricsCollector::new();

        collector.record_cycle_started();
        collector.record_cycle_started();
        collector.record_cycle_published();
        collector.record_device_read_failure();
        collector.record_decode_failure();
        for _ in 0..14 {
            collector.record_field_published();
        }
        collector.record_field_publish_failure();
        collector.record_connect_attempt();
        collector.record_reconnect();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.poll.cycles_started, 2);
        assert_eq!(snapshot.poll.cycles_published, 1);
        assert_eq!(snapshot.poll.device_read_failures, 1);
        assert_eq!(snapshot.poll.decode_failures, 1);
        assert_eq!(snapshot.poll.fields_published, 14);
        assert_eq!(snapshot.poll.field_publish_failures, 1);
        assert_eq!(snapshot.session.connect_attempts, 1);
        assert_eq!(snapshot.session.reconnects, 1);
    }

    #[test]
    fn test_state_transitions_count_changes_only() {
        let collector = MetricsCollector::new();
        assert_eq!(collector.state(), BridgeState::Starting);

        collector.set_state(BridgeState::Connecting);
        collector.set_state(BridgeState::Running);
        collector.set_state(BridgeState::Running);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.state, "running");
        assert_eq!(snapshot.state_transitions, 2);
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::new();
        collector.record_cycle_started();
        collector.set_state(BridgeState::Failed);

        collector.reset();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.poll.cycles_started, 0);
        assert_eq!(snapshot.state, "starting");
        assert_eq!(snapshot.state_transitions, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsCollector::new().snapshot()).unwrap();
        assert_eq!(json["state"], "starting");
        assert_eq!(json["poll"]["cycles_started"], 0);
        assert_eq!(json["session"]["reconnects"], 0);
    }

    #[test]
    fn test_global_collector_is_shared() {
        let before = metrics().snapshot().session.connect_attempts;
        metrics().record_connect_attempt();
        assert!(metrics().snapshot().session.connect_attempts > before);
    }
}
