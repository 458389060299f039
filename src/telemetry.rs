//! Registry lifecycle events and counters.
//!
//! The registry reports what it does to its handles as [`RegistryEvent`]s.
//! Every event is counted by [`RegistryMetrics`] and forwarded to an
//! [`EventSink`]; the default sink writes structured `tracing` records, and an
//! audit collaborator can supply its own. Sinks observe; they never get access
//! to registry state.

use crate::config::SourceKind;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Something that happened to the topology or to a cached handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    TopologyResolved {
        source: SourceKind,
        profiles: usize,
        default_profile: String,
    },
    HandleCreated {
        profile: String,
        handle_id: u64,
    },
    CreationFailed {
        profile: String,
        error: String,
    },
    ProbeFailed {
        profile: String,
        handle_id: u64,
        error: String,
    },
    HandleRecreated {
        profile: String,
        handle_id: u64,
        previous_handle_id: u64,
    },
    HandleClosed {
        profile: String,
        handle_id: u64,
    },
    CloseFailed {
        profile: String,
        handle_id: u64,
        error: String,
    },
}

/// Receiver of registry events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &RegistryEvent);
}

/// Default sink: one `tracing` record per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::TopologyResolved {
                source,
                profiles,
                default_profile,
            } => info!(source = %source, profiles, default_profile = %default_profile, "topology resolved"),
            RegistryEvent::HandleCreated { profile, handle_id } => {
                info!(profile = %profile, handle_id, "handle created")
            }
            RegistryEvent::CreationFailed { profile, error } => {
                warn!(profile = %profile, error = %error, "handle creation failed")
            }
            RegistryEvent::ProbeFailed {
                profile,
                handle_id,
                error,
            } => warn!(profile = %profile, handle_id, error = %error, "liveness probe failed, evicting handle"),
            RegistryEvent::HandleRecreated {
                profile,
                handle_id,
                previous_handle_id,
            } => info!(profile = %profile, handle_id, previous_handle_id, "handle recreated"),
            RegistryEvent::HandleClosed { profile, handle_id } => {
                info!(profile = %profile, handle_id, "handle closed")
            }
            RegistryEvent::CloseFailed {
                profile,
                handle_id,
                error,
            } => warn!(profile = %profile, handle_id, error = %error, "handle close failed"),
        }
    }
}

/// Registry counters.
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    /// Handles created, including recreations.
    pub handles_created: AtomicU64,

    /// Handles created to replace one that failed its probe.
    pub handles_recreated: AtomicU64,

    /// Failed creation attempts.
    pub creation_failures: AtomicU64,

    /// Failed liveness probes.
    pub probe_failures: AtomicU64,

    /// Handles closed explicitly or at shutdown.
    pub handles_closed: AtomicU64,

    /// Close attempts that reported an error.
    pub close_failures: AtomicU64,
}

impl RegistryMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handles_created: self.handles_created.load(Ordering::Relaxed),
            handles_recreated: self.handles_recreated.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            handles_closed: self.handles_closed.load(Ordering::Relaxed),
            close_failures: self.close_failures.load(Ordering::Relaxed),
        }
    }
}

impl EventSink for RegistryMetrics {
    fn record(&self, event: &RegistryEvent) {
        let counter = match event {
            RegistryEvent::TopologyResolved { .. } => return,
            RegistryEvent::HandleCreated { .. } => &self.handles_created,
            RegistryEvent::HandleRecreated { .. } => {
                self.handles_created.fetch_add(1, Ordering::Relaxed);
                &self.handles_recreated
            }
            RegistryEvent::CreationFailed { .. } => &self.creation_failures,
            RegistryEvent::ProbeFailed { .. } => &self.probe_failures,
            RegistryEvent::HandleClosed { .. } => &self.handles_closed,
            RegistryEvent::CloseFailed { .. } => &self.close_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`RegistryMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub handles_created: u64,
    pub handles_recreated: u64,
    pub creation_failures: u64,
    pub probe_failures: u64,
    pub handles_closed: u64,
    pub close_failures: u64,
}

/// Shared metrics type.
pub type SharedMetrics = Arc<RegistryMetrics>;

/// Create a new shared metrics instance.
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RegistryMetrics::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_count_events() {
        let metrics = RegistryMetrics::new();
        metrics.record(&RegistryEvent::HandleCreated {
            profile: "dev".into(),
            handle_id: 1,
        });
        metrics.record(&RegistryEvent::ProbeFailed {
            profile: "dev".into(),
            handle_id: 1,
            error: "gone away".into(),
        });
        metrics.record(&RegistryEvent::HandleRecreated {
            profile: "dev".into(),
            handle_id: 2,
            previous_handle_id: 1,
        });
        metrics.record(&RegistryEvent::CloseFailed {
            profile: "dev".into(),
            handle_id: 2,
            error: "broken pipe".into(),
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.handles_created, 2);
        assert_eq!(snapshot.handles_recreated, 1);
        assert_eq!(snapshot.probe_failures, 1);
        assert_eq!(snapshot.close_failures, 1);
        assert_eq!(snapshot.handles_closed, 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = RegistryEvent::HandleClosed {
            profile: "dev".into(),
            handle_id: 7,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "handle_closed");
        assert_eq!(json["profile"], "dev");
        assert_eq!(json["handle_id"], 7);
    }
}
