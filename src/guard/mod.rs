//! Guard metrics: best-effort observability for invariant violations.
//!
//! The recorder keeps process-local counters and a bounded ring of recent
//! events. Those reset on restart; the persisted event log written by
//! [`GuardPersistence`] is what alerting reads across restarts.

mod analyzer;
mod persistence;

pub use analyzer::{evaluate_alerts, AlertLevel, AlertReport, AlertStatus, GuardAlert, GuardAnalyzer, Threshold, ThresholdTable};
pub use persistence::GuardPersistence;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::flags::{FeatureFlags, PersistenceFlag};

pub const ALLOCATION_SYSTEM_ERROR: &str = "allocation_system_error";
pub const RECONCILIATION_DRIFT: &str = "reconciliation_drift";
pub const RECONCILIATION_UNIT_FAILED: &str = "reconciliation_unit_failed";
/// Counted in memory only; never queued for persistence.
pub const GUARD_EVENTS_DROPPED: &str = "guard_events_dropped";

#[derive(Debug, Clone, Serialize)]
pub struct GuardEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecorderSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub recent: Vec<GuardEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistenceView {
    pub state: PersistenceFlag,
    pub pending: usize,
    pub dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_flush_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub recent: Vec<GuardEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceView>,
}

#[derive(Debug, Default)]
struct RecorderState {
    counters: BTreeMap<String, u64>,
    recent: VecDeque<GuardEvent>,
}

pub struct GuardMetrics {
    state: Mutex<RecorderState>,
    max_recent: usize,
    flags: Arc<FeatureFlags>,
    persistence: Option<Arc<GuardPersistence>>,
}

impl GuardMetrics {
    pub fn new(
        max_recent: usize,
        flags: Arc<FeatureFlags>,
        persistence: Option<Arc<GuardPersistence>>,
    ) -> Self {
        Self {
            state: Mutex::new(RecorderState::default()),
            max_recent: max_recent.max(1),
            flags,
            persistence,
        }
    }

    pub fn record(&self, event_type: &str, context: Value) {
        self.record_with_level(event_type, None, context);
    }

    /// Never blocks on I/O and never fails; persistence only queues.
    pub fn record_with_level(&self, event_type: &str, level: Option<&str>, context: Value) {
        let event = GuardEvent {
            event_type: event_type.to_string(),
            level: level.map(str::to_string),
            context,
            timestamp: Utc::now(),
        };

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state.counters.entry(event.event_type.clone()).or_insert(0) += 1;
            state.recent.push_back(event.clone());
            while state.recent.len() > self.max_recent {
                state.recent.pop_front();
            }
        }

        warn!(event_type, context = %event.context, "guard event");

        if self.flags.guard_metrics_persistence() != PersistenceFlag::Off {
            if let Some(persistence) = &self.persistence {
                let dropped = persistence.enqueue(event);
                if dropped > 0 {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    *state
                        .counters
                        .entry(GUARD_EVENTS_DROPPED.to_string())
                        .or_insert(0) += dropped as u64;
                }
            }
        }
    }

    pub fn snapshot(&self) -> RecorderSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        RecorderSnapshot {
            counters: state.counters.clone(),
            recent: state.recent.iter().cloned().collect(),
        }
    }

    pub fn count(&self, event_type: &str) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.counters.get(event_type).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.counters.clear();
        state.recent.clear();
    }

    pub fn persistence(&self) -> Option<&Arc<GuardPersistence>> {
        self.persistence.as_ref()
    }

    /// Counters and recent events, plus the persisted summary in enforce mode.
    pub async fn full_snapshot(&self, window_minutes: i64) -> GuardSnapshot {
        let RecorderSnapshot { counters, recent } = self.snapshot();
        let state = self.flags.guard_metrics_persistence();
        let persistence = match &self.persistence {
            Some(persistence) => {
                let summary = if state == PersistenceFlag::Enforce {
                    match persistence.summary(window_minutes).await {
                        Ok(summary) => Some(summary),
                        Err(err) => {
                            warn!(error = %err, "guard metrics summary unavailable");
                            None
                        }
                    }
                } else {
                    None
                };
                Some(PersistenceView {
                    state,
                    pending: persistence.pending(),
                    dropped: persistence.dropped(),
                    summary,
                    last_flush_error: persistence.last_flush_error(),
                })
            }
            None => None,
        };
        GuardSnapshot {
            counters,
            recent,
            persistence,
        }
    }
}
