use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::GuardPersistence;
use crate::flags::{AlertsFlag, FeatureFlags, PersistenceFlag};

/// Counts at or above `warn` raise a warning, at or above `critical` a critical alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold {
    pub warn: u64,
    pub critical: u64,
}

impl Threshold {
    pub const fn new(warn: u64, critical: u64) -> Self {
        Self { warn, critical }
    }
}

const DEFAULT_THRESHOLDS: &[(&str, Threshold)] = &[
    ("allocation_over_remaining", Threshold::new(2, 5)),
    ("allocation_negative_amount", Threshold::new(1, 2)),
    ("allocation_non_positive_total", Threshold::new(1, 3)),
    ("allocation_payment_overflow", Threshold::new(3, 6)),
    ("allocation_invoice_not_found", Threshold::new(3, 6)),
    ("allocation_empty_lines", Threshold::new(5, 10)),
    ("allocation_idempotency_collision", Threshold::new(1, 3)),
    ("allocation_system_error", Threshold::new(1, 3)),
    ("reconciliation_drift", Threshold::new(3, 6)),
    ("reconciliation_unit_failed", Threshold::new(1, 3)),
];

const FALLBACK_THRESHOLD: Threshold = Threshold::new(10, 20);

#[derive(Debug, Clone)]
pub struct ThresholdTable {
    entries: BTreeMap<String, Threshold>,
    fallback: Threshold,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            entries: DEFAULT_THRESHOLDS
                .iter()
                .map(|(event_type, threshold)| (event_type.to_string(), *threshold))
                .collect(),
            fallback: FALLBACK_THRESHOLD,
        }
    }
}

impl ThresholdTable {
    /// Built-in table with configured entries layered on top.
    pub fn with_overrides(overrides: &BTreeMap<String, Threshold>) -> Self {
        let mut table = Self::default();
        for (event_type, threshold) in overrides {
            table.entries.insert(event_type.clone(), *threshold);
        }
        table
    }

    pub fn threshold_for(&self, event_type: &str) -> Threshold {
        self.entries.get(event_type).copied().unwrap_or(self.fallback)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warn,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardAlert {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Persisted events of this type inside the alert window.
    #[serde(rename = "countLastHour")]
    pub count: u64,
    pub level: AlertLevel,
    pub threshold: Threshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Ok,
    /// Alerting is switched off.
    Disabled,
    /// Persistence is off or the persisted summary could not be read.
    NoData,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertReport {
    pub status: AlertStatus,
    pub window_minutes: i64,
    pub items: Vec<GuardAlert>,
}

/// Classifies per-type counts; critical alerts first, then by count descending.
pub fn evaluate_alerts(summary: &BTreeMap<String, u64>, table: &ThresholdTable) -> Vec<GuardAlert> {
    let mut alerts: Vec<GuardAlert> = summary
        .iter()
        .filter_map(|(event_type, &count)| {
            let threshold = table.threshold_for(event_type);
            let level = if count >= threshold.critical {
                AlertLevel::Critical
            } else if count >= threshold.warn {
                AlertLevel::Warn
            } else {
                return None;
            };
            Some(GuardAlert {
                event_type: event_type.clone(),
                count,
                level,
                threshold,
            })
        })
        .collect();

    alerts.sort_by_key(|a| (Reverse(a.level), Reverse(a.count)));
    alerts
}

pub struct GuardAnalyzer {
    persistence: Option<Arc<GuardPersistence>>,
    flags: Arc<FeatureFlags>,
    table: ThresholdTable,
    window_minutes: i64,
}

impl GuardAnalyzer {
    pub fn new(
        persistence: Option<Arc<GuardPersistence>>,
        flags: Arc<FeatureFlags>,
        table: ThresholdTable,
        window_minutes: i64,
    ) -> Self {
        Self {
            persistence,
            flags,
            table,
            window_minutes,
        }
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.table
    }

    /// Alerts over the persisted event log; never fails.
    pub async fn current_alerts(&self) -> AlertReport {
        let empty = |status| AlertReport {
            status,
            window_minutes: self.window_minutes,
            items: Vec::new(),
        };

        if self.flags.guard_metrics_alerts() == AlertsFlag::Off {
            return empty(AlertStatus::Disabled);
        }
        if self.flags.guard_metrics_persistence() == PersistenceFlag::Off {
            return empty(AlertStatus::NoData);
        }
        let Some(persistence) = &self.persistence else {
            return empty(AlertStatus::NoData);
        };

        match persistence.summary(self.window_minutes).await {
            Ok(summary) => AlertReport {
                status: AlertStatus::Ok,
                window_minutes: self.window_minutes,
                items: evaluate_alerts(&summary, &self.table),
            },
            Err(err) => {
                warn!(error = %err, "guard alert evaluation skipped");
                empty(AlertStatus::NoData)
            }
        }
    }
}
