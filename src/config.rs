use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::flags::FlagStates;
use crate::guard::Threshold;
use crate::store::SettlementOrder;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub database_path: PathBuf,
    pub busy_timeout_ms: u64,
    pub flags: FlagStates,
    pub allocation: AllocationConfig,
    pub guard: GuardConfig,
    pub reconciliation: ReconciliationConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("payledger.db"),
            busy_timeout_ms: 5_000,
            flags: FlagStates::default(),
            allocation: AllocationConfig::default(),
            guard: GuardConfig::default(),
            reconciliation: ReconciliationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    pub tolerance: Decimal,
    pub settlement_order: SettlementOrder,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub max_recent: usize,
    pub flush_interval_ms: u64,
    pub max_batch: usize,
    /// Queue capacity in batches; beyond `max_batch * max_pending_batches` the oldest events are dropped.
    pub max_pending_batches: usize,
    pub summary_window_minutes: i64,
    pub thresholds: BTreeMap<String, Threshold>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_recent: 200,
            flush_interval_ms: 15_000,
            max_batch: 200,
            max_pending_batches: 25,
            summary_window_minutes: 60,
            thresholds: BTreeMap::new(),
        }
    }
}

impl GuardConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn max_pending(&self) -> usize {
        self.max_batch.saturating_mul(self.max_pending_batches)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub drift_tolerance: Decimal,
    pub warn_ratio: Decimal,
    pub fail_ratio: Decimal,
    pub chunk_size: usize,
    pub schedule_interval_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            drift_tolerance: Decimal::ZERO,
            warn_ratio: Decimal::new(5, 4),
            fail_ratio: Decimal::new(5, 3),
            chunk_size: 50,
            schedule_interval_secs: 3_600,
        }
    }
}

impl LedgerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: LedgerConfig = serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `PAYLEDGER_*` environment overrides on top of the loaded values.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(path) = lookup("PAYLEDGER_DB") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(state) = lookup("PAYLEDGER_ACTIVE_RECONCILIATION") {
            self.flags.active_reconciliation = state.parse()?;
        }
        if let Some(state) = lookup("PAYLEDGER_GUARD_PERSISTENCE") {
            self.flags.guard_metrics_persistence = state.parse()?;
        }
        if let Some(state) = lookup("PAYLEDGER_GUARD_ALERTS") {
            self.flags.guard_metrics_alerts = state.parse()?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.allocation.tolerance < Decimal::ZERO {
            return Err(AppError::Config("allocation.tolerance cannot be negative".into()));
        }
        if self.reconciliation.drift_tolerance < Decimal::ZERO {
            return Err(AppError::Config(
                "reconciliation.drift_tolerance cannot be negative".into(),
            ));
        }
        if self.reconciliation.warn_ratio > self.reconciliation.fail_ratio {
            return Err(AppError::Config(
                "reconciliation.warn_ratio must not exceed fail_ratio".into(),
            ));
        }
        if self.guard.max_batch == 0
            || self.guard.max_pending_batches == 0
            || self.reconciliation.chunk_size == 0
        {
            return Err(AppError::Config("batch and chunk sizes must be positive".into()));
        }
        for (event_type, threshold) in &self.guard.thresholds {
            if threshold.warn > threshold.critical {
                return Err(AppError::Config(format!(
                    "threshold for {event_type}: warn {} exceeds critical {}",
                    threshold.warn, threshold.critical
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{PersistenceFlag, ReconciliationFlag};
    use rust_decimal_macros::dec;

    #[test]
    fn empty_json_yields_defaults() {
        let config: LedgerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.guard.max_recent, 200);
        assert_eq!(config.guard.flush_interval_ms, 15_000);
        assert_eq!(config.reconciliation.warn_ratio, dec!(0.0005));
        assert_eq!(config.reconciliation.fail_ratio, dec!(0.005));
        assert_eq!(config.allocation.settlement_order, SettlementOrder::OldestFirst);
    }

    #[test]
    fn reads_nested_sections() {
        let config: LedgerConfig = serde_json::from_str(
            r#"{
                "database_path": "/tmp/ledger.db",
                "allocation": {"tolerance": "0.000001", "settlement_order": "newest_first"},
                "guard": {"thresholds": {"allocation_over_remaining": {"warn": 1, "critical": 4}}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.allocation.tolerance, dec!(0.000001));
        assert_eq!(config.allocation.settlement_order, SettlementOrder::NewestFirst);
        assert_eq!(config.guard.thresholds["allocation_over_remaining"].critical, 4);
    }

    #[test]
    fn env_overrides_replace_flags() {
        let config = LedgerConfig::default()
            .with_overrides(|key| match key {
                "PAYLEDGER_DB" => Some("other.db".into()),
                "PAYLEDGER_ACTIVE_RECONCILIATION" => Some("enforce".into()),
                "PAYLEDGER_GUARD_PERSISTENCE" => Some("off".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.database_path, PathBuf::from("other.db"));
        assert_eq!(config.flags.active_reconciliation, ReconciliationFlag::Enforce);
        assert_eq!(config.flags.guard_metrics_persistence, PersistenceFlag::Off);
    }

    #[test]
    fn rejects_bad_flag_override() {
        let err = LedgerConfig::default()
            .with_overrides(|key| (key == "PAYLEDGER_GUARD_ALERTS").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
