//! Multi-stage rollout flags.
//!
//! Each flag moves through increasingly impactful states; the defaults are
//! the least impactful ones. States are mutable at runtime so enforcement can
//! be switched off without a restart.

use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationFlag {
    Off,
    #[default]
    Dry,
    Enforce,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceFlag {
    Off,
    #[default]
    Shadow,
    Enforce,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertsFlag {
    #[default]
    Off,
    On,
}

macro_rules! flag_text {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = AppError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($ty::$variant),)+
                    other => Err(AppError::Config(format!(
                        "unknown {} state '{other}'",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

flag_text!(ReconciliationFlag { Off => "off", Dry => "dry", Enforce => "enforce" });
flag_text!(PersistenceFlag { Off => "off", Shadow => "shadow", Enforce => "enforce" });
flag_text!(AlertsFlag { Off => "off", On => "on" });

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagStates {
    pub active_reconciliation: ReconciliationFlag,
    pub guard_metrics_persistence: PersistenceFlag,
    pub guard_metrics_alerts: AlertsFlag,
}

#[derive(Debug, Default)]
pub struct FeatureFlags {
    states: RwLock<FlagStates>,
}

impl FeatureFlags {
    pub fn new(states: FlagStates) -> Self {
        Self {
            states: RwLock::new(states),
        }
    }

    pub fn snapshot(&self) -> FlagStates {
        *self.states.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn active_reconciliation(&self) -> ReconciliationFlag {
        self.snapshot().active_reconciliation
    }

    pub fn guard_metrics_persistence(&self) -> PersistenceFlag {
        self.snapshot().guard_metrics_persistence
    }

    pub fn guard_metrics_alerts(&self) -> AlertsFlag {
        self.snapshot().guard_metrics_alerts
    }

    pub fn set_active_reconciliation(&self, state: ReconciliationFlag, modified_by: &str) {
        self.update(|s| s.active_reconciliation = state);
        info!(flag = "active_reconciliation", %state, modified_by, "feature flag changed");
    }

    pub fn set_guard_metrics_persistence(&self, state: PersistenceFlag, modified_by: &str) {
        self.update(|s| s.guard_metrics_persistence = state);
        info!(flag = "guard_metrics_persistence", %state, modified_by, "feature flag changed");
    }

    pub fn set_guard_metrics_alerts(&self, state: AlertsFlag, modified_by: &str) {
        self.update(|s| s.guard_metrics_alerts = state);
        info!(flag = "guard_metrics_alerts", %state, modified_by, "feature flag changed");
    }

    fn update(&self, apply: impl FnOnce(&mut FlagStates)) {
        let mut guard = self.states.write().unwrap_or_else(|e| e.into_inner());
        apply(&mut guard);
    }
}
