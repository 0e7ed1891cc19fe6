use serde::Serialize;
use thiserror::Error;

use crate::invariants::ValidationReport;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Task(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("allocation rejected: {}", .0.describe())]
    Rejected(Box<ValidationReport>),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("disabled by feature flag: {0}")]
    Disabled(&'static str),
}

/// Whether a failure was caused by the request or by the system.
///
/// System errors are safe to retry because allocation writes are idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    System,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Database(_) | AppError::Io(_) | AppError::Json(_) | AppError::Task(_) => {
                ErrorKind::System
            }
            AppError::Config(_)
            | AppError::Validation(_)
            | AppError::Rejected(_)
            | AppError::NotFound { .. }
            | AppError::Disabled(_) => ErrorKind::Validation,
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind() == ErrorKind::System
    }

    pub fn report(&self) -> Option<&ValidationReport> {
        match self {
            AppError::Rejected(report) => Some(report),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(value: tokio::task::JoinError) -> Self {
        AppError::Task(value.to_string())
    }
}

impl From<AppError> for String {
    fn from(value: AppError) -> Self {
        value.to_string()
    }
}
