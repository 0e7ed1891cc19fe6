//! Payment-to-invoice allocation ledger.
//!
//! Payments are split across invoices through a single validated,
//! idempotent write path ([`allocation`]); guard metrics record every
//! invariant violation ([`guard`]); and the reconciliation engine audits
//! the cached per-representative debt against ledger rows
//! ([`reconciliation`]). [`Ledger`] wires the pieces together.

pub mod allocation;
pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod flags;
pub mod guard;
pub mod idempotency;
pub mod invariants;
pub mod ledger;
pub mod money;
pub mod reconciliation;
pub mod store;

pub use allocation::{AllocationEngine, AllocationReceipt};
pub use config::LedgerConfig;
pub use error::{AppError, ErrorKind, Result};
pub use ledger::Ledger;
