#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use payledger::cache::SummaryCache;
use payledger::flags::FlagStates;
use payledger::{Ledger, LedgerConfig};
use rust_decimal::Decimal;
use tempfile::TempDir;

pub struct Fixture {
    pub ledger: Ledger,
    _dir: TempDir,
}

pub fn config_in(dir: &TempDir, flags: FlagStates) -> LedgerConfig {
    LedgerConfig {
        database_path: dir.path().join("ledger.db"),
        flags,
        ..LedgerConfig::default()
    }
}

pub fn ledger_with(flags: FlagStates) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Ledger::open(config_in(&dir, flags)).expect("open ledger");
    Fixture { ledger, _dir: dir }
}

pub fn ledger() -> Fixture {
    ledger_with(FlagStates::default())
}

/// A representative with one invoice per amount, issued on consecutive days.
pub async fn representative_with_invoices(ledger: &Ledger, amounts: &[Decimal]) -> (i64, Vec<i64>) {
    let rep = ledger.create_representative("Rep").await.expect("representative");
    let mut invoices = Vec::new();
    for (i, amount) in amounts.iter().enumerate() {
        let id = ledger
            .issue_invoice(rep, &format!("INV-{}", i + 1), *amount, &format!("2025-01-{:02}", i + 1))
            .await
            .expect("invoice");
        invoices.push(id);
    }
    (rep, invoices)
}

pub async fn payment(ledger: &Ledger, rep: i64, amount: Decimal) -> i64 {
    ledger
        .record_payment(rep, amount, "2025-02-01", None)
        .await
        .expect("payment")
}

#[derive(Default)]
pub struct RecordingCache {
    pub calls: Mutex<Vec<(i64, bool, String)>>,
}

impl SummaryCache for RecordingCache {
    fn invalidate_representative(&self, representative_id: i64, cascade_global: bool, reason: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((representative_id, cascade_global, reason.to_string()));
    }
}

pub fn ledger_with_cache(cache: Arc<RecordingCache>) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Ledger::open_with_cache(config_in(&dir, FlagStates::default()), cache).expect("open ledger");
    Fixture { ledger, _dir: dir }
}
