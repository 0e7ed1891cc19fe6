use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DbState {
    path: PathBuf,
    busy_timeout: Duration,
}

impl DbState {
    pub fn initialize(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        Self::run_migrations(&mut conn)?;

        Ok(Self { path, busy_timeout })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        Ok(conn)
    }

    /// Runs blocking SQLite work on the blocking pool with a fresh connection.
    pub async fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = state.open()?;
            work(&mut conn)
        })
        .await?
    }

    fn run_migrations(conn: &mut Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS representatives (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                total_debt INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT
            );

            CREATE TABLE IF NOT EXISTS invoices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                representative_id INTEGER NOT NULL,
                invoice_number TEXT NOT NULL,
                amount INTEGER NOT NULL CHECK (amount >= 0),
                status TEXT NOT NULL DEFAULT 'unpaid',
                issue_date TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT,
                FOREIGN KEY(representative_id) REFERENCES representatives(id) ON DELETE RESTRICT
            );

            CREATE TABLE IF NOT EXISTS payments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                representative_id INTEGER NOT NULL,
                amount INTEGER NOT NULL CHECK (amount > 0),
                allocation_status TEXT NOT NULL DEFAULT 'unallocated',
                invoice_id INTEGER,
                payment_date TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY(representative_id) REFERENCES representatives(id) ON DELETE RESTRICT,
                FOREIGN KEY(invoice_id) REFERENCES invoices(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS payment_allocations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payment_id INTEGER NOT NULL,
                invoice_id INTEGER NOT NULL,
                allocated_amount INTEGER NOT NULL CHECK (allocated_amount > 0),
                idempotency_key TEXT NOT NULL UNIQUE,
                origin TEXT NOT NULL,
                performed_by TEXT,
                reason TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY(payment_id) REFERENCES payments(id) ON DELETE RESTRICT,
                FOREIGN KEY(invoice_id) REFERENCES invoices(id) ON DELETE RESTRICT
            );

            CREATE TABLE IF NOT EXISTS guard_metrics_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                level TEXT,
                context TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reconciliation_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mode TEXT NOT NULL,
                scope TEXT NOT NULL,
                status TEXT NOT NULL,
                total INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                drift_count INTEGER NOT NULL DEFAULT 0,
                corrected_count INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS reconciliation_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                representative_id INTEGER NOT NULL,
                cached_debt INTEGER NOT NULL,
                ledger_debt INTEGER NOT NULL,
                reason TEXT NOT NULL,
                severity TEXT NOT NULL,
                status TEXT NOT NULL,
                note TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY(run_id) REFERENCES reconciliation_runs(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_invoices_representative ON invoices(representative_id, issue_date);
            CREATE INDEX IF NOT EXISTS idx_payments_representative ON payments(representative_id);
            CREATE INDEX IF NOT EXISTS idx_allocations_payment ON payment_allocations(payment_id);
            CREATE INDEX IF NOT EXISTS idx_allocations_invoice ON payment_allocations(invoice_id);
            CREATE INDEX IF NOT EXISTS idx_guard_events_created ON guard_metrics_events(created_at);
            CREATE INDEX IF NOT EXISTS idx_reconciliation_actions_run ON reconciliation_actions(run_id);
            ",
        )?;
        // cancelled runs record when the cancel request was observed
        ensure_column(
            conn,
            "reconciliation_runs",
            "cancelled_at",
            "ALTER TABLE reconciliation_runs ADD COLUMN cancelled_at TEXT",
        )?;
        Ok(())
    }
}

/// Fixed-width UTC timestamps so TEXT columns compare chronologically.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn iso(ts: chrono::DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ensure_column(conn: &mut Connection, table: &str, column: &str, alter_sql: &str) -> Result<()> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(());
        }
    }
    drop(rows);
    drop(stmt);
    conn.execute(alter_sql, [])?;
    Ok(())
}
