//! Reconciliation Engine: compares each representative's cached `total_debt`
//! with the debt implied by ledger rows, reports drift, and in enforce mode
//! rewrites the cached value.
//!
//! Runs are persisted in `reconciliation_runs` and move through
//! pending -> running -> completed | failed | cancelled. Every representative
//! is one atomic unit: a failure is recorded and the run moves on, and a
//! cancel request is honoured between units only.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::SummaryCache;
use crate::config::ReconciliationConfig;
use crate::db::{now_iso, DbState};
use crate::error::{AppError, Result};
use crate::flags::{FeatureFlags, ReconciliationFlag};
use crate::guard::{GuardMetrics, RECONCILIATION_DRIFT, RECONCILIATION_UNIT_FAILED};
use crate::money::{from_micros, to_micros};
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Dry,
    Enforce,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Dry => "dry",
            RunMode::Enforce => "enforce",
        }
    }

    fn from_db(value: &str) -> Option<Self> {
        match value {
            "dry" => Some(RunMode::Dry),
            "enforce" => Some(RunMode::Enforce),
            _ => None,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self> {
        RunMode::from_db(value.trim().to_ascii_lowercase().as_str())
            .ok_or_else(|| AppError::Validation(format!("unknown reconciliation mode '{value}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    Info,
    Warn,
    Fail,
}

impl DriftSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftSeverity::Info => "info",
            DriftSeverity::Warn => "warn",
            DriftSeverity::Fail => "fail",
        }
    }

    fn from_db(value: &str) -> Option<Self> {
        match value {
            "info" => Some(DriftSeverity::Info),
            "warn" => Some(DriftSeverity::Warn),
            "fail" => Some(DriftSeverity::Fail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Reported,
    Applied,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Reported => "reported",
            ActionStatus::Applied => "applied",
        }
    }

    fn from_db(value: &str) -> Option<Self> {
        match value {
            "reported" => Some(ActionStatus::Reported),
            "applied" => Some(ActionStatus::Applied),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftFinding {
    pub representative_id: i64,
    pub cached_debt: Decimal,
    pub ledger_debt: Decimal,
    /// `cached_debt - ledger_debt`.
    pub difference: Decimal,
    pub diff_ratio: Decimal,
    pub reason: &'static str,
    pub severity: DriftSeverity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencySummary {
    pub checked: usize,
    pub inconsistent_count: usize,
    /// Representatives whose rows could not be read.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub representative_id: i64,
    pub error: String,
}

/// `is_valid` only when every representative was checked and none drifted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub is_valid: bool,
    pub summary: ConsistencySummary,
    pub corrections: Vec<DriftFinding>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<UnitFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub mode: RunMode,
    pub scope: String,
    pub status: RunStatus,
    pub total: i64,
    pub processed: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub drift_count: i64,
    pub corrected_count: i64,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub cancelled_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunAction {
    pub id: i64,
    pub run_id: i64,
    pub representative_id: i64,
    pub cached_debt: Decimal,
    pub ledger_debt: Decimal,
    pub reason: String,
    pub severity: DriftSeverity,
    pub status: ActionStatus,
    pub note: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    processed: i64,
    succeeded: i64,
    failed: i64,
    drift_count: i64,
    corrected_count: i64,
}

struct UnitOutcome {
    finding: Option<DriftFinding>,
    applied: bool,
}

/// Compares one representative's cached debt with its ledger debt.
pub fn check_representative(
    conn: &Connection,
    representative_id: i64,
    config: &ReconciliationConfig,
) -> Result<Option<DriftFinding>> {
    let cached = store::cached_debt(conn, representative_id)?;
    let ledger = store::ledger_debt(conn, representative_id)?;
    let difference = cached - ledger;
    if difference.abs() <= config.drift_tolerance {
        return Ok(None);
    }

    let diff_ratio = (difference.abs() / cached.abs().max(Decimal::ONE)).round_dp(6);
    let severity = if diff_ratio >= config.fail_ratio {
        DriftSeverity::Fail
    } else if diff_ratio >= config.warn_ratio {
        DriftSeverity::Warn
    } else {
        DriftSeverity::Info
    };
    let reason = if difference > Decimal::ZERO {
        "cached_above_ledger"
    } else {
        "cached_below_ledger"
    };

    Ok(Some(DriftFinding {
        representative_id,
        cached_debt: cached,
        ledger_debt: ledger,
        difference,
        diff_ratio,
        reason,
        severity,
    }))
}

fn scope_label(focus: Option<i64>) -> String {
    match focus {
        Some(id) => format!("representative:{id}"),
        None => "global".to_string(),
    }
}

fn target_ids(conn: &Connection, focus: Option<i64>) -> Result<Vec<i64>> {
    match focus {
        Some(id) => {
            if store::fetch_representative(conn, id)?.is_none() {
                return Err(AppError::NotFound {
                    entity: "representative",
                    id,
                });
            }
            Ok(vec![id])
        }
        None => store::fetch_active_representative_ids(conn),
    }
}

const RUN_COLUMNS: &str = "id, mode, scope, status, total, processed, succeeded, failed,
    drift_count, corrected_count, error, created_at, started_at, completed_at, cancelled_at";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let mode: String = row.get(1)?;
    let status: String = row.get(3)?;
    Ok(RunRecord {
        id: row.get(0)?,
        mode: RunMode::from_db(&mode).unwrap_or(RunMode::Dry),
        scope: row.get(2)?,
        status: RunStatus::from_db(&status).unwrap_or(RunStatus::Failed),
        total: row.get(4)?,
        processed: row.get(5)?,
        succeeded: row.get(6)?,
        failed: row.get(7)?,
        drift_count: row.get(8)?,
        corrected_count: row.get(9)?,
        error: row.get(10)?,
        created_at: row.get(11)?,
        started_at: row.get(12)?,
        completed_at: row.get(13)?,
        cancelled_at: row.get(14)?,
    })
}

fn fetch_run(conn: &Connection, run_id: i64) -> Result<RunRecord> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM reconciliation_runs WHERE id = ?");
    conn.query_row(&sql, params![run_id], run_from_row)
        .optional()?
        .ok_or(AppError::NotFound {
            entity: "reconciliation run",
            id: run_id,
        })
}

fn save_progress(conn: &Connection, run_id: i64, progress: &Progress, error: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE reconciliation_runs
         SET processed = ?, succeeded = ?, failed = ?, drift_count = ?, corrected_count = ?,
             error = COALESCE(?, error)
         WHERE id = ?",
        params![
            progress.processed,
            progress.succeeded,
            progress.failed,
            progress.drift_count,
            progress.corrected_count,
            error,
            run_id
        ],
    )?;
    Ok(())
}

fn finish_run(conn: &Connection, run_id: i64, status: RunStatus, error: Option<&str>) -> Result<()> {
    let now = now_iso();
    let cancelled_at = (status == RunStatus::Cancelled).then(|| now.clone());
    conn.execute(
        "UPDATE reconciliation_runs
         SET status = ?, completed_at = ?, cancelled_at = COALESCE(?, cancelled_at),
             error = COALESCE(?, error)
         WHERE id = ?",
        params![status.as_str(), now, cancelled_at, error, run_id],
    )?;
    Ok(())
}

fn reconcile_unit(
    conn: &mut Connection,
    run_id: i64,
    representative_id: i64,
    apply: bool,
    enforce_requested: bool,
    config: &ReconciliationConfig,
) -> Result<UnitOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let Some(finding) = check_representative(&tx, representative_id, config)? else {
        return Ok(UnitOutcome {
            finding: None,
            applied: false,
        });
    };

    if apply {
        store::set_cached_debt(&tx, representative_id, finding.ledger_debt)?;
    }
    let (status, note) = match (apply, enforce_requested) {
        (true, _) => (ActionStatus::Applied, None),
        (false, true) => (
            ActionStatus::Reported,
            Some("enforcement disabled while the run was in progress"),
        ),
        (false, false) => (ActionStatus::Reported, None),
    };
    tx.execute(
        "INSERT INTO reconciliation_actions
            (run_id, representative_id, cached_debt, ledger_debt, reason, severity, status, note, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            run_id,
            representative_id,
            to_micros(finding.cached_debt)?,
            to_micros(finding.ledger_debt)?,
            finding.reason,
            finding.severity.as_str(),
            status.as_str(),
            note,
            now_iso()
        ],
    )?;
    tx.commit()?;

    Ok(UnitOutcome {
        finding: Some(finding),
        applied: apply,
    })
}

pub struct ReconciliationEngine {
    db: DbState,
    flags: Arc<FeatureFlags>,
    metrics: Arc<GuardMetrics>,
    cache: Arc<dyn SummaryCache>,
    config: ReconciliationConfig,
    cancels: Mutex<HashMap<i64, Arc<AtomicBool>>>,
    handles: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl ReconciliationEngine {
    pub fn new(
        db: DbState,
        flags: Arc<FeatureFlags>,
        metrics: Arc<GuardMetrics>,
        cache: Arc<dyn SummaryCache>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            db,
            flags,
            metrics,
            cache,
            config,
            cancels: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Dry check that never writes; always allowed regardless of flag state.
    pub async fn validate_consistency(&self, focus: Option<i64>) -> Result<ConsistencyReport> {
        let ids = self.db.run(move |conn| target_ids(conn, focus)).await?;

        let mut corrections = Vec::new();
        let mut failures = Vec::new();
        for chunk in ids.chunks(self.config.chunk_size.max(1)) {
            let chunk = chunk.to_vec();
            let config = self.config.clone();
            let (found, failed) = self
                .db
                .run(move |conn| {
                    let mut found = Vec::new();
                    let mut failed = Vec::new();
                    for id in chunk {
                        match check_representative(conn, id, &config) {
                            Ok(Some(finding)) => found.push(finding),
                            Ok(None) => {}
                            Err(err) => failed.push(UnitFailure {
                                representative_id: id,
                                error: err.to_string(),
                            }),
                        }
                    }
                    Ok((found, failed))
                })
                .await?;
            corrections.extend(found);
            failures.extend(failed);
            tokio::task::yield_now().await;
        }

        for finding in &corrections {
            warn!(
                representative_id = finding.representative_id,
                cached = %finding.cached_debt,
                ledger = %finding.ledger_debt,
                severity = finding.severity.as_str(),
                "debt drift detected"
            );
        }
        for failure in &failures {
            warn!(
                representative_id = failure.representative_id,
                error = %failure.error,
                "consistency check failed for representative"
            );
            self.metrics.record_with_level(
                RECONCILIATION_UNIT_FAILED,
                Some("error"),
                json!({ "mode": "check", "representative_id": failure.representative_id, "error": failure.error }),
            );
        }
        corrections.sort_by(|a, b| {
            b.diff_ratio
                .cmp(&a.diff_ratio)
                .then(a.representative_id.cmp(&b.representative_id))
        });

        Ok(ConsistencyReport {
            is_valid: corrections.is_empty() && failures.is_empty(),
            summary: ConsistencySummary {
                checked: ids.len(),
                inconsistent_count: corrections.len(),
                failed: failures.len(),
            },
            corrections,
            failures,
        })
    }

    /// Records a pending run and starts it in the background.
    ///
    /// Enforce mode requires `active_reconciliation = enforce`; the flag is
    /// re-read before every correction so it can be switched off mid-run.
    pub async fn start_run(self: &Arc<Self>, mode: RunMode, focus: Option<i64>) -> Result<RunRecord> {
        if mode == RunMode::Enforce && self.flags.active_reconciliation() != ReconciliationFlag::Enforce {
            return Err(AppError::Disabled("active_reconciliation"));
        }

        let scope = scope_label(focus);
        let (record, ids) = self
            .db
            .run(move |conn| {
                let ids = target_ids(conn, focus)?;
                conn.execute(
                    "INSERT INTO reconciliation_runs (mode, scope, status, total, created_at)
                     VALUES (?, ?, 'pending', ?, ?)",
                    params![mode.as_str(), scope, ids.len() as i64, now_iso()],
                )?;
                let run_id = conn.last_insert_rowid();
                Ok((fetch_run(conn, run_id)?, ids))
            })
            .await?;

        let run_id = record.id;
        let cancel = Arc::new(AtomicBool::new(false));
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id, Arc::clone(&cancel));

        let this = Arc::clone(self);
        // held across spawn so the task cannot remove its entry before it exists
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            if let Err(err) = this.execute(run_id, mode, ids, &cancel).await {
                error!(run_id, error = %err, "reconciliation run failed");
                let message = err.to_string();
                let marked = this
                    .db
                    .run(move |conn| finish_run(conn, run_id, RunStatus::Failed, Some(&message)))
                    .await;
                if let Err(err) = marked {
                    error!(run_id, error = %err, "could not mark run as failed");
                }
            }
            this.cancels
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&run_id);
            this.handles
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&run_id);
        });
        handles.insert(run_id, handle);
        drop(handles);

        info!(run_id, mode = mode.as_str(), scope = %record.scope, total = record.total, "reconciliation run queued");
        Ok(record)
    }

    async fn execute(&self, run_id: i64, mode: RunMode, ids: Vec<i64>, cancel: &AtomicBool) -> Result<()> {
        self.db
            .run(move |conn| {
                conn.execute(
                    "UPDATE reconciliation_runs SET status = 'running', started_at = ? WHERE id = ?",
                    params![now_iso(), run_id],
                )?;
                Ok(())
            })
            .await?;

        let mut progress = Progress::default();
        let chunk_size = self.config.chunk_size.max(1);
        for (index, representative_id) in ids.into_iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                let snapshot = progress;
                self.db
                    .run(move |conn| {
                        save_progress(conn, run_id, &snapshot, None)?;
                        finish_run(conn, run_id, RunStatus::Cancelled, None)
                    })
                    .await?;
                info!(run_id, processed = progress.processed, "reconciliation run cancelled");
                return Ok(());
            }

            let enforce_requested = mode == RunMode::Enforce;
            let apply = enforce_requested
                && self.flags.active_reconciliation() == ReconciliationFlag::Enforce;
            let config = self.config.clone();
            let outcome = self
                .db
                .run(move |conn| {
                    reconcile_unit(conn, run_id, representative_id, apply, enforce_requested, &config)
                })
                .await;

            progress.processed += 1;
            let mut unit_error = None;
            match outcome {
                Ok(UnitOutcome { finding, applied }) => {
                    progress.succeeded += 1;
                    if let Some(finding) = finding {
                        progress.drift_count += 1;
                        self.report_drift(run_id, &finding, applied);
                        if applied {
                            progress.corrected_count += 1;
                            self.cache.invalidate_representative(
                                representative_id,
                                true,
                                "reconciliation_correction",
                            );
                        }
                    }
                }
                Err(err) => {
                    progress.failed += 1;
                    warn!(run_id, representative_id, error = %err, "reconciliation unit failed");
                    self.metrics.record_with_level(
                        RECONCILIATION_UNIT_FAILED,
                        Some("error"),
                        json!({ "run_id": run_id, "representative_id": representative_id, "error": err.to_string() }),
                    );
                    unit_error = Some(format!("representative {representative_id}: {err}"));
                }
            }

            let snapshot = progress;
            self.db
                .run(move |conn| save_progress(conn, run_id, &snapshot, unit_error.as_deref()))
                .await?;

            tokio::task::yield_now().await;
            if (index + 1) % chunk_size == 0 {
                debug!(run_id, processed = progress.processed, "reconciliation chunk done");
            }
        }

        self.db
            .run(move |conn| finish_run(conn, run_id, RunStatus::Completed, None))
            .await?;
        info!(
            run_id,
            processed = progress.processed,
            failed = progress.failed,
            drift = progress.drift_count,
            corrected = progress.corrected_count,
            "reconciliation run completed"
        );
        Ok(())
    }

    fn report_drift(&self, run_id: i64, finding: &DriftFinding, applied: bool) {
        warn!(
            run_id,
            representative_id = finding.representative_id,
            cached = %finding.cached_debt,
            ledger = %finding.ledger_debt,
            severity = finding.severity.as_str(),
            applied,
            "debt drift detected"
        );
        self.metrics.record_with_level(
            RECONCILIATION_DRIFT,
            Some(finding.severity.as_str()),
            json!({ "run_id": run_id, "finding": finding, "applied": applied }),
        );
    }

    /// Asks a running run to stop before its next representative.
    ///
    /// Returns `false` when the run is not active in this process.
    pub fn cancel(&self, run_id: i64) -> bool {
        let cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        match cancels.get(&run_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(run_id, "reconciliation cancel requested");
                true
            }
            None => false,
        }
    }

    /// Number of run tasks this engine still tracks.
    pub fn tracked_runs(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_active(&self, run_id: i64) -> bool {
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&run_id)
    }

    /// Waits for a run started by this engine to finish and returns its final record.
    pub async fn wait(&self, run_id: i64) -> Result<RunRecord> {
        let handle = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id);
        if let Some(handle) = handle {
            handle.await?;
        }
        self.run_status(run_id).await
    }

    pub async fn run_status(&self, run_id: i64) -> Result<RunRecord> {
        self.db.run(move |conn| fetch_run(conn, run_id)).await
    }

    pub async fn run_actions(&self, run_id: i64) -> Result<Vec<RunAction>> {
        self.db
            .run(move |conn| {
                fetch_run(conn, run_id)?;
                let mut stmt = conn.prepare(
                    "SELECT id, run_id, representative_id, cached_debt, ledger_debt, reason, severity, status, note, created_at
                     FROM reconciliation_actions WHERE run_id = ? ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(params![run_id], |row| {
                    let severity: String = row.get(6)?;
                    let status: String = row.get(7)?;
                    Ok(RunAction {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        representative_id: row.get(2)?,
                        cached_debt: from_micros(row.get(3)?),
                        ledger_debt: from_micros(row.get(4)?),
                        reason: row.get(5)?,
                        severity: DriftSeverity::from_db(&severity).unwrap_or(DriftSeverity::Info),
                        status: ActionStatus::from_db(&status).unwrap_or(ActionStatus::Reported),
                        note: row.get(8)?,
                        created_at: row.get(9)?,
                    })
                })?;

                let mut actions = Vec::new();
                for row in rows {
                    actions.push(row?);
                }
                Ok(actions)
            })
            .await
    }

    /// Most recent runs first.
    pub async fn history(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let limit = limit.max(1) as i64;
        self.db
            .run(move |conn| {
                let sql = format!("SELECT {RUN_COLUMNS} FROM reconciliation_runs ORDER BY id DESC LIMIT ?");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![limit], run_from_row)?;

                let mut runs = Vec::new();
                for row in rows {
                    runs.push(row?);
                }
                Ok(runs)
            })
            .await
    }

    /// Periodic global pass following the `active_reconciliation` flag at
    /// each tick: skipped when off, dry when dry, enforcing when enforce.
    pub fn spawn_drift_job(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            info!(interval_secs = interval.as_secs(), "scheduled drift job started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let mode = match this.flags.active_reconciliation() {
                    ReconciliationFlag::Off => {
                        debug!("scheduled drift job skipped; reconciliation is off");
                        continue;
                    }
                    ReconciliationFlag::Dry => RunMode::Dry,
                    ReconciliationFlag::Enforce => RunMode::Enforce,
                };
                match this.start_run(mode, None).await {
                    Ok(run) => {
                        if let Err(err) = this.wait(run.id).await {
                            warn!(run_id = run.id, error = %err, "scheduled drift run did not finish cleanly");
                        }
                    }
                    Err(err) => warn!(error = %err, "scheduled drift run could not start"),
                }
            }
            info!("scheduled drift job stopped");
        })
    }

    /// Cancels every active run and waits for their tasks.
    pub async fn shutdown(&self) {
        let ids: Vec<i64> = self
            .cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        for id in &ids {
            self.cancel(*id);
        }
        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "reconciliation task ended abnormally");
            }
        }
    }
}
