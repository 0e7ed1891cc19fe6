use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::TransactionBehavior;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::allocation::AllocationEngine;
use crate::cache::{NoopSummaryCache, SummaryCache};
use crate::config::LedgerConfig;
use crate::db::DbState;
use crate::error::{AppError, Result};
use crate::flags::FeatureFlags;
use crate::guard::{GuardAnalyzer, GuardMetrics, GuardPersistence, ThresholdTable};
use crate::money;
use crate::reconciliation::{ConsistencyReport, ReconciliationEngine};
use crate::store::{self, Invoice, Representative};

/// Process-wide root: owns every engine and hands out references.
///
/// Built once at startup; nothing in the crate reaches for global state.
pub struct Ledger {
    config: LedgerConfig,
    db: DbState,
    flags: Arc<FeatureFlags>,
    cache: Arc<dyn SummaryCache>,
    metrics: Arc<GuardMetrics>,
    persistence: Arc<GuardPersistence>,
    analyzer: GuardAnalyzer,
    allocation: AllocationEngine,
    reconciliation: Arc<ReconciliationEngine>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Ledger {
    pub fn open(config: LedgerConfig) -> Result<Self> {
        Self::open_with_cache(config, Arc::new(NoopSummaryCache))
    }

    pub fn open_with_cache(config: LedgerConfig, cache: Arc<dyn SummaryCache>) -> Result<Self> {
        let db = DbState::initialize(&config.database_path, config.busy_timeout())?;
        let flags = Arc::new(FeatureFlags::new(config.flags));

        let persistence = Arc::new(GuardPersistence::new(
            db.clone(),
            Arc::clone(&flags),
            config.guard.max_batch,
            config.guard.max_pending(),
            config.guard.flush_interval(),
        ));
        let metrics = Arc::new(GuardMetrics::new(
            config.guard.max_recent,
            Arc::clone(&flags),
            Some(Arc::clone(&persistence)),
        ));
        let analyzer = GuardAnalyzer::new(
            Some(Arc::clone(&persistence)),
            Arc::clone(&flags),
            ThresholdTable::with_overrides(&config.guard.thresholds),
            config.guard.summary_window_minutes,
        );
        let allocation = AllocationEngine::new(
            db.clone(),
            Arc::clone(&metrics),
            Arc::clone(&cache),
            config.allocation.tolerance,
            config.allocation.settlement_order,
        );
        let reconciliation = Arc::new(ReconciliationEngine::new(
            db.clone(),
            Arc::clone(&flags),
            Arc::clone(&metrics),
            Arc::clone(&cache),
            config.reconciliation.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        info!(path = %db.path().display(), flags = ?flags.snapshot(), "ledger opened");
        Ok(Self {
            config,
            db,
            flags,
            cache,
            metrics,
            persistence,
            analyzer,
            allocation,
            reconciliation,
            shutdown,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn db(&self) -> &DbState {
        &self.db
    }

    pub fn flags(&self) -> &Arc<FeatureFlags> {
        &self.flags
    }

    pub fn metrics(&self) -> &Arc<GuardMetrics> {
        &self.metrics
    }

    pub fn persistence(&self) -> &Arc<GuardPersistence> {
        &self.persistence
    }

    pub fn analyzer(&self) -> &GuardAnalyzer {
        &self.analyzer
    }

    pub fn allocation(&self) -> &AllocationEngine {
        &self.allocation
    }

    pub fn reconciliation(&self) -> &Arc<ReconciliationEngine> {
        &self.reconciliation
    }

    /// Starts the guard metrics flusher and the scheduled drift job.
    pub fn start_background(&self) {
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        background.push(self.persistence.spawn_flusher(self.shutdown.subscribe()));
        background.push(self.reconciliation.spawn_drift_job(
            Duration::from_secs(self.config.reconciliation.schedule_interval_secs.max(1)),
            self.shutdown.subscribe(),
        ));
    }

    /// Stops background tasks, cancels active runs and flushes queued guard events.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        self.reconciliation.shutdown().await;
        if let Err(err) = self.persistence.flush_now().await {
            warn!(error = %err, pending = self.persistence.pending(), "guard events left unflushed at shutdown");
        }
        info!("ledger shut down");
    }

    pub async fn create_representative(&self, name: &str) -> Result<i64> {
        let name = name.to_string();
        self.db
            .run(move |conn| store::insert_representative(conn, &name))
            .await
    }

    pub async fn representative(&self, id: i64) -> Result<Representative> {
        self.db
            .run(move |conn| {
                store::fetch_representative(conn, id)?.ok_or(AppError::NotFound {
                    entity: "representative",
                    id,
                })
            })
            .await
    }

    /// Issues an invoice and adds its amount to the representative's cached debt.
    pub async fn issue_invoice(
        &self,
        representative_id: i64,
        invoice_number: &str,
        amount: Decimal,
        issue_date: &str,
    ) -> Result<i64> {
        let invoice_number = invoice_number.to_string();
        let issue_date = issue_date.to_string();
        let amount = money::normalize(amount);
        let invoice_id = self
            .db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let id = store::insert_invoice(&tx, representative_id, &invoice_number, amount, &issue_date)?;
                tx.commit()?;
                Ok(id)
            })
            .await?;
        self.cache
            .invalidate_representative(representative_id, true, "invoice_issued");
        Ok(invoice_id)
    }

    pub async fn record_payment(
        &self,
        representative_id: i64,
        amount: Decimal,
        payment_date: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        let payment_date = payment_date.to_string();
        let description = description.map(str::to_string);
        let amount = money::normalize(amount);
        self.db
            .run(move |conn| {
                store::insert_payment(conn, representative_id, amount, &payment_date, description.as_deref())
            })
            .await
    }

    pub async fn invoice(&self, id: i64) -> Result<Invoice> {
        self.db
            .run(move |conn| {
                store::fetch_invoice(conn, id)?.ok_or(AppError::NotFound {
                    entity: "invoice",
                    id,
                })
            })
            .await
    }

    /// Changes an invoice amount, carries the delta into the cached debt and
    /// re-checks the representative with a focused dry reconciliation.
    pub async fn edit_invoice_amount(
        &self,
        invoice_id: i64,
        amount: Decimal,
    ) -> Result<(Invoice, ConsistencyReport)> {
        let amount = money::normalize(amount);
        let invoice = self
            .db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let before = store::fetch_invoice(&tx, invoice_id)?.ok_or(AppError::NotFound {
                    entity: "invoice",
                    id: invoice_id,
                })?;
                let after = store::update_invoice_amount(&tx, invoice_id, amount)?;
                store::adjust_cached_debt(&tx, after.representative_id, after.amount - before.amount)?;
                tx.commit()?;
                Ok(after)
            })
            .await?;

        self.cache
            .invalidate_representative(invoice.representative_id, true, "invoice_edited");
        let report = self
            .reconciliation
            .validate_consistency(Some(invoice.representative_id))
            .await?;
        if !report.is_valid {
            warn!(
                invoice_id,
                representative_id = invoice.representative_id,
                drift = report.summary.inconsistent_count,
                "drift present after invoice edit"
            );
        }
        Ok((invoice, report))
    }
}
