//! Allocation Engine: the only writer of `payment_allocations`.
//!
//! Manual and automatic allocation share one path: read balances, build
//! proposed lines, run [`validate_allocations`], then insert and refresh
//! statuses and lower the cached debt, all inside a single `BEGIN IMMEDIATE`
//! transaction.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::{Connection, TransactionBehavior};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::SummaryCache;
use crate::db::DbState;
use crate::error::{AppError, Result};
use crate::guard::{GuardMetrics, ALLOCATION_SYSTEM_ERROR};
use crate::idempotency::derive_key;
use crate::invariants::{
    validate_allocations, InvoiceSnapshot, PaymentSnapshot, ProposedLine, ValidationReport, Violation,
};
use crate::money;
use crate::store::{
    self, AllocationLine, AllocationOrigin, AllocationStatus, Invoice, InvoiceStatus,
    NewAllocation, Payment, SettlementOrder,
};

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceState {
    pub invoice_id: i64,
    pub amount: Decimal,
    pub allocated: Decimal,
    pub remaining: Decimal,
    pub status: InvoiceStatus,
}

impl From<&Invoice> for InvoiceState {
    fn from(invoice: &Invoice) -> Self {
        Self {
            invoice_id: invoice.id,
            amount: invoice.amount,
            allocated: invoice.allocated,
            remaining: invoice.remaining(),
            status: invoice.status,
        }
    }
}

/// Outcome of a committed (or replayed) allocation.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationReceipt {
    pub payment_id: i64,
    pub representative_id: i64,
    /// True when nothing was written because the lines already existed.
    pub replayed: bool,
    pub lines: Vec<AllocationLine>,
    pub allocated_total: Decimal,
    pub payment_status: AllocationStatus,
    pub payment_remaining: Decimal,
    pub invoices: Vec<InvoiceState>,
}

impl AllocationReceipt {
    pub fn allocated_to_invoice(&self, invoice_id: i64) -> Decimal {
        self.lines
            .iter()
            .filter(|line| line.invoice_id == invoice_id)
            .map(|line| line.amount)
            .sum()
    }

    pub fn invoice(&self, invoice_id: i64) -> Option<&InvoiceState> {
        self.invoices.iter().find(|inv| inv.invoice_id == invoice_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Manual,
    Auto,
}

impl Mode {
    fn as_str(&self) -> &'static str {
        match self {
            Mode::Manual => "manual",
            Mode::Auto => "auto",
        }
    }
}

enum Attempt {
    Done { receipt: AllocationReceipt },
    Rejected {
        representative_id: i64,
        report: ValidationReport,
    },
}

pub struct AllocationEngine {
    db: DbState,
    metrics: Arc<GuardMetrics>,
    cache: Arc<dyn SummaryCache>,
    tolerance: Decimal,
    order: SettlementOrder,
}

impl AllocationEngine {
    pub fn new(
        db: DbState,
        metrics: Arc<GuardMetrics>,
        cache: Arc<dyn SummaryCache>,
        tolerance: Decimal,
        order: SettlementOrder,
    ) -> Self {
        Self {
            db,
            metrics,
            cache,
            tolerance,
            order,
        }
    }

    pub fn settlement_order(&self) -> SettlementOrder {
        self.order
    }

    /// Applies `amount` of a payment to one chosen invoice.
    ///
    /// Retrying with the same `(payment, invoice, amount)` returns the
    /// existing line with `replayed = true` instead of writing a second one.
    pub async fn manual_allocate(
        &self,
        payment_id: i64,
        invoice_id: i64,
        amount: Decimal,
        performed_by: &str,
        reason: Option<&str>,
    ) -> Result<AllocationReceipt> {
        let amount = money::normalize(amount);
        let key = derive_key(payment_id, invoice_id, amount)?;
        let tolerance = self.tolerance;
        let performed_by = performed_by.to_string();
        let reason = reason.map(str::to_string);

        let attempt = self
            .db
            .run(move |conn| {
                manual_in_tx(
                    conn,
                    payment_id,
                    invoice_id,
                    amount,
                    &key,
                    tolerance,
                    &performed_by,
                    reason.as_deref(),
                )
            })
            .await;
        self.settle(Mode::Manual, payment_id, attempt)
    }

    /// Settles a payment across the representative's open invoices in
    /// settlement order; whatever does not fit stays unallocated.
    pub async fn auto_allocate(
        &self,
        payment_id: i64,
        performed_by: &str,
        reason: Option<&str>,
    ) -> Result<AllocationReceipt> {
        let tolerance = self.tolerance;
        let order = self.order;
        let performed_by = performed_by.to_string();
        let reason = reason.map(str::to_string);

        let attempt = self
            .db
            .run(move |conn| {
                auto_in_tx(conn, payment_id, order, tolerance, &performed_by, reason.as_deref())
            })
            .await;
        self.settle(Mode::Auto, payment_id, attempt)
    }

    fn settle(&self, mode: Mode, payment_id: i64, attempt: Result<Attempt>) -> Result<AllocationReceipt> {
        match attempt {
            Ok(Attempt::Done { receipt }) => {
                if receipt.replayed {
                    debug!(payment_id, mode = mode.as_str(), "allocation replayed; nothing written");
                } else {
                    info!(
                        payment_id,
                        representative_id = receipt.representative_id,
                        mode = mode.as_str(),
                        lines = receipt.lines.len(),
                        total = %receipt.allocated_total,
                        status = receipt.payment_status.as_str(),
                        "allocation committed"
                    );
                    self.cache.invalidate_representative(
                        receipt.representative_id,
                        true,
                        "payment_allocation",
                    );
                }
                Ok(receipt)
            }
            Ok(Attempt::Rejected {
                representative_id,
                report,
            }) => {
                for violation in &report.violations {
                    self.metrics.record(
                        violation.metric_type(),
                        json!({
                            "payment_id": payment_id,
                            "representative_id": representative_id,
                            "mode": mode.as_str(),
                            "violation": violation,
                        }),
                    );
                }
                warn!(payment_id, mode = mode.as_str(), violations = %report.describe(), "allocation rejected");
                Err(AppError::Rejected(Box::new(report)))
            }
            Err(err) => {
                if err.is_system() {
                    self.metrics.record_with_level(
                        ALLOCATION_SYSTEM_ERROR,
                        Some("error"),
                        json!({ "payment_id": payment_id, "mode": mode.as_str(), "error": err.to_string() }),
                    );
                }
                Err(err)
            }
        }
    }

    /// Unpaid and partially paid invoices with capacity, in settlement order.
    pub async fn eligible_invoices(&self, representative_id: i64) -> Result<Vec<Invoice>> {
        let order = self.order;
        self.db
            .run(move |conn| store::fetch_open_invoices(conn, representative_id, order))
            .await
    }

    pub async fn unallocated_payments(&self, representative_id: i64) -> Result<Vec<Payment>> {
        self.db
            .run(move |conn| store::fetch_unallocated_payments(conn, representative_id))
            .await
    }

    pub async fn allocation_history(&self, payment_id: i64) -> Result<Vec<AllocationLine>> {
        self.db
            .run(move |conn| {
                if store::fetch_payment(conn, payment_id)?.is_none() {
                    return Err(AppError::NotFound {
                        entity: "payment",
                        id: payment_id,
                    });
                }
                store::fetch_allocations_for_payment(conn, payment_id)
            })
            .await
    }
}

fn load_payment(conn: &Connection, payment_id: i64) -> Result<Payment> {
    store::fetch_payment(conn, payment_id)?.ok_or(AppError::NotFound {
        entity: "payment",
        id: payment_id,
    })
}

fn payment_snapshot(payment: &Payment) -> PaymentSnapshot {
    PaymentSnapshot {
        payment_id: payment.id,
        amount: payment.amount,
        already_allocated: payment.allocated,
    }
}

fn invoice_snapshot(invoice: &Invoice) -> InvoiceSnapshot {
    InvoiceSnapshot {
        invoice_id: invoice.id,
        amount: invoice.amount,
        already_allocated: invoice.allocated,
    }
}

#[allow(clippy::too_many_arguments)]
fn manual_in_tx(
    conn: &mut Connection,
    payment_id: i64,
    invoice_id: i64,
    amount: Decimal,
    key: &str,
    tolerance: Decimal,
    performed_by: &str,
    reason: Option<&str>,
) -> Result<Attempt> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let payment = load_payment(&tx, payment_id)?;

    if let Some(existing) = store::fetch_allocation_by_key(&tx, key)? {
        let receipt = build_receipt(&tx, &payment, vec![existing], true)?;
        return Ok(Attempt::Done { receipt });
    }

    let invoice = store::fetch_invoice(&tx, invoice_id)?;
    if let Some(invoice) = &invoice {
        if invoice.representative_id != payment.representative_id {
            return Err(AppError::Validation(format!(
                "invoice {invoice_id} belongs to representative {}, payment {payment_id} to {}",
                invoice.representative_id, payment.representative_id
            )));
        }
    }
    let snapshots: Vec<InvoiceSnapshot> = invoice.iter().map(invoice_snapshot).collect();
    let lines = [ProposedLine {
        invoice_id,
        amount,
        idempotency_key: Some(key.to_string()),
    }];

    let report = validate_allocations(&payment_snapshot(&payment), &snapshots, &lines, tolerance);
    if !report.ok {
        return Ok(Attempt::Rejected {
            representative_id: payment.representative_id,
            report,
        });
    }

    let written = write_lines(&tx, &payment, &lines, AllocationOrigin::Manual, performed_by, reason)?;
    let receipt = build_receipt(&tx, &payment, written, false)?;
    tx.commit()?;
    Ok(Attempt::Done { receipt })
}

fn auto_in_tx(
    conn: &mut Connection,
    payment_id: i64,
    order: SettlementOrder,
    tolerance: Decimal,
    performed_by: &str,
    reason: Option<&str>,
) -> Result<Attempt> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let payment = load_payment(&tx, payment_id)?;
    let open = store::fetch_open_invoices(&tx, payment.representative_id, order)?;

    let mut left = payment.remaining();
    let mut lines = Vec::new();
    let mut duplicates = Vec::new();
    for invoice in &open {
        if left <= Decimal::ZERO {
            break;
        }
        let take = left.min(invoice.remaining());
        if take <= Decimal::ZERO {
            continue;
        }
        let key = derive_key(payment_id, invoice.id, take)?;
        // the invoice still has capacity, so an existing line with this key
        // is an earlier allocation of the same amount, not a retry
        if store::fetch_allocation_by_key(&tx, &key)?.is_some() {
            duplicates.push(Violation::DuplicateLine {
                invoice_id: invoice.id,
                amount: take,
                idempotency_key: key.clone(),
            });
        }
        lines.push(ProposedLine {
            invoice_id: invoice.id,
            amount: take,
            idempotency_key: Some(key),
        });
        left -= take;
    }

    // nothing has capacity any more: a retry of a settled payment
    if lines.is_empty() {
        let existing = store::fetch_allocations_for_payment(&tx, payment_id)?;
        if !existing.is_empty() {
            let receipt = build_receipt(&tx, &payment, existing, true)?;
            return Ok(Attempt::Done { receipt });
        }
    }

    let snapshots: Vec<InvoiceSnapshot> = open.iter().map(invoice_snapshot).collect();
    let mut report = validate_allocations(&payment_snapshot(&payment), &snapshots, &lines, tolerance);
    for duplicate in duplicates {
        report.reject(duplicate);
    }
    if !report.ok {
        return Ok(Attempt::Rejected {
            representative_id: payment.representative_id,
            report,
        });
    }

    let written = write_lines(&tx, &payment, &lines, AllocationOrigin::Auto, performed_by, reason)?;
    let receipt = build_receipt(&tx, &payment, written, false)?;
    tx.commit()?;
    Ok(Attempt::Done { receipt })
}

fn write_lines(
    conn: &Connection,
    payment: &Payment,
    lines: &[ProposedLine],
    origin: AllocationOrigin,
    performed_by: &str,
    reason: Option<&str>,
) -> Result<Vec<AllocationLine>> {
    let payment_id = payment.id;
    let mut written = Vec::with_capacity(lines.len());
    let mut touched = BTreeSet::new();
    for line in lines {
        let key = match &line.idempotency_key {
            Some(key) => key.clone(),
            None => derive_key(payment_id, line.invoice_id, line.amount)?,
        };
        let new_line = NewAllocation {
            payment_id,
            invoice_id: line.invoice_id,
            amount: line.amount,
            idempotency_key: &key,
            origin,
            performed_by: Some(performed_by),
            reason,
        };
        let stored = match store::insert_allocation(conn, &new_line)? {
            Some(stored) => {
                store::adjust_cached_debt(conn, payment.representative_id, -stored.amount)?;
                stored
            }
            None => store::fetch_allocation_by_key(conn, &key)?.ok_or_else(|| {
                AppError::Task(format!("allocation {key} vanished after key conflict"))
            })?,
        };
        touched.insert(line.invoice_id);
        written.push(stored);
    }

    for invoice_id in touched {
        store::refresh_invoice_status(conn, invoice_id)?;
    }
    store::refresh_payment_status(conn, payment_id)?;
    Ok(written)
}

fn build_receipt(
    conn: &Connection,
    payment: &Payment,
    lines: Vec<AllocationLine>,
    replayed: bool,
) -> Result<AllocationReceipt> {
    let current = load_payment(conn, payment.id)?;
    let invoice_ids: BTreeSet<i64> = lines.iter().map(|line| line.invoice_id).collect();
    let mut invoices = Vec::with_capacity(invoice_ids.len());
    for invoice_id in invoice_ids {
        if let Some(invoice) = store::fetch_invoice(conn, invoice_id)? {
            invoices.push(InvoiceState::from(&invoice));
        }
    }

    Ok(AllocationReceipt {
        payment_id: current.id,
        representative_id: current.representative_id,
        replayed,
        allocated_total: lines.iter().map(|line| line.amount).sum(),
        lines,
        payment_status: current.allocation_status,
        payment_remaining: current.remaining(),
        invoices,
    })
}
