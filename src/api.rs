//! Request/response envelopes for callers of the ledger, and the handlers
//! that turn a request into a `{success, data?, error?}` response.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::allocation::AllocationReceipt;
use crate::error::{AppError, ErrorKind, Result};
use crate::guard::{AlertReport, GuardSnapshot};
use crate::invariants::Violation;
use crate::ledger::Ledger;
use crate::reconciliation::ConsistencyReport;
use crate::store::{AllocationLine, AllocationStatus, InvoiceStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct ManualAllocateRequest {
    pub payment_id: i64,
    pub invoice_id: i64,
    pub amount: Decimal,
    pub performed_by: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoAllocateRequest {
    pub payment_id: i64,
    pub performed_by: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidateConsistencyRequest {
    #[serde(default)]
    pub focus_representative_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl From<&AppError> for ApiError {
    fn from(err: &AppError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            violations: err
                .report()
                .map(|report| report.violations.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(err: &AppError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError::from(err)),
        }
    }
}

impl<T> From<Result<T>> for ApiResponse<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => ApiResponse::ok(data),
            Err(err) => ApiResponse::fail(&err),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualAllocateData {
    pub allocated_to_invoice: Decimal,
    pub replayed: bool,
    pub idempotency_key: Option<String>,
    pub payment_status: AllocationStatus,
    pub payment_remaining: Decimal,
    pub invoice_status: Option<InvoiceStatus>,
    pub invoice_remaining: Option<Decimal>,
}

impl ManualAllocateData {
    fn from_receipt(receipt: &AllocationReceipt, invoice_id: i64) -> Self {
        let invoice = receipt.invoice(invoice_id);
        Self {
            allocated_to_invoice: receipt.allocated_to_invoice(invoice_id),
            replayed: receipt.replayed,
            idempotency_key: receipt.lines.first().map(|line| line.idempotency_key.clone()),
            payment_status: receipt.payment_status,
            payment_remaining: receipt.payment_remaining,
            invoice_status: invoice.map(|inv| inv.status),
            invoice_remaining: invoice.map(|inv| inv.remaining),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoAllocateData {
    pub allocated_lines: Vec<AllocationLine>,
    pub allocated_total: Decimal,
    pub replayed: bool,
    pub payment_status: AllocationStatus,
    pub payment_remaining: Decimal,
}

impl From<AllocationReceipt> for AutoAllocateData {
    fn from(receipt: AllocationReceipt) -> Self {
        Self {
            allocated_total: receipt.allocated_total,
            replayed: receipt.replayed,
            payment_status: receipt.payment_status,
            payment_remaining: receipt.payment_remaining,
            allocated_lines: receipt.lines,
        }
    }
}

pub async fn manual_allocate(ledger: &Ledger, req: ManualAllocateRequest) -> ApiResponse<ManualAllocateData> {
    ledger
        .allocation()
        .manual_allocate(
            req.payment_id,
            req.invoice_id,
            req.amount,
            &req.performed_by,
            req.reason.as_deref(),
        )
        .await
        .map(|receipt| ManualAllocateData::from_receipt(&receipt, req.invoice_id))
        .into()
}

pub async fn auto_allocate(ledger: &Ledger, req: AutoAllocateRequest) -> ApiResponse<AutoAllocateData> {
    ledger
        .allocation()
        .auto_allocate(req.payment_id, &req.performed_by, req.reason.as_deref())
        .await
        .map(AutoAllocateData::from)
        .into()
}

pub async fn validate_consistency(
    ledger: &Ledger,
    req: ValidateConsistencyRequest,
) -> ApiResponse<ConsistencyReport> {
    ledger
        .reconciliation()
        .validate_consistency(req.focus_representative_id)
        .await
        .into()
}

pub async fn guard_snapshot(ledger: &Ledger) -> GuardSnapshot {
    ledger
        .metrics()
        .full_snapshot(ledger.config().guard.summary_window_minutes)
        .await
}

pub async fn guard_alerts(ledger: &Ledger) -> AlertReport {
    ledger.analyzer().current_alerts().await
}
