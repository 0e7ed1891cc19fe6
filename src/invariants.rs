//! Allocation invariant validation.
//!
//! [`validate_allocations`] is the single gate every allocation batch passes
//! before any write, for manual and automatic allocation alike. It is pure: it
//! performs no I/O, never mutates its inputs and always reports the complete
//! set of violations in one pass.

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TOLERANCE: Decimal = Decimal::ZERO;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSnapshot {
    pub payment_id: i64,
    pub amount: Decimal,
    #[serde(default)]
    pub already_allocated: Decimal,
}

impl PaymentSnapshot {
    pub fn remaining(&self) -> Decimal {
        self.amount - self.already_allocated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSnapshot {
    pub invoice_id: i64,
    pub amount: Decimal,
    #[serde(default)]
    pub already_allocated: Decimal,
}

impl InvoiceSnapshot {
    pub fn remaining(&self) -> Decimal {
        self.amount - self.already_allocated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedLine {
    pub invoice_id: i64,
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ProposedLine {
    pub fn new(invoice_id: i64, amount: Decimal) -> Self {
        Self {
            invoice_id,
            amount,
            idempotency_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Violation {
    EmptyLines,
    NonPositiveTotal { total: Decimal },
    PaymentOverflow { requested: Decimal, remaining: Decimal },
    InvoiceNotFound { invoice_id: i64 },
    NonPositiveAmount { invoice_id: i64, amount: Decimal },
    InvoiceOverflow { invoice_id: i64, amount: Decimal, remaining: Decimal },
    /// A line with the same payment, invoice and amount is already on the
    /// ledger while the invoice still has capacity.
    DuplicateLine { invoice_id: i64, amount: Decimal, idempotency_key: String },
}

impl Violation {
    pub fn code(&self) -> &'static str {
        match self {
            Violation::EmptyLines => "EMPTY_LINES",
            Violation::NonPositiveTotal { .. } => "NON_POSITIVE_TOTAL",
            Violation::PaymentOverflow { .. } => "PAYMENT_OVERFLOW",
            Violation::InvoiceNotFound { .. } => "INVOICE_NOT_FOUND",
            Violation::NonPositiveAmount { .. } => "NON_POSITIVE_AMOUNT",
            Violation::InvoiceOverflow { .. } => "INVOICE_OVERFLOW",
            Violation::DuplicateLine { .. } => "DUPLICATE_LINE",
        }
    }

    /// Guard metric event type recorded for this violation.
    pub fn metric_type(&self) -> &'static str {
        match self {
            Violation::EmptyLines => "allocation_empty_lines",
            Violation::NonPositiveTotal { .. } => "allocation_non_positive_total",
            Violation::PaymentOverflow { .. } => "allocation_payment_overflow",
            Violation::InvoiceNotFound { .. } => "allocation_invoice_not_found",
            Violation::NonPositiveAmount { .. } => "allocation_negative_amount",
            Violation::InvoiceOverflow { .. } => "allocation_over_remaining",
            Violation::DuplicateLine { .. } => "allocation_idempotency_collision",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::EmptyLines => write!(f, "EMPTY_LINES: no allocation lines were proposed"),
            Violation::NonPositiveTotal { total } => {
                write!(f, "NON_POSITIVE_TOTAL: total requested {total} must be positive")
            }
            Violation::PaymentOverflow {
                requested,
                remaining,
            } => write!(
                f,
                "PAYMENT_OVERFLOW: requested {requested} exceeds payment remaining {remaining} by {}",
                requested - remaining
            ),
            Violation::InvoiceNotFound { invoice_id } => {
                write!(f, "INVOICE_NOT_FOUND: invoice {invoice_id}")
            }
            Violation::NonPositiveAmount { invoice_id, amount } => write!(
                f,
                "NON_POSITIVE_AMOUNT: invoice {invoice_id} line amount {amount} must be positive"
            ),
            Violation::InvoiceOverflow {
                invoice_id,
                amount,
                remaining,
            } => write!(
                f,
                "INVOICE_OVERFLOW: invoice {invoice_id} line amount {amount} exceeds remaining {remaining} by {}",
                amount - remaining
            ),
            Violation::DuplicateLine {
                invoice_id,
                amount,
                idempotency_key,
            } => write!(
                f,
                "DUPLICATE_LINE: invoice {invoice_id} already holds a {amount} line from this payment ({idempotency_key})"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub violations: Vec<Violation>,
    pub total_requested: Decimal,
    /// Payment remaining before this batch.
    pub payment_remaining: Decimal,
    /// Payment remaining if the batch were applied as requested.
    pub payment_remaining_after: Decimal,
    pub per_invoice_remaining: BTreeMap<i64, Decimal>,
}

impl ValidationReport {
    pub fn codes(&self) -> Vec<&'static str> {
        self.violations.iter().map(Violation::code).collect()
    }

    pub fn has(&self, code: &str) -> bool {
        self.violations.iter().any(|v| v.code() == code)
    }

    /// Adds a violation found outside the pure checks, such as a ledger key conflict.
    pub fn reject(&mut self, violation: Violation) {
        self.ok = false;
        self.violations.push(violation);
    }

    pub fn describe(&self) -> String {
        self.violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub fn validate_allocations(
    payment: &PaymentSnapshot,
    invoices: &[InvoiceSnapshot],
    lines: &[ProposedLine],
    tolerance: Decimal,
) -> ValidationReport {
    let payment_remaining = payment.remaining();
    let per_invoice_remaining: BTreeMap<i64, Decimal> = invoices
        .iter()
        .map(|inv| (inv.invoice_id, inv.remaining()))
        .collect();

    if lines.is_empty() {
        return ValidationReport {
            ok: false,
            violations: vec![Violation::EmptyLines],
            total_requested: Decimal::ZERO,
            payment_remaining,
            payment_remaining_after: payment_remaining,
            per_invoice_remaining,
        };
    }

    let mut violations = Vec::new();
    let total_requested: Decimal = lines.iter().map(|line| line.amount).sum();
    if total_requested <= Decimal::ZERO {
        violations.push(Violation::NonPositiveTotal {
            total: total_requested,
        });
    }
    if total_requested - payment_remaining > tolerance {
        violations.push(Violation::PaymentOverflow {
            requested: total_requested,
            remaining: payment_remaining,
        });
    }

    // lines in one batch may target the same invoice, so capacity is consumed
    // cumulatively
    let mut consumed: BTreeMap<i64, Decimal> = BTreeMap::new();
    for line in lines {
        let Some(remaining) = per_invoice_remaining.get(&line.invoice_id) else {
            violations.push(Violation::InvoiceNotFound {
                invoice_id: line.invoice_id,
            });
            continue;
        };
        if line.amount <= Decimal::ZERO {
            violations.push(Violation::NonPositiveAmount {
                invoice_id: line.invoice_id,
                amount: line.amount,
            });
            continue;
        }
        let used = consumed.entry(line.invoice_id).or_insert(Decimal::ZERO);
        let available = *remaining - *used;
        if line.amount - available > tolerance {
            violations.push(Violation::InvoiceOverflow {
                invoice_id: line.invoice_id,
                amount: line.amount,
                remaining: available,
            });
            continue;
        }
        *used += line.amount;
    }

    ValidationReport {
        ok: violations.is_empty(),
        violations,
        total_requested,
        payment_remaining,
        payment_remaining_after: payment_remaining - total_requested,
        per_invoice_remaining,
    }
}
