//! Ledger rows and the SQL that reads and writes them.
//!
//! Every function takes a `&Connection`, so the same helpers run inside the
//! allocation engine's transactions (a `Transaction` derefs to `Connection`).

use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::now_iso;
use crate::error::{AppError, Result};
use crate::money::{from_micros, to_micros};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Unpaid,
    Partial,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Unpaid => "unpaid",
            InvoiceStatus::Partial => "partial",
            InvoiceStatus::Paid => "paid",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "unpaid" | "overdue" => Some(InvoiceStatus::Unpaid),
            "partial" => Some(InvoiceStatus::Partial),
            "paid" => Some(InvoiceStatus::Paid),
            _ => None,
        }
    }

    pub fn for_coverage(amount: Decimal, allocated: Decimal) -> Self {
        if allocated >= amount {
            InvoiceStatus::Paid
        } else if allocated > Decimal::ZERO {
            InvoiceStatus::Partial
        } else {
            InvoiceStatus::Unpaid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Unallocated,
    Partial,
    Full,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Unallocated => "unallocated",
            AllocationStatus::Partial => "partial",
            AllocationStatus::Full => "full",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "unallocated" => Some(AllocationStatus::Unallocated),
            "partial" => Some(AllocationStatus::Partial),
            "full" => Some(AllocationStatus::Full),
            _ => None,
        }
    }

    pub fn for_coverage(amount: Decimal, allocated: Decimal) -> Self {
        if allocated >= amount {
            AllocationStatus::Full
        } else if allocated > Decimal::ZERO {
            AllocationStatus::Partial
        } else {
            AllocationStatus::Unallocated
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationOrigin {
    Manual,
    Auto,
    Synthetic,
}

impl AllocationOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationOrigin::Manual => "manual",
            AllocationOrigin::Auto => "auto",
            AllocationOrigin::Synthetic => "synthetic",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(AllocationOrigin::Manual),
            "auto" => Some(AllocationOrigin::Auto),
            "synthetic" => Some(AllocationOrigin::Synthetic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Representative {
    pub id: i64,
    pub name: String,
    pub total_debt: Decimal,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    pub id: i64,
    pub representative_id: i64,
    pub invoice_number: String,
    pub amount: Decimal,
    pub allocated: Decimal,
    pub status: InvoiceStatus,
    pub issue_date: String,
}

impl Invoice {
    pub fn remaining(&self) -> Decimal {
        self.amount - self.allocated
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: i64,
    pub representative_id: i64,
    pub amount: Decimal,
    pub allocated: Decimal,
    pub allocation_status: AllocationStatus,
    pub invoice_id: Option<i64>,
    pub payment_date: String,
    pub description: Option<String>,
    pub created_at: String,
}

impl Payment {
    pub fn remaining(&self) -> Decimal {
        self.amount - self.allocated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationLine {
    pub id: i64,
    pub payment_id: i64,
    pub invoice_id: i64,
    pub amount: Decimal,
    pub idempotency_key: String,
    pub origin: AllocationOrigin,
    pub performed_by: Option<String>,
    pub reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewAllocation<'a> {
    pub payment_id: i64,
    pub invoice_id: i64,
    pub amount: Decimal,
    pub idempotency_key: &'a str,
    pub origin: AllocationOrigin,
    pub performed_by: Option<&'a str>,
    pub reason: Option<&'a str>,
}

/// Order in which automatic allocation settles a representative's invoices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

impl SettlementOrder {
    fn sql(&self) -> &'static str {
        match self {
            SettlementOrder::OldestFirst => "ORDER BY i.issue_date ASC, i.id ASC",
            SettlementOrder::NewestFirst => "ORDER BY i.issue_date DESC, i.id DESC",
        }
    }
}

const INVOICE_COLUMNS: &str = "
    i.id,
    i.representative_id,
    i.invoice_number,
    i.amount,
    IFNULL((SELECT SUM(pa.allocated_amount) FROM payment_allocations pa WHERE pa.invoice_id = i.id), 0),
    i.status,
    i.issue_date";

const PAYMENT_COLUMNS: &str = "
    p.id,
    p.representative_id,
    p.amount,
    IFNULL((SELECT SUM(pa.allocated_amount) FROM payment_allocations pa WHERE pa.payment_id = p.id), 0),
    p.allocation_status,
    p.invoice_id,
    p.payment_date,
    p.description,
    p.created_at";

const ALLOCATION_COLUMNS: &str = "
    id, payment_id, invoice_id, allocated_amount, idempotency_key, origin, performed_by, reason, created_at";

fn invoice_from_row(row: &Row<'_>) -> rusqlite::Result<Invoice> {
    let status: String = row.get(5)?;
    Ok(Invoice {
        id: row.get(0)?,
        representative_id: row.get(1)?,
        invoice_number: row.get(2)?,
        amount: from_micros(row.get(3)?),
        allocated: from_micros(row.get(4)?),
        status: InvoiceStatus::from_db(&status).unwrap_or(InvoiceStatus::Unpaid),
        issue_date: row.get(6)?,
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    let status: String = row.get(4)?;
    Ok(Payment {
        id: row.get(0)?,
        representative_id: row.get(1)?,
        amount: from_micros(row.get(2)?),
        allocated: from_micros(row.get(3)?),
        allocation_status: AllocationStatus::from_db(&status)
            .unwrap_or(AllocationStatus::Unallocated),
        invoice_id: row.get(5)?,
        payment_date: row.get(6)?,
        description: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn allocation_from_row(row: &Row<'_>) -> rusqlite::Result<AllocationLine> {
    let origin: String = row.get(5)?;
    Ok(AllocationLine {
        id: row.get(0)?,
        payment_id: row.get(1)?,
        invoice_id: row.get(2)?,
        amount: from_micros(row.get(3)?),
        idempotency_key: row.get(4)?,
        origin: AllocationOrigin::from_db(&origin).unwrap_or(AllocationOrigin::Manual),
        performed_by: row.get(6)?,
        reason: row.get(7)?,
        created_at: row.get(8)?,
    })
}

pub fn insert_representative(conn: &Connection, name: &str) -> Result<i64> {
    if name.trim().is_empty() {
        return Err(AppError::Validation("representative name is required".into()));
    }
    conn.execute(
        "INSERT INTO representatives (name, total_debt, is_active, created_at) VALUES (?, 0, 1, ?)",
        params![name.trim(), now_iso()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn fetch_representative(conn: &Connection, id: i64) -> Result<Option<Representative>> {
    let rep = conn
        .query_row(
            "SELECT id, name, total_debt, is_active, created_at, updated_at
             FROM representatives WHERE id = ?",
            params![id],
            |row| {
                Ok(Representative {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    total_debt: from_micros(row.get(2)?),
                    is_active: row.get::<_, i64>(3)? != 0,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(rep)
}

pub fn fetch_active_representative_ids(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM representatives WHERE is_active = 1 ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;

    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

pub fn cached_debt(conn: &Connection, representative_id: i64) -> Result<Decimal> {
    let micros = conn
        .query_row(
            "SELECT total_debt FROM representatives WHERE id = ?",
            params![representative_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .ok_or(AppError::NotFound {
            entity: "representative",
            id: representative_id,
        })?;
    Ok(from_micros(micros))
}

pub fn set_cached_debt(conn: &Connection, representative_id: i64, debt: Decimal) -> Result<()> {
    conn.execute(
        "UPDATE representatives SET total_debt = ?, updated_at = ? WHERE id = ?",
        params![to_micros(debt)?, now_iso(), representative_id],
    )?;
    Ok(())
}

/// Adds `delta` to the cached debt, as the invoice issuance and edit flows do.
pub fn adjust_cached_debt(conn: &Connection, representative_id: i64, delta: Decimal) -> Result<()> {
    let updated = conn.execute(
        "UPDATE representatives SET total_debt = total_debt + ?, updated_at = ? WHERE id = ?",
        params![to_micros(delta)?, now_iso(), representative_id],
    )?;
    if updated == 0 {
        return Err(AppError::NotFound {
            entity: "representative",
            id: representative_id,
        });
    }
    Ok(())
}

/// Σ(invoice amounts) − Σ(allocation lines on those invoices), straight from ledger rows.
pub fn ledger_debt(conn: &Connection, representative_id: i64) -> Result<Decimal> {
    let (invoiced, allocated) = conn.query_row(
        "SELECT
            IFNULL((SELECT SUM(amount) FROM invoices WHERE representative_id = ?1), 0),
            IFNULL((SELECT SUM(pa.allocated_amount)
                    FROM payment_allocations pa
                    JOIN invoices i ON i.id = pa.invoice_id
                    WHERE i.representative_id = ?1), 0)",
        params![representative_id],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
    )?;
    Ok(from_micros(invoiced - allocated))
}

/// Issues an invoice the way the issuance flow does, bumping the cached debt.
pub fn insert_invoice(
    conn: &Connection,
    representative_id: i64,
    invoice_number: &str,
    amount: Decimal,
    issue_date: &str,
) -> Result<i64> {
    if amount < Decimal::ZERO {
        return Err(AppError::Validation("invoice amount cannot be negative".into()));
    }
    let micros = to_micros(amount)?;
    adjust_cached_debt(conn, representative_id, amount)?;
    conn.execute(
        "INSERT INTO invoices (representative_id, invoice_number, amount, status, issue_date, created_at)
         VALUES (?, ?, ?, 'unpaid', ?, ?)",
        params![representative_id, invoice_number, micros, issue_date, now_iso()],
    )?;
    let invoice_id = conn.last_insert_rowid();
    refresh_invoice_status(conn, invoice_id)?;
    Ok(invoice_id)
}

pub fn fetch_invoice(conn: &Connection, id: i64) -> Result<Option<Invoice>> {
    let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices i WHERE i.id = ?");
    let invoice = conn
        .query_row(&sql, params![id], invoice_from_row)
        .optional()?;
    Ok(invoice)
}

/// Unpaid and partially paid invoices of a representative that still have capacity.
pub fn fetch_open_invoices(
    conn: &Connection,
    representative_id: i64,
    order: SettlementOrder,
) -> Result<Vec<Invoice>> {
    let sql = format!(
        "SELECT {INVOICE_COLUMNS}
         FROM invoices i
         WHERE i.representative_id = ? AND i.status IN ('unpaid', 'partial', 'overdue')
         {}",
        order.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![representative_id], invoice_from_row)?;

    let mut invoices = Vec::new();
    for row in rows {
        let invoice = row?;
        if invoice.remaining() > Decimal::ZERO {
            invoices.push(invoice);
        }
    }
    Ok(invoices)
}

/// Changes an invoice amount for the edit flow; refuses to drop below what is allocated.
pub fn update_invoice_amount(conn: &Connection, invoice_id: i64, amount: Decimal) -> Result<Invoice> {
    if amount < Decimal::ZERO {
        return Err(AppError::Validation("invoice amount cannot be negative".into()));
    }
    let invoice = fetch_invoice(conn, invoice_id)?.ok_or(AppError::NotFound {
        entity: "invoice",
        id: invoice_id,
    })?;
    if amount < invoice.allocated {
        return Err(AppError::Validation(format!(
            "invoice {invoice_id} already has {} allocated; amount {amount} would be short by {}",
            invoice.allocated,
            invoice.allocated - amount
        )));
    }
    conn.execute(
        "UPDATE invoices SET amount = ?, updated_at = ? WHERE id = ?",
        params![to_micros(amount)?, now_iso(), invoice_id],
    )?;
    refresh_invoice_status(conn, invoice_id)?;
    fetch_invoice(conn, invoice_id)?.ok_or(AppError::NotFound {
        entity: "invoice",
        id: invoice_id,
    })
}

pub fn refresh_invoice_status(conn: &Connection, invoice_id: i64) -> Result<InvoiceStatus> {
    let invoice = fetch_invoice(conn, invoice_id)?.ok_or(AppError::NotFound {
        entity: "invoice",
        id: invoice_id,
    })?;
    let status = InvoiceStatus::for_coverage(invoice.amount, invoice.allocated);
    if status != invoice.status {
        conn.execute(
            "UPDATE invoices SET status = ?, updated_at = ? WHERE id = ?",
            params![status.as_str(), now_iso(), invoice_id],
        )?;
    }
    Ok(status)
}

pub fn insert_payment(
    conn: &Connection,
    representative_id: i64,
    amount: Decimal,
    payment_date: &str,
    description: Option<&str>,
) -> Result<i64> {
    if amount <= Decimal::ZERO {
        return Err(AppError::Validation("payment amount must be positive".into()));
    }
    let exists = conn
        .query_row(
            "SELECT 1 FROM representatives WHERE id = ?",
            params![representative_id],
            |_| Ok(()),
        )
        .optional()?;
    if exists.is_none() {
        return Err(AppError::NotFound {
            entity: "representative",
            id: representative_id,
        });
    }
    conn.execute(
        "INSERT INTO payments (representative_id, amount, allocation_status, payment_date, description, created_at)
         VALUES (?, ?, 'unallocated', ?, ?, ?)",
        params![
            representative_id,
            to_micros(amount)?,
            payment_date,
            description,
            now_iso()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn fetch_payment(conn: &Connection, id: i64) -> Result<Option<Payment>> {
    let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments p WHERE p.id = ?");
    let payment = conn
        .query_row(&sql, params![id], payment_from_row)
        .optional()?;
    Ok(payment)
}

pub fn fetch_unallocated_payments(conn: &Connection, representative_id: i64) -> Result<Vec<Payment>> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS}
         FROM payments p
         WHERE p.representative_id = ? AND p.allocation_status != 'full'
         ORDER BY p.created_at DESC, p.id DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![representative_id], payment_from_row)?;

    let mut payments = Vec::new();
    for row in rows {
        payments.push(row?);
    }
    Ok(payments)
}

/// Recomputes the allocation flag and links the invoice when it is the payment's only one.
pub fn refresh_payment_status(conn: &Connection, payment_id: i64) -> Result<AllocationStatus> {
    let payment = fetch_payment(conn, payment_id)?.ok_or(AppError::NotFound {
        entity: "payment",
        id: payment_id,
    })?;
    let status = AllocationStatus::for_coverage(payment.amount, payment.allocated);
    let (distinct, sole_invoice) = conn.query_row(
        "SELECT COUNT(DISTINCT invoice_id), MIN(invoice_id) FROM payment_allocations WHERE payment_id = ?",
        params![payment_id],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
    )?;
    let invoice_id = if distinct == 1 { sole_invoice } else { None };
    conn.execute(
        "UPDATE payments SET allocation_status = ?, invoice_id = ? WHERE id = ?",
        params![status.as_str(), invoice_id, payment_id],
    )?;
    Ok(status)
}

pub fn fetch_allocation_by_key(conn: &Connection, key: &str) -> Result<Option<AllocationLine>> {
    let sql = format!("SELECT {ALLOCATION_COLUMNS} FROM payment_allocations WHERE idempotency_key = ?");
    let line = conn
        .query_row(&sql, params![key], allocation_from_row)
        .optional()?;
    Ok(line)
}

pub fn fetch_allocations_for_payment(conn: &Connection, payment_id: i64) -> Result<Vec<AllocationLine>> {
    let sql = format!(
        "SELECT {ALLOCATION_COLUMNS} FROM payment_allocations WHERE payment_id = ? ORDER BY id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![payment_id], allocation_from_row)?;

    let mut lines = Vec::new();
    for row in rows {
        lines.push(row?);
    }
    Ok(lines)
}

/// Appends a ledger line; `None` when a line with the same idempotency key exists.
pub fn insert_allocation(conn: &Connection, line: &NewAllocation<'_>) -> Result<Option<AllocationLine>> {
    let inserted = conn.execute(
        "INSERT INTO payment_allocations
            (payment_id, invoice_id, allocated_amount, idempotency_key, origin, performed_by, reason, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(idempotency_key) DO NOTHING",
        params![
            line.payment_id,
            line.invoice_id,
            to_micros(line.amount)?,
            line.idempotency_key,
            line.origin.as_str(),
            line.performed_by,
            line.reason,
            now_iso()
        ],
    )?;
    if inserted == 0 {
        return Ok(None);
    }
    fetch_allocation_by_key(conn, line.idempotency_key)
}
