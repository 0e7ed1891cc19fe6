mod common;

use std::sync::Arc;

use payledger::error::{AppError, ErrorKind};
use payledger::invariants::{
    validate_allocations, InvoiceSnapshot, PaymentSnapshot, ProposedLine, Violation, DEFAULT_TOLERANCE,
};
use payledger::store::{AllocationOrigin, AllocationStatus, InvoiceStatus};
use rust_decimal_macros::dec;

use common::{ledger, ledger_with_cache, payment, representative_with_invoices, RecordingCache};

fn rejected_codes(err: &AppError) -> Vec<&'static str> {
    err.report().map(|r| r.codes()).unwrap_or_default()
}

#[tokio::test]
async fn manual_allocation_can_consume_an_invoice_exactly() {
    let fx = ledger();
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(80)]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;

    let receipt = fx
        .ledger
        .allocation()
        .manual_allocate(pay, invoices[0], dec!(80), "alice", Some("settle"))
        .await
        .unwrap();

    assert!(!receipt.replayed);
    assert_eq!(receipt.allocated_to_invoice(invoices[0]), dec!(80));
    assert_eq!(receipt.payment_status, AllocationStatus::Partial);
    assert_eq!(receipt.payment_remaining, dec!(20));
    let invoice = receipt.invoice(invoices[0]).unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.remaining, dec!(0));

    let history = fx.ledger.allocation().allocation_history(pay).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].origin, AllocationOrigin::Manual);
    assert_eq!(history[0].performed_by.as_deref(), Some("alice"));
    assert!(history[0].idempotency_key.starts_with("sha256:p:"));
}

#[tokio::test]
async fn payment_split_across_two_invoices() {
    let fx = ledger();
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(80), dec!(50)]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;
    let engine = fx.ledger.allocation();

    engine.manual_allocate(pay, invoices[0], dec!(60), "alice", None).await.unwrap();
    let receipt = engine.manual_allocate(pay, invoices[1], dec!(30), "alice", None).await.unwrap();

    assert_eq!(receipt.payment_remaining, dec!(10));
    assert_eq!(receipt.payment_status, AllocationStatus::Partial);
    assert_eq!(fx.ledger.invoice(invoices[0]).await.unwrap().status, InvoiceStatus::Partial);
    assert_eq!(fx.ledger.invoice(invoices[1]).await.unwrap().status, InvoiceStatus::Partial);

    let rep_row = fx.ledger.representative(rep).await.unwrap();
    assert_eq!(rep_row.total_debt, dec!(40));
}

#[tokio::test]
async fn payment_overflow_is_rejected_without_writes() {
    let fx = ledger();
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(200)]).await;
    let pay = payment(&fx.ledger, rep, dec!(50)).await;

    let err = fx
        .ledger
        .allocation()
        .manual_allocate(pay, invoices[0], dec!(60), "alice", None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(rejected_codes(&err), vec!["PAYMENT_OVERFLOW"]);
    assert!(err.to_string().contains("by 10"));
    assert!(fx.ledger.allocation().allocation_history(pay).await.unwrap().is_empty());
    assert_eq!(fx.ledger.invoice(invoices[0]).await.unwrap().status, InvoiceStatus::Unpaid);
    assert_eq!(fx.ledger.metrics().count("allocation_payment_overflow"), 1);
}

#[tokio::test]
async fn invoice_overflow_reports_remaining() {
    let fx = ledger();
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(40)]).await;
    let pay = payment(&fx.ledger, rep, dec!(500)).await;

    let err = fx
        .ledger
        .allocation()
        .manual_allocate(pay, invoices[0], dec!(45), "alice", None)
        .await
        .unwrap_err();

    let report = err.report().unwrap();
    assert_eq!(report.codes(), vec!["INVOICE_OVERFLOW"]);
    assert_eq!(report.per_invoice_remaining[&invoices[0]], dec!(40));
    assert_eq!(fx.ledger.metrics().count("allocation_over_remaining"), 1);
}

#[tokio::test]
async fn unknown_invoice_and_zero_amount_are_validation_failures() {
    let fx = ledger();
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(40)]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;
    let engine = fx.ledger.allocation();

    let err = engine.manual_allocate(pay, 9_999, dec!(10), "alice", None).await.unwrap_err();
    assert_eq!(rejected_codes(&err), vec!["INVOICE_NOT_FOUND"]);

    let err = engine.manual_allocate(pay, invoices[0], dec!(0), "alice", None).await.unwrap_err();
    assert!(err.report().unwrap().has("NON_POSITIVE_AMOUNT"));
    assert!(err.report().unwrap().has("NON_POSITIVE_TOTAL"));
}

#[tokio::test]
async fn missing_payment_is_not_found() {
    let fx = ledger();
    let err = fx
        .ledger
        .allocation()
        .manual_allocate(404, 1, dec!(10), "alice", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound { entity: "payment", id: 404 }));
    assert!(!err.is_system());
}

#[tokio::test]
async fn invoice_of_another_representative_is_refused() {
    let fx = ledger();
    let (rep, _) = representative_with_invoices(&fx.ledger, &[dec!(40)]).await;
    let (_, other_invoices) = representative_with_invoices(&fx.ledger, &[dec!(40)]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;

    let err = fx
        .ledger
        .allocation()
        .manual_allocate(pay, other_invoices[0], dec!(10), "alice", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn retrying_a_manual_allocation_is_a_no_op() {
    let fx = ledger();
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(80)]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;
    let engine = fx.ledger.allocation();

    let first = engine.manual_allocate(pay, invoices[0], dec!(30), "alice", None).await.unwrap();
    // same logical amount, different representation
    let second = engine
        .manual_allocate(pay, invoices[0], dec!(30.0000000001), "alice", None)
        .await
        .unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.lines[0].idempotency_key, second.lines[0].idempotency_key);
    assert_eq!(second.payment_remaining, dec!(70));
    assert_eq!(engine.allocation_history(pay).await.unwrap().len(), 1);
    assert_eq!(fx.ledger.representative(rep).await.unwrap().total_debt, dec!(50));
}

#[tokio::test]
async fn auto_allocation_settles_oldest_invoices_first() {
    let fx = ledger();
    let (rep, invoices) =
        representative_with_invoices(&fx.ledger, &[dec!(40), dec!(50), dec!(70)]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;

    let receipt = fx.ledger.allocation().auto_allocate(pay, "system", None).await.unwrap();

    let lines: Vec<_> = receipt.lines.iter().map(|l| (l.invoice_id, l.amount)).collect();
    assert_eq!(
        lines,
        vec![(invoices[0], dec!(40)), (invoices[1], dec!(50)), (invoices[2], dec!(10))]
    );
    assert!(receipt.lines.iter().all(|l| l.origin == AllocationOrigin::Auto));
    assert_eq!(receipt.payment_status, AllocationStatus::Full);
    assert_eq!(receipt.payment_remaining, dec!(0));
    assert_eq!(receipt.invoice(invoices[0]).unwrap().status, InvoiceStatus::Paid);
    assert_eq!(receipt.invoice(invoices[1]).unwrap().status, InvoiceStatus::Paid);
    assert_eq!(receipt.invoice(invoices[2]).unwrap().status, InvoiceStatus::Partial);

    let eligible = fx.ledger.allocation().eligible_invoices(rep).await.unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].remaining(), dec!(60));
}

#[tokio::test]
async fn auto_allocation_leaves_remainder_unallocated() {
    let fx = ledger();
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(30)]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;

    let receipt = fx.ledger.allocation().auto_allocate(pay, "system", None).await.unwrap();

    assert_eq!(receipt.allocated_to_invoice(invoices[0]), dec!(30));
    assert_eq!(receipt.payment_status, AllocationStatus::Partial);
    assert_eq!(receipt.payment_remaining, dec!(70));

    let open = fx.ledger.allocation().unallocated_payments(rep).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].remaining(), dec!(70));
    assert_eq!(open[0].invoice_id, Some(invoices[0]));
}

#[tokio::test]
async fn retrying_auto_allocation_writes_nothing() {
    let fx = ledger();
    let (rep, _) = representative_with_invoices(&fx.ledger, &[dec!(40), dec!(80)]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;
    let engine = fx.ledger.allocation();

    let first = engine.auto_allocate(pay, "system", None).await.unwrap();
    let second = engine.auto_allocate(pay, "system", None).await.unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(second.lines.len(), first.lines.len());
    assert_eq!(engine.allocation_history(pay).await.unwrap().len(), 2);
}

#[tokio::test]
async fn auto_allocation_fills_invoices_partly_paid_by_hand() {
    let fx = ledger();
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(40), dec!(50)]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;
    let engine = fx.ledger.allocation();
    engine
        .manual_allocate(pay, invoices[0], dec!(10), "alice", None)
        .await
        .unwrap();

    let receipt = engine.auto_allocate(pay, "system", None).await.unwrap();

    assert!(!receipt.replayed);
    assert_eq!(receipt.allocated_to_invoice(invoices[0]), dec!(30));
    assert_eq!(receipt.allocated_to_invoice(invoices[1]), dec!(50));
    assert_eq!(receipt.invoice(invoices[0]).unwrap().status, InvoiceStatus::Paid);
    assert_eq!(receipt.payment_remaining, dec!(10));
}

#[tokio::test]
async fn auto_allocation_matching_an_earlier_line_is_rejected_not_replayed() {
    let fx = ledger();
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(40)]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;
    let engine = fx.ledger.allocation();
    engine
        .manual_allocate(pay, invoices[0], dec!(20), "alice", None)
        .await
        .unwrap();

    let err = engine.auto_allocate(pay, "system", None).await.unwrap_err();

    assert_eq!(rejected_codes(&err), vec!["DUPLICATE_LINE"]);
    let report = err.report().unwrap();
    assert!(matches!(
        &report.violations[0],
        Violation::DuplicateLine { invoice_id, amount, .. }
            if *invoice_id == invoices[0] && *amount == dec!(20)
    ));
    assert_eq!(engine.allocation_history(pay).await.unwrap().len(), 1);
    let invoice = fx.ledger.invoice(invoices[0]).await.unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Partial);
    assert_eq!(invoice.remaining(), dec!(20));
    assert_eq!(fx.ledger.metrics().count("allocation_idempotency_collision"), 1);
}

#[tokio::test]
async fn auto_allocation_without_open_invoices_is_rejected() {
    let fx = ledger();
    let (rep, _) = representative_with_invoices(&fx.ledger, &[]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;

    let err = fx.ledger.allocation().auto_allocate(pay, "system", None).await.unwrap_err();
    assert_eq!(rejected_codes(&err), vec!["EMPTY_LINES"]);
    assert_eq!(fx.ledger.metrics().count("allocation_empty_lines"), 1);
}

#[tokio::test]
async fn auto_lines_pass_the_validator_against_the_prior_state() {
    let fx = ledger();
    let (rep, invoices) =
        representative_with_invoices(&fx.ledger, &[dec!(25.5), dec!(10), dec!(99.999999)]).await;
    let earlier = payment(&fx.ledger, rep, dec!(5)).await;
    fx.ledger
        .allocation()
        .manual_allocate(earlier, invoices[0], dec!(5), "alice", None)
        .await
        .unwrap();
    let pay = payment(&fx.ledger, rep, dec!(120)).await;

    let before = fx.ledger.allocation().eligible_invoices(rep).await.unwrap();
    let receipt = fx.ledger.allocation().auto_allocate(pay, "system", None).await.unwrap();

    let snapshots: Vec<InvoiceSnapshot> = before
        .iter()
        .map(|inv| InvoiceSnapshot {
            invoice_id: inv.id,
            amount: inv.amount,
            already_allocated: inv.allocated,
        })
        .collect();
    let lines: Vec<ProposedLine> = receipt
        .lines
        .iter()
        .map(|l| ProposedLine::new(l.invoice_id, l.amount))
        .collect();
    let payment_snapshot = PaymentSnapshot {
        payment_id: pay,
        amount: dec!(120),
        already_allocated: dec!(0),
    };
    let report = validate_allocations(&payment_snapshot, &snapshots, &lines, DEFAULT_TOLERANCE);
    assert!(report.ok, "{}", report.describe());
    assert_eq!(receipt.allocated_total, dec!(120));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_never_overfill_an_invoice() {
    let fx = ledger();
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(100)]).await;
    let mut payments = Vec::new();
    for _ in 0..5 {
        payments.push(payment(&fx.ledger, rep, dec!(30)).await);
    }
    let invoice = invoices[0];
    let ledger = Arc::new(fx.ledger);

    let mut tasks = Vec::new();
    for pay in payments {
        let ledger = Arc::clone(&ledger);
        tasks.push(tokio::spawn(async move {
            ledger
                .allocation()
                .manual_allocate(pay, invoice, dec!(30), "racer", None)
                .await
        }));
    }

    let mut succeeded = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(err) => assert_eq!(rejected_codes(&err), vec!["INVOICE_OVERFLOW"]),
        }
    }

    assert_eq!(succeeded, 3);
    let stored = ledger.invoice(invoice).await.unwrap();
    assert_eq!(stored.allocated, dec!(90));
    assert!(stored.allocated <= stored.amount);
}

#[tokio::test]
async fn committed_allocations_invalidate_the_summary_cache() {
    let cache = Arc::new(RecordingCache::default());
    let fx = ledger_with_cache(Arc::clone(&cache));
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(80)]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;
    cache.calls.lock().unwrap().clear();

    fx.ledger
        .allocation()
        .manual_allocate(pay, invoices[0], dec!(10), "alice", None)
        .await
        .unwrap();
    // replay and rejection must not invalidate
    fx.ledger
        .allocation()
        .manual_allocate(pay, invoices[0], dec!(10), "alice", None)
        .await
        .unwrap();
    let _ = fx
        .ledger
        .allocation()
        .manual_allocate(pay, invoices[0], dec!(500), "alice", None)
        .await;

    let calls = cache.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![(rep, true, "payment_allocation".to_string())]);
}
