mod common;

use std::time::Duration;

use payledger::error::AppError;
use payledger::flags::{FlagStates, ReconciliationFlag};
use payledger::reconciliation::{ActionStatus, DriftSeverity, RunMode, RunStatus};
use payledger::store;
use payledger::Ledger;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use common::{ledger, ledger_with, payment, representative_with_invoices};

fn enforce_flags() -> FlagStates {
    FlagStates {
        active_reconciliation: ReconciliationFlag::Enforce,
        ..FlagStates::default()
    }
}

fn overwrite_cached_debt(ledger: &Ledger, rep: i64, value: Decimal) {
    let conn = ledger.db().open().unwrap();
    store::set_cached_debt(&conn, rep, value).unwrap();
}

#[tokio::test]
async fn ledger_maintained_through_the_engine_has_no_drift() {
    let fx = ledger();
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(80), dec!(50)]).await;
    let pay = payment(&fx.ledger, rep, dec!(100)).await;
    fx.ledger.allocation().auto_allocate(pay, "system", None).await.unwrap();
    fx.ledger
        .edit_invoice_amount(invoices[1], dec!(70))
        .await
        .unwrap();

    let report = fx.ledger.reconciliation().validate_consistency(None).await.unwrap();
    assert!(report.is_valid);
    assert_eq!(report.summary.checked, 1);
    assert_eq!(report.summary.inconsistent_count, 0);
    assert_eq!(fx.ledger.representative(rep).await.unwrap().total_debt, dec!(50));
}

#[tokio::test]
async fn dry_check_reports_drift_and_is_repeatable() {
    let fx = ledger();
    let (rep, _) = representative_with_invoices(&fx.ledger, &[dec!(1000)]).await;
    let (clean, _) = representative_with_invoices(&fx.ledger, &[dec!(10)]).await;
    overwrite_cached_debt(&fx.ledger, rep, dec!(1100));

    let engine = fx.ledger.reconciliation();
    let first = engine.validate_consistency(None).await.unwrap();
    let second = engine.validate_consistency(None).await.unwrap();

    assert_eq!(first, second);
    assert!(!first.is_valid);
    assert_eq!(first.summary.checked, 2);
    assert_eq!(first.summary.inconsistent_count, 1);
    let finding = &first.corrections[0];
    assert_eq!(finding.representative_id, rep);
    assert_eq!(finding.cached_debt, dec!(1100));
    assert_eq!(finding.ledger_debt, dec!(1000));
    assert_eq!(finding.difference, dec!(100));
    assert_eq!(finding.reason, "cached_above_ledger");
    assert_eq!(finding.severity, DriftSeverity::Fail);

    let focused = engine.validate_consistency(Some(clean)).await.unwrap();
    assert!(focused.is_valid);
    // dry checks never write
    assert_eq!(fx.ledger.representative(rep).await.unwrap().total_debt, dec!(1100));
}

#[tokio::test]
async fn small_drift_is_classified_by_ratio() {
    let fx = ledger();
    let (rep, _) = representative_with_invoices(&fx.ledger, &[dec!(100000)]).await;
    overwrite_cached_debt(&fx.ledger, rep, dec!(99990));

    let report = fx.ledger.reconciliation().validate_consistency(Some(rep)).await.unwrap();
    let finding = &report.corrections[0];
    assert_eq!(finding.reason, "cached_below_ledger");
    assert_eq!(finding.severity, DriftSeverity::Info);
}

#[tokio::test]
async fn focusing_on_a_missing_representative_fails() {
    let fx = ledger();
    let err = fx.ledger.reconciliation().validate_consistency(Some(77)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { entity: "representative", id: 77 }));
}

#[tokio::test]
async fn enforce_run_requires_the_flag() {
    let fx = ledger();
    let err = fx
        .ledger
        .reconciliation()
        .start_run(RunMode::Enforce, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Disabled("active_reconciliation")));
}

#[tokio::test]
async fn dry_run_records_findings_without_correcting() {
    let fx = ledger();
    let (rep, _) = representative_with_invoices(&fx.ledger, &[dec!(300)]).await;
    overwrite_cached_debt(&fx.ledger, rep, dec!(0));
    let engine = fx.ledger.reconciliation();

    let queued = engine.start_run(RunMode::Dry, None).await.unwrap();
    assert_eq!(queued.status, RunStatus::Pending);
    assert_eq!(queued.total, 1);

    let run = engine.wait(queued.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.processed, 1);
    assert_eq!(run.drift_count, 1);
    assert_eq!(run.corrected_count, 0);
    assert!(run.started_at.is_some() && run.completed_at.is_some());

    let actions = engine.run_actions(run.id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].status, ActionStatus::Reported);
    assert_eq!(actions[0].ledger_debt, dec!(300));
    assert_eq!(fx.ledger.representative(rep).await.unwrap().total_debt, dec!(0));
    assert_eq!(fx.ledger.metrics().count("reconciliation_drift"), 1);
}

#[tokio::test]
async fn enforce_run_corrects_cached_debt() {
    let fx = ledger_with(enforce_flags());
    let (drifted, _) = representative_with_invoices(&fx.ledger, &[dec!(500)]).await;
    let (clean, _) = representative_with_invoices(&fx.ledger, &[dec!(20)]).await;
    let pay = payment(&fx.ledger, drifted, dec!(200)).await;
    fx.ledger.allocation().auto_allocate(pay, "system", None).await.unwrap();
    overwrite_cached_debt(&fx.ledger, drifted, dec!(500));
    let engine = fx.ledger.reconciliation();

    let run = engine.start_run(RunMode::Enforce, None).await.unwrap();
    let run = engine.wait(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total, 2);
    assert_eq!(run.succeeded, 2);
    assert_eq!(run.drift_count, 1);
    assert_eq!(run.corrected_count, 1);
    assert_eq!(fx.ledger.representative(drifted).await.unwrap().total_debt, dec!(300));
    assert_eq!(fx.ledger.representative(clean).await.unwrap().total_debt, dec!(20));

    let actions = engine.run_actions(run.id).await.unwrap();
    assert_eq!(actions[0].status, ActionStatus::Applied);
    assert!(engine.validate_consistency(None).await.unwrap().is_valid);
}

#[tokio::test]
async fn enforce_switched_off_mid_run_only_reports() {
    let fx = ledger_with(enforce_flags());
    let (rep, _) = representative_with_invoices(&fx.ledger, &[dec!(50)]).await;
    overwrite_cached_debt(&fx.ledger, rep, dec!(5));
    let engine = fx.ledger.reconciliation();

    let run = engine.start_run(RunMode::Enforce, None).await.unwrap();
    // the spawned task has not been polled yet on this single-threaded runtime
    fx.ledger
        .flags()
        .set_active_reconciliation(ReconciliationFlag::Dry, "operator");
    let run = engine.wait(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.corrected_count, 0);
    let actions = engine.run_actions(run.id).await.unwrap();
    assert_eq!(actions[0].status, ActionStatus::Reported);
    assert!(actions[0].note.is_some());
    assert_eq!(fx.ledger.representative(rep).await.unwrap().total_debt, dec!(5));
}

#[tokio::test]
async fn cancelled_run_applies_no_corrections() {
    let fx = ledger_with(enforce_flags());
    let mut reps = Vec::new();
    for _ in 0..5 {
        let (rep, _) = representative_with_invoices(&fx.ledger, &[dec!(100)]).await;
        overwrite_cached_debt(&fx.ledger, rep, dec!(1));
        reps.push(rep);
    }
    let engine = fx.ledger.reconciliation();

    let run = engine.start_run(RunMode::Enforce, None).await.unwrap();
    assert!(engine.cancel(run.id));
    let run = engine.wait(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.processed, 0);
    assert!(run.cancelled_at.is_some());
    assert!(!engine.is_active(run.id));
    assert!(!engine.cancel(run.id));
    for rep in reps {
        assert_eq!(fx.ledger.representative(rep).await.unwrap().total_debt, dec!(1));
    }
}

#[tokio::test]
async fn one_broken_representative_does_not_abort_the_run() {
    let fx = ledger();
    let (broken, _) = representative_with_invoices(&fx.ledger, &[dec!(10)]).await;
    let (fine, _) = representative_with_invoices(&fx.ledger, &[dec!(10)]).await;
    {
        let conn = fx.ledger.db().open().unwrap();
        conn.execute(
            "UPDATE representatives SET total_debt = 'not a number' WHERE id = ?",
            [broken],
        )
        .unwrap();
    }
    let engine = fx.ledger.reconciliation();

    let run = engine.start_run(RunMode::Dry, None).await.unwrap();
    let run = engine.wait(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.processed, 2);
    assert_eq!(run.failed, 1);
    assert_eq!(run.succeeded, 1);
    assert!(run.error.unwrap().contains(&format!("representative {broken}")));
    assert_eq!(fx.ledger.metrics().count("reconciliation_unit_failed"), 1);
    assert!(engine.validate_consistency(Some(fine)).await.unwrap().is_valid);
}

#[tokio::test]
async fn one_broken_representative_does_not_abort_the_check() {
    let fx = ledger();
    let (broken, _) = representative_with_invoices(&fx.ledger, &[dec!(10)]).await;
    let (drifted, _) = representative_with_invoices(&fx.ledger, &[dec!(10)]).await;
    representative_with_invoices(&fx.ledger, &[dec!(10)]).await;
    overwrite_cached_debt(&fx.ledger, drifted, dec!(25));
    {
        let conn = fx.ledger.db().open().unwrap();
        conn.execute(
            "UPDATE representatives SET total_debt = 'not a number' WHERE id = ?",
            [broken],
        )
        .unwrap();
    }

    let report = fx.ledger.reconciliation().validate_consistency(None).await.unwrap();

    assert!(!report.is_valid);
    assert_eq!(report.summary.checked, 3);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.inconsistent_count, 1);
    assert_eq!(report.corrections[0].representative_id, drifted);
    assert_eq!(report.failures[0].representative_id, broken);
    assert_eq!(fx.ledger.metrics().count("reconciliation_unit_failed"), 1);
}

#[tokio::test]
async fn finished_runs_release_their_task_handles() {
    let fx = ledger();
    representative_with_invoices(&fx.ledger, &[dec!(10)]).await;
    let engine = fx.ledger.reconciliation();

    let run = engine.start_run(RunMode::Dry, None).await.unwrap();
    assert_eq!(engine.tracked_runs(), 1);

    for _ in 0..100 {
        if engine.tracked_runs() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.tracked_runs(), 0);
    assert_eq!(engine.run_status(run.id).await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn history_lists_newest_runs_first() {
    let fx = ledger();
    representative_with_invoices(&fx.ledger, &[dec!(10)]).await;
    let engine = fx.ledger.reconciliation();

    let first = engine.start_run(RunMode::Dry, None).await.unwrap();
    engine.wait(first.id).await.unwrap();
    let second = engine.start_run(RunMode::Dry, None).await.unwrap();
    engine.wait(second.id).await.unwrap();

    let history = engine.history(10).await.unwrap();
    let ids: Vec<i64> = history.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert!(matches!(
        engine.run_status(999).await.unwrap_err(),
        AppError::NotFound { .. }
    ));
}

#[tokio::test]
async fn editing_an_invoice_below_its_allocations_is_refused() {
    let fx = ledger();
    let (rep, invoices) = representative_with_invoices(&fx.ledger, &[dec!(100)]).await;
    let pay = payment(&fx.ledger, rep, dec!(40)).await;
    fx.ledger
        .allocation()
        .manual_allocate(pay, invoices[0], dec!(40), "alice", None)
        .await
        .unwrap();

    let err = fx.ledger.edit_invoice_amount(invoices[0], dec!(30)).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let (invoice, report) = fx.ledger.edit_invoice_amount(invoices[0], dec!(40)).await.unwrap();
    assert_eq!(invoice.status, payledger::store::InvoiceStatus::Paid);
    assert!(report.is_valid);
    assert_eq!(fx.ledger.representative(rep).await.unwrap().total_debt, dec!(0));
}
