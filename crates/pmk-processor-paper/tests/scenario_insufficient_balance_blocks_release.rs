//! Scenario: releases are gated on the available balance and are
//! all-or-nothing against the processor.
//!
//! GREEN when:
//! - Releasing 60k against a 50k balance fails with
//!   `InsufficientEscrowBalance` and changes nothing.
//! - fund(X) followed by release(X) nets the balance back to where it
//!   started.
//! - A processor withdrawal failure writes no ledger entry and moves no
//!   balance.

use std::sync::Arc;

use pmk_escrow::{EscrowEngine, EscrowError, NullSink};
use pmk_processor_paper::PaperProcessor;
use pmk_schemas::{EscrowId, Money, PaymentType};

fn setup() -> (Arc<PaperProcessor>, EscrowEngine) {
    let processor = Arc::new(PaperProcessor::new());
    let engine = EscrowEngine::new(processor.clone(), Arc::new(NullSink));
    (processor, engine)
}

fn escrow_with_balance(engine: &EscrowEngine, balance: i64) -> EscrowId {
    let escrow = engine
        .create_escrow(
            "project-1",
            Money::from_major(100_000),
            10,
            "client-1",
            "contractor-1",
        )
        .unwrap()
        .id;
    engine
        .fund_escrow(escrow, Money::from_major(balance), "bank_transfer", None)
        .unwrap();
    escrow
}

#[test]
fn oversized_release_is_refused_and_balances_hold() {
    let (_, engine) = setup();
    let escrow = escrow_with_balance(&engine, 50_000);

    let err = engine
        .release_funds(
            escrow,
            "contractor-1",
            Money::from_major(60_000),
            PaymentType::TaskCompletion,
            None,
        )
        .unwrap_err();
    assert_eq!(
        err,
        EscrowError::InsufficientEscrowBalance {
            requested: Money::from_major(60_000),
            available: Money::from_major(50_000),
        }
    );

    let snap = engine.get_escrow(escrow).unwrap();
    assert_eq!(snap.escrow_balance, Money::from_major(50_000));
    assert_eq!(snap.total_paid, Money::ZERO);
    assert_eq!(engine.ledger_entries(escrow).unwrap().len(), 1);
}

#[test]
fn fund_then_release_round_trips_the_balance() {
    let (_, engine) = setup();
    let escrow = escrow_with_balance(&engine, 30_000);
    let before = engine.get_escrow(escrow).unwrap().escrow_balance;

    engine
        .fund_escrow(escrow, Money::from_major(7_000), "bank_transfer", None)
        .unwrap();
    engine
        .release_funds(
            escrow,
            "contractor-1",
            Money::from_major(7_000),
            PaymentType::TaskCompletion,
            None,
        )
        .unwrap();

    let snap = engine.get_escrow(escrow).unwrap();
    assert_eq!(snap.escrow_balance, before);
    assert_eq!(snap.total_deposited, Money::from_major(37_000));
    assert_eq!(snap.total_paid, Money::from_major(7_000));
    assert_eq!(snap.escrow_balance, snap.total_deposited - snap.total_paid);
}

#[test]
fn processor_withdrawal_failure_is_atomic() {
    let (processor, engine) = setup();
    let escrow = escrow_with_balance(&engine, 50_000);
    processor.set_fail_withdrawals(true);

    let err = engine
        .release_funds(
            escrow,
            "contractor-1",
            Money::from_major(10_000),
            PaymentType::TaskCompletion,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, EscrowError::Processor(_)));
    assert!(err.is_retryable());

    let snap = engine.get_escrow(escrow).unwrap();
    assert_eq!(snap.escrow_balance, Money::from_major(50_000));
    assert_eq!(snap.total_paid, Money::ZERO);
    assert_eq!(engine.ledger_entries(escrow).unwrap().len(), 1, "deposit only");

    // Same release succeeds once the processor recovers.
    processor.set_fail_withdrawals(false);
    engine
        .release_funds(
            escrow,
            "contractor-1",
            Money::from_major(10_000),
            PaymentType::TaskCompletion,
            None,
        )
        .unwrap();
    assert_eq!(
        engine.get_escrow(escrow).unwrap().escrow_balance,
        Money::from_major(40_000)
    );
}

#[test]
fn signed_ledger_sum_always_reconciles() {
    let (_, engine) = setup();
    let escrow = escrow_with_balance(&engine, 80_000);
    engine
        .release_funds(
            escrow,
            "contractor-1",
            Money::from_major(11_000),
            PaymentType::Milestone,
            None,
        )
        .unwrap();
    engine
        .release_funds(
            escrow,
            "contractor-1",
            Money::from_major(4_000),
            PaymentType::TaskCompletion,
            None,
        )
        .unwrap();
    engine
        .fund_escrow(escrow, Money::from_major(5_000), "bank_transfer", None)
        .unwrap();

    let snap = engine.get_escrow(escrow).unwrap();
    let signed_sum: Money = engine
        .ledger_entries(escrow)
        .unwrap()
        .iter()
        .map(|e| e.amount)
        .sum();

    assert_eq!(signed_sum, snap.total_deposited - snap.total_paid);
    assert_eq!(snap.escrow_balance, Money::from_major(70_000));
    assert!(snap.escrow_balance.is_non_negative());
}
