//! Scenario: escrow funding lifecycle and retention release.
//!
//! GREEN when:
//! - A 100k escrow at 10% retention computes a 10k retention amount.
//! - Funding 50k leaves the escrow ACTIVE; the second 50k marks it FUNDED.
//! - Retention releases only after completion, and close only after the
//!   retention release.
//! - Funding and retention events reach the notification sink.

use std::sync::Arc;

use pmk_escrow::{EscrowEngine, EscrowError, EscrowStatus, PaymentProcessor};
use pmk_processor_paper::{PaperProcessor, RecordingSink};
use pmk_schemas::Money;

fn setup() -> (Arc<PaperProcessor>, Arc<RecordingSink>, EscrowEngine) {
    let processor = Arc::new(PaperProcessor::new());
    let sink = Arc::new(RecordingSink::new());
    let engine = EscrowEngine::new(processor.clone(), sink.clone());
    (processor, sink, engine)
}

#[test]
fn retention_amount_is_ten_percent_of_contract() {
    let (_, _, engine) = setup();
    let snap = engine
        .create_escrow(
            "project-1",
            Money::from_major(100_000),
            10,
            "client-1",
            "contractor-1",
        )
        .unwrap();

    assert_eq!(snap.retention_amount, Money::from_major(10_000));
    assert_eq!(snap.retention_percentage, 10);
    assert!(!snap.retention_released);
}

#[test]
fn funding_walks_active_then_funded() {
    let (_, sink, engine) = setup();
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

    let snap = engine
        .fund_escrow(escrow, Money::from_major(50_000), "bank_transfer", None)
        .unwrap();
    assert_eq!(snap.escrow_balance, Money::from_major(50_000));
    assert_eq!(snap.status, EscrowStatus::Active);

    let snap = engine
        .fund_escrow(escrow, Money::from_major(50_000), "bank_transfer", None)
        .unwrap();
    assert_eq!(snap.escrow_balance, Money::from_major(100_000));
    assert_eq!(snap.status, EscrowStatus::Funded);

    assert_eq!(sink.count_of("escrow_funded"), 2);
}

#[test]
fn retention_release_gates_on_completion_and_close_gates_on_retention() {
    let (processor, sink, engine) = setup();
    let snap = engine
        .create_escrow(
            "project-1",
            Money::from_major(100_000),
            10,
            "client-1",
            "contractor-1",
        )
        .unwrap();
    let escrow = snap.id;
    engine
        .fund_escrow(escrow, Money::from_major(100_000), "bank_transfer", None)
        .unwrap();

    // Retention cannot release before completion.
    let err = engine.release_retention(escrow).unwrap_err();
    assert!(matches!(err, EscrowError::RetentionNotReleasable { .. }));

    // Close cannot happen before completion either.
    let err = engine.close_escrow(escrow).unwrap_err();
    assert!(matches!(err, EscrowError::NotClosable { .. }));

    engine.mark_completed(escrow).unwrap();
    let err = engine.close_escrow(escrow).unwrap_err();
    assert!(matches!(
        err,
        EscrowError::NotClosable {
            status: "COMPLETED",
            retention_released: false,
        }
    ));

    engine.release_retention(escrow).unwrap();
    let snap = engine.get_escrow(escrow).unwrap();
    assert!(snap.retention_released);
    assert_eq!(snap.total_paid, Money::from_major(10_000));
    assert_eq!(snap.escrow_balance, Money::from_major(90_000));

    let closed = engine.close_escrow(escrow).unwrap();
    assert_eq!(closed.status, EscrowStatus::Closed);

    // Double retention release is refused.
    let err = engine.release_retention(escrow).unwrap_err();
    assert!(matches!(err, EscrowError::RetentionNotReleasable { .. }));

    // Custodial balance mirrors the engine ledger.
    let entries = engine.ledger_entries(escrow).unwrap();
    assert_eq!(entries.len(), 2); // deposit + retention release
    let handle = processor
        .open_account("project-1", "client-1", "contractor-1")
        .unwrap();
    assert_eq!(
        processor.account_balance(&handle),
        Some(Money::from_major(90_000))
    );

    assert_eq!(sink.count_of("retention_released"), 1);
    assert_eq!(sink.count_of("escrow_closed"), 1);
}

#[test]
fn closed_escrow_accepts_no_more_funds() {
    let (_, _, engine) = setup();
    // Zero retention so the escrow can close right after completion.
    let escrow = engine
        .create_escrow(
            "project-2",
            Money::from_major(10_000),
            0,
            "client-1",
            "contractor-1",
        )
        .unwrap()
        .id;
    engine
        .fund_escrow(escrow, Money::from_major(10_000), "bank_transfer", None)
        .unwrap();
    engine.mark_completed(escrow).unwrap();
    engine.close_escrow(escrow).unwrap();

    let err = engine
        .fund_escrow(escrow, Money::from_major(1), "bank_transfer", None)
        .unwrap_err();
    assert!(matches!(err, EscrowError::InvalidStateTransition { .. }));
}
