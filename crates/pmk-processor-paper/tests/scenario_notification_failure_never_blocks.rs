//! Scenario: notification delivery is best-effort — a sink that refuses
//! every event must not block or roll back any financial transition.

use std::sync::Arc;

use pmk_escrow::{EscrowEngine, EscrowStatus};
use pmk_payments::UnitState;
use pmk_processor_paper::{FailingSink, PaperProcessor};
use pmk_schemas::Money;

#[test]
fn financial_transitions_survive_a_dead_sink() {
    let engine = EscrowEngine::new(Arc::new(PaperProcessor::new()), Arc::new(FailingSink));

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
        .fund_escrow(escrow, Money::from_major(100_000), "bank_transfer", None)
        .unwrap();
    assert_eq!(snap.status, EscrowStatus::Funded);

    let unit = engine
        .create_task_payment(
            escrow,
            "task-1",
            Money::from_major(5_000),
            vec![],
            vec![],
            false,
            false,
        )
        .unwrap();
    let unit = engine.verify_completion(unit.id, 95, vec![], None).unwrap();
    assert_eq!(unit.state, UnitState::Paid);

    let dispute = engine
        .open_dispute(
            escrow,
            None,
            Money::from_major(1_000),
            "client-1",
            "contractor-1",
        )
        .unwrap();
    engine
        .resolve_dispute(dispute.id, "withdrawn", Money::ZERO, "admin-1")
        .unwrap();

    let snap = engine.get_escrow(escrow).unwrap();
    assert_eq!(snap.escrow_balance, Money::from_major(95_000));
    assert_eq!(snap.open_dispute_count, 0);
}
