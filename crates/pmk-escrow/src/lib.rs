//! pmk-escrow
//!
//! Escrow account manager and the engine that orchestrates conditional
//! payments, change orders, and disputes over it.
//!
//! - The ledger is the single source for fund totals; the escrow balance is
//!   always `total_deposited - total_paid` by construction.
//! - Payments may only be released against the available balance, which
//!   excludes dispute-frozen amounts.
//! - [`EscrowEngine`] is the only public path to balance-affecting
//!   operations; external money movement flows through the injected
//!   [`PaymentProcessor`], notification fan-out through the injected
//!   [`NotificationSink`].

mod account;
mod engine;
mod error;
mod processor;

pub use account::{EscrowAccount, EscrowStatus};
pub use engine::{EscrowEngine, EscrowSnapshot};
pub use error::EscrowError;
pub use processor::{
    NotificationSink, NullSink, PaymentProcessor, ProcessorError, SinkError,
};

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use pmk_schemas::{AccountHandle, Money, PaymentType, TransactionId};

    use super::*;

    /// Deterministic in-crate stub; the full paper processor lives in
    /// pmk-processor-paper and is exercised by the scenario tests there.
    #[derive(Default)]
    struct StubProcessor {
        fail_deposits: AtomicBool,
        fail_withdrawals: AtomicBool,
    }

    impl PaymentProcessor for StubProcessor {
        fn open_account(
            &self,
            project_id: &str,
            _client_id: &str,
            _contractor_id: &str,
        ) -> Result<AccountHandle, ProcessorError> {
            Ok(AccountHandle::new(format!("stub:{project_id}")))
        }

        fn deposit(
            &self,
            _account: &AccountHandle,
            _amount: Money,
            _method: &str,
            idempotency_key: &str,
        ) -> Result<TransactionId, ProcessorError> {
            if self.fail_deposits.load(Ordering::SeqCst) {
                return Err(ProcessorError::new("deposit", "stub refusal"));
            }
            Ok(TransactionId::new(format!("stub:dep:{idempotency_key}")))
        }

        fn withdraw(
            &self,
            _account: &AccountHandle,
            _recipient_id: &str,
            _amount: Money,
            idempotency_key: &str,
        ) -> Result<TransactionId, ProcessorError> {
            if self.fail_withdrawals.load(Ordering::SeqCst) {
                return Err(ProcessorError::new("withdraw", "stub refusal"));
            }
            Ok(TransactionId::new(format!("stub:wd:{idempotency_key}")))
        }
    }

    fn engine() -> (Arc<StubProcessor>, EscrowEngine) {
        let processor = Arc::new(StubProcessor::default());
        let engine = EscrowEngine::new(processor.clone(), Arc::new(NullSink));
        (processor, engine)
    }

    fn create(engine: &EscrowEngine, total: i64, retention_pct: u32) -> EscrowSnapshot {
        engine
            .create_escrow(
                "project-1",
                Money::from_major(total),
                retention_pct,
                "client-1",
                "contractor-1",
            )
            .unwrap()
    }

    #[test]
    fn create_escrow_computes_retention() {
        let (_, engine) = engine();
        let snap = create(&engine, 100_000, 10);

        assert_eq!(snap.retention_amount, Money::from_major(10_000));
        assert_eq!(snap.status, EscrowStatus::Created);
        assert_eq!(snap.escrow_balance, Money::ZERO);
        assert_eq!(snap.version, 0);
    }

    #[test]
    fn create_escrow_rejects_bad_retention() {
        let (_, engine) = engine();
        let err = engine
            .create_escrow(
                "project-1",
                Money::from_major(100_000),
                101,
                "client-1",
                "contractor-1",
            )
            .unwrap_err();
        assert_eq!(err, EscrowError::InvalidRetention { percentage: 101 });
    }

    #[test]
    fn processor_refusal_creates_no_escrow() {
        struct RefusingProcessor;
        impl PaymentProcessor for RefusingProcessor {
            fn open_account(
                &self,
                _: &str,
                _: &str,
                _: &str,
            ) -> Result<AccountHandle, ProcessorError> {
                Err(ProcessorError::new("open_account", "refused"))
            }
            fn deposit(
                &self,
                _: &AccountHandle,
                _: Money,
                _: &str,
                _: &str,
            ) -> Result<TransactionId, ProcessorError> {
                unreachable!("no account was opened")
            }
            fn withdraw(
                &self,
                _: &AccountHandle,
                _: &str,
                _: Money,
                _: &str,
            ) -> Result<TransactionId, ProcessorError> {
                unreachable!("no account was opened")
            }
        }

        let engine = EscrowEngine::new(Arc::new(RefusingProcessor), Arc::new(NullSink));
        let err = engine
            .create_escrow(
                "project-1",
                Money::from_major(100_000),
                10,
                "client-1",
                "contractor-1",
            )
            .unwrap_err();
        assert!(matches!(err, EscrowError::Processor(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn funding_progresses_active_then_funded() {
        let (_, engine) = engine();
        let escrow = create(&engine, 100_000, 10).id;

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
    }

    #[test]
    fn failed_deposit_changes_nothing() {
        let (processor, engine) = engine();
        let escrow = create(&engine, 100_000, 10).id;
        processor.fail_deposits.store(true, Ordering::SeqCst);

        let err = engine
            .fund_escrow(escrow, Money::from_major(50_000), "bank_transfer", None)
            .unwrap_err();
        assert!(matches!(err, EscrowError::Processor(_)));

        let snap = engine.get_escrow(escrow).unwrap();
        assert_eq!(snap.escrow_balance, Money::ZERO);
        assert_eq!(snap.total_deposited, Money::ZERO);
        assert_eq!(snap.status, EscrowStatus::Created);
        assert!(engine.ledger_entries(escrow).unwrap().is_empty());
    }

    #[test]
    fn release_respects_available_balance() {
        let (_, engine) = engine();
        let escrow = create(&engine, 100_000, 10).id;
        engine
            .fund_escrow(escrow, Money::from_major(50_000), "bank_transfer", None)
            .unwrap();

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
        assert!(err.is_retryable());

        // Balances unchanged by the refused release.
        let snap = engine.get_escrow(escrow).unwrap();
        assert_eq!(snap.escrow_balance, Money::from_major(50_000));
        assert_eq!(snap.total_paid, Money::ZERO);
    }

    #[test]
    fn failed_withdrawal_changes_nothing() {
        let (processor, engine) = engine();
        let escrow = create(&engine, 100_000, 10).id;
        engine
            .fund_escrow(escrow, Money::from_major(50_000), "bank_transfer", None)
            .unwrap();
        processor.fail_withdrawals.store(true, Ordering::SeqCst);

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

        let snap = engine.get_escrow(escrow).unwrap();
        assert_eq!(snap.escrow_balance, Money::from_major(50_000));
        assert_eq!(engine.ledger_entries(escrow).unwrap().len(), 1); // deposit only
    }

    #[test]
    fn duplicate_release_key_is_already_paid() {
        let (_, engine) = engine();
        let escrow = create(&engine, 100_000, 10).id;
        engine
            .fund_escrow(escrow, Money::from_major(50_000), "bank_transfer", None)
            .unwrap();

        engine
            .release_funds(
                escrow,
                "contractor-1",
                Money::from_major(5_000),
                PaymentType::TaskCompletion,
                Some("release-1".into()),
            )
            .unwrap();
        let err = engine
            .release_funds(
                escrow,
                "contractor-1",
                Money::from_major(5_000),
                PaymentType::TaskCompletion,
                Some("release-1".into()),
            )
            .unwrap_err();
        assert_eq!(err, EscrowError::AlreadyPaid);
        assert_eq!(engine.ledger_entries(escrow).unwrap().len(), 2);
    }

    #[test]
    fn close_requires_completion_and_retention_release() {
        let (_, engine) = engine();
        let escrow = create(&engine, 100_000, 10).id;
        engine
            .fund_escrow(escrow, Money::from_major(100_000), "bank_transfer", None)
            .unwrap();

        let err = engine.close_escrow(escrow).unwrap_err();
        assert!(matches!(err, EscrowError::NotClosable { .. }));

        engine.mark_completed(escrow).unwrap();
        let err = engine.close_escrow(escrow).unwrap_err();
        assert!(matches!(
            err,
            EscrowError::NotClosable {
                retention_released: false,
                ..
            }
        ));

        engine.release_retention(escrow).unwrap();
        let snap = engine.close_escrow(escrow).unwrap();
        assert_eq!(snap.status, EscrowStatus::Closed);
        assert!(snap.retention_released);
    }

    #[test]
    fn retention_release_only_when_completed() {
        let (_, engine) = engine();
        let escrow = create(&engine, 100_000, 10).id;
        engine
            .fund_escrow(escrow, Money::from_major(100_000), "bank_transfer", None)
            .unwrap();

        let err = engine.release_retention(escrow).unwrap_err();
        assert!(matches!(err, EscrowError::RetentionNotReleasable { .. }));
    }

    #[test]
    fn milestone_allocation_is_bounded() {
        let (_, engine) = engine();
        let escrow = create(&engine, 100_000, 10).id;

        // 90% of contract is allocatable after 10% retention.
        engine
            .create_milestone(escrow, "phase 1", 50, vec![], None)
            .unwrap();
        engine
            .create_milestone(escrow, "phase 2", 40, vec![], None)
            .unwrap();
        let err = engine
            .create_milestone(escrow, "phase 3", 10, vec![], None)
            .unwrap_err();
        assert_eq!(
            err,
            EscrowError::MilestoneOverallocated {
                requested: Money::from_major(10_000),
                unallocated: Money::ZERO,
            }
        );
    }

    #[test]
    fn ledger_reconciles_against_totals() {
        let (_, engine) = engine();
        let escrow = create(&engine, 100_000, 10).id;
        engine
            .fund_escrow(escrow, Money::from_major(60_000), "bank_transfer", None)
            .unwrap();
        engine
            .release_funds(
                escrow,
                "contractor-1",
                Money::from_major(12_500),
                PaymentType::TaskCompletion,
                None,
            )
            .unwrap();

        let snap = engine.get_escrow(escrow).unwrap();
        let signed_sum: Money = engine
            .ledger_entries(escrow)
            .unwrap()
            .iter()
            .map(|e| e.amount)
            .sum();
        assert_eq!(signed_sum, snap.total_deposited - snap.total_paid);
        assert_eq!(snap.escrow_balance, snap.total_deposited - snap.total_paid);
    }
}
