//! Deterministic in-memory "paper" payment processor adapter.
//!
//! Design decisions (kept intentionally simple/deterministic):
//! - Account handles are derived from the project id:
//!     "paper:acct:{project_id}"
//! - Transaction ids are stable strings derived from request inputs:
//!     - deposit:  "paper:txn:dep:{idempotency_key}"
//!     - withdraw: "paper:txn:wd:{idempotency_key}"
//! - No randomness. No timestamps.
//! - Idempotency: replaying a consumed key returns the original transaction
//!   id without moving funds again.
//! - Fail-closed: every refusal (injected failure, unknown account,
//!   insufficient processor balance) moves no funds.
//!
//! The crate also ships two [`NotificationSink`] fakes: a recording sink
//! for asserting event fan-out and a failing sink for proving that sink
//! failures never affect financial outcomes.

use std::collections::BTreeMap;
use std::sync::Mutex;

use pmk_escrow::{NotificationSink, PaymentProcessor, ProcessorError, SinkError};
use pmk_schemas::{AccountHandle, Money, TransactionId};

// ---------------------------------------------------------------------------
// PaperProcessor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct PaperAccount {
    client_id: String,
    contractor_id: String,
    balance: Money,
}

#[derive(Debug, Default)]
struct PaperState {
    accounts: BTreeMap<String, PaperAccount>,
    /// Consumed idempotency keys and the transaction they produced.
    txns: BTreeMap<String, TransactionId>,
    fail_deposits: bool,
    fail_withdrawals: bool,
}

/// Deterministic in-memory payment processor.
#[derive(Debug, Default)]
pub struct PaperProcessor {
    state: Mutex<PaperState>,
}

impl PaperProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject deposit failures for fail-closed tests.
    pub fn set_fail_deposits(&self, fail: bool) {
        self.state.lock().expect("paper state poisoned").fail_deposits = fail;
    }

    /// Inject withdrawal failures for fail-closed tests.
    pub fn set_fail_withdrawals(&self, fail: bool) {
        self.state.lock().expect("paper state poisoned").fail_withdrawals = fail;
    }

    /// Processor-side balance of a custodial account (test assertion aid).
    pub fn account_balance(&self, account: &AccountHandle) -> Option<Money> {
        self.state
            .lock()
            .expect("paper state poisoned")
            .accounts
            .get(account.as_str())
            .map(|a| a.balance)
    }

    /// Number of distinct transactions executed.
    pub fn txn_count(&self) -> usize {
        self.state.lock().expect("paper state poisoned").txns.len()
    }

    /// The (client, contractor) pair an account was opened for.
    pub fn account_parties(&self, account: &AccountHandle) -> Option<(String, String)> {
        self.state
            .lock()
            .expect("paper state poisoned")
            .accounts
            .get(account.as_str())
            .map(|a| (a.client_id.clone(), a.contractor_id.clone()))
    }
}

impl PaymentProcessor for PaperProcessor {
    /// Open (or re-open, idempotently) the custodial account for a project.
    fn open_account(
        &self,
        project_id: &str,
        client_id: &str,
        contractor_id: &str,
    ) -> Result<AccountHandle, ProcessorError> {
        let handle = format!("paper:acct:{project_id}");
        let mut state = self.state.lock().expect("paper state poisoned");
        state.accounts.entry(handle.clone()).or_insert(PaperAccount {
            client_id: client_id.to_string(),
            contractor_id: contractor_id.to_string(),
            balance: Money::ZERO,
        });
        Ok(AccountHandle::new(handle))
    }

    fn deposit(
        &self,
        account: &AccountHandle,
        amount: Money,
        _method: &str,
        idempotency_key: &str,
    ) -> Result<TransactionId, ProcessorError> {
        let mut state = self.state.lock().expect("paper state poisoned");
        if let Some(txn) = state.txns.get(idempotency_key) {
            return Ok(txn.clone());
        }
        if state.fail_deposits {
            return Err(ProcessorError::new("deposit", "paper: injected failure"));
        }
        let acct = state
            .accounts
            .get_mut(account.as_str())
            .ok_or_else(|| ProcessorError::new("deposit", "paper: unknown account"))?;
        acct.balance += amount;

        let txn = TransactionId::new(format!("paper:txn:dep:{idempotency_key}"));
        state.txns.insert(idempotency_key.to_string(), txn.clone());
        Ok(txn)
    }

    fn withdraw(
        &self,
        account: &AccountHandle,
        _recipient_id: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> Result<TransactionId, ProcessorError> {
        let mut state = self.state.lock().expect("paper state poisoned");
        if let Some(txn) = state.txns.get(idempotency_key) {
            return Ok(txn.clone());
        }
        if state.fail_withdrawals {
            return Err(ProcessorError::new("withdraw", "paper: injected failure"));
        }
        let acct = state
            .accounts
            .get_mut(account.as_str())
            .ok_or_else(|| ProcessorError::new("withdraw", "paper: unknown account"))?;
        if amount > acct.balance {
            return Err(ProcessorError::new(
                "withdraw",
                "paper: insufficient custodial balance",
            ));
        }
        acct.balance -= amount;

        let txn = TransactionId::new(format!("paper:txn:wd:{idempotency_key}"));
        state.txns.insert(idempotency_key.to_string(), txn.clone());
        Ok(txn)
    }
}

// ---------------------------------------------------------------------------
// Notification sink fakes
// ---------------------------------------------------------------------------

/// One captured notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub recipient_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Sink that records every event for test assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().expect("sink events poisoned").clone()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .expect("sink events poisoned")
            .iter()
            .filter(|n| n.event_type == event_type)
            .count()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(
        &self,
        recipient_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SinkError> {
        self.events.lock().expect("sink events poisoned").push(Notification {
            recipient_id: recipient_id.to_string(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

/// Sink that refuses every delivery — notification failures must never
/// block or roll back a financial transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingSink;

impl NotificationSink for FailingSink {
    fn notify(&self, _: &str, _: &str, _: &serde_json::Value) -> Result<(), SinkError> {
        Err(SinkError::new("failing sink: delivery refused"))
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(p: &PaperProcessor) -> AccountHandle {
        p.open_account("project-1", "client-1", "contractor-1").unwrap()
    }

    #[test]
    fn account_handles_are_deterministic() {
        let p = PaperProcessor::new();
        let a = opened(&p);
        let b = opened(&p);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "paper:acct:project-1");
        assert_eq!(
            p.account_parties(&a),
            Some(("client-1".to_string(), "contractor-1".to_string()))
        );
    }

    #[test]
    fn deposit_credits_and_derives_stable_txn() {
        let p = PaperProcessor::new();
        let acct = opened(&p);
        let txn = p.deposit(&acct, Money::from_major(100), "wire", "k1").unwrap();
        assert_eq!(txn, TransactionId::new("paper:txn:dep:k1"));
        assert_eq!(p.account_balance(&acct), Some(Money::from_major(100)));
    }

    #[test]
    fn replayed_key_moves_no_funds() {
        let p = PaperProcessor::new();
        let acct = opened(&p);
        let first = p.deposit(&acct, Money::from_major(100), "wire", "k1").unwrap();
        let replay = p.deposit(&acct, Money::from_major(100), "wire", "k1").unwrap();
        assert_eq!(first, replay);
        assert_eq!(p.account_balance(&acct), Some(Money::from_major(100)));
        assert_eq!(p.txn_count(), 1);
    }

    #[test]
    fn withdraw_debits_and_fails_closed_when_short() {
        let p = PaperProcessor::new();
        let acct = opened(&p);
        p.deposit(&acct, Money::from_major(100), "wire", "k1").unwrap();

        p.withdraw(&acct, "contractor-1", Money::from_major(40), "k2").unwrap();
        assert_eq!(p.account_balance(&acct), Some(Money::from_major(60)));

        let err = p
            .withdraw(&acct, "contractor-1", Money::from_major(100), "k3")
            .unwrap_err();
        assert_eq!(err.operation, "withdraw");
        assert_eq!(p.account_balance(&acct), Some(Money::from_major(60)));
    }

    #[test]
    fn injected_failures_refuse_without_moving_funds() {
        let p = PaperProcessor::new();
        let acct = opened(&p);
        p.set_fail_deposits(true);
        assert!(p.deposit(&acct, Money::from_major(1), "wire", "k1").is_err());
        assert_eq!(p.account_balance(&acct), Some(Money::ZERO));

        p.set_fail_deposits(false);
        p.deposit(&acct, Money::from_major(10), "wire", "k2").unwrap();
        p.set_fail_withdrawals(true);
        assert!(p.withdraw(&acct, "c", Money::from_major(1), "k3").is_err());
        assert_eq!(p.account_balance(&acct), Some(Money::from_major(10)));
    }

    #[test]
    fn recording_sink_captures_events() {
        let sink = RecordingSink::new();
        sink.notify("client-1", "escrow_funded", &serde_json::json!({"ok": true}))
            .unwrap();
        assert_eq!(sink.count_of("escrow_funded"), 1);
        assert_eq!(sink.events()[0].recipient_id, "client-1");
    }
}
