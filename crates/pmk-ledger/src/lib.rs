//! Ledger store — append-only record of every fund movement for one escrow.
//!
//! # Purpose
//! Wraps the raw entry list behind a typed, append-only [`Ledger`] façade
//! that:
//!
//! - Enforces ledger invariants on every append (strictly positive amounts,
//!   non-empty recipient, no idempotency-key reuse).
//! - Exposes only the minimal write surface (`append_deposit`,
//!   `append_release`).
//! - Keeps running totals (`total_deposited`, `total_paid`) so the owning
//!   escrow balance is always `deposited - paid`.
//! - Provides an O(n) [`Ledger::verify_integrity`] replay that cross-checks
//!   the running totals against the stored entries.
//!
//! Entries are write-once: there is no edit or delete surface. Corrections
//! are new compensating entries (REFUND).
//!
//! # Determinism
//! `Ledger` is deterministic and pure — no IO, no clock (timestamps are
//! caller-supplied), no randomness beyond the caller-supplied entry ids.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pmk_schemas::{EntryId, EntryStatus, EscrowId, Money, PaymentType, TransactionId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// All invariant violations that `Ledger` can surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Deposit and release amounts must be strictly positive.
    NonPositiveAmount { amount: Money },
    /// The recipient id must be non-empty.
    EmptyRecipient,
    /// The supplied idempotency key was already consumed by an earlier entry.
    DuplicateIdempotencyKey { key: String },
    /// A deposit may not be recorded with a release payment type and vice
    /// versa.
    WrongDirection { payment_type: PaymentType },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonPositiveAmount { amount } => {
                write!(f, "ledger invariant: amount must be > 0, got {amount}")
            }
            Self::EmptyRecipient => write!(f, "ledger invariant: recipient must not be empty"),
            Self::DuplicateIdempotencyKey { key } => {
                write!(f, "ledger invariant: idempotency key {key:?} already consumed")
            }
            Self::WrongDirection { payment_type } => write!(
                f,
                "ledger invariant: payment type {} has the wrong direction for this append",
                payment_type.as_str()
            ),
        }
    }
}

impl std::error::Error for LedgerError {}

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

/// One immutable fund movement.
///
/// `amount` is signed: deposits are positive, releases negative. The sum of
/// all COMPLETED signed amounts therefore reconciles directly against
/// `total_deposited - total_paid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub escrow_id: EscrowId,
    pub recipient_id: String,
    pub amount: Money,
    pub payment_type: PaymentType,
    pub external_txn_id: Option<TransactionId>,
    pub status: EntryStatus,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Snapshot (read-only view)
// ---------------------------------------------------------------------------

/// A point-in-time read-only view of the ledger's derived state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub escrow_id: EscrowId,
    pub total_deposited: Money,
    pub total_paid: Money,
    pub entry_count: usize,
}

impl LedgerSnapshot {
    /// Derived balance: `total_deposited - total_paid`.
    pub fn balance(&self) -> Money {
        self.total_deposited - self.total_paid
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Append-only ledger façade with invariant enforcement.
#[derive(Clone, Debug)]
pub struct Ledger {
    escrow_id: EscrowId,
    entries: Vec<LedgerEntry>,
    total_deposited: Money,
    total_paid: Money,
    consumed_keys: BTreeSet<String>,
}

impl Ledger {
    /// Create an empty ledger for the given escrow.
    pub fn new(escrow_id: EscrowId) -> Self {
        Self {
            escrow_id,
            entries: Vec::new(),
            total_deposited: Money::ZERO,
            total_paid: Money::ZERO,
            consumed_keys: BTreeSet::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Write surface
    // -----------------------------------------------------------------------

    /// Append a completed DEPOSIT entry, enforcing all invariants.
    ///
    /// # Errors
    /// Returns [`LedgerError`] if any invariant is violated. The ledger is
    /// **not** mutated on error.
    pub fn append_deposit(
        &mut self,
        depositor_id: &str,
        amount: Money,
        external_txn_id: TransactionId,
        idempotency_key: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.validate(depositor_id, amount, &idempotency_key)?;

        self.total_deposited += amount;
        Ok(self.push_entry(
            depositor_id,
            amount,
            PaymentType::Deposit,
            external_txn_id,
            idempotency_key,
            at,
        ))
    }

    /// Append a completed release entry (task, milestone, retention, or
    /// refund), enforcing all invariants.
    ///
    /// `amount` is supplied positive and stored negative.
    ///
    /// # Errors
    /// Returns [`LedgerError`] if any invariant is violated. The ledger is
    /// **not** mutated on error.
    pub fn append_release(
        &mut self,
        recipient_id: &str,
        amount: Money,
        payment_type: PaymentType,
        external_txn_id: TransactionId,
        idempotency_key: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        if !payment_type.is_release() {
            return Err(LedgerError::WrongDirection { payment_type });
        }
        self.validate(recipient_id, amount, &idempotency_key)?;

        self.total_paid += amount;
        Ok(self.push_entry(
            recipient_id,
            -amount,
            payment_type,
            external_txn_id,
            idempotency_key,
            at,
        ))
    }

    // -----------------------------------------------------------------------
    // Read surface
    // -----------------------------------------------------------------------

    /// `true` if the idempotency key was already consumed by an entry.
    pub fn has_consumed_key(&self, key: &str) -> bool {
        self.consumed_keys.contains(key)
    }

    /// Sum of signed amounts across COMPLETED entries, optionally filtered
    /// by payment type.
    pub fn sum_completed(&self, payment_type: Option<PaymentType>) -> Money {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::Completed)
            .filter(|e| payment_type.map_or(true, |t| e.payment_type == t))
            .map(|e| e.amount)
            .sum()
    }

    pub fn escrow_id(&self) -> EscrowId {
        self.escrow_id
    }

    pub fn total_deposited(&self) -> Money {
        self.total_deposited
    }

    pub fn total_paid(&self) -> Money {
        self.total_paid
    }

    /// Derived balance: `total_deposited - total_paid`.
    pub fn balance(&self) -> Money {
        self.total_deposited - self.total_paid
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Return a cloned snapshot of the current derived state.
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            escrow_id: self.escrow_id,
            total_deposited: self.total_deposited,
            total_paid: self.total_paid,
            entry_count: self.entries.len(),
        }
    }

    /// Recompute totals from the stored entries and verify they match the
    /// running incremental totals. Returns `true` if consistent.
    ///
    /// This is an **integrity check** — expensive (O(n) replay) — for use in
    /// tests, startup verification, or audit flows only.
    pub fn verify_integrity(&self) -> bool {
        let mut deposited = Money::ZERO;
        let mut paid = Money::ZERO;
        for e in &self.entries {
            if e.status != EntryStatus::Completed {
                continue;
            }
            if e.payment_type == PaymentType::Deposit {
                deposited += e.amount;
            } else {
                paid += -e.amount;
            }
        }
        deposited == self.total_deposited
            && paid == self.total_paid
            && self.sum_completed(None) == self.balance()
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn validate(
        &self,
        recipient_id: &str,
        amount: Money,
        idempotency_key: &Option<String>,
    ) -> Result<(), LedgerError> {
        if recipient_id.trim().is_empty() {
            return Err(LedgerError::EmptyRecipient);
        }
        if !amount.is_positive() {
            return Err(LedgerError::NonPositiveAmount { amount });
        }
        if let Some(key) = idempotency_key {
            if self.consumed_keys.contains(key) {
                return Err(LedgerError::DuplicateIdempotencyKey { key: key.clone() });
            }
        }
        Ok(())
    }

    fn push_entry(
        &mut self,
        recipient_id: &str,
        signed_amount: Money,
        payment_type: PaymentType,
        external_txn_id: TransactionId,
        idempotency_key: Option<String>,
        at: DateTime<Utc>,
    ) -> LedgerEntry {
        if let Some(key) = &idempotency_key {
            self.consumed_keys.insert(key.clone());
        }
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            escrow_id: self.escrow_id,
            recipient_id: recipient_id.to_string(),
            amount: signed_amount,
            payment_type,
            external_txn_id: Some(external_txn_id),
            status: EntryStatus::Completed,
            idempotency_key,
            created_at: at,
        };
        self.entries.push(entry.clone());
        entry
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
