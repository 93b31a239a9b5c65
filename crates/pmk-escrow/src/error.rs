//! Engine error taxonomy.
//!
//! Validation errors are rejected before any side effect. Processor and
//! balance errors are retryable with no state change. `AlreadyPaid` and
//! illegal transitions are non-retryable caller logic errors.

use pmk_schemas::{DisputeId, EntryId, EscrowId, Money, UnitId};

use crate::processor::ProcessorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowError {
    /// Retention percentage must be in [0, 100].
    InvalidRetention { percentage: u32 },
    /// Milestone percentage must be in (0, 100].
    InvalidPercentage { percentage: u32 },
    /// Monetary amounts entering the engine must be strictly positive.
    InvalidAmount { amount: Money },
    /// Client / contractor / recipient ids must be non-empty.
    MissingParty { field: &'static str },
    EscrowNotFound { escrow_id: EscrowId },
    UnitNotFound { unit_id: UnitId },
    DisputeNotFound { dispute_id: DisputeId },
    EntryNotFound { entry_id: EntryId },
    /// The release exceeds the balance available once dispute-frozen
    /// amounts are excluded. Retryable after funding.
    InsufficientEscrowBalance { requested: Money, available: Money },
    /// A milestone's computed amount exceeds the contract value not yet
    /// allocated to other units or retention.
    MilestoneOverallocated { requested: Money, unallocated: Money },
    /// The external processor refused the operation; nothing was written.
    Processor(ProcessorError),
    /// The unit (or idempotency key) was already paid. Non-retryable.
    AlreadyPaid,
    /// A deposit idempotency key was already consumed.
    DuplicateDeposit { key: String },
    /// The requested operation is not legal in the current state.
    InvalidStateTransition { detail: String },
    /// Escrow close requires COMPLETED status and released retention.
    NotClosable { status: &'static str, retention_released: bool },
    /// Retention release requires COMPLETED status and an unreleased
    /// retention balance.
    RetentionNotReleasable { detail: String },
    ChangeOrder(pmk_changeorder::ChangeOrderError),
    Ledger(pmk_ledger::LedgerError),
    Dispute(pmk_dispute::DisputeError),
}

impl EscrowError {
    /// `true` when the caller can retry the operation after correcting an
    /// external condition (funding the escrow, processor recovery).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EscrowError::InsufficientEscrowBalance { .. } | EscrowError::Processor(_)
        )
    }
}

impl std::fmt::Display for EscrowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRetention { percentage } => {
                write!(f, "retention percentage must be in [0, 100], got {percentage}")
            }
            Self::InvalidPercentage { percentage } => {
                write!(f, "milestone percentage must be in (0, 100], got {percentage}")
            }
            Self::InvalidAmount { amount } => {
                write!(f, "amount must be strictly positive, got {amount}")
            }
            Self::MissingParty { field } => write!(f, "missing required party: {field}"),
            Self::EscrowNotFound { escrow_id } => write!(f, "escrow {escrow_id} not found"),
            Self::UnitNotFound { unit_id } => write!(f, "payment unit {unit_id} not found"),
            Self::DisputeNotFound { dispute_id } => write!(f, "dispute {dispute_id} not found"),
            Self::EntryNotFound { entry_id } => write!(f, "ledger entry {entry_id} not found"),
            Self::InsufficientEscrowBalance { requested, available } => write!(
                f,
                "insufficient escrow balance: requested {requested}, available {available}"
            ),
            Self::MilestoneOverallocated { requested, unallocated } => write!(
                f,
                "milestone amount {requested} exceeds unallocated contract value {unallocated}"
            ),
            Self::Processor(e) => write!(f, "payment processor error: {e}"),
            Self::AlreadyPaid => write!(f, "payment was already released"),
            Self::DuplicateDeposit { key } => {
                write!(f, "deposit idempotency key {key:?} already consumed")
            }
            Self::InvalidStateTransition { detail } => {
                write!(f, "invalid state transition: {detail}")
            }
            Self::NotClosable { status, retention_released } => write!(
                f,
                "escrow cannot close: status {status}, retention released: {retention_released}"
            ),
            Self::RetentionNotReleasable { detail } => {
                write!(f, "retention not releasable: {detail}")
            }
            Self::ChangeOrder(e) => write!(f, "{e}"),
            Self::Ledger(e) => write!(f, "{e}"),
            Self::Dispute(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EscrowError {}

impl From<ProcessorError> for EscrowError {
    fn from(e: ProcessorError) -> Self {
        EscrowError::Processor(e)
    }
}

impl From<pmk_changeorder::ChangeOrderError> for EscrowError {
    fn from(e: pmk_changeorder::ChangeOrderError) -> Self {
        EscrowError::ChangeOrder(e)
    }
}

impl From<pmk_ledger::LedgerError> for EscrowError {
    fn from(e: pmk_ledger::LedgerError) -> Self {
        match e {
            pmk_ledger::LedgerError::DuplicateIdempotencyKey { key } => {
                // A consumed release key means the payment already went out.
                EscrowError::DuplicateDeposit { key }
            }
            other => EscrowError::Ledger(other),
        }
    }
}

impl From<pmk_payments::UnitError> for EscrowError {
    fn from(e: pmk_payments::UnitError) -> Self {
        match e {
            pmk_payments::UnitError::AlreadyPaid => EscrowError::AlreadyPaid,
            other => EscrowError::InvalidStateTransition {
                detail: other.to_string(),
            },
        }
    }
}

impl From<pmk_dispute::DisputeError> for EscrowError {
    fn from(e: pmk_dispute::DisputeError) -> Self {
        EscrowError::Dispute(e)
    }
}
