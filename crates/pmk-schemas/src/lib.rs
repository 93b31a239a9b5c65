use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod money;

pub use money::{Money, MICROS_SCALE};

/// Identifier of one escrow account.
pub type EscrowId = Uuid;

/// Identifier of one conditional payment unit (task or milestone).
pub type UnitId = Uuid;

/// Identifier of one payment dispute.
pub type DisputeId = Uuid;

/// Identifier of one ledger entry.
pub type EntryId = Uuid;

/// Classification of a fund movement through an escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    Deposit,
    TaskCompletion,
    Milestone,
    RetentionRelease,
    Refund,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Deposit => "DEPOSIT",
            PaymentType::TaskCompletion => "TASK_COMPLETION",
            PaymentType::Milestone => "MILESTONE",
            PaymentType::RetentionRelease => "RETENTION_RELEASE",
            PaymentType::Refund => "REFUND",
        }
    }

    /// `true` for the movement kinds that pay money out of the escrow.
    pub fn is_release(&self) -> bool {
        !matches!(self, PaymentType::Deposit)
    }
}

/// Processing status of a single ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Completed => "COMPLETED",
            EntryStatus::Failed => "FAILED",
        }
    }
}

/// Opaque handle for an account opened with the external payment processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountHandle(pub String);

impl AccountHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        AccountHandle(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Transaction id returned by the external payment processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        TransactionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
