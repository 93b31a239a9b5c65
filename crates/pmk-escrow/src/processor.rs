//! External collaborator traits — the engine's only paths to the outside.
//!
//! The engine never talks to a payment network or a delivery channel
//! directly: both capabilities are constructor-injected trait objects, so
//! the engine is testable with in-memory fakes and deployable against real
//! adapters without change.
//!
//! `PaymentProcessor` is assumed to fail closed (no funds move on error)
//! and to be idempotent per caller-supplied idempotency key. The engine
//! calls it *before* writing any local state; a processor failure therefore
//! leaves no orphaned ledger entries.
//!
//! `NotificationSink` is fire-and-forget: failures are logged at the call
//! site and never propagate into a financial transition.

use pmk_schemas::{AccountHandle, Money, TransactionId};

// ---------------------------------------------------------------------------
// ProcessorError
// ---------------------------------------------------------------------------

/// Failure reported by the external payment processor.
///
/// Retryable by the caller; the processor is assumed to have moved no funds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorError {
    /// Which processor operation failed ("open_account", "deposit",
    /// "withdraw").
    pub operation: &'static str,
    pub message: String,
}

impl ProcessorError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProcessorError {}

// ---------------------------------------------------------------------------
// PaymentProcessor
// ---------------------------------------------------------------------------

/// External money-moving capability.
///
/// Implementations must fail closed: an `Err` return guarantees no funds
/// moved. `deposit` and `withdraw` must be idempotent per
/// `idempotency_key` — replaying a key returns the original transaction
/// rather than moving funds twice.
pub trait PaymentProcessor: Send + Sync {
    /// Open a custodial account for one project. Called once per escrow,
    /// before any local escrow state exists.
    fn open_account(
        &self,
        project_id: &str,
        client_id: &str,
        contractor_id: &str,
    ) -> Result<AccountHandle, ProcessorError>;

    /// Move client funds into the custodial account.
    fn deposit(
        &self,
        account: &AccountHandle,
        amount: Money,
        method: &str,
        idempotency_key: &str,
    ) -> Result<TransactionId, ProcessorError>;

    /// Pay funds out of the custodial account to a recipient.
    fn withdraw(
        &self,
        account: &AccountHandle,
        recipient_id: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> Result<TransactionId, ProcessorError>;
}

// ---------------------------------------------------------------------------
// NotificationSink
// ---------------------------------------------------------------------------

/// Failure reported by a notification sink. Logged, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError {
    pub message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification sink error: {}", self.message)
    }
}

impl std::error::Error for SinkError {}

/// Fire-and-forget event delivery toward a recipient.
pub trait NotificationSink: Send + Sync {
    fn notify(
        &self,
        recipient_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SinkError>;
}

/// Sink that drops every event. Useful for tests and batch tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _: &str, _: &str, _: &serde_json::Value) -> Result<(), SinkError> {
        Ok(())
    }
}
