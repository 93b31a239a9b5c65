//! Payment dispute record and its SUBMITTED → MEDIATION → RESOLVED machine.
//!
//! The record is pure bookkeeping: freezing the disputed funds, unfreezing
//! on resolution, and the compensating refund are engine effects applied
//! under the escrow cell lock. Resolution is a human judgment distinct from
//! payment execution — a failed compensating payment leaves the dispute
//! RESOLVED and flags [`Settlement::Pending`] for operator follow-up; it
//! never reverts the decision.
//!
//! Deadlines (`response_deadline`, `mediation_date`) are advisory scheduling
//! fields consumed by the external workflow orchestrator, not internal
//! timers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pmk_schemas::{DisputeId, EntryId, EscrowId, Money, TransactionId, UnitId};

/// Days the respondent has to answer a newly submitted dispute.
pub const RESPONSE_DEADLINE_DAYS: i64 = 7;

/// Days between a mediation request and the scheduled mediation.
pub const MEDIATION_LEAD_DAYS: i64 = 3;

// ---------------------------------------------------------------------------
// Status / references
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    Submitted,
    Mediation,
    Resolved,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Mediation => "MEDIATION",
            Self::Resolved => "RESOLVED",
        }
    }

    /// `true` while the referenced payment's funds must stay frozen.
    pub fn freezes_funds(&self) -> bool {
        !matches!(self, Self::Resolved)
    }
}

/// The payment a dispute contests: either a settled ledger entry or a
/// not-yet-paid conditional payment unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ref", rename_all = "snake_case")]
pub enum PaymentRef {
    LedgerEntry { entry_id: EntryId },
    Unit { unit_id: UnitId },
}

/// Outcome of the compensating payment after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "settlement", rename_all = "snake_case")]
pub enum Settlement {
    /// Resolution carried no payout.
    NotRequired,
    /// Compensating refund executed.
    Settled { txn: TransactionId },
    /// Compensating refund failed; requires operator attention. The
    /// resolution decision stands.
    Pending { reason: String },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisputeError {
    /// The action is not legal in the current status.
    IllegalTransition {
        from: DisputeStatus,
        action: &'static str,
    },
    /// Dispute amounts must be strictly positive; resolution amounts
    /// non-negative.
    InvalidAmount { amount: Money },
    /// Submitter and respondent are required parties.
    MissingParty { field: &'static str },
}

impl std::fmt::Display for DisputeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalTransition { from, action } => {
                write!(f, "illegal dispute transition: {} + {action}", from.as_str())
            }
            Self::InvalidAmount { amount } => {
                write!(f, "invalid dispute amount {amount}")
            }
            Self::MissingParty { field } => write!(f, "dispute requires a non-empty {field}"),
        }
    }
}

impl std::error::Error for DisputeError {}

// ---------------------------------------------------------------------------
// PaymentDispute
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentDispute {
    pub id: DisputeId,
    pub escrow_id: EscrowId,
    pub payment_ref: Option<PaymentRef>,
    pub dispute_amount: Money,
    pub submitted_by: String,
    pub respondent_id: String,
    pub status: DisputeStatus,
    pub resolution: Option<String>,
    pub resolution_amount: Option<Money>,
    pub resolved_by: Option<String>,
    pub mediator: Option<String>,
    pub mediation_date: Option<DateTime<Utc>>,
    pub response_deadline: DateTime<Utc>,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub settlement: Settlement,
}

impl PaymentDispute {
    /// Open a dispute in SUBMITTED with the response deadline set
    /// [`RESPONSE_DEADLINE_DAYS`] out.
    pub fn open(
        escrow_id: EscrowId,
        payment_ref: Option<PaymentRef>,
        dispute_amount: Money,
        submitted_by: impl Into<String>,
        respondent_id: impl Into<String>,
        opened_at: DateTime<Utc>,
    ) -> Result<Self, DisputeError> {
        let submitted_by = submitted_by.into();
        let respondent_id = respondent_id.into();
        if !dispute_amount.is_positive() {
            return Err(DisputeError::InvalidAmount {
                amount: dispute_amount,
            });
        }
        if submitted_by.trim().is_empty() {
            return Err(DisputeError::MissingParty { field: "submitter" });
        }
        if respondent_id.trim().is_empty() {
            return Err(DisputeError::MissingParty { field: "respondent" });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            escrow_id,
            payment_ref,
            dispute_amount,
            submitted_by,
            respondent_id,
            status: DisputeStatus::Submitted,
            resolution: None,
            resolution_amount: None,
            resolved_by: None,
            mediator: None,
            mediation_date: None,
            response_deadline: opened_at + Duration::days(RESPONSE_DEADLINE_DAYS),
            opened_at,
            resolved_at: None,
            settlement: Settlement::NotRequired,
        })
    }

    /// SUBMITTED → MEDIATION: assign a mediator and schedule the session
    /// [`MEDIATION_LEAD_DAYS`] out.
    pub fn request_mediation(
        &mut self,
        mediator: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), DisputeError> {
        if self.status != DisputeStatus::Submitted {
            return Err(DisputeError::IllegalTransition {
                from: self.status,
                action: "request_mediation",
            });
        }
        self.mediator = Some(mediator.into());
        self.mediation_date = Some(at + Duration::days(MEDIATION_LEAD_DAYS));
        self.status = DisputeStatus::Mediation;
        Ok(())
    }

    /// SUBMITTED|MEDIATION → RESOLVED: record the judgment.
    ///
    /// `resolution_amount` is the compensating payout to the prevailing
    /// party (zero means no payout). Executing that payout is the engine's
    /// job; see [`PaymentDispute::mark_settled`] /
    /// [`PaymentDispute::mark_settlement_pending`].
    pub fn resolve(
        &mut self,
        resolution: impl Into<String>,
        resolution_amount: Money,
        resolved_by: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), DisputeError> {
        if self.status == DisputeStatus::Resolved {
            return Err(DisputeError::IllegalTransition {
                from: self.status,
                action: "resolve",
            });
        }
        if resolution_amount.is_negative() {
            return Err(DisputeError::InvalidAmount {
                amount: resolution_amount,
            });
        }
        self.resolution = Some(resolution.into());
        self.resolution_amount = Some(resolution_amount);
        self.resolved_by = Some(resolved_by.into());
        self.resolved_at = Some(at);
        self.status = DisputeStatus::Resolved;
        Ok(())
    }

    /// Record a successful compensating payment. Only legal once RESOLVED.
    pub fn mark_settled(&mut self, txn: TransactionId) -> Result<(), DisputeError> {
        if self.status != DisputeStatus::Resolved {
            return Err(DisputeError::IllegalTransition {
                from: self.status,
                action: "mark_settled",
            });
        }
        self.settlement = Settlement::Settled { txn };
        Ok(())
    }

    /// Flag a failed compensating payment for manual follow-up. The
    /// resolution decision is not reverted. Only legal once RESOLVED.
    pub fn mark_settlement_pending(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<(), DisputeError> {
        if self.status != DisputeStatus::Resolved {
            return Err(DisputeError::IllegalTransition {
                from: self.status,
                action: "mark_settlement_pending",
            });
        }
        self.settlement = Settlement::Pending {
            reason: reason.into(),
        };
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
