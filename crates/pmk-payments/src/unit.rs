use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pmk_schemas::{DisputeId, EscrowId, Money, TransactionId, UnitId};

// ---------------------------------------------------------------------------
// UnitState
// ---------------------------------------------------------------------------

/// State a unit frozen by a dispute resumes to once the dispute resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeState {
    Verified,
    Approved,
}

/// All valid states a conditional payment unit can occupy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    /// Created; completion not yet verified.
    Pending,
    /// Completion verified with quality evidence recorded.
    Verified,
    /// Explicitly approved for payment.
    Approved,
    /// Payment withheld while a dispute references this unit.
    Frozen {
        resume_to: ResumeState,
        dispute_id: DisputeId,
    },
    /// Funds released. **Terminal.**
    Paid,
}

impl UnitState {
    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Verified => "VERIFIED",
            Self::Approved => "APPROVED",
            Self::Frozen { .. } => "FROZEN",
            Self::Paid => "PAID",
        }
    }
}

// ---------------------------------------------------------------------------
// UnitEvent
// ---------------------------------------------------------------------------

/// Events that drive state transitions in a [`ConditionalPaymentUnit`].
#[derive(Debug, Clone, PartialEq)]
pub enum UnitEvent {
    /// Completion verified by the orchestrator; records the evidence.
    Verify {
        quality_score: u8,
        photos: Vec<String>,
        notes: Option<String>,
    },
    /// Explicit approval (only valid when approval is required).
    Approve { approved_by: String },
    /// The escrow release committed; record the transaction and close out.
    MarkPaid {
        txn: TransactionId,
        at: DateTime<Utc>,
    },
    /// A dispute now references this unit; withhold payment.
    Freeze { dispute_id: DisputeId },
    /// The referencing dispute resolved; restore the pre-freeze state.
    Unfreeze { dispute_id: DisputeId },
}

impl UnitEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Verify { .. } => "Verify",
            Self::Approve { .. } => "Approve",
            Self::MarkPaid { .. } => "MarkPaid",
            Self::Freeze { .. } => "Freeze",
            Self::Unfreeze { .. } => "Unfreeze",
        }
    }
}

// ---------------------------------------------------------------------------
// UnitError
// ---------------------------------------------------------------------------

/// Returned when an event cannot legally be applied in the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    /// `MarkPaid` on an already-paid unit. Non-retryable; the caller's
    /// idempotent retry already succeeded.
    AlreadyPaid,
    /// The event is not legal in the current state. Signals a caller logic
    /// error; the unit is unchanged.
    IllegalTransition { from: &'static str, event: &'static str },
    /// `Approve` on a unit that does not require approval.
    ApprovalNotRequired,
    /// `Verify` without photo evidence on a unit that requires photos.
    PhotosRequired,
    /// Quality scores are whole percents in [0, 100].
    QualityScoreOutOfRange { score: u8 },
    /// `Unfreeze` from a dispute other than the one holding the freeze.
    FrozenByOtherDispute { held_by: DisputeId },
}

impl std::fmt::Display for UnitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyPaid => write!(f, "unit is already paid"),
            Self::IllegalTransition { from, event } => {
                write!(f, "illegal unit transition: {from} + {event}")
            }
            Self::ApprovalNotRequired => {
                write!(f, "unit does not require approval; payment proceeds from VERIFIED")
            }
            Self::PhotosRequired => write!(f, "unit requires photo evidence for verification"),
            Self::QualityScoreOutOfRange { score } => {
                write!(f, "quality score must be in [0, 100], got {score}")
            }
            Self::FrozenByOtherDispute { held_by } => {
                write!(f, "unit is frozen by dispute {held_by}")
            }
        }
    }
}

impl std::error::Error for UnitError {}

// ---------------------------------------------------------------------------
// UnitKind
// ---------------------------------------------------------------------------

/// One deliverable inside a payment milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliverable {
    pub description: String,
    pub completed: bool,
}

/// Discriminates the two conditional payment variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    /// Single-deliverable task payment.
    Task {
        /// Id of the task in the external workflow system.
        task_id: String,
        completion_requirements: Vec<String>,
        verification_criteria: Vec<String>,
        approval_required: bool,
        photos_required: bool,
    },
    /// Percentage-of-contract milestone with multiple sub-deliverables.
    Milestone {
        name: String,
        /// Whole-percent share of the contract value, in [0, 100].
        percentage: u32,
        deliverables: Vec<Deliverable>,
        due_date: Option<DateTime<Utc>>,
    },
}

/// Milestone payment amount: `percentage` of `total_project_value`, exact.
///
/// Returns `None` when the result would overflow `i64` (the percentage
/// itself is validated by the engine at creation time).
pub fn milestone_amount(total_project_value: Money, percentage: u32) -> Option<Money> {
    total_project_value.percent_of(percentage)
}

// ---------------------------------------------------------------------------
// ConditionalPaymentUnit
// ---------------------------------------------------------------------------

/// A conditional payment tracked through an explicit state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalPaymentUnit {
    pub id: UnitId,
    pub escrow_id: EscrowId,
    pub contractor_id: String,
    /// Amount released when this unit completes. Rescaled by change orders
    /// while the unit is non-terminal.
    pub amount: Money,
    pub kind: UnitKind,
    pub state: UnitState,
    pub quality_score: Option<u8>,
    pub verification_notes: Option<String>,
    pub photo_evidence: Vec<String>,
    pub expected_completion_date: Option<DateTime<Utc>>,
    pub paid_date: Option<DateTime<Utc>>,
    pub payment_txn_id: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
}

impl ConditionalPaymentUnit {
    /// Create a task payment in the `Pending` state.
    #[allow(clippy::too_many_arguments)]
    pub fn new_task(
        escrow_id: EscrowId,
        contractor_id: impl Into<String>,
        amount: Money,
        task_id: impl Into<String>,
        completion_requirements: Vec<String>,
        verification_criteria: Vec<String>,
        approval_required: bool,
        photos_required: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            escrow_id,
            contractor_id,
            amount,
            UnitKind::Task {
                task_id: task_id.into(),
                completion_requirements,
                verification_criteria,
                approval_required,
                photos_required,
            },
            created_at,
        )
    }

    /// Create a payment milestone in the `Pending` state.
    ///
    /// The caller (engine) is responsible for ensuring `amount` equals
    /// [`milestone_amount`] of the owning contract at creation time.
    pub fn new_milestone(
        escrow_id: EscrowId,
        contractor_id: impl Into<String>,
        amount: Money,
        name: impl Into<String>,
        percentage: u32,
        deliverables: Vec<Deliverable>,
        due_date: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut unit = Self::new(
            escrow_id,
            contractor_id,
            amount,
            UnitKind::Milestone {
                name: name.into(),
                percentage,
                deliverables,
                due_date,
            },
            created_at,
        );
        unit.expected_completion_date = due_date;
        unit
    }

    fn new(
        escrow_id: EscrowId,
        contractor_id: impl Into<String>,
        amount: Money,
        kind: UnitKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            escrow_id,
            contractor_id: contractor_id.into(),
            amount,
            kind,
            state: UnitState::Pending,
            quality_score: None,
            verification_notes: None,
            photo_evidence: Vec::new(),
            expected_completion_date: None,
            paid_date: None,
            payment_txn_id: None,
            created_at,
        }
    }

    /// Whether payment requires an explicit `Approve` after verification.
    ///
    /// Milestones always require approval; task payments carry a flag.
    pub fn approval_required(&self) -> bool {
        match &self.kind {
            UnitKind::Task { approval_required, .. } => *approval_required,
            UnitKind::Milestone { .. } => true,
        }
    }

    fn photos_required(&self) -> bool {
        match &self.kind {
            UnitKind::Task { photos_required, .. } => *photos_required,
            UnitKind::Milestone { .. } => false,
        }
    }

    /// `true` when the unit has cleared every gate except the funds release.
    pub fn is_payable(&self) -> bool {
        match self.state {
            UnitState::Approved => true,
            UnitState::Verified => !self.approval_required(),
            _ => false,
        }
    }

    /// `true` while the unit counts toward pending (projected) outflow.
    pub fn is_outstanding(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Apply an event to this unit.
    ///
    /// # Errors
    /// Returns [`UnitError`] for illegal transitions and failed validation.
    /// The unit is unchanged on error.
    pub fn apply(&mut self, event: &UnitEvent) -> Result<(), UnitError> {
        use UnitEvent::*;
        use UnitState::*;

        match (&self.state, event) {
            // ------------------------------------------------------------------
            // Verification: Pending → Verified, evidence recorded.
            // ------------------------------------------------------------------
            (Pending, Verify { quality_score, photos, notes }) => {
                if *quality_score > 100 {
                    return Err(UnitError::QualityScoreOutOfRange { score: *quality_score });
                }
                if self.photos_required() && photos.is_empty() {
                    return Err(UnitError::PhotosRequired);
                }
                self.quality_score = Some(*quality_score);
                self.photo_evidence = photos.clone();
                self.verification_notes = notes.clone();
                self.state = Verified;
            }

            // ------------------------------------------------------------------
            // Approval: Verified → Approved, only when required.
            // ------------------------------------------------------------------
            (Verified, Approve { approved_by }) => {
                if !self.approval_required() {
                    return Err(UnitError::ApprovalNotRequired);
                }
                let note = format!("approved by {approved_by}");
                self.verification_notes = Some(match self.verification_notes.take() {
                    Some(existing) => format!("{existing}; {note}"),
                    None => note,
                });
                self.state = Approved;
            }

            // ------------------------------------------------------------------
            // Payment: Approved, or Verified when no approval gate exists.
            // ------------------------------------------------------------------
            (Verified, MarkPaid { txn, at }) => {
                if self.approval_required() {
                    return Err(UnitError::IllegalTransition {
                        from: "VERIFIED",
                        event: "MarkPaid",
                    });
                }
                self.settle(txn.clone(), *at);
            }
            (Approved, MarkPaid { txn, at }) => self.settle(txn.clone(), *at),

            // MarkPaid on a terminal unit: the distinguished idempotency error.
            (Paid, MarkPaid { .. }) => return Err(UnitError::AlreadyPaid),

            // ------------------------------------------------------------------
            // Dispute freeze: reachable from Verified/Approved only.
            // ------------------------------------------------------------------
            (Verified, Freeze { dispute_id }) => {
                self.state = Frozen {
                    resume_to: ResumeState::Verified,
                    dispute_id: *dispute_id,
                };
            }
            (Approved, Freeze { dispute_id }) => {
                self.state = Frozen {
                    resume_to: ResumeState::Approved,
                    dispute_id: *dispute_id,
                };
            }

            (Frozen { resume_to, dispute_id: held_by }, Unfreeze { dispute_id }) => {
                let (resume_to, held_by) = (*resume_to, *held_by);
                if held_by != *dispute_id {
                    return Err(UnitError::FrozenByOtherDispute { held_by });
                }
                self.state = match resume_to {
                    ResumeState::Verified => Verified,
                    ResumeState::Approved => Approved,
                };
            }

            // ------------------------------------------------------------------
            // Everything else is illegal.
            // ------------------------------------------------------------------
            (state, ev) => {
                return Err(UnitError::IllegalTransition {
                    from: state.as_str(),
                    event: ev.name(),
                });
            }
        }

        Ok(())
    }

    fn settle(&mut self, txn: TransactionId, at: DateTime<Utc>) {
        self.payment_txn_id = Some(txn);
        self.paid_date = Some(at);
        self.state = UnitState::Paid;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
