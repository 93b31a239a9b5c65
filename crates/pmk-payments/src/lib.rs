//! Conditional payment unit state machine.
//!
//! # Design
//!
//! Explicit state machine for a single conditional payment (task payment or
//! payment milestone). Every lifecycle event is applied via
//! [`ConditionalPaymentUnit::apply`], which enforces two invariants:
//!
//! 1. **Legal transitions only.** Illegal events return [`UnitError`];
//!    the unit is never mutated on error.
//! 2. **At-most-once payment.** `MarkPaid` on a unit that is already
//!    `Paid` returns [`UnitError::AlreadyPaid`] — the caller's retry with
//!    the same idempotency key must not double-pay.
//!
//! # State diagram
//!
//! ```text
//!              Verify                Approve            MarkPaid
//!   Pending ──────────► Verified ──────────► Approved ──────────► Paid (term.)
//!                          │                    │                   ▲
//!                          │ (approval not      │                   │
//!                          │  required)         │                   │
//!                          └────────────────────┼───── MarkPaid ────┘
//!                          │                    │
//!                        Freeze               Freeze
//!                          ▼                    ▼
//!                        Frozen { resume_to, dispute_id }
//!                          │
//!                        Unfreeze (same dispute) — restores resume_to
//! ```
//!
//! Funds movement is the engine's concern: this crate only tracks the
//! lifecycle. The engine calls `MarkPaid` after the escrow release commits,
//! so a failed release leaves the unit in its pre-payment state (retryable).

mod unit;

pub use unit::{
    milestone_amount, ConditionalPaymentUnit, Deliverable, ResumeState, UnitError, UnitEvent,
    UnitKind, UnitState,
};
