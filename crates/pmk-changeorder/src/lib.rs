//! Change-order arithmetic — the pure half of contract amendment.
//!
//! `plan_change_order` validates an amendment and computes the new contract
//! totals; `rescale_amount` proportionally rescales one pending payment
//! amount against the plan. The engine applies a plan atomically (account
//! totals, every non-terminal unit, schedule shift, audit record) under the
//! escrow cell lock; nothing here performs IO or mutation.
//!
//! All proportional math is exact integer `i128` mul-div; a rescale of
//! `20_000` against `100_000 → 110_000` yields exactly `22_000`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pmk_schemas::{EscrowId, Money};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrderError {
    /// The amendment would drive the total project value negative.
    InvalidChangeOrder { new_total: Money },
    /// The prior total is zero; no adjustment ratio exists.
    DivisionByZeroGuard,
    /// A rescaled amount does not fit in the money range.
    AmountOverflow,
    /// Reason and approver are required audit fields.
    MissingAuditField { field: &'static str },
}

impl std::fmt::Display for ChangeOrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidChangeOrder { new_total } => {
                write!(f, "change order would drive total project value to {new_total}")
            }
            Self::DivisionByZeroGuard => {
                write!(f, "cannot rescale against a zero prior project value")
            }
            Self::AmountOverflow => write!(f, "rescaled amount overflows the money range"),
            Self::MissingAuditField { field } => {
                write!(f, "change order requires a non-empty {field}")
            }
        }
    }
}

impl std::error::Error for ChangeOrderError {}

// ---------------------------------------------------------------------------
// ChangeOrder record
// ---------------------------------------------------------------------------

/// Append-only audit record of one applied contract amendment.
///
/// Never mutated after the engine appends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeOrder {
    pub id: Uuid,
    pub escrow_id: EscrowId,
    /// Sequential per escrow, starting at 1.
    pub change_order_number: u32,
    pub amount_change: Money,
    pub schedule_impact_days: i64,
    pub reason: String,
    pub approved_by: String,
    pub applied_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ChangePlan
// ---------------------------------------------------------------------------

/// Validated outcome of planning an amendment: the new contract totals and
/// the ratio basis every pending amount is rescaled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangePlan {
    pub prior_total: Money,
    pub new_total: Money,
    pub new_retention_amount: Money,
}

/// Validate an amendment and compute the new totals.
///
/// # Errors
/// - [`ChangeOrderError::DivisionByZeroGuard`] when `prior_total` is zero.
/// - [`ChangeOrderError::InvalidChangeOrder`] when the new total would be
///   negative.
/// - [`ChangeOrderError::AmountOverflow`] when the new total or retention
///   does not fit in the money range.
pub fn plan_change_order(
    prior_total: Money,
    retention_percentage: u32,
    amount_change: Money,
) -> Result<ChangePlan, ChangeOrderError> {
    if prior_total == Money::ZERO {
        return Err(ChangeOrderError::DivisionByZeroGuard);
    }
    let new_total = prior_total
        .checked_add(amount_change)
        .ok_or(ChangeOrderError::AmountOverflow)?;
    if new_total.is_negative() {
        return Err(ChangeOrderError::InvalidChangeOrder { new_total });
    }
    let new_retention_amount = new_total
        .percent_of(retention_percentage)
        .ok_or(ChangeOrderError::AmountOverflow)?;

    Ok(ChangePlan {
        prior_total,
        new_total,
        new_retention_amount,
    })
}

/// Rescale one pending payment amount by the plan's adjustment ratio:
/// `amount * new_total / prior_total`, exact over `i128`.
pub fn rescale_amount(amount: Money, plan: &ChangePlan) -> Result<Money, ChangeOrderError> {
    if plan.prior_total == Money::ZERO {
        return Err(ChangeOrderError::DivisionByZeroGuard);
    }
    amount
        .mul_div(plan.new_total.micros(), plan.prior_total.micros())
        .ok_or(ChangeOrderError::AmountOverflow)
}

/// Shift an expected completion date by the amendment's schedule impact.
pub fn shift_schedule(date: DateTime<Utc>, schedule_impact_days: i64) -> DateTime<Utc> {
    date + Duration::days(schedule_impact_days)
}

/// Reject empty audit fields before any state is touched.
pub fn validate_audit_fields(reason: &str, approved_by: &str) -> Result<(), ChangeOrderError> {
    if reason.trim().is_empty() {
        return Err(ChangeOrderError::MissingAuditField { field: "reason" });
    }
    if approved_by.trim().is_empty() {
        return Err(ChangeOrderError::MissingAuditField { field: "approver" });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_computes_new_totals() {
        let plan = plan_change_order(Money::from_major(100_000), 10, Money::from_major(10_000))
            .unwrap();
        assert_eq!(plan.new_total, Money::from_major(110_000));
        assert_eq!(plan.new_retention_amount, Money::from_major(11_000));
    }

    #[test]
    fn plan_accepts_reductions() {
        let plan = plan_change_order(Money::from_major(100_000), 10, Money::from_major(-40_000))
            .unwrap();
        assert_eq!(plan.new_total, Money::from_major(60_000));
        assert_eq!(plan.new_retention_amount, Money::from_major(6_000));
    }

    #[test]
    fn plan_rejects_negative_new_total() {
        let err = plan_change_order(Money::from_major(100_000), 10, Money::from_major(-150_000))
            .unwrap_err();
        assert_eq!(
            err,
            ChangeOrderError::InvalidChangeOrder {
                new_total: Money::from_major(-50_000)
            }
        );
    }

    #[test]
    fn plan_rejects_zero_prior_total() {
        let err =
            plan_change_order(Money::ZERO, 10, Money::from_major(10_000)).unwrap_err();
        assert_eq!(err, ChangeOrderError::DivisionByZeroGuard);
    }

    #[test]
    fn plan_allows_new_total_of_zero() {
        // Cancelling the entire remaining contract is legal; only negative
        // totals are rejected.
        let plan = plan_change_order(Money::from_major(50_000), 10, Money::from_major(-50_000))
            .unwrap();
        assert_eq!(plan.new_total, Money::ZERO);
        assert_eq!(plan.new_retention_amount, Money::ZERO);
    }

    #[test]
    fn rescale_is_exact_proportion() {
        // +10% on the contract lifts a 20_000 milestone to exactly 22_000.
        let plan = plan_change_order(Money::from_major(100_000), 10, Money::from_major(10_000))
            .unwrap();
        assert_eq!(
            rescale_amount(Money::from_major(20_000), &plan).unwrap(),
            Money::from_major(22_000)
        );
    }

    #[test]
    fn rescale_identity_when_unchanged() {
        let plan = plan_change_order(Money::from_major(100_000), 10, Money::ZERO).unwrap();
        let amount = Money::from_major(33_333);
        assert_eq!(rescale_amount(amount, &plan).unwrap(), amount);
    }

    #[test]
    fn rescale_shrinks_on_reduction() {
        let plan = plan_change_order(Money::from_major(100_000), 10, Money::from_major(-50_000))
            .unwrap();
        assert_eq!(
            rescale_amount(Money::from_major(20_000), &plan).unwrap(),
            Money::from_major(10_000)
        );
    }

    #[test]
    fn shift_schedule_moves_forward_and_back() {
        let d = Utc::now();
        assert_eq!(shift_schedule(d, 14) - d, Duration::days(14));
        assert_eq!(shift_schedule(d, -7) - d, Duration::days(-7));
    }

    #[test]
    fn audit_fields_must_be_non_empty() {
        assert_eq!(
            validate_audit_fields("", "pm-1").unwrap_err(),
            ChangeOrderError::MissingAuditField { field: "reason" }
        );
        assert_eq!(
            validate_audit_fields("scope increase", "  ").unwrap_err(),
            ChangeOrderError::MissingAuditField { field: "approver" }
        );
        assert!(validate_audit_fields("scope increase", "pm-1").is_ok());
    }
}
