//! Cash-flow projection — pure read-side analytics.
//!
//! Aggregates caller-supplied per-escrow position snapshots into a
//! forward-looking projection for one party. No side effects, no clock, no
//! IO; safe to compute concurrently with writers because inputs are
//! snapshots taken under the escrow locks.

use serde::{Deserialize, Serialize};

use pmk_schemas::{EscrowId, Money};

/// Confidence the projection starts from before risk deductions.
pub const BASE_CONFIDENCE: f64 = 0.8;

/// Confidence deduction per listed risk factor.
pub const RISK_PENALTY: f64 = 0.1;

/// Confidence bounds after deductions.
pub const CONFIDENCE_FLOOR: f64 = 0.1;
pub const CONFIDENCE_CEILING: f64 = 1.0;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Read-only position of one escrow, captured under its cell lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowPosition {
    pub escrow_id: EscrowId,
    pub total_project_value: Money,
    pub total_deposited: Money,
    pub total_paid: Money,
    pub retention_amount: Money,
    pub retention_released: bool,
    /// Sum of VERIFIED/APPROVED (payment-pending) unit amounts.
    pub pending_release_total: Money,
    pub pending_unit_count: usize,
    /// Amounts excluded from the available balance by open disputes.
    pub frozen_total: Money,
    pub open_dispute_count: usize,
    /// Units whose expected completion date has passed without payment.
    pub overdue_unit_count: usize,
}

impl EscrowPosition {
    /// Funding still owed by the client before the escrow is fully covered.
    pub fn remaining_funding(&self) -> Money {
        let gap = self.total_project_value - self.total_deposited;
        if gap.is_positive() {
            gap
        } else {
            Money::ZERO
        }
    }

    /// `true` when pending releases could not all be paid from the current
    /// balance.
    pub fn is_underfunded(&self) -> bool {
        let balance = self.total_deposited - self.total_paid;
        self.pending_release_total > balance - self.frozen_total
    }
}

// ---------------------------------------------------------------------------
// Risk factors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskKind {
    /// Pending releases exceed the available balance.
    UnderfundedEscrow,
    /// At least one dispute is open against the escrow.
    OpenDispute,
    /// At least one unit is past its expected completion date.
    OverdueUnit,
}

impl RiskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnderfundedEscrow => "underfunded_escrow",
            Self::OpenDispute => "open_dispute",
            Self::OverdueUnit => "overdue_unit",
        }
    }
}

/// One identified risk, attributed to the escrow that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub kind: RiskKind,
    pub escrow_id: EscrowId,
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Derived, read-only snapshot of forward cash flow for one party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashFlowProjection {
    /// Funding still due into escrow across all positions.
    pub projected_inflow: Money,
    /// Pending conditional releases plus unreleased retention.
    pub projected_outflow: Money,
    pub net_cash_flow: Money,
    pub pending_unit_count: usize,
    pub risk_factors: Vec<RiskFactor>,
    /// [`BASE_CONFIDENCE`] minus [`RISK_PENALTY`] per factor, clamped to
    /// [[`CONFIDENCE_FLOOR`], [`CONFIDENCE_CEILING`]].
    pub confidence_score: f64,
}

/// Project forward cash flow across a party's escrow positions.
pub fn project(positions: &[EscrowPosition]) -> CashFlowProjection {
    let mut inflow = Money::ZERO;
    let mut outflow = Money::ZERO;
    let mut pending_units = 0usize;
    let mut risks = Vec::new();

    for pos in positions {
        inflow = inflow.saturating_add(pos.remaining_funding());
        outflow = outflow.saturating_add(pos.pending_release_total);
        if !pos.retention_released {
            outflow = outflow.saturating_add(pos.retention_amount);
        }
        pending_units += pos.pending_unit_count;

        if pos.is_underfunded() {
            risks.push(RiskFactor {
                kind: RiskKind::UnderfundedEscrow,
                escrow_id: pos.escrow_id,
            });
        }
        if pos.open_dispute_count > 0 {
            risks.push(RiskFactor {
                kind: RiskKind::OpenDispute,
                escrow_id: pos.escrow_id,
            });
        }
        if pos.overdue_unit_count > 0 {
            risks.push(RiskFactor {
                kind: RiskKind::OverdueUnit,
                escrow_id: pos.escrow_id,
            });
        }
    }

    let confidence = (BASE_CONFIDENCE - RISK_PENALTY * risks.len() as f64)
        .clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING);

    CashFlowProjection {
        projected_inflow: inflow,
        projected_outflow: outflow,
        net_cash_flow: inflow - outflow,
        pending_unit_count: pending_units,
        risk_factors: risks,
        confidence_score: confidence,
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
