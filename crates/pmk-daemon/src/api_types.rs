//! Request and response types for all pmk-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests. No business logic lives here; engine
//! snapshots (`EscrowSnapshot`, `ConditionalPaymentUnit`, `PaymentDispute`,
//! `CashFlowProjection`) serialize directly as response bodies.

use chrono::{DateTime, Utc};
use pmk_dispute::PaymentRef;
use pmk_schemas::Money;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Structured errors
// ---------------------------------------------------------------------------

/// Body of every non-2xx response: the violated invariant by name, a
/// human-readable detail, and whether a retry can succeed after the caller
/// corrects an external condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub detail: String,
    pub retryable: bool,
}

// ---------------------------------------------------------------------------
// Escrow lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEscrowRequest {
    pub project_id: String,
    /// Micros (1e-6 currency units), like every money field on this API.
    pub total_project_value: Money,
    pub retention_percentage: u32,
    pub client_id: String,
    pub contractor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundEscrowRequest {
    pub amount: Money,
    pub method: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseFundsRequest {
    pub recipient_id: String,
    pub amount: Money,
    pub payment_type: pmk_schemas::PaymentType,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Conditional payment units
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CreateUnitRequest {
    Task {
        task_id: String,
        amount: Money,
        #[serde(default)]
        completion_requirements: Vec<String>,
        #[serde(default)]
        verification_criteria: Vec<String>,
        #[serde(default)]
        approval_required: bool,
        #[serde(default)]
        photos_required: bool,
    },
    Milestone {
        name: String,
        percentage: u32,
        #[serde(default)]
        deliverables: Vec<DeliverableBody>,
        #[serde(default)]
        due_date: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverableBody {
    pub description: String,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyUnitRequest {
    pub quality_score: u8,
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveUnitRequest {
    pub approved_by: String,
}

// ---------------------------------------------------------------------------
// Change orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeOrderRequest {
    pub amount_change: Money,
    #[serde(default)]
    pub schedule_impact_days: i64,
    pub reason: String,
    pub approved_by: String,
}

// ---------------------------------------------------------------------------
// Disputes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenDisputeRequest {
    pub escrow_id: pmk_schemas::EscrowId,
    #[serde(default)]
    pub payment_ref: Option<PaymentRef>,
    pub dispute_amount: Money,
    pub submitted_by: String,
    pub respondent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveDisputeRequest {
    pub resolution: String,
    pub resolution_amount: Money,
    pub resolved_by: String,
}
