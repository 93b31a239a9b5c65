//! Axum router and all HTTP handlers for pmk-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. All handlers are `pub(crate)` so the
//! scenario tests in `tests/` can compose the router directly.
//!
//! Every public operation returns either a fully-updated entity or a
//! structured [`ErrorResponse`] naming the violated invariant — there is
//! no partial-success response shape.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;
use uuid::Uuid;

use pmk_escrow::EscrowError;
use pmk_payments::Deliverable;

use crate::{
    api_types::{
        ApproveUnitRequest, ChangeOrderRequest, CreateEscrowRequest, CreateUnitRequest,
        ErrorResponse, FundEscrowRequest, HealthResponse, OpenDisputeRequest,
        ReleaseFundsRequest, ResolveDisputeRequest, VerifyUnitRequest,
    },
    state::{AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/stream", get(stream))
        .route("/v1/escrows", post(create_escrow))
        .route("/v1/escrows/:id", get(get_escrow))
        .route("/v1/escrows/:id/fund", post(fund_escrow))
        .route("/v1/escrows/:id/release", post(release_funds))
        .route("/v1/escrows/:id/ledger", get(list_ledger))
        .route("/v1/escrows/:id/units", get(list_units).post(create_unit))
        .route(
            "/v1/escrows/:id/change-orders",
            get(list_change_orders).post(apply_change_order),
        )
        .route("/v1/escrows/:id/complete", post(mark_completed))
        .route("/v1/escrows/:id/retention/release", post(release_retention))
        .route("/v1/escrows/:id/close", post(close_escrow))
        .route("/v1/units/:id", get(get_unit))
        .route("/v1/units/:id/verify", post(verify_unit))
        .route("/v1/units/:id/approve", post(approve_unit))
        .route("/v1/units/:id/pay", post(pay_unit))
        .route("/v1/disputes", post(open_dispute))
        .route("/v1/disputes/:id", get(get_dispute))
        .route("/v1/disputes/:id/mediation", post(request_mediation))
        .route("/v1/disputes/:id/resolve", post(resolve_dispute))
        .route("/v1/dashboard/:party_id", get(dashboard))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_code(err: &EscrowError) -> &'static str {
    match err {
        EscrowError::InvalidRetention { .. } => "invalid_retention",
        EscrowError::InvalidPercentage { .. } => "invalid_percentage",
        EscrowError::InvalidAmount { .. } => "invalid_amount",
        EscrowError::MissingParty { .. } => "missing_party",
        EscrowError::EscrowNotFound { .. } => "escrow_not_found",
        EscrowError::UnitNotFound { .. } => "unit_not_found",
        EscrowError::DisputeNotFound { .. } => "dispute_not_found",
        EscrowError::EntryNotFound { .. } => "entry_not_found",
        EscrowError::InsufficientEscrowBalance { .. } => "insufficient_escrow_balance",
        EscrowError::MilestoneOverallocated { .. } => "milestone_overallocated",
        EscrowError::Processor(_) => "processor_error",
        EscrowError::AlreadyPaid => "already_paid",
        EscrowError::DuplicateDeposit { .. } => "duplicate_deposit",
        EscrowError::InvalidStateTransition { .. } => "invalid_state_transition",
        EscrowError::NotClosable { .. } => "not_closable",
        EscrowError::RetentionNotReleasable { .. } => "retention_not_releasable",
        EscrowError::ChangeOrder(_) => "invalid_change_order",
        EscrowError::Ledger(_) => "ledger_invariant",
        EscrowError::Dispute(_) => "dispute_error",
    }
}

fn status_for(err: &EscrowError) -> StatusCode {
    use EscrowError::*;
    match err {
        EscrowNotFound { .. } | UnitNotFound { .. } | DisputeNotFound { .. }
        | EntryNotFound { .. } => StatusCode::NOT_FOUND,
        InvalidRetention { .. } | InvalidPercentage { .. } | InvalidAmount { .. }
        | MissingParty { .. } | ChangeOrder(_) | Ledger(_) => StatusCode::BAD_REQUEST,
        Processor(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::CONFLICT,
    }
}

fn reject(err: EscrowError) -> Response {
    let body = ErrorResponse {
        error: error_code(&err).to_string(),
        detail: err.to_string(),
        retryable: err.is_retryable(),
    };
    (status_for(&err), Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// Escrow lifecycle
// ---------------------------------------------------------------------------

pub(crate) async fn create_escrow(
    State(st): State<Arc<AppState>>,
    Json(req): Json<CreateEscrowRequest>,
) -> Response {
    match st.engine.create_escrow(
        &req.project_id,
        req.total_project_value,
        req.retention_percentage,
        &req.client_id,
        &req.contractor_id,
    ) {
        Ok(snap) => {
            info!(escrow_id = %snap.id, project = %req.project_id, "escrow created");
            st.audit_append(
                snap.id,
                pmk_audit::topic::ESCROW,
                "ESCROW_CREATED",
                &req.client_id,
                json!({ "total_project_value": req.total_project_value, "retention_percentage": req.retention_percentage }),
            );
            (StatusCode::CREATED, Json(snap)).into_response()
        }
        Err(err) => reject(err),
    }
}

pub(crate) async fn get_escrow(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.engine.get_escrow(id) {
        Ok(snap) => (StatusCode::OK, Json(snap)).into_response(),
        Err(err) => reject(err),
    }
}

pub(crate) async fn fund_escrow(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<FundEscrowRequest>,
) -> Response {
    match st
        .engine
        .fund_escrow(id, req.amount, &req.method, req.idempotency_key)
    {
        Ok(snap) => {
            info!(escrow_id = %id, amount = %req.amount, "escrow funded");
            st.audit_append(
                id,
                pmk_audit::topic::FUNDS,
                "DEPOSIT_COMPLETED",
                &snap.client_id,
                json!({ "amount": req.amount, "method": req.method, "balance": snap.escrow_balance }),
            );
            (StatusCode::OK, Json(snap)).into_response()
        }
        Err(err) => reject(err),
    }
}

pub(crate) async fn release_funds(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReleaseFundsRequest>,
) -> Response {
    match st.engine.release_funds(
        id,
        &req.recipient_id,
        req.amount,
        req.payment_type,
        req.idempotency_key,
    ) {
        Ok(txn) => {
            st.audit_append(
                id,
                pmk_audit::topic::FUNDS,
                "PAYMENT_RELEASED",
                &req.recipient_id,
                json!({ "amount": req.amount, "payment_type": req.payment_type, "txn": txn }),
            );
            (StatusCode::OK, Json(json!({ "transaction_id": txn }))).into_response()
        }
        Err(err) => reject(err),
    }
}

pub(crate) async fn list_ledger(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.engine.ledger_entries(id) {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(err) => reject(err),
    }
}

pub(crate) async fn mark_completed(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.engine.mark_completed(id) {
        Ok(snap) => {
            st.audit_append(
                id,
                pmk_audit::topic::ESCROW,
                "ESCROW_COMPLETED",
                "orchestrator",
                json!({ "status": snap.status }),
            );
            (StatusCode::OK, Json(snap)).into_response()
        }
        Err(err) => reject(err),
    }
}

pub(crate) async fn release_retention(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.engine.release_retention(id) {
        Ok(txn) => {
            st.audit_append(
                id,
                pmk_audit::topic::FUNDS,
                "RETENTION_RELEASED",
                "orchestrator",
                json!({ "txn": txn }),
            );
            (StatusCode::OK, Json(json!({ "transaction_id": txn }))).into_response()
        }
        Err(err) => reject(err),
    }
}

pub(crate) async fn close_escrow(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.engine.close_escrow(id) {
        Ok(snap) => {
            info!(escrow_id = %id, "escrow closed");
            st.audit_append(
                id,
                pmk_audit::topic::ESCROW,
                "ESCROW_CLOSED",
                "orchestrator",
                json!({}),
            );
            (StatusCode::OK, Json(snap)).into_response()
        }
        Err(err) => reject(err),
    }
}

// ---------------------------------------------------------------------------
// Conditional payment units
// ---------------------------------------------------------------------------

pub(crate) async fn create_unit(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateUnitRequest>,
) -> Response {
    let result = match req {
        CreateUnitRequest::Task {
            task_id,
            amount,
            completion_requirements,
            verification_criteria,
            approval_required,
            photos_required,
        } => st.engine.create_task_payment(
            id,
            &task_id,
            amount,
            completion_requirements,
            verification_criteria,
            approval_required,
            photos_required,
        ),
        CreateUnitRequest::Milestone {
            name,
            percentage,
            deliverables,
            due_date,
        } => {
            let deliverables = deliverables
                .into_iter()
                .map(|d| Deliverable {
                    description: d.description,
                    completed: d.completed,
                })
                .collect();
            st.engine
                .create_milestone(id, &name, percentage, deliverables, due_date)
        }
    };

    match result {
        Ok(unit) => {
            st.audit_append(
                id,
                pmk_audit::topic::UNITS,
                "UNIT_CREATED",
                &unit.contractor_id,
                json!({ "unit_id": unit.id, "amount": unit.amount }),
            );
            (StatusCode::CREATED, Json(unit)).into_response()
        }
        Err(err) => reject(err),
    }
}

pub(crate) async fn list_units(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.engine.units(id) {
        Ok(units) => (StatusCode::OK, Json(units)).into_response(),
        Err(err) => reject(err),
    }
}

pub(crate) async fn get_unit(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match st.engine.get_unit(id) {
        Ok(unit) => (StatusCode::OK, Json(unit)).into_response(),
        Err(err) => reject(err),
    }
}

pub(crate) async fn verify_unit(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<VerifyUnitRequest>,
) -> Response {
    match st
        .engine
        .verify_completion(id, req.quality_score, req.photos, req.notes)
    {
        Ok(unit) => {
            st.audit_append(
                unit.escrow_id,
                pmk_audit::topic::UNITS,
                "UNIT_VERIFIED",
                "orchestrator",
                json!({ "unit_id": id, "quality_score": req.quality_score, "state": unit.state.as_str() }),
            );
            (StatusCode::OK, Json(unit)).into_response()
        }
        Err(err) => reject(err),
    }
}

pub(crate) async fn approve_unit(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApproveUnitRequest>,
) -> Response {
    match st.engine.approve(id, &req.approved_by) {
        Ok(unit) => {
            st.audit_append(
                unit.escrow_id,
                pmk_audit::topic::UNITS,
                "UNIT_APPROVED",
                &req.approved_by,
                json!({ "unit_id": id, "state": unit.state.as_str() }),
            );
            (StatusCode::OK, Json(unit)).into_response()
        }
        Err(err) => reject(err),
    }
}

pub(crate) async fn pay_unit(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match st.engine.release_unit_payment(id) {
        Ok(txn) => {
            (StatusCode::OK, Json(json!({ "transaction_id": txn }))).into_response()
        }
        Err(err) => reject(err),
    }
}

// ---------------------------------------------------------------------------
// Change orders
// ---------------------------------------------------------------------------

pub(crate) async fn apply_change_order(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ChangeOrderRequest>,
) -> Response {
    match st.engine.apply_change_order(
        id,
        req.amount_change,
        req.schedule_impact_days,
        &req.reason,
        &req.approved_by,
    ) {
        Ok(order) => {
            info!(escrow_id = %id, number = order.change_order_number, "change order applied");
            st.audit_append(
                id,
                pmk_audit::topic::CHANGE_ORDERS,
                "CHANGE_ORDER_APPLIED",
                &req.approved_by,
                json!({ "number": order.change_order_number, "amount_change": req.amount_change }),
            );
            (StatusCode::CREATED, Json(order)).into_response()
        }
        Err(err) => reject(err),
    }
}

pub(crate) async fn list_change_orders(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.engine.change_orders(id) {
        Ok(orders) => (StatusCode::OK, Json(orders)).into_response(),
        Err(err) => reject(err),
    }
}

// ---------------------------------------------------------------------------
// Disputes
// ---------------------------------------------------------------------------

pub(crate) async fn open_dispute(
    State(st): State<Arc<AppState>>,
    Json(req): Json<OpenDisputeRequest>,
) -> Response {
    match st.engine.open_dispute(
        req.escrow_id,
        req.payment_ref,
        req.dispute_amount,
        &req.submitted_by,
        &req.respondent_id,
    ) {
        Ok(dispute) => {
            st.audit_append(
                req.escrow_id,
                pmk_audit::topic::DISPUTES,
                "DISPUTE_OPENED",
                &req.submitted_by,
                json!({ "dispute_id": dispute.id, "dispute_amount": req.dispute_amount }),
            );
            (StatusCode::CREATED, Json(dispute)).into_response()
        }
        Err(err) => reject(err),
    }
}

pub(crate) async fn get_dispute(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.engine.get_dispute(id) {
        Ok(dispute) => (StatusCode::OK, Json(dispute)).into_response(),
        Err(err) => reject(err),
    }
}

pub(crate) async fn request_mediation(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.engine.request_mediation(id) {
        Ok(dispute) => {
            st.audit_append(
                dispute.escrow_id,
                pmk_audit::topic::DISPUTES,
                "MEDIATION_SCHEDULED",
                dispute.mediator.as_deref().unwrap_or("unassigned"),
                json!({ "dispute_id": id, "mediation_date": dispute.mediation_date }),
            );
            (StatusCode::OK, Json(dispute)).into_response()
        }
        Err(err) => reject(err),
    }
}

pub(crate) async fn resolve_dispute(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResolveDisputeRequest>,
) -> Response {
    match st
        .engine
        .resolve_dispute(id, &req.resolution, req.resolution_amount, &req.resolved_by)
    {
        Ok(dispute) => {
            info!(dispute_id = %id, "dispute resolved");
            st.audit_append(
                dispute.escrow_id,
                pmk_audit::topic::DISPUTES,
                "DISPUTE_RESOLVED",
                &req.resolved_by,
                json!({ "dispute_id": id, "resolution_amount": req.resolution_amount }),
            );
            (StatusCode::OK, Json(dispute)).into_response()
        }
        Err(err) => reject(err),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/dashboard/:party_id
// ---------------------------------------------------------------------------

pub(crate) async fn dashboard(
    State(st): State<Arc<AppState>>,
    Path(party_id): Path<String>,
) -> Response {
    let projection = st.engine.cash_flow_dashboard(&party_id);
    (StatusCode::OK, Json(projection)).into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Notice { .. } => "notice",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
