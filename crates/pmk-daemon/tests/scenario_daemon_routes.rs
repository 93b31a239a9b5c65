//! In-process scenario tests for pmk-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket.
//! Each test calls `routes::build_router` and drives it via
//! `tower::ServiceExt::oneshot` — no network I/O required.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use pmk_daemon::{routes, state};
use serde_json::json;
use tower::ServiceExt; // oneshot

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a fresh in-process router backed by a clean AppState.
fn make_state() -> Arc<state::AppState> {
    Arc::new(state::AppState::new())
}

fn router(st: &Arc<state::AppState>) -> axum::Router {
    routes::build_router(Arc::clone(st))
}

async fn call(
    router: axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(axum::body::Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(axum::body::Body::empty()).unwrap(),
    };

    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("body is not valid JSON")
    };
    (status, value)
}

async fn create_escrow(st: &Arc<state::AppState>) -> String {
    let (status, body) = call(
        router(st),
        "POST",
        "/v1/escrows",
        Some(json!({
            "project_id": "project-1",
            "total_project_value": 100_000_000_000i64,
            "retention_percentage": 10,
            "client_id": "client-1",
            "contractor_id": "contractor-1",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {body}");
    body["id"].as_str().unwrap().to_string()
}

async fn fund(st: &Arc<state::AppState>, escrow: &str, amount_major: i64) {
    let (status, _) = call(
        router(st),
        "POST",
        &format!("/v1/escrows/{escrow}/fund"),
        Some(json!({
            "amount": amount_major * 1_000_000,
            "method": "bank_transfer",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let st = make_state();
    let (status, body) = call(router(&st), "GET", "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["service"], "pmk-daemon");
}

// ---------------------------------------------------------------------------
// Escrow lifecycle over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_and_fetch_escrow() {
    let st = make_state();
    let escrow = create_escrow(&st).await;

    let (status, body) = call(router(&st), "GET", &format!("/v1/escrows/{escrow}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CREATED");
    assert_eq!(body["retention_amount"], 10_000_000_000i64);
    assert_eq!(body["escrow_balance"], 0);
}

#[tokio::test]
async fn funding_transitions_status_over_http() {
    let st = make_state();
    let escrow = create_escrow(&st).await;

    fund(&st, &escrow, 50_000).await;
    let (_, body) = call(router(&st), "GET", &format!("/v1/escrows/{escrow}"), None).await;
    assert_eq!(body["status"], "ACTIVE");

    fund(&st, &escrow, 50_000).await;
    let (_, body) = call(router(&st), "GET", &format!("/v1/escrows/{escrow}"), None).await;
    assert_eq!(body["status"], "FUNDED");
}

#[tokio::test]
async fn unknown_escrow_is_404_with_structured_error() {
    let st = make_state();
    let (status, body) = call(
        router(&st),
        "GET",
        "/v1/escrows/00000000-0000-0000-0000-000000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "escrow_not_found");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn invalid_retention_is_400() {
    let st = make_state();
    let (status, body) = call(
        router(&st),
        "POST",
        "/v1/escrows",
        Some(json!({
            "project_id": "project-1",
            "total_project_value": 1_000_000,
            "retention_percentage": 101,
            "client_id": "client-1",
            "contractor_id": "contractor-1",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_retention");
}

// ---------------------------------------------------------------------------
// Unit lifecycle over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn task_unit_verify_pays_out() {
    let st = make_state();
    let escrow = create_escrow(&st).await;
    fund(&st, &escrow, 50_000).await;

    let (status, unit) = call(
        router(&st),
        "POST",
        &format!("/v1/escrows/{escrow}/units"),
        Some(json!({
            "kind": "task",
            "task_id": "task-77",
            "amount": 5_000_000_000i64,
            "approval_required": false,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let unit_id = unit["id"].as_str().unwrap().to_string();

    let (status, unit) = call(
        router(&st),
        "POST",
        &format!("/v1/units/{unit_id}/verify"),
        Some(json!({ "quality_score": 95 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(unit["state"]["state"], "PAID");

    let (_, snap) = call(router(&st), "GET", &format!("/v1/escrows/{escrow}"), None).await;
    assert_eq!(snap["escrow_balance"], 45_000_000_000i64);
    assert_eq!(snap["total_paid"], 5_000_000_000i64);
}

#[tokio::test]
async fn oversized_release_is_409_conflict() {
    let st = make_state();
    let escrow = create_escrow(&st).await;
    fund(&st, &escrow, 50_000).await;

    let (status, body) = call(
        router(&st),
        "POST",
        &format!("/v1/escrows/{escrow}/release"),
        Some(json!({
            "recipient_id": "contractor-1",
            "amount": 60_000_000_000i64,
            "payment_type": "TASK_COMPLETION",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "insufficient_escrow_balance");
    assert_eq!(body["retryable"], true);
}

#[tokio::test]
async fn milestone_and_change_order_over_http() {
    let st = make_state();
    let escrow = create_escrow(&st).await;
    fund(&st, &escrow, 100_000).await;

    let (status, milestone) = call(
        router(&st),
        "POST",
        &format!("/v1/escrows/{escrow}/units"),
        Some(json!({
            "kind": "milestone",
            "name": "framing complete",
            "percentage": 20,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(milestone["amount"], 20_000_000_000i64);
    let unit_id = milestone["id"].as_str().unwrap().to_string();

    let (status, order) = call(
        router(&st),
        "POST",
        &format!("/v1/escrows/{escrow}/change-orders"),
        Some(json!({
            "amount_change": 10_000_000_000i64,
            "reason": "scope increase",
            "approved_by": "pm-1",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["change_order_number"], 1);

    let (_, unit) = call(router(&st), "GET", &format!("/v1/units/{unit_id}"), None).await;
    assert_eq!(unit["amount"], 22_000_000_000i64);
}

// ---------------------------------------------------------------------------
// Disputes over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispute_lifecycle_over_http() {
    let st = make_state();
    let escrow = create_escrow(&st).await;
    fund(&st, &escrow, 50_000).await;

    let (status, dispute) = call(
        router(&st),
        "POST",
        "/v1/disputes",
        Some(json!({
            "escrow_id": escrow,
            "dispute_amount": 5_000_000_000i64,
            "submitted_by": "client-1",
            "respondent_id": "contractor-1",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(dispute["status"], "SUBMITTED");
    let dispute_id = dispute["id"].as_str().unwrap().to_string();

    // The frozen amount is excluded from the available balance.
    let (_, snap) = call(router(&st), "GET", &format!("/v1/escrows/{escrow}"), None).await;
    assert_eq!(snap["available_balance"], 45_000_000_000i64);

    let (status, dispute) = call(
        router(&st),
        "POST",
        &format!("/v1/disputes/{dispute_id}/mediation"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dispute["status"], "MEDIATION");

    let (status, dispute) = call(
        router(&st),
        "POST",
        &format!("/v1/disputes/{dispute_id}/resolve"),
        Some(json!({
            "resolution": "client prevails",
            "resolution_amount": 5_000_000_000i64,
            "resolved_by": "mediator-1",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dispute["status"], "RESOLVED");

    let (_, snap) = call(router(&st), "GET", &format!("/v1/escrows/{escrow}"), None).await;
    assert_eq!(snap["frozen_total"], 0);
    assert_eq!(snap["escrow_balance"], 45_000_000_000i64, "refund paid out");
}

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dashboard_returns_projection() {
    let st = make_state();
    let escrow = create_escrow(&st).await;
    fund(&st, &escrow, 60_000).await;

    let (status, body) = call(router(&st), "GET", "/v1/dashboard/contractor-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["projected_inflow"], 40_000_000_000i64);
    assert!(body["confidence_score"].as_f64().unwrap() > 0.0);
}

// ---------------------------------------------------------------------------
// Audit trail wiring
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mutations_append_to_the_audit_trail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let st = Arc::new(
        state::AppState::new()
            .with_audit(path.to_str().unwrap(), true)
            .unwrap(),
    );

    let escrow = create_escrow(&st).await;
    fund(&st, &escrow, 10_000).await;

    let verified = pmk_audit::verify_hash_chain(&path).unwrap();
    assert_eq!(verified, pmk_audit::VerifyResult::Valid { lines: 2 });
}
