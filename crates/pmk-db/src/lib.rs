//! PostgreSQL persistence for the escrow engine.
//!
//! Runtime-checked queries only (no compile-time DB connection needed).
//! Schema invariants that matter financially are enforced at the DB level
//! too: CHECK-constrained enum columns, a unique idempotency-key index,
//! and an append-only trigger on `ledger_entries`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub const ENV_DB_URL: &str = "PMK_DATABASE_URL";

/// Connect to Postgres using PMK_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_escrow_table: bool,
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='escrow_accounts'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_escrow_table: exists,
    })
}

/// Count disputes that are still freezing funds (SUBMITTED or MEDIATION).
/// Used by CLI guardrails to prevent migrating a DB with live arbitration.
pub async fn count_open_disputes(pool: &PgPool) -> Result<i64> {
    // If the schema doesn't exist yet, treat as 0 (safe) rather than failing.
    let st = status(pool).await?;
    if !st.has_escrow_table {
        return Ok(0);
    }

    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
        r#"
        select count(*)::bigint
        from payment_disputes
        where status in ('SUBMITTED','MEDIATION')
        "#,
    )
    .fetch_one(pool)
    .await
    .context("count_open_disputes failed")?;

    Ok(n)
}

/// Convenience boolean.
pub async fn has_open_disputes(pool: &PgPool) -> Result<bool> {
    Ok(count_open_disputes(pool).await? > 0)
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Escrow account row. Money columns are raw micros.
#[derive(Debug, Clone)]
pub struct EscrowRow {
    pub escrow_id: Uuid,
    pub project_id: String,
    pub total_project_value_micros: i64,
    pub retention_percentage: i32,
    pub retention_amount_micros: i64,
    pub retention_released: bool,
    pub status: String,
    pub client_id: String,
    pub contractor_id: String,
    pub processor_account: String,
    pub expected_completion_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntryRow {
    pub entry_id: Uuid,
    pub escrow_id: Uuid,
    pub recipient_id: String,
    pub amount_micros: i64,
    pub payment_type: String,
    pub external_txn_id: Option<String>,
    pub status: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChangeOrderRow {
    pub change_order_id: Uuid,
    pub escrow_id: Uuid,
    pub change_order_number: i32,
    pub amount_change_micros: i64,
    pub schedule_impact_days: i64,
    pub reason: String,
    pub approved_by: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDisputeRow {
    pub dispute_id: Uuid,
    pub escrow_id: Uuid,
    pub payment_ref: Option<Value>,
    pub dispute_amount_micros: i64,
    pub submitted_by: String,
    pub respondent_id: String,
    pub status: String,
    pub response_deadline: DateTime<Utc>,
    pub opened_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Insert a new escrow account row.
pub async fn insert_escrow(pool: &PgPool, row: &EscrowRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into escrow_accounts (
          escrow_id, project_id, total_project_value_micros, retention_percentage,
          retention_amount_micros, retention_released, status, client_id,
          contractor_id, processor_account, expected_completion_date, created_at, version
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
        )
        "#,
    )
    .bind(row.escrow_id)
    .bind(&row.project_id)
    .bind(row.total_project_value_micros)
    .bind(row.retention_percentage)
    .bind(row.retention_amount_micros)
    .bind(row.retention_released)
    .bind(&row.status)
    .bind(&row.client_id)
    .bind(&row.contractor_id)
    .bind(&row.processor_account)
    .bind(row.expected_completion_date)
    .bind(row.created_at)
    .bind(row.version)
    .execute(pool)
    .await
    .context("insert_escrow failed")?;

    Ok(())
}

/// Persist escrow mutable state with optimistic-version check; returns an
/// error if the stored version no longer matches `expected_version`.
pub async fn update_escrow_state(
    pool: &PgPool,
    escrow_id: Uuid,
    status: &str,
    total_project_value_micros: i64,
    retention_amount_micros: i64,
    retention_released: bool,
    expected_version: i64,
    new_version: i64,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        update escrow_accounts
        set status = $2,
            total_project_value_micros = $3,
            retention_amount_micros = $4,
            retention_released = $5,
            version = $7
        where escrow_id = $1 and version = $6
        "#,
    )
    .bind(escrow_id)
    .bind(status)
    .bind(total_project_value_micros)
    .bind(retention_amount_micros)
    .bind(retention_released)
    .bind(expected_version)
    .bind(new_version)
    .execute(pool)
    .await
    .context("update_escrow_state failed")?;

    if result.rows_affected() == 0 {
        return Err(anyhow!(
            "optimistic version conflict on escrow {escrow_id} (expected v{expected_version})"
        ));
    }
    Ok(())
}

/// Insert one ledger entry (append-only semantics enforced by trigger).
pub async fn insert_ledger_entry(pool: &PgPool, row: &NewLedgerEntryRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into ledger_entries (
          entry_id, escrow_id, recipient_id, amount_micros, payment_type,
          external_txn_id, status, idempotency_key, created_at
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9
        )
        "#,
    )
    .bind(row.entry_id)
    .bind(row.escrow_id)
    .bind(&row.recipient_id)
    .bind(row.amount_micros)
    .bind(&row.payment_type)
    .bind(&row.external_txn_id)
    .bind(&row.status)
    .bind(&row.idempotency_key)
    .bind(row.created_at)
    .execute(pool)
    .await
    .context("insert_ledger_entry failed")?;

    Ok(())
}

/// Insert one change-order audit row (append-only; never updated).
pub async fn insert_change_order(pool: &PgPool, row: &NewChangeOrderRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into change_orders (
          change_order_id, escrow_id, change_order_number, amount_change_micros,
          schedule_impact_days, reason, approved_by, applied_at
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8
        )
        "#,
    )
    .bind(row.change_order_id)
    .bind(row.escrow_id)
    .bind(row.change_order_number)
    .bind(row.amount_change_micros)
    .bind(row.schedule_impact_days)
    .bind(&row.reason)
    .bind(&row.approved_by)
    .bind(row.applied_at)
    .execute(pool)
    .await
    .context("insert_change_order failed")?;

    Ok(())
}

/// Insert a newly opened dispute.
pub async fn insert_dispute(pool: &PgPool, row: &NewDisputeRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into payment_disputes (
          dispute_id, escrow_id, payment_ref, dispute_amount_micros,
          submitted_by, respondent_id, status, response_deadline, opened_at
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9
        )
        "#,
    )
    .bind(row.dispute_id)
    .bind(row.escrow_id)
    .bind(&row.payment_ref)
    .bind(row.dispute_amount_micros)
    .bind(&row.submitted_by)
    .bind(&row.respondent_id)
    .bind(&row.status)
    .bind(row.response_deadline)
    .bind(row.opened_at)
    .execute(pool)
    .await
    .context("insert_dispute failed")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Load one escrow account row.
pub async fn fetch_escrow(pool: &PgPool, escrow_id: Uuid) -> Result<Option<EscrowRow>> {
    let row = sqlx::query(
        r#"
        select escrow_id, project_id, total_project_value_micros, retention_percentage,
               retention_amount_micros, retention_released, status, client_id,
               contractor_id, processor_account, expected_completion_date, created_at, version
        from escrow_accounts
        where escrow_id = $1
        "#,
    )
    .bind(escrow_id)
    .fetch_optional(pool)
    .await
    .context("fetch_escrow failed")?;

    Ok(row.map(|r| EscrowRow {
        escrow_id: r.get("escrow_id"),
        project_id: r.get("project_id"),
        total_project_value_micros: r.get("total_project_value_micros"),
        retention_percentage: r.get("retention_percentage"),
        retention_amount_micros: r.get("retention_amount_micros"),
        retention_released: r.get("retention_released"),
        status: r.get("status"),
        client_id: r.get("client_id"),
        contractor_id: r.get("contractor_id"),
        processor_account: r.get("processor_account"),
        expected_completion_date: r.get("expected_completion_date"),
        created_at: r.get("created_at"),
        version: r.get("version"),
    }))
}

/// Signed sum of COMPLETED ledger entries for one escrow — the DB-side
/// half of the reconciliation invariant.
pub async fn completed_ledger_sum(pool: &PgPool, escrow_id: Uuid) -> Result<i64> {
    let (sum,): (Option<i64>,) = sqlx::query_as::<_, (Option<i64>,)>(
        r#"
        select sum(amount_micros)::bigint
        from ledger_entries
        where escrow_id = $1 and status = 'COMPLETED'
        "#,
    )
    .bind(escrow_id)
    .fetch_one(pool)
    .await
    .context("completed_ledger_sum failed")?;

    Ok(sum.unwrap_or(0))
}
