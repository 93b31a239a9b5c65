//! Escrow engine — the single choke-point for every financial mutation.
//!
//! # Concurrency model
//!
//! One cell per escrow, each behind its own `Mutex`; the outer map sits
//! behind an `RwLock` used only for insert/lookup. Every balance-affecting
//! operation locks exactly one cell and performs its validate → external
//! call → write sequence under that lock, so concurrent releases against
//! one escrow are serialized while cross-escrow operations proceed fully in
//! parallel.
//!
//! # Atomicity
//!
//! The external processor call is the first, cancellable step: local writes
//! (ledger entry, status, unit transition) begin only after the processor
//! returned success. A processor failure therefore leaves no orphaned
//! state. Notification delivery happens after the financial outcome is
//! decided and can never affect it.
//!
//! # Dispute freezing
//!
//! A logical filter, not a lock: frozen amounts are subtracted from the
//! available balance used to validate new releases, while deposits and
//! unrelated payments keep flowing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use pmk_cashflow::{CashFlowProjection, EscrowPosition};
use pmk_changeorder::{
    plan_change_order, rescale_amount, shift_schedule, validate_audit_fields, ChangeOrder,
};
use pmk_dispute::{PaymentDispute, PaymentRef};
use pmk_ledger::{Ledger, LedgerEntry};
use pmk_payments::{
    milestone_amount, ConditionalPaymentUnit, Deliverable, UnitEvent, UnitKind, UnitState,
};
use pmk_schemas::{DisputeId, EscrowId, Money, PaymentType, TransactionId, UnitId};

use crate::account::{EscrowAccount, EscrowStatus};
use crate::error::EscrowError;
use crate::processor::{NotificationSink, PaymentProcessor};

// ---------------------------------------------------------------------------
// EscrowSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time read view of one escrow, assembled under its cell lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowSnapshot {
    pub id: EscrowId,
    pub project_id: String,
    pub total_project_value: Money,
    pub total_deposited: Money,
    pub total_paid: Money,
    pub escrow_balance: Money,
    /// Balance minus dispute-frozen amounts, floored at zero.
    pub available_balance: Money,
    pub frozen_total: Money,
    pub retention_percentage: u32,
    pub retention_amount: Money,
    pub retention_released: bool,
    pub status: EscrowStatus,
    pub client_id: String,
    pub contractor_id: String,
    pub unit_count: usize,
    pub open_dispute_count: usize,
    pub change_order_count: usize,
    pub expected_completion_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// EscrowCell
// ---------------------------------------------------------------------------

/// Everything owned by one escrow, guarded by one mutex.
struct EscrowCell {
    account: EscrowAccount,
    ledger: Ledger,
    units: BTreeMap<UnitId, ConditionalPaymentUnit>,
    change_orders: Vec<ChangeOrder>,
    disputes: BTreeMap<DisputeId, PaymentDispute>,
    /// Dispute-frozen amounts, keyed by the holding dispute.
    frozen: BTreeMap<DisputeId, Money>,
}

impl EscrowCell {
    fn balance(&self) -> Money {
        self.ledger.balance()
    }

    fn frozen_total(&self) -> Money {
        self.frozen.values().copied().sum()
    }

    /// Balance available for new releases: frozen amounts excluded,
    /// floored at zero.
    fn available_balance(&self) -> Money {
        let available = self.balance() - self.frozen_total();
        if available.is_negative() {
            Money::ZERO
        } else {
            available
        }
    }

    /// Contract value already committed to units (any state — paid units
    /// consumed their allocation) plus retention.
    fn allocated_total(&self) -> Money {
        let units: Money = self.units.values().map(|u| u.amount).sum();
        units.saturating_add(self.account.retention_amount)
    }

    /// Contract value still open for new milestones.
    fn unallocated_value(&self) -> Money {
        let free = self.account.total_project_value - self.allocated_total();
        if free.is_negative() {
            Money::ZERO
        } else {
            free
        }
    }

    fn open_dispute_count(&self) -> usize {
        self.disputes
            .values()
            .filter(|d| d.status.freezes_funds())
            .count()
    }

    fn snapshot(&self) -> EscrowSnapshot {
        EscrowSnapshot {
            id: self.account.id,
            project_id: self.account.project_id.clone(),
            total_project_value: self.account.total_project_value,
            total_deposited: self.ledger.total_deposited(),
            total_paid: self.ledger.total_paid(),
            escrow_balance: self.balance(),
            available_balance: self.available_balance(),
            frozen_total: self.frozen_total(),
            retention_percentage: self.account.retention_percentage,
            retention_amount: self.account.retention_amount,
            retention_released: self.account.retention_released,
            status: self.account.status,
            client_id: self.account.client_id.clone(),
            contractor_id: self.account.contractor_id.clone(),
            unit_count: self.units.len(),
            open_dispute_count: self.open_dispute_count(),
            change_order_count: self.change_orders.len(),
            expected_completion_date: self.account.expected_completion_date,
            created_at: self.account.created_at,
            version: self.account.version,
        }
    }

    fn position(&self, now: DateTime<Utc>) -> EscrowPosition {
        let pending: Vec<&ConditionalPaymentUnit> = self
            .units
            .values()
            .filter(|u| matches!(u.state, UnitState::Verified | UnitState::Approved))
            .collect();
        let overdue = self
            .units
            .values()
            .filter(|u| !u.state.is_terminal())
            .filter(|u| u.expected_completion_date.map_or(false, |d| d < now))
            .count();

        EscrowPosition {
            escrow_id: self.account.id,
            total_project_value: self.account.total_project_value,
            total_deposited: self.ledger.total_deposited(),
            total_paid: self.ledger.total_paid(),
            retention_amount: self.account.retention_amount,
            retention_released: self.account.retention_released,
            pending_release_total: pending.iter().map(|u| u.amount).sum(),
            pending_unit_count: pending.len(),
            frozen_total: self.frozen_total(),
            open_dispute_count: self.open_dispute_count(),
            overdue_unit_count: overdue,
        }
    }
}

// ---------------------------------------------------------------------------
// EscrowEngine
// ---------------------------------------------------------------------------

/// Shared, thread-safe escrow engine.
///
/// Cheap to share via `Arc`; all operations take `&self`.
pub struct EscrowEngine {
    cells: RwLock<BTreeMap<EscrowId, Arc<Mutex<EscrowCell>>>>,
    unit_index: RwLock<BTreeMap<UnitId, EscrowId>>,
    dispute_index: RwLock<BTreeMap<DisputeId, EscrowId>>,
    processor: Arc<dyn PaymentProcessor>,
    sink: Arc<dyn NotificationSink>,
}

impl EscrowEngine {
    pub fn new(processor: Arc<dyn PaymentProcessor>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            cells: RwLock::new(BTreeMap::new()),
            unit_index: RwLock::new(BTreeMap::new()),
            dispute_index: RwLock::new(BTreeMap::new()),
            processor,
            sink,
        }
    }

    // -----------------------------------------------------------------------
    // Escrow account lifecycle
    // -----------------------------------------------------------------------

    /// Create an escrow for one project.
    ///
    /// Opens the external processor account first; if that call fails the
    /// escrow is not created (no partial state).
    pub fn create_escrow(
        &self,
        project_id: &str,
        total_project_value: Money,
        retention_percentage: u32,
        client_id: &str,
        contractor_id: &str,
    ) -> Result<EscrowSnapshot, EscrowError> {
        if retention_percentage > 100 {
            return Err(EscrowError::InvalidRetention {
                percentage: retention_percentage,
            });
        }
        if !total_project_value.is_positive() {
            return Err(EscrowError::InvalidAmount {
                amount: total_project_value,
            });
        }
        require_party(project_id, "project")?;
        require_party(client_id, "client")?;
        require_party(contractor_id, "contractor")?;

        let retention_amount = total_project_value
            .percent_of(retention_percentage)
            .ok_or(EscrowError::InvalidAmount {
                amount: total_project_value,
            })?;

        // External account first — a processor refusal must leave nothing
        // behind.
        let handle = self
            .processor
            .open_account(project_id, client_id, contractor_id)?;

        let now = Utc::now();
        let account = EscrowAccount {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            total_project_value,
            retention_percentage,
            retention_amount,
            retention_released: false,
            status: EscrowStatus::Created,
            client_id: client_id.to_string(),
            contractor_id: contractor_id.to_string(),
            processor_account: handle,
            expected_completion_date: None,
            created_at: now,
            version: 0,
        };
        let escrow_id = account.id;
        let cell = EscrowCell {
            ledger: Ledger::new(escrow_id),
            account,
            units: BTreeMap::new(),
            change_orders: Vec::new(),
            disputes: BTreeMap::new(),
            frozen: BTreeMap::new(),
        };
        let snapshot = cell.snapshot();

        self.cells
            .write()
            .expect("escrow map lock poisoned")
            .insert(escrow_id, Arc::new(Mutex::new(cell)));

        self.emit(
            client_id,
            "escrow_created",
            json!({ "escrow_id": escrow_id, "total_project_value": total_project_value }),
        );
        Ok(snapshot)
    }

    /// Deposit client funds.
    ///
    /// All-or-nothing: on processor failure no ledger entry is written and
    /// balances are unchanged.
    pub fn fund_escrow(
        &self,
        escrow_id: EscrowId,
        amount: Money,
        method: &str,
        idempotency_key: Option<String>,
    ) -> Result<EscrowSnapshot, EscrowError> {
        if !amount.is_positive() {
            return Err(EscrowError::InvalidAmount { amount });
        }
        let cell = self.cell(escrow_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");

        if cell.account.status == EscrowStatus::Closed {
            return Err(EscrowError::InvalidStateTransition {
                detail: "cannot fund a closed escrow".into(),
            });
        }
        let key = idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string());
        if cell.ledger.has_consumed_key(&key) {
            return Err(EscrowError::DuplicateDeposit { key });
        }

        let txn = self
            .processor
            .deposit(&cell.account.processor_account, amount, method, &key)?;

        let now = Utc::now();
        let depositor = cell.account.client_id.clone();
        cell.ledger
            .append_deposit(&depositor, amount, txn, Some(key), now)?;
        let balance = cell.balance();
        cell.account.recompute_funding_status(balance);
        cell.account.version += 1;

        let snapshot = cell.snapshot();
        drop(cell);

        self.emit(
            &snapshot.client_id,
            "escrow_funded",
            json!({
                "escrow_id": escrow_id,
                "amount": amount,
                "escrow_balance": snapshot.escrow_balance,
                "status": snapshot.status.as_str(),
            }),
        );
        Ok(snapshot)
    }

    /// Release funds from the escrow to a recipient.
    ///
    /// Validates against the available balance (dispute-frozen amounts
    /// excluded), calls the processor, then writes the ledger entry — all
    /// under the cell lock, all-or-nothing.
    pub fn release_funds(
        &self,
        escrow_id: EscrowId,
        recipient_id: &str,
        amount: Money,
        payment_type: PaymentType,
        idempotency_key: Option<String>,
    ) -> Result<TransactionId, EscrowError> {
        let cell = self.cell(escrow_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");
        let txn = self.release_locked(
            &mut cell,
            recipient_id,
            amount,
            payment_type,
            idempotency_key,
        )?;
        let contractor = cell.account.contractor_id.clone();
        drop(cell);

        self.emit(
            &contractor,
            "payment_released",
            json!({
                "escrow_id": escrow_id,
                "recipient_id": recipient_id,
                "amount": amount,
                "payment_type": payment_type.as_str(),
                "txn": txn,
            }),
        );
        Ok(txn)
    }

    /// Mark the project COMPLETED. The trigger is owned by the external
    /// workflow orchestrator.
    pub fn mark_completed(&self, escrow_id: EscrowId) -> Result<EscrowSnapshot, EscrowError> {
        let cell = self.cell(escrow_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");

        match cell.account.status {
            EscrowStatus::Active | EscrowStatus::Funded => {
                cell.account.status = EscrowStatus::Completed;
                cell.account.version += 1;
            }
            status => {
                return Err(EscrowError::InvalidStateTransition {
                    detail: format!("cannot complete an escrow in status {}", status.as_str()),
                })
            }
        }
        let snapshot = cell.snapshot();
        drop(cell);

        self.emit(
            &snapshot.contractor_id,
            "escrow_completed",
            json!({ "escrow_id": escrow_id }),
        );
        Ok(snapshot)
    }

    /// Release the withheld retention to the contractor. Only legal once
    /// the project is COMPLETED.
    pub fn release_retention(&self, escrow_id: EscrowId) -> Result<TransactionId, EscrowError> {
        let cell = self.cell(escrow_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");

        if cell.account.status != EscrowStatus::Completed {
            return Err(EscrowError::RetentionNotReleasable {
                detail: format!(
                    "escrow status is {}, requires COMPLETED",
                    cell.account.status.as_str()
                ),
            });
        }
        if cell.account.retention_released {
            return Err(EscrowError::RetentionNotReleasable {
                detail: "retention was already released".into(),
            });
        }
        let amount = cell.account.retention_amount;
        if !amount.is_positive() {
            return Err(EscrowError::RetentionNotReleasable {
                detail: "no retention was withheld".into(),
            });
        }

        let contractor = cell.account.contractor_id.clone();
        let key = format!("ret:{escrow_id}");
        let txn = self.release_locked(
            &mut cell,
            &contractor,
            amount,
            PaymentType::RetentionRelease,
            Some(key),
        )?;
        cell.account.retention_released = true;
        drop(cell);

        self.emit(
            &contractor,
            "retention_released",
            json!({ "escrow_id": escrow_id, "amount": amount, "txn": txn }),
        );
        Ok(txn)
    }

    /// Close the escrow. Only legal when COMPLETED and retention has been
    /// released (or none was withheld). Escrows are never deleted.
    pub fn close_escrow(&self, escrow_id: EscrowId) -> Result<EscrowSnapshot, EscrowError> {
        let cell = self.cell(escrow_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");

        let retention_done =
            cell.account.retention_released || !cell.account.retention_amount.is_positive();
        if cell.account.status != EscrowStatus::Completed || !retention_done {
            return Err(EscrowError::NotClosable {
                status: cell.account.status.as_str(),
                retention_released: cell.account.retention_released,
            });
        }
        cell.account.status = EscrowStatus::Closed;
        cell.account.version += 1;
        let snapshot = cell.snapshot();
        drop(cell);

        self.emit(
            &snapshot.client_id,
            "escrow_closed",
            json!({ "escrow_id": escrow_id }),
        );
        Ok(snapshot)
    }

    // -----------------------------------------------------------------------
    // Conditional payment units
    // -----------------------------------------------------------------------

    /// Create a task payment against the escrow.
    #[allow(clippy::too_many_arguments)]
    pub fn create_task_payment(
        &self,
        escrow_id: EscrowId,
        task_id: &str,
        amount: Money,
        completion_requirements: Vec<String>,
        verification_criteria: Vec<String>,
        approval_required: bool,
        photos_required: bool,
    ) -> Result<ConditionalPaymentUnit, EscrowError> {
        if !amount.is_positive() {
            return Err(EscrowError::InvalidAmount { amount });
        }
        require_party(task_id, "task")?;

        let cell = self.cell(escrow_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");
        let unit = ConditionalPaymentUnit::new_task(
            escrow_id,
            cell.account.contractor_id.clone(),
            amount,
            task_id,
            completion_requirements,
            verification_criteria,
            approval_required,
            photos_required,
            Utc::now(),
        );
        self.insert_unit(&mut cell, unit)
    }

    /// Create a payment milestone. The amount is derived from the
    /// percentage of the current contract value and must fit within the
    /// contract value not yet allocated to other units or retention.
    pub fn create_milestone(
        &self,
        escrow_id: EscrowId,
        name: &str,
        percentage: u32,
        deliverables: Vec<Deliverable>,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<ConditionalPaymentUnit, EscrowError> {
        if percentage == 0 || percentage > 100 {
            return Err(EscrowError::InvalidPercentage { percentage });
        }
        require_party(name, "milestone name")?;

        let cell = self.cell(escrow_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");

        let amount = milestone_amount(cell.account.total_project_value, percentage).ok_or(
            EscrowError::InvalidAmount {
                amount: cell.account.total_project_value,
            },
        )?;
        let unallocated = cell.unallocated_value();
        if amount > unallocated {
            return Err(EscrowError::MilestoneOverallocated {
                requested: amount,
                unallocated,
            });
        }

        let unit = ConditionalPaymentUnit::new_milestone(
            escrow_id,
            cell.account.contractor_id.clone(),
            amount,
            name,
            percentage,
            deliverables,
            due_date,
            Utc::now(),
        );
        self.insert_unit(&mut cell, unit)
    }

    /// Record verified completion for a unit.
    ///
    /// When the unit does not require approval the payment cascades
    /// immediately; an [`EscrowError::InsufficientEscrowBalance`] (or
    /// processor failure) leaves the unit VERIFIED so the caller can fund
    /// the escrow and retry.
    pub fn verify_completion(
        &self,
        unit_id: UnitId,
        quality_score: u8,
        photos: Vec<String>,
        notes: Option<String>,
    ) -> Result<ConditionalPaymentUnit, EscrowError> {
        let (escrow_id, cell) = self.cell_for_unit(unit_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");

        let unit = cell
            .units
            .get_mut(&unit_id)
            .ok_or(EscrowError::UnitNotFound { unit_id })?;
        unit.apply(&UnitEvent::Verify {
            quality_score,
            photos,
            notes,
        })?;
        let cascade = !unit.approval_required();
        cell.account.version += 1;

        if cascade {
            self.settle_unit_locked(&mut cell, unit_id)?;
        }
        let unit = cell
            .units
            .get(&unit_id)
            .cloned()
            .ok_or(EscrowError::UnitNotFound { unit_id })?;
        let contractor = cell.account.contractor_id.clone();
        drop(cell);

        self.emit(
            &contractor,
            "unit_verified",
            json!({
                "escrow_id": escrow_id,
                "unit_id": unit_id,
                "quality_score": quality_score,
                "state": unit.state.as_str(),
            }),
        );
        Ok(unit)
    }

    /// Approve a verified unit for payment; the payment cascades
    /// immediately. Only valid on units that require approval.
    pub fn approve(
        &self,
        unit_id: UnitId,
        approved_by: &str,
    ) -> Result<ConditionalPaymentUnit, EscrowError> {
        require_party(approved_by, "approver")?;
        let (escrow_id, cell) = self.cell_for_unit(unit_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");

        let unit = cell
            .units
            .get_mut(&unit_id)
            .ok_or(EscrowError::UnitNotFound { unit_id })?;
        unit.apply(&UnitEvent::Approve {
            approved_by: approved_by.to_string(),
        })?;
        cell.account.version += 1;

        self.settle_unit_locked(&mut cell, unit_id)?;
        let unit = cell
            .units
            .get(&unit_id)
            .cloned()
            .ok_or(EscrowError::UnitNotFound { unit_id })?;
        let contractor = cell.account.contractor_id.clone();
        drop(cell);

        self.emit(
            &contractor,
            "unit_approved",
            json!({
                "escrow_id": escrow_id,
                "unit_id": unit_id,
                "approved_by": approved_by,
                "state": unit.state.as_str(),
            }),
        );
        Ok(unit)
    }

    /// Retry the funds release for a unit that has cleared verification
    /// (and approval, where required) but could not be paid yet.
    ///
    /// Re-invoking for an already-PAID unit returns
    /// [`EscrowError::AlreadyPaid`] without a new ledger entry.
    pub fn release_unit_payment(&self, unit_id: UnitId) -> Result<TransactionId, EscrowError> {
        let (escrow_id, cell) = self.cell_for_unit(unit_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");
        let txn = self.settle_unit_locked(&mut cell, unit_id)?;
        let contractor = cell.account.contractor_id.clone();
        drop(cell);

        self.emit(
            &contractor,
            "payment_released",
            json!({ "escrow_id": escrow_id, "unit_id": unit_id, "txn": txn }),
        );
        Ok(txn)
    }

    // -----------------------------------------------------------------------
    // Change orders
    // -----------------------------------------------------------------------

    /// Apply a contract amendment atomically: new totals, proportional
    /// rescale of every non-terminal unit, schedule shift, and an
    /// append-only audit record.
    pub fn apply_change_order(
        &self,
        escrow_id: EscrowId,
        amount_change: Money,
        schedule_impact_days: i64,
        reason: &str,
        approved_by: &str,
    ) -> Result<ChangeOrder, EscrowError> {
        validate_audit_fields(reason, approved_by)?;

        let cell = self.cell(escrow_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");

        if matches!(
            cell.account.status,
            EscrowStatus::Completed | EscrowStatus::Closed
        ) {
            return Err(EscrowError::InvalidStateTransition {
                detail: format!(
                    "cannot amend an escrow in status {}",
                    cell.account.status.as_str()
                ),
            });
        }

        let plan = plan_change_order(
            cell.account.total_project_value,
            cell.account.retention_percentage,
            amount_change,
        )?;

        // Rescale every non-terminal unit against the plan before touching
        // the account, so a failed rescale applies nothing.
        let mut rescaled: Vec<(UnitId, Money)> = Vec::new();
        for (id, unit) in &cell.units {
            if unit.state.is_terminal() {
                continue;
            }
            rescaled.push((*id, rescale_amount(unit.amount, &plan)?));
        }

        let now = Utc::now();
        for (id, amount) in rescaled {
            if let Some(unit) = cell.units.get_mut(&id) {
                unit.amount = amount;
                if let Some(due) = unit.expected_completion_date {
                    unit.expected_completion_date = Some(shift_schedule(due, schedule_impact_days));
                }
            }
        }
        cell.account.total_project_value = plan.new_total;
        cell.account.retention_amount = plan.new_retention_amount;
        if let Some(due) = cell.account.expected_completion_date {
            cell.account.expected_completion_date =
                Some(shift_schedule(due, schedule_impact_days));
        }

        let order = ChangeOrder {
            id: Uuid::new_v4(),
            escrow_id,
            change_order_number: cell.change_orders.len() as u32 + 1,
            amount_change,
            schedule_impact_days,
            reason: reason.to_string(),
            approved_by: approved_by.to_string(),
            applied_at: now,
        };
        cell.change_orders.push(order.clone());
        cell.account.version += 1;

        let (client, contractor) = (
            cell.account.client_id.clone(),
            cell.account.contractor_id.clone(),
        );
        drop(cell);

        let payload = json!({
            "escrow_id": escrow_id,
            "change_order_number": order.change_order_number,
            "amount_change": amount_change,
            "new_total_project_value": plan.new_total,
        });
        self.emit(&client, "change_order_applied", payload.clone());
        self.emit(&contractor, "change_order_applied", payload);
        Ok(order)
    }

    // -----------------------------------------------------------------------
    // Disputes
    // -----------------------------------------------------------------------

    /// Open a dispute, freezing the contested amount out of the available
    /// balance until resolution.
    pub fn open_dispute(
        &self,
        escrow_id: EscrowId,
        payment_ref: Option<PaymentRef>,
        dispute_amount: Money,
        submitted_by: &str,
        respondent_id: &str,
    ) -> Result<PaymentDispute, EscrowError> {
        let cell = self.cell(escrow_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");

        // Validate the reference against this escrow before any effect.
        match payment_ref {
            Some(PaymentRef::Unit { unit_id }) => {
                if !cell.units.contains_key(&unit_id) {
                    return Err(EscrowError::UnitNotFound { unit_id });
                }
            }
            Some(PaymentRef::LedgerEntry { entry_id }) => {
                if !cell.ledger.entries().iter().any(|e| e.id == entry_id) {
                    return Err(EscrowError::EntryNotFound { entry_id });
                }
            }
            None => {}
        }

        let dispute = PaymentDispute::open(
            escrow_id,
            payment_ref,
            dispute_amount,
            submitted_by,
            respondent_id,
            Utc::now(),
        )?;

        // Freeze the contested amount; a non-terminal referenced unit is
        // frozen in place as well.
        cell.frozen.insert(dispute.id, dispute_amount);
        if let Some(PaymentRef::Unit { unit_id }) = payment_ref {
            if let Some(unit) = cell.units.get_mut(&unit_id) {
                if matches!(unit.state, UnitState::Verified | UnitState::Approved) {
                    unit.apply(&UnitEvent::Freeze {
                        dispute_id: dispute.id,
                    })?;
                }
            }
        }
        cell.disputes.insert(dispute.id, dispute.clone());
        cell.account.version += 1;
        self.dispute_index
            .write()
            .expect("dispute index lock poisoned")
            .insert(dispute.id, escrow_id);
        drop(cell);

        let payload = json!({
            "escrow_id": escrow_id,
            "dispute_id": dispute.id,
            "dispute_amount": dispute_amount,
            "response_deadline": dispute.response_deadline,
        });
        self.emit(respondent_id, "dispute_opened", payload.clone());
        self.emit(submitted_by, "dispute_opened", payload);
        Ok(dispute)
    }

    /// Move a dispute into mediation; a mediator is assigned and a session
    /// scheduled. Both parties are notified.
    pub fn request_mediation(&self, dispute_id: DisputeId) -> Result<PaymentDispute, EscrowError> {
        let (escrow_id, cell) = self.cell_for_dispute(dispute_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");

        // Mediator assignment is deterministic off the dispute id; the
        // mediation pool lives outside this engine.
        let mediator = format!("mediator-{}", &dispute_id.simple().to_string()[..8]);
        let dispute = cell
            .disputes
            .get_mut(&dispute_id)
            .ok_or(EscrowError::DisputeNotFound { dispute_id })?;
        dispute.request_mediation(mediator, Utc::now())?;
        let dispute = dispute.clone();
        cell.account.version += 1;
        drop(cell);

        let payload = json!({
            "escrow_id": escrow_id,
            "dispute_id": dispute_id,
            "mediator": dispute.mediator,
            "mediation_date": dispute.mediation_date,
        });
        self.emit(&dispute.submitted_by, "mediation_scheduled", payload.clone());
        self.emit(&dispute.respondent_id, "mediation_scheduled", payload);
        Ok(dispute)
    }

    /// Resolve a dispute: unfreeze the contested funds and, when the
    /// resolution awards an amount, pay the compensating REFUND to the
    /// submitting party.
    ///
    /// A failed compensating payment leaves the dispute RESOLVED with a
    /// pending-settlement flag for operator follow-up — resolution is a
    /// judgment call distinct from payment execution.
    pub fn resolve_dispute(
        &self,
        dispute_id: DisputeId,
        resolution: &str,
        resolution_amount: Money,
        resolved_by: &str,
    ) -> Result<PaymentDispute, EscrowError> {
        require_party(resolved_by, "resolver")?;
        let (escrow_id, cell) = self.cell_for_dispute(dispute_id)?;
        let mut cell = cell.lock().expect("escrow cell mutex poisoned");

        let dispute = cell
            .disputes
            .get_mut(&dispute_id)
            .ok_or(EscrowError::DisputeNotFound { dispute_id })?;
        dispute.resolve(resolution, resolution_amount, resolved_by, Utc::now())?;
        let payment_ref = dispute.payment_ref;
        let submitted_by = dispute.submitted_by.clone();
        let respondent_id = dispute.respondent_id.clone();

        // Unfreeze before settling so the award can draw on the funds it
        // contests.
        cell.frozen.remove(&dispute_id);
        if let Some(PaymentRef::Unit { unit_id }) = payment_ref {
            if let Some(unit) = cell.units.get_mut(&unit_id) {
                if matches!(unit.state, UnitState::Frozen { .. }) {
                    unit.apply(&UnitEvent::Unfreeze { dispute_id })?;
                }
            }
        }

        if resolution_amount.is_positive() {
            let key = format!("dispute:{escrow_id}:{dispute_id}");
            let outcome = self.release_locked(
                &mut cell,
                &submitted_by,
                resolution_amount,
                PaymentType::Refund,
                Some(key),
            );
            let dispute = cell
                .disputes
                .get_mut(&dispute_id)
                .ok_or(EscrowError::DisputeNotFound { dispute_id })?;
            match outcome {
                Ok(txn) => dispute.mark_settled(txn)?,
                Err(err) => {
                    tracing::warn!(
                        %dispute_id,
                        error = %err,
                        "compensating payment failed; settlement pending"
                    );
                    dispute.mark_settlement_pending(err.to_string())?;
                }
            }
        }

        cell.account.version += 1;
        let dispute = cell
            .disputes
            .get(&dispute_id)
            .cloned()
            .ok_or(EscrowError::DisputeNotFound { dispute_id })?;
        drop(cell);

        let payload = json!({
            "escrow_id": escrow_id,
            "dispute_id": dispute_id,
            "resolution": resolution,
            "resolution_amount": resolution_amount,
        });
        self.emit(&submitted_by, "dispute_resolved", payload.clone());
        self.emit(&respondent_id, "dispute_resolved", payload);
        Ok(dispute)
    }

    // -----------------------------------------------------------------------
    // Read surface
    // -----------------------------------------------------------------------

    pub fn get_escrow(&self, escrow_id: EscrowId) -> Result<EscrowSnapshot, EscrowError> {
        let cell = self.cell(escrow_id)?;
        let cell = cell.lock().expect("escrow cell mutex poisoned");
        Ok(cell.snapshot())
    }

    pub fn get_unit(&self, unit_id: UnitId) -> Result<ConditionalPaymentUnit, EscrowError> {
        let (_, cell) = self.cell_for_unit(unit_id)?;
        let cell = cell.lock().expect("escrow cell mutex poisoned");
        cell.units
            .get(&unit_id)
            .cloned()
            .ok_or(EscrowError::UnitNotFound { unit_id })
    }

    pub fn get_dispute(&self, dispute_id: DisputeId) -> Result<PaymentDispute, EscrowError> {
        let (_, cell) = self.cell_for_dispute(dispute_id)?;
        let cell = cell.lock().expect("escrow cell mutex poisoned");
        cell.disputes
            .get(&dispute_id)
            .cloned()
            .ok_or(EscrowError::DisputeNotFound { dispute_id })
    }

    pub fn ledger_entries(&self, escrow_id: EscrowId) -> Result<Vec<LedgerEntry>, EscrowError> {
        let cell = self.cell(escrow_id)?;
        let cell = cell.lock().expect("escrow cell mutex poisoned");
        Ok(cell.ledger.entries().to_vec())
    }

    pub fn change_orders(&self, escrow_id: EscrowId) -> Result<Vec<ChangeOrder>, EscrowError> {
        let cell = self.cell(escrow_id)?;
        let cell = cell.lock().expect("escrow cell mutex poisoned");
        Ok(cell.change_orders.clone())
    }

    pub fn units(&self, escrow_id: EscrowId) -> Result<Vec<ConditionalPaymentUnit>, EscrowError> {
        let cell = self.cell(escrow_id)?;
        let cell = cell.lock().expect("escrow cell mutex poisoned");
        Ok(cell.units.values().cloned().collect())
    }

    /// Cash-flow positions for every escrow where `party_id` is the client
    /// or the contractor.
    pub fn positions_for_party(&self, party_id: &str, now: DateTime<Utc>) -> Vec<EscrowPosition> {
        let cells: Vec<Arc<Mutex<EscrowCell>>> = self
            .cells
            .read()
            .expect("escrow map lock poisoned")
            .values()
            .cloned()
            .collect();

        cells
            .iter()
            .filter_map(|cell| {
                let cell = cell.lock().expect("escrow cell mutex poisoned");
                let involved = cell.account.client_id == party_id
                    || cell.account.contractor_id == party_id;
                involved.then(|| cell.position(now))
            })
            .collect()
    }

    /// Forward-looking cash-flow dashboard for one party. Read-only.
    pub fn cash_flow_dashboard(&self, party_id: &str) -> CashFlowProjection {
        pmk_cashflow::project(&self.positions_for_party(party_id, Utc::now()))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn cell(&self, escrow_id: EscrowId) -> Result<Arc<Mutex<EscrowCell>>, EscrowError> {
        self.cells
            .read()
            .expect("escrow map lock poisoned")
            .get(&escrow_id)
            .cloned()
            .ok_or(EscrowError::EscrowNotFound { escrow_id })
    }

    fn cell_for_unit(
        &self,
        unit_id: UnitId,
    ) -> Result<(EscrowId, Arc<Mutex<EscrowCell>>), EscrowError> {
        let escrow_id = *self
            .unit_index
            .read()
            .expect("unit index lock poisoned")
            .get(&unit_id)
            .ok_or(EscrowError::UnitNotFound { unit_id })?;
        Ok((escrow_id, self.cell(escrow_id)?))
    }

    fn cell_for_dispute(
        &self,
        dispute_id: DisputeId,
    ) -> Result<(EscrowId, Arc<Mutex<EscrowCell>>), EscrowError> {
        let escrow_id = *self
            .dispute_index
            .read()
            .expect("dispute index lock poisoned")
            .get(&dispute_id)
            .ok_or(EscrowError::DisputeNotFound { dispute_id })?;
        Ok((escrow_id, self.cell(escrow_id)?))
    }

    fn insert_unit(
        &self,
        cell: &mut EscrowCell,
        unit: ConditionalPaymentUnit,
    ) -> Result<ConditionalPaymentUnit, EscrowError> {
        let unit_id = unit.id;
        let escrow_id = unit.escrow_id;
        cell.units.insert(unit_id, unit.clone());
        cell.account.version += 1;
        self.unit_index
            .write()
            .expect("unit index lock poisoned")
            .insert(unit_id, escrow_id);
        Ok(unit)
    }

    /// Validate, withdraw, append — the shared release path. Caller holds
    /// the cell lock.
    fn release_locked(
        &self,
        cell: &mut EscrowCell,
        recipient_id: &str,
        amount: Money,
        payment_type: PaymentType,
        idempotency_key: Option<String>,
    ) -> Result<TransactionId, EscrowError> {
        if !amount.is_positive() {
            return Err(EscrowError::InvalidAmount { amount });
        }
        require_party(recipient_id, "recipient")?;
        if !payment_type.is_release() {
            return Err(EscrowError::InvalidStateTransition {
                detail: "a deposit is not a release".into(),
            });
        }
        if cell.account.status == EscrowStatus::Closed {
            return Err(EscrowError::InvalidStateTransition {
                detail: "cannot release from a closed escrow".into(),
            });
        }
        if let Some(key) = &idempotency_key {
            if cell.ledger.has_consumed_key(key) {
                return Err(EscrowError::AlreadyPaid);
            }
        }
        let available = cell.available_balance();
        if amount > available {
            return Err(EscrowError::InsufficientEscrowBalance {
                requested: amount,
                available,
            });
        }

        let key = idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string());
        let txn =
            self.processor
                .withdraw(&cell.account.processor_account, recipient_id, amount, &key)?;
        cell.ledger.append_release(
            recipient_id,
            amount,
            payment_type,
            txn.clone(),
            Some(key),
            Utc::now(),
        )?;
        cell.account.version += 1;
        Ok(txn)
    }

    /// Pay out one payable unit: balance gate, processor withdrawal, ledger
    /// entry, and the PAID transition, all under the caller-held cell lock.
    fn settle_unit_locked(
        &self,
        cell: &mut EscrowCell,
        unit_id: UnitId,
    ) -> Result<TransactionId, EscrowError> {
        let (amount, contractor, payment_type, key) = {
            let unit = cell
                .units
                .get(&unit_id)
                .ok_or(EscrowError::UnitNotFound { unit_id })?;
            if unit.state == UnitState::Paid {
                return Err(EscrowError::AlreadyPaid);
            }
            if !unit.is_payable() {
                return Err(EscrowError::InvalidStateTransition {
                    detail: format!(
                        "unit {unit_id} is {} and not payable",
                        unit.state.as_str()
                    ),
                });
            }
            let payment_type = match unit.kind {
                UnitKind::Task { .. } => PaymentType::TaskCompletion,
                UnitKind::Milestone { .. } => PaymentType::Milestone,
            };
            (
                unit.amount,
                unit.contractor_id.clone(),
                payment_type,
                format!("unit:{}:{unit_id}", cell.account.id),
            )
        };
        if cell.ledger.has_consumed_key(&key) {
            return Err(EscrowError::AlreadyPaid);
        }

        let txn = self.release_locked(cell, &contractor, amount, payment_type, Some(key))?;
        let now = Utc::now();
        let unit = cell
            .units
            .get_mut(&unit_id)
            .ok_or(EscrowError::UnitNotFound { unit_id })?;
        unit.apply(&UnitEvent::MarkPaid {
            txn: txn.clone(),
            at: now,
        })?;
        Ok(txn)
    }

    fn emit(&self, recipient_id: &str, event_type: &str, payload: serde_json::Value) {
        if let Err(err) = self.sink.notify(recipient_id, event_type, &payload) {
            tracing::warn!(event_type, error = %err, "notification sink failure ignored");
        }
    }
}

fn require_party(value: &str, field: &'static str) -> Result<(), EscrowError> {
    if value.trim().is_empty() {
        return Err(EscrowError::MissingParty { field });
    }
    Ok(())
}
