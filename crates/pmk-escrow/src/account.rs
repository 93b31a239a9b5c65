use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pmk_schemas::{AccountHandle, EscrowId, Money};

/// Lifecycle of one escrow account.
///
/// `Created → Active` on the first deposit, `Active → Funded` once the
/// balance covers the total project value, `Funded → Completed` when the
/// external orchestrator marks the project done, `Completed → Closed` after
/// retention release. Releases never demote the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    Created,
    Active,
    Funded,
    Completed,
    Closed,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Active => "ACTIVE",
            Self::Funded => "FUNDED",
            Self::Completed => "COMPLETED",
            Self::Closed => "CLOSED",
        }
    }
}

/// One project's held funds.
///
/// Fund totals live on the owning ledger; this struct carries the contract
/// terms, status, and the external processor handle. The invariant
/// `balance == total_deposited - total_paid` is therefore structural — the
/// ledger is the single source for both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowAccount {
    pub id: EscrowId,
    pub project_id: String,
    pub total_project_value: Money,
    pub retention_percentage: u32,
    /// Derived: `total_project_value * retention_percentage / 100`.
    /// Recomputed by change orders.
    pub retention_amount: Money,
    pub retention_released: bool,
    pub status: EscrowStatus,
    pub client_id: String,
    pub contractor_id: String,
    pub processor_account: AccountHandle,
    pub expected_completion_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Optimistic-concurrency counter, bumped on every committed mutation.
    pub version: u64,
}

impl EscrowAccount {
    /// Recompute status after a deposit: first funds activate the escrow,
    /// full coverage marks it FUNDED.
    pub fn recompute_funding_status(&mut self, balance: Money) {
        match self.status {
            EscrowStatus::Created | EscrowStatus::Active => {
                self.status = if balance >= self.total_project_value {
                    EscrowStatus::Funded
                } else {
                    EscrowStatus::Active
                };
            }
            // Completed/Closed escrows keep their status; a Funded escrow
            // stays Funded even if a later change order raises the total.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn account(total: Money) -> EscrowAccount {
        EscrowAccount {
            id: Uuid::new_v4(),
            project_id: "project-1".into(),
            total_project_value: total,
            retention_percentage: 10,
            retention_amount: total.percent_of(10).unwrap(),
            retention_released: false,
            status: EscrowStatus::Created,
            client_id: "client-1".into(),
            contractor_id: "contractor-1".into(),
            processor_account: AccountHandle::new("acct-1"),
            expected_completion_date: None,
            created_at: Utc::now(),
            version: 0,
        }
    }

    #[test]
    fn partial_funding_activates() {
        let mut a = account(Money::from_major(100_000));
        a.recompute_funding_status(Money::from_major(50_000));
        assert_eq!(a.status, EscrowStatus::Active);
    }

    #[test]
    fn full_funding_marks_funded() {
        let mut a = account(Money::from_major(100_000));
        a.recompute_funding_status(Money::from_major(100_000));
        assert_eq!(a.status, EscrowStatus::Funded);
    }

    #[test]
    fn completed_status_is_sticky() {
        let mut a = account(Money::from_major(100_000));
        a.status = EscrowStatus::Completed;
        a.recompute_funding_status(Money::from_major(100_000));
        assert_eq!(a.status, EscrowStatus::Completed);
    }
}
