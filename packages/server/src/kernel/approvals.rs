//! Approval state machine: human-in-the-loop gate for sensitive actions.
//!
//! `pending → approved | rejected` on operator action, `pending → expired`
//! by the periodic sweep. Once decided, the payload and decision are
//! immutable; every transition is a check-and-set on `status = 'pending'`.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::sql::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "approval_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// Operator decision on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    fn as_status(self) -> ApprovalStatus {
        match self {
            Decision::Approved => ApprovalStatus::Approved,
            Decision::Rejected => ApprovalStatus::Rejected,
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Approval {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub requested_by: String,
    pub status: ApprovalStatus,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<String>,
    pub decision_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

const APPROVAL_COLUMNS: &str = "id, tenant_id, resource_type, resource_id, action, payload, \
                                requested_by, status, expires_at, decided_at, decided_by, \
                                decision_reason, created_at";

impl Approval {
    pub fn new(
        tenant_id: Uuid,
        resource_type: &str,
        resource_id: &str,
        action: &str,
        payload: serde_json::Value,
        requested_by: &str,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            action: action.to_string(),
            payload,
            requested_by: requested_by.to_string(),
            status: ApprovalStatus::Pending,
            expires_at: Utc::now() + ttl,
            decided_at: None,
            decided_by: None,
            decision_reason: None,
            created_at: Utc::now(),
        }
    }

    /// Gate for operator retry of a job that exhausted its attempts.
    pub fn job_retry(tenant_id: Uuid, job_id: Uuid, last_error: &str) -> Self {
        Self::new(
            tenant_id,
            "job",
            &job_id.to_string(),
            "job_retry",
            serde_json::json!({ "last_error": last_error }),
            "system",
            Duration::days(7),
        )
    }

    /// Gate for lifting a frozen budget.
    pub fn budget_override(
        tenant_id: Uuid,
        budget_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            tenant_id,
            "budget",
            &budget_id.to_string(),
            "budget_override",
            payload,
            "system",
            Duration::hours(24),
        )
    }

    /// Gate for applying reconciliation fixes for a store.
    pub fn resolve_discrepancies(
        tenant_id: Uuid,
        store_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            tenant_id,
            "store",
            &store_id.to_string(),
            "resolve_discrepancies",
            payload,
            "system",
            Duration::days(7),
        )
    }

    pub async fn find_by_status(
        tenant_id: Uuid,
        status: ApprovalStatus,
        db: &PgPool,
    ) -> Result<Vec<Self>> {
        let approvals = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {APPROVAL_COLUMNS}
            FROM approvals
            WHERE tenant_id = $1 AND status = $2
            ORDER BY created_at DESC
            "#,
        ))
        .bind(tenant_id)
        .bind(status)
        .fetch_all(db)
        .await?;

        Ok(approvals)
    }

    /// Apply an operator decision. Returns `None` when the approval is no
    /// longer pending (already decided, expired, or a concurrent decision
    /// won); the caller surfaces that as a conflict.
    pub async fn decide(
        id: Uuid,
        decision: Decision,
        decided_by: &str,
        reason: Option<&str>,
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let approval = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE approvals
            SET status = $1, decided_at = NOW(), decided_by = $2, decision_reason = $3
            WHERE id = $4 AND status = 'pending' AND expires_at > NOW()
            RETURNING {APPROVAL_COLUMNS}
            "#,
        ))
        .bind(decision.as_status())
        .bind(decided_by)
        .bind(reason)
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(approval)
    }

    /// Expire overdue pending approvals. Returns the expired rows so the
    /// caller can audit each.
    pub async fn sweep_expired(db: &PgPool) -> Result<Vec<Self>> {
        let expired = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE approvals
            SET status = 'expired', decided_at = NOW()
            WHERE status = 'pending' AND expires_at < NOW()
            RETURNING {APPROVAL_COLUMNS}
            "#,
        ))
        .fetch_all(db)
        .await?;

        Ok(expired)
    }
}

#[async_trait::async_trait]
impl Record for Approval {
    const TABLE: &'static str = "approvals";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self> {
        let approval = sqlx::query_as::<_, Self>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = $1",
        ))
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(approval)
    }

    async fn insert(&self, db: &PgPool) -> Result<Self> {
        let approval = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO approvals (
                id, tenant_id, resource_type, resource_id, action, payload,
                requested_by, status, expires_at, decided_at, decided_by,
                decision_reason, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {APPROVAL_COLUMNS}
            "#,
        ))
        .bind(self.id)
        .bind(self.tenant_id)
        .bind(&self.resource_type)
        .bind(&self.resource_id)
        .bind(&self.action)
        .bind(&self.payload)
        .bind(&self.requested_by)
        .bind(self.status)
        .bind(self.expires_at)
        .bind(self.decided_at)
        .bind(&self.decided_by)
        .bind(&self.decision_reason)
        .bind(self.created_at)
        .fetch_one(db)
        .await?;

        Ok(approval)
    }

    // Decided approvals are immutable; the only writes are the CAS paths
    // above, so a general update is a no-op lookup.
    async fn update(&self, db: &PgPool) -> Result<Self> {
        Self::find_by_id(self.id, db).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_retry_approval_expires_in_seven_days() {
        let approval = Approval::job_retry(Uuid::new_v4(), Uuid::new_v4(), "boom");
        let ttl = approval.expires_at - Utc::now();
        assert!(ttl > Duration::days(6) && ttl <= Duration::days(7));
        assert_eq!(approval.action, "job_retry");
        assert_eq!(approval.resource_type, "job");
        assert_eq!(approval.status, ApprovalStatus::Pending);
    }

    #[test]
    fn budget_override_approval_expires_in_a_day() {
        let approval = Approval::budget_override(
            Uuid::new_v4(),
            Uuid::new_v4(),
            serde_json::json!({"budget_name": "api_calls", "current": 100, "limit": 100}),
        );
        let ttl = approval.expires_at - Utc::now();
        assert!(ttl > Duration::hours(23) && ttl <= Duration::hours(24));
    }

    #[test]
    fn decision_maps_to_terminal_status() {
        assert_eq!(Decision::Approved.as_status(), ApprovalStatus::Approved);
        assert_eq!(Decision::Rejected.as_status(), ApprovalStatus::Rejected);
    }
}
