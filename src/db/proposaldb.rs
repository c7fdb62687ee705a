// db/proposaldb.rs
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, Error, Postgres, Transaction};
use uuid::Uuid;

use super::db::DBClient;
use crate::models::proposalmodel::*;

/// The tenant/client pair a customer session is bound to. Every proposal
/// read from the customer side goes through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientScope {
    pub tenant_id: Uuid,
    pub client_id: Uuid,
}

/// A status change as decided by a status writer, ready to persist.
#[derive(Debug, Clone)]
pub struct StatusWrite {
    pub to: ProposalStatus,
    /// `None` when the degraded writer skipped the history row.
    pub history: Option<ProposalStatusChange>,
}

/// Columns a lifecycle transition may set alongside the status.
#[derive(Debug, Clone, Default)]
pub struct ProposalPatch {
    pub selected_tier: Option<GbbTier>,
    pub total: Option<BigDecimal>,
    pub deposit_amount: Option<BigDecimal>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub declined_at: Option<DateTime<Utc>>,
    pub decline_reason: Option<String>,
}

/// What the deposit transaction writes, computed from the locked row.
#[derive(Debug, Clone)]
pub struct DepositPlan {
    pub status: StatusWrite,
    pub verified_at: DateTime<Utc>,
    pub portal_closes_at: DateTime<Utc>,
    pub job: Job,
}

#[derive(Debug, Clone)]
pub enum DepositApplication {
    Applied { proposal: Proposal, job: Job },
    AlreadyApplied { proposal: Proposal, job: Option<Job> },
    Conflict { existing_reference: String },
    NotFound,
}

pub type DepositPlanner<'a> = &'a (dyn Fn(&Proposal) -> DepositPlan + Send + Sync);

#[async_trait]
pub trait ProposalExt {
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, Error>;

    async fn get_client(&self, scope: ClientScope) -> Result<Option<Client>, Error>;

    async fn get_proposal_scoped(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
    ) -> Result<Option<Proposal>, Error>;

    /// Every proposal of the client that has left draft, newest first.
    async fn list_client_proposals(&self, scope: ClientScope) -> Result<Vec<Proposal>, Error>;

    /// Optimistic transition: applies only while the row still has
    /// `expected` as its status. `None` means the guard failed.
    async fn update_proposal_status(
        &self,
        proposal_id: Uuid,
        expected: ProposalStatus,
        write: &StatusWrite,
        patch: ProposalPatch,
    ) -> Result<Option<Proposal>, Error>;

    /// Records a verified deposit, opens the portal and creates the job in
    /// one unit of work. Idempotency and conflicts are re-checked against
    /// the locked row before anything is written.
    async fn apply_deposit_confirmation(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        reference: &str,
        plan: DepositPlanner<'_>,
    ) -> Result<DepositApplication, Error>;

    /// Closes a portal whose window has elapsed. Returns false when another
    /// request already closed it.
    async fn close_portal(&self, proposal_id: Uuid, now: DateTime<Utc>) -> Result<bool, Error>;

    /// Replaces the area list while the portal is still open at `now`.
    async fn save_area_selections(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        areas: Vec<ProposalArea>,
        now: DateTime<Utc>,
    ) -> Result<Option<Proposal>, Error>;

    /// Marks selections complete, closes the portal and moves the job
    /// forward in one transaction.
    async fn complete_selections(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        expected: ProposalStatus,
        write: &StatusWrite,
        now: DateTime<Utc>,
    ) -> Result<Option<(Proposal, Option<Job>)>, Error>;

    async fn get_job_by_quote(&self, quote_id: Uuid) -> Result<Option<Job>, Error>;

    async fn get_status_history(&self, proposal_id: Uuid) -> Result<Vec<ProposalStatusChange>, Error>;
}

const PROPOSAL_COLUMNS: &str = r#"
    id, tenant_id, client_id, quote_number, base_total, total,
    status, selected_tier, deposit_amount, deposit_transaction_id,
    deposit_verified_at, portal_open, portal_opened_at, portal_closed_at,
    valid_until, viewed_at, accepted_at, declined_at, decline_reason,
    areas, created_at, updated_at
"#;

const JOB_COLUMNS: &str = r#"
    id, tenant_id, quote_id, client_id, customer_name, customer_email,
    customer_phone, job_address, selected_tier, total, deposit_amount,
    deposit_transaction_id, status, created_at, updated_at
"#;

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    change: &ProposalStatusChange,
) -> Result<(), Error> {
    sqlx::query(
        r#"
        INSERT INTO proposal_status_history (id, proposal_id, from_status, to_status, actor, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(change.id)
    .bind(change.proposal_id)
    .bind(change.from_status)
    .bind(change.to_status)
    .bind(&change.actor)
    .bind(change.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl ProposalExt for DBClient {
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, Error> {
        sqlx::query_as::<_, Tenant>(
            r#"
            SELECT id, name, contact_email, deposit_percent, portal_duration_days, currency, created_at
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_client(&self, scope: ClientScope) -> Result<Option<Client>, Error> {
        sqlx::query_as::<_, Client>(
            r#"
            SELECT id, tenant_id, name, email, phone, address, created_at
            FROM clients
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(scope.client_id)
        .bind(scope.tenant_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_proposal_scoped(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
    ) -> Result<Option<Proposal>, Error> {
        sqlx::query_as::<_, Proposal>(&format!(
            "SELECT {} FROM proposals WHERE id = $1 AND tenant_id = $2 AND client_id = $3",
            PROPOSAL_COLUMNS
        ))
        .bind(proposal_id)
        .bind(scope.tenant_id)
        .bind(scope.client_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_client_proposals(&self, scope: ClientScope) -> Result<Vec<Proposal>, Error> {
        sqlx::query_as::<_, Proposal>(&format!(
            r#"
            SELECT {} FROM proposals
            WHERE tenant_id = $1 AND client_id = $2 AND status <> 'draft'::proposal_status
            ORDER BY created_at DESC
            "#,
            PROPOSAL_COLUMNS
        ))
        .bind(scope.tenant_id)
        .bind(scope.client_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn update_proposal_status(
        &self,
        proposal_id: Uuid,
        expected: ProposalStatus,
        write: &StatusWrite,
        patch: ProposalPatch,
    ) -> Result<Option<Proposal>, Error> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Proposal>(&format!(
            r#"
            UPDATE proposals
            SET status = $3,
                selected_tier = COALESCE($4, selected_tier),
                total = COALESCE($5, total),
                deposit_amount = COALESCE($6, deposit_amount),
                viewed_at = COALESCE(viewed_at, $7),
                accepted_at = COALESCE($8, accepted_at),
                declined_at = COALESCE($9, declined_at),
                decline_reason = COALESCE($10, decline_reason),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            PROPOSAL_COLUMNS
        ))
        .bind(proposal_id)
        .bind(expected)
        .bind(write.to)
        .bind(patch.selected_tier)
        .bind(patch.total)
        .bind(patch.deposit_amount)
        .bind(patch.viewed_at)
        .bind(patch.accepted_at)
        .bind(patch.declined_at)
        .bind(patch.decline_reason)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(proposal) = updated else {
            tx.rollback().await?;
            return Ok(None);
        };

        if let Some(change) = &write.history {
            insert_history(&mut tx, change).await?;
        }

        tx.commit().await?;
        Ok(Some(proposal))
    }

    async fn apply_deposit_confirmation(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        reference: &str,
        plan: DepositPlanner<'_>,
    ) -> Result<DepositApplication, Error> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query_as::<_, Proposal>(&format!(
            r#"
            SELECT {} FROM proposals
            WHERE id = $1 AND tenant_id = $2 AND client_id = $3
            FOR UPDATE
            "#,
            PROPOSAL_COLUMNS
        ))
        .bind(proposal_id)
        .bind(scope.tenant_id)
        .bind(scope.client_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(locked) = locked else {
            tx.rollback().await?;
            return Ok(DepositApplication::NotFound);
        };

        if let Some(existing) = locked.deposit_transaction_id.clone() {
            tx.rollback().await?;
            if existing == reference {
                let job = self.get_job_by_quote(proposal_id).await?;
                return Ok(DepositApplication::AlreadyApplied { proposal: locked, job });
            }
            return Ok(DepositApplication::Conflict { existing_reference: existing });
        }

        let plan = plan(&locked);

        let proposal = sqlx::query_as::<_, Proposal>(&format!(
            r#"
            UPDATE proposals
            SET status = $2,
                deposit_transaction_id = $3,
                deposit_verified_at = $4,
                portal_open = TRUE,
                portal_opened_at = $4,
                portal_closed_at = $5,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            PROPOSAL_COLUMNS
        ))
        .bind(proposal_id)
        .bind(plan.status.to)
        .bind(reference)
        .bind(plan.verified_at)
        .bind(plan.portal_closes_at)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(change) = &plan.status.history {
            insert_history(&mut tx, change).await?;
        }

        let job = plan.job;
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs
            (id, tenant_id, quote_id, client_id, customer_name, customer_email,
             customer_phone, job_address, selected_tier, total, deposit_amount,
             deposit_transaction_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job.id)
        .bind(job.tenant_id)
        .bind(job.quote_id)
        .bind(job.client_id)
        .bind(&job.customer_name)
        .bind(&job.customer_email)
        .bind(&job.customer_phone)
        .bind(&job.job_address)
        .bind(job.selected_tier)
        .bind(&job.total)
        .bind(&job.deposit_amount)
        .bind(&job.deposit_transaction_id)
        .bind(job.status)
        .bind(job.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(DepositApplication::Applied { proposal, job })
    }

    async fn close_portal(&self, proposal_id: Uuid, now: DateTime<Utc>) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE proposals
            SET portal_open = FALSE, updated_at = NOW()
            WHERE id = $1 AND portal_open = TRUE AND portal_closed_at < $2
            "#,
        )
        .bind(proposal_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_area_selections(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        areas: Vec<ProposalArea>,
        now: DateTime<Utc>,
    ) -> Result<Option<Proposal>, Error> {
        sqlx::query_as::<_, Proposal>(&format!(
            r#"
            UPDATE proposals
            SET areas = $4, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND client_id = $3
              AND portal_open = TRUE
              AND (portal_closed_at IS NULL OR portal_closed_at >= $5)
            RETURNING {}
            "#,
            PROPOSAL_COLUMNS
        ))
        .bind(proposal_id)
        .bind(scope.tenant_id)
        .bind(scope.client_id)
        .bind(Json(&areas))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
    }

    async fn complete_selections(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        expected: ProposalStatus,
        write: &StatusWrite,
        now: DateTime<Utc>,
    ) -> Result<Option<(Proposal, Option<Job>)>, Error> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Proposal>(&format!(
            r#"
            UPDATE proposals
            SET status = $4,
                portal_open = FALSE,
                portal_closed_at = $5,
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND client_id = $3
              AND status = $6
              AND portal_open = TRUE
              AND (portal_closed_at IS NULL OR portal_closed_at >= $5)
            RETURNING {}
            "#,
            PROPOSAL_COLUMNS
        ))
        .bind(proposal_id)
        .bind(scope.tenant_id)
        .bind(scope.client_id)
        .bind(write.to)
        .bind(now)
        .bind(expected)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(proposal) = updated else {
            tx.rollback().await?;
            return Ok(None);
        };

        if let Some(change) = &write.history {
            insert_history(&mut tx, change).await?;
        }

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'selections_complete'::job_status, updated_at = NOW()
            WHERE quote_id = $1
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(proposal_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some((proposal, job)))
    }

    async fn get_job_by_quote(&self, quote_id: Uuid) -> Result<Option<Job>, Error> {
        sqlx::query_as::<_, Job>(&format!(
            "SELECT {} FROM jobs WHERE quote_id = $1",
            JOB_COLUMNS
        ))
        .bind(quote_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_status_history(&self, proposal_id: Uuid) -> Result<Vec<ProposalStatusChange>, Error> {
        sqlx::query_as::<_, ProposalStatusChange>(
            r#"
            SELECT id, proposal_id, from_status, to_status, actor, created_at
            FROM proposal_status_history
            WHERE proposal_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(proposal_id)
        .fetch_all(&self.pool)
        .await
    }
}
