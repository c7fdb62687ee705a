// db/auditdb.rs
use async_trait::async_trait;
use sqlx::Error;
use uuid::Uuid;

use super::db::DBClient;
use crate::models::auditmodel::AuditEvent;

#[async_trait]
pub trait AuditExt {
    async fn insert_audit_event(&self, event: &AuditEvent) -> Result<(), Error>;

    async fn list_audit_events(
        &self,
        tenant_id: Uuid,
        proposal_id: Option<Uuid>,
    ) -> Result<Vec<AuditEvent>, Error>;
}

#[async_trait]
impl AuditExt for DBClient {
    async fn insert_audit_event(&self, event: &AuditEvent) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_events
            (id, tenant_id, client_id, proposal_id, session_id, event_type, description, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.tenant_id)
        .bind(event.client_id)
        .bind(event.proposal_id)
        .bind(event.session_id)
        .bind(&event.event_type)
        .bind(&event.description)
        .bind(&event.metadata)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit_events(
        &self,
        tenant_id: Uuid,
        proposal_id: Option<Uuid>,
    ) -> Result<Vec<AuditEvent>, Error> {
        sqlx::query_as::<_, AuditEvent>(
            r#"
            SELECT id, tenant_id, client_id, proposal_id, session_id, event_type, description, metadata, created_at
            FROM audit_events
            WHERE tenant_id = $1 AND ($2::uuid IS NULL OR proposal_id = $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .bind(proposal_id)
        .fetch_all(&self.pool)
        .await
    }
}
