// service/audit_service.rs
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::{
    db::Store,
    models::{
        accessmodel::{AccessSession, MagicLink, OtpVerification},
        auditmodel::AuditEvent,
        proposalmodel::{Job, Proposal, ProposalStatus},
    },
    service::error::ServiceError,
};

#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn Store>,
}

impl AuditService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn log(&self, event: &AuditEvent) -> Result<(), ServiceError> {
        self.store.insert_audit_event(event).await?;
        tracing::debug!("Audit: {} ({})", event.event_type, event.description);
        Ok(())
    }

    #[cfg(test)]
    pub async fn events_for_proposal(
        &self,
        tenant_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<Vec<AuditEvent>, ServiceError> {
        Ok(self
            .store
            .list_audit_events(tenant_id, Some(proposal_id))
            .await?)
    }
}

pub fn magic_link_validated(link: &MagicLink, session: &AccessSession, reused: bool) -> AuditEvent {
    AuditEvent::new(link.tenant_id, "magic_link_validated", "Customer opened a magic link")
        .client(link.client_id)
        .proposal(link.quote_id)
        .session(session.id)
        .metadata(json!({
            "magicLinkId": link.id,
            "useCount": link.use_count,
            "reusedSession": reused,
            "ipAddress": session.ip_address,
        }))
}

pub fn session_validated(session: &AccessSession) -> AuditEvent {
    AuditEvent::new(session.tenant_id, "session_validated", "Customer session validated")
        .client(session.client_id)
        .session(session.id)
        .metadata(json!({ "verified": session.is_verified }))
}

pub fn session_revoked(session: &AccessSession) -> AuditEvent {
    AuditEvent::new(session.tenant_id, "session_revoked", "Customer signed out")
        .client(session.client_id)
        .session(session.id)
}

pub fn otp_requested(session: &AccessSession, otp: &OtpVerification) -> AuditEvent {
    AuditEvent::new(session.tenant_id, "otp_requested", "Verification code sent")
        .client(session.client_id)
        .session(session.id)
        .metadata(json!({ "method": otp.method, "otpId": otp.id }))
}

pub fn otp_verified(session: &AccessSession, ip: Option<&str>) -> AuditEvent {
    AuditEvent::new(session.tenant_id, "otp_verified", "Session upgraded to verified")
        .client(session.client_id)
        .session(session.id)
        .metadata(json!({
            "quoteCount": session.quote_ids.len(),
            "ipAddress": ip,
        }))
}

pub fn status_changed(proposal: &Proposal, from: ProposalStatus, actor: &str) -> AuditEvent {
    AuditEvent::new(
        proposal.tenant_id,
        "proposal_status_changed",
        format!("Proposal {} moved from {} to {}", proposal.quote_number, from.as_str(), proposal.status.as_str()),
    )
    .client(proposal.client_id)
    .proposal(proposal.id)
    .metadata(json!({
        "from": from,
        "to": proposal.status,
        "actor": actor,
        "selectedTier": proposal.selected_tier,
    }))
}

pub fn deposit_verified(proposal: &Proposal, job: &Job) -> AuditEvent {
    AuditEvent::new(
        proposal.tenant_id,
        "deposit_verified",
        format!("Deposit verified for proposal {}, job created", proposal.quote_number),
    )
    .client(proposal.client_id)
    .proposal(proposal.id)
    .metadata(json!({
        "paymentReference": job.deposit_transaction_id,
        "depositAmount": job.deposit_amount,
        "jobId": job.id,
        "portalClosesAt": proposal.portal_closed_at,
    }))
}

pub fn portal_expired(proposal: &Proposal) -> AuditEvent {
    AuditEvent::new(proposal.tenant_id, "portal_expired", "Selection portal closed after its window elapsed")
        .client(proposal.client_id)
        .proposal(proposal.id)
        .metadata(json!({ "closedAt": proposal.portal_closed_at }))
}

pub fn selections_saved(proposal: &Proposal, area_ids: &[Uuid]) -> AuditEvent {
    AuditEvent::new(proposal.tenant_id, "selections_saved", "Customer saved area selections")
        .client(proposal.client_id)
        .proposal(proposal.id)
        .metadata(json!({ "areaIds": area_ids }))
}

pub fn selections_submitted(proposal: &Proposal, job: Option<&Job>) -> AuditEvent {
    AuditEvent::new(proposal.tenant_id, "selections_submitted", "Customer submitted all selections")
        .client(proposal.client_id)
        .proposal(proposal.id)
        .metadata(json!({ "jobId": job.map(|j| j.id) }))
}

pub fn payment_intent_created(proposal: &Proposal, intent_id: &str, amount_minor: i64) -> AuditEvent {
    AuditEvent::new(proposal.tenant_id, "payment_intent_created", "Deposit payment started")
        .client(proposal.client_id)
        .proposal(proposal.id)
        .metadata(json!({
            "paymentIntentId": intent_id,
            "amountMinor": amount_minor,
            "selectedTier": proposal.selected_tier,
        }))
}

pub fn payment_rejected(proposal: &Proposal, reference: &str, reason: &str) -> AuditEvent {
    AuditEvent::new(proposal.tenant_id, "payment_rejected", "Deposit confirmation rejected")
        .client(proposal.client_id)
        .proposal(proposal.id)
        .metadata(json!({ "paymentReference": reference, "reason": reason }))
}
