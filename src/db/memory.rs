// db/memory.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use sqlx::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    accessdb::AccessExt,
    auditdb::AuditExt,
    proposaldb::*,
    Store,
};
use crate::models::{accessmodel::*, auditmodel::AuditEvent, proposalmodel::*};

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<Uuid, Tenant>,
    clients: HashMap<Uuid, Client>,
    proposals: HashMap<Uuid, Proposal>,
    /// Keyed by quote id, which keeps one job per proposal.
    jobs: HashMap<Uuid, Job>,
    history: Vec<ProposalStatusChange>,
    magic_links: HashMap<Uuid, MagicLink>,
    sessions: HashMap<Uuid, AccessSession>,
    otps: HashMap<Uuid, OtpVerification>,
    audit: Vec<AuditEvent>,
}

/// Process-local store used when no database is configured, and by tests.
///
/// All state sits behind one `RwLock`; a multi-step write holds the write
/// guard for its whole unit of work, which gives it the same atomicity a
/// Postgres transaction gives the `DBClient`.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
    fail_next_deposit_write: Arc<AtomicBool>,
    fail_audit_writes: Arc<AtomicBool>,
}

fn injected(what: &str) -> Error {
    Error::Protocol(format!("injected failure: {}", what))
}

fn in_scope(proposal: &Proposal, scope: ClientScope) -> bool {
    proposal.tenant_id == scope.tenant_id && proposal.client_id == scope.client_id
}

fn row_not_found() -> Error {
    Error::RowNotFound
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_tenant(&self, tenant: Tenant) {
        self.state.write().await.tenants.insert(tenant.id, tenant);
    }

    pub async fn insert_client(&self, client: Client) {
        self.state.write().await.clients.insert(client.id, client);
    }

    pub async fn insert_proposal(&self, proposal: Proposal) {
        self.state.write().await.proposals.insert(proposal.id, proposal);
    }

    /// Seeds one tenant, client and sent proposal so a database-less run has
    /// something to open.
    pub async fn seed_demo(&self) -> (Tenant, Client, Proposal) {
        let now = Utc::now();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: "Brightside Painting".to_string(),
            contact_email: "office@brightside.example".to_string(),
            deposit_percent: BigDecimal::from(30),
            portal_duration_days: Some(14),
            currency: "usd".to_string(),
            created_at: now,
        };
        let client = Client {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            name: "Jordan Avery".to_string(),
            email: "jordan@example.com".to_string(),
            phone: None,
            address: Some("12 Elm Street".to_string()),
            created_at: now,
        };
        let proposal = Proposal {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            client_id: client.id,
            quote_number: "Q-1001".to_string(),
            base_total: BigDecimal::from(4200),
            total: BigDecimal::from(4200),
            status: ProposalStatus::Sent,
            selected_tier: None,
            deposit_amount: None,
            deposit_transaction_id: None,
            deposit_verified_at: None,
            portal_open: false,
            portal_opened_at: None,
            portal_closed_at: None,
            valid_until: Some(now + Duration::days(30)),
            viewed_at: None,
            accepted_at: None,
            declined_at: None,
            decline_reason: None,
            areas: vec![
                ProposalArea { id: Uuid::new_v4(), name: "Living room walls".to_string(), selection: None },
                ProposalArea { id: Uuid::new_v4(), name: "Kitchen trim".to_string(), selection: None },
            ],
            created_at: now,
            updated_at: now,
        };

        self.insert_tenant(tenant.clone()).await;
        self.insert_client(client.clone()).await;
        self.insert_proposal(proposal.clone()).await;
        (tenant, client, proposal)
    }

    #[cfg(test)]
    pub fn fail_next_deposit_write(&self) {
        self.fail_next_deposit_write.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn set_fail_audit_writes(&self, fail: bool) {
        self.fail_audit_writes.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub async fn job_count(&self, quote_id: Uuid) -> usize {
        self.state
            .read()
            .await
            .jobs
            .values()
            .filter(|job| job.quote_id == quote_id)
            .count()
    }

    #[cfg(test)]
    pub async fn proposal(&self, proposal_id: Uuid) -> Option<Proposal> {
        self.state.read().await.proposals.get(&proposal_id).cloned()
    }

    #[cfg(test)]
    pub async fn update_proposal_raw(&self, proposal_id: Uuid, f: impl FnOnce(&mut Proposal)) {
        if let Some(proposal) = self.state.write().await.proposals.get_mut(&proposal_id) {
            f(proposal);
        }
    }

    #[cfg(test)]
    pub async fn update_session_raw(&self, session_id: Uuid, f: impl FnOnce(&mut AccessSession)) {
        if let Some(session) = self.state.write().await.sessions.get_mut(&session_id) {
            f(session);
        }
    }

    #[cfg(test)]
    pub async fn update_otp_raw(&self, otp_id: Uuid, f: impl FnOnce(&mut OtpVerification)) {
        if let Some(otp) = self.state.write().await.otps.get_mut(&otp_id) {
            f(otp);
        }
    }

    #[cfg(test)]
    pub async fn update_magic_link_raw(&self, link_id: Uuid, f: impl FnOnce(&mut MagicLink)) {
        if let Some(link) = self.state.write().await.magic_links.get_mut(&link_id) {
            f(link);
        }
    }
}

impl Store for InMemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl ProposalExt for InMemoryStore {
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, Error> {
        Ok(self.state.read().await.tenants.get(&tenant_id).cloned())
    }

    async fn get_client(&self, scope: ClientScope) -> Result<Option<Client>, Error> {
        let state = self.state.read().await;
        Ok(state
            .clients
            .get(&scope.client_id)
            .filter(|client| client.tenant_id == scope.tenant_id)
            .cloned())
    }

    async fn get_proposal_scoped(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
    ) -> Result<Option<Proposal>, Error> {
        let state = self.state.read().await;
        Ok(state
            .proposals
            .get(&proposal_id)
            .filter(|p| in_scope(p, scope))
            .cloned())
    }

    async fn list_client_proposals(&self, scope: ClientScope) -> Result<Vec<Proposal>, Error> {
        let state = self.state.read().await;
        let mut proposals: Vec<Proposal> = state
            .proposals
            .values()
            .filter(|p| in_scope(p, scope) && p.status != ProposalStatus::Draft)
            .cloned()
            .collect();
        proposals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(proposals)
    }

    async fn update_proposal_status(
        &self,
        proposal_id: Uuid,
        expected: ProposalStatus,
        write: &StatusWrite,
        patch: ProposalPatch,
    ) -> Result<Option<Proposal>, Error> {
        let mut state = self.state.write().await;

        let Some(proposal) = state.proposals.get_mut(&proposal_id) else {
            return Ok(None);
        };
        if proposal.status != expected {
            return Ok(None);
        }

        proposal.status = write.to;
        if let Some(tier) = patch.selected_tier {
            proposal.selected_tier = Some(tier);
        }
        if let Some(total) = patch.total {
            proposal.total = total;
        }
        if let Some(deposit) = patch.deposit_amount {
            proposal.deposit_amount = Some(deposit);
        }
        if proposal.viewed_at.is_none() {
            proposal.viewed_at = patch.viewed_at;
        }
        if let Some(at) = patch.accepted_at {
            proposal.accepted_at = Some(at);
        }
        if let Some(at) = patch.declined_at {
            proposal.declined_at = Some(at);
        }
        if let Some(reason) = patch.decline_reason {
            proposal.decline_reason = Some(reason);
        }
        proposal.updated_at = Utc::now();
        let updated = proposal.clone();

        if let Some(change) = &write.history {
            state.history.push(change.clone());
        }
        Ok(Some(updated))
    }

    async fn apply_deposit_confirmation(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        reference: &str,
        plan: DepositPlanner<'_>,
    ) -> Result<DepositApplication, Error> {
        let mut state = self.state.write().await;

        let Some(locked) = state
            .proposals
            .get(&proposal_id)
            .filter(|p| in_scope(p, scope))
            .cloned()
        else {
            return Ok(DepositApplication::NotFound);
        };

        if let Some(existing) = locked.deposit_transaction_id.clone() {
            if existing == reference {
                let job = state.jobs.get(&proposal_id).cloned();
                return Ok(DepositApplication::AlreadyApplied { proposal: locked, job });
            }
            return Ok(DepositApplication::Conflict { existing_reference: existing });
        }

        let plan = plan(&locked);

        // Nothing has been written yet, so failing here leaves no trace.
        if self.fail_next_deposit_write.swap(false, Ordering::SeqCst) {
            return Err(injected("deposit write"));
        }
        if state.jobs.contains_key(&proposal_id) {
            return Err(Error::Protocol(
                "duplicate key value violates unique constraint \"jobs_quote_id_key\"".to_string(),
            ));
        }

        let mut proposal = locked;
        proposal.status = plan.status.to;
        proposal.deposit_transaction_id = Some(reference.to_string());
        proposal.deposit_verified_at = Some(plan.verified_at);
        proposal.portal_open = true;
        proposal.portal_opened_at = Some(plan.verified_at);
        proposal.portal_closed_at = Some(plan.portal_closes_at);
        proposal.updated_at = plan.verified_at;

        state.proposals.insert(proposal_id, proposal.clone());
        if let Some(change) = plan.status.history {
            state.history.push(change);
        }
        state.jobs.insert(proposal_id, plan.job.clone());

        Ok(DepositApplication::Applied { proposal, job: plan.job })
    }

    async fn close_portal(&self, proposal_id: Uuid, now: DateTime<Utc>) -> Result<bool, Error> {
        let mut state = self.state.write().await;
        match state.proposals.get_mut(&proposal_id) {
            Some(proposal) if proposal.portal_window_elapsed(now) => {
                proposal.portal_open = false;
                proposal.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_area_selections(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        areas: Vec<ProposalArea>,
        now: DateTime<Utc>,
    ) -> Result<Option<Proposal>, Error> {
        let mut state = self.state.write().await;
        match state.proposals.get_mut(&proposal_id) {
            Some(proposal)
                if in_scope(proposal, scope)
                    && proposal.portal_open
                    && !proposal.portal_window_elapsed(now) =>
            {
                proposal.areas = areas;
                proposal.updated_at = now;
                Ok(Some(proposal.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete_selections(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        expected: ProposalStatus,
        write: &StatusWrite,
        now: DateTime<Utc>,
    ) -> Result<Option<(Proposal, Option<Job>)>, Error> {
        let mut state = self.state.write().await;

        let Some(proposal) = state.proposals.get_mut(&proposal_id) else {
            return Ok(None);
        };
        if !in_scope(proposal, scope)
            || proposal.status != expected
            || !proposal.portal_open
            || proposal.portal_window_elapsed(now)
        {
            return Ok(None);
        }

        proposal.status = write.to;
        proposal.portal_open = false;
        proposal.portal_closed_at = Some(now);
        proposal.updated_at = now;
        let proposal = proposal.clone();

        if let Some(change) = &write.history {
            state.history.push(change.clone());
        }

        let job = state.jobs.get_mut(&proposal_id).map(|job| {
            job.status = JobStatus::SelectionsComplete;
            job.updated_at = now;
            job.clone()
        });

        Ok(Some((proposal, job)))
    }

    async fn get_job_by_quote(&self, quote_id: Uuid) -> Result<Option<Job>, Error> {
        Ok(self.state.read().await.jobs.get(&quote_id).cloned())
    }

    async fn get_status_history(&self, proposal_id: Uuid) -> Result<Vec<ProposalStatusChange>, Error> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|change| change.proposal_id == proposal_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AccessExt for InMemoryStore {
    async fn create_magic_link(&self, link: &MagicLink) -> Result<MagicLink, Error> {
        let mut state = self.state.write().await;
        if state.magic_links.values().any(|existing| existing.token == link.token) {
            return Err(Error::Protocol("duplicate magic link token".to_string()));
        }
        state.magic_links.insert(link.id, link.clone());
        Ok(link.clone())
    }

    async fn get_magic_link_by_token(&self, token: &str) -> Result<Option<MagicLink>, Error> {
        let state = self.state.read().await;
        Ok(state.magic_links.values().find(|link| link.token == token).cloned())
    }

    async fn record_magic_link_use(
        &self,
        link_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<MagicLink>, Error> {
        let mut state = self.state.write().await;
        let link = state.magic_links.get_mut(&link_id).ok_or_else(row_not_found)?;
        if link.is_consumed() {
            return Ok(None);
        }
        link.use_count += 1;
        link.session_id = Some(session_id);
        link.last_used_at = Some(now);
        Ok(Some(link.clone()))
    }

    async fn create_session(&self, session: &AccessSession) -> Result<AccessSession, Error> {
        let mut state = self.state.write().await;
        state.sessions.insert(session.id, session.clone());
        Ok(session.clone())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<AccessSession>, Error> {
        Ok(self.state.read().await.sessions.get(&session_id).cloned())
    }

    async fn get_session_by_token(&self, token: &str) -> Result<Option<AccessSession>, Error> {
        let state = self.state.read().await;
        Ok(state.sessions.values().find(|s| s.token == token).cloned())
    }

    async fn touch_session(
        &self,
        session_id: Uuid,
        ip_address: Option<String>,
        user_agent: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut state = self.state.write().await;
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.last_accessed_at = Some(now);
            if ip_address.is_some() {
                session.ip_address = ip_address;
            }
            if user_agent.is_some() {
                session.user_agent = user_agent;
            }
        }
        Ok(())
    }

    async fn upgrade_session(
        &self,
        session_id: Uuid,
        quote_ids: Vec<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<AccessSession, Error> {
        let mut state = self.state.write().await;
        let session = state.sessions.get_mut(&session_id).ok_or_else(row_not_found)?;
        session.is_verified = true;
        session.verified_at = Some(now);
        session.quote_ids = quote_ids;
        Ok(session.clone())
    }

    async fn expire_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), Error> {
        let mut state = self.state.write().await;
        if let Some(session) = state.sessions.get_mut(&session_id) {
            if session.expires_at > now {
                session.expires_at = now;
            }
        }
        Ok(())
    }

    async fn create_otp(&self, otp: &OtpVerification) -> Result<OtpVerification, Error> {
        let mut state = self.state.write().await;
        for earlier in state.otps.values_mut() {
            if earlier.session_id == otp.session_id
                && earlier.superseded_at.is_none()
                && earlier.verified_at.is_none()
            {
                earlier.superseded_at = Some(otp.created_at);
            }
        }
        let mut created = otp.clone();
        created.attempts = 0;
        state.otps.insert(created.id, created.clone());
        Ok(created)
    }

    async fn count_otps_since(&self, session_id: Uuid, since: DateTime<Utc>) -> Result<i64, Error> {
        let state = self.state.read().await;
        Ok(state
            .otps
            .values()
            .filter(|otp| otp.session_id == session_id && otp.created_at > since)
            .count() as i64)
    }

    async fn get_current_otp(&self, session_id: Uuid) -> Result<Option<OtpVerification>, Error> {
        let state = self.state.read().await;
        Ok(state
            .otps
            .values()
            .filter(|otp| {
                otp.session_id == session_id
                    && otp.superseded_at.is_none()
                    && otp.verified_at.is_none()
            })
            .max_by_key(|otp| otp.created_at)
            .cloned())
    }

    async fn claim_otp_attempt(&self, otp_id: Uuid) -> Result<Option<OtpVerification>, Error> {
        let mut state = self.state.write().await;
        let otp = state.otps.get_mut(&otp_id).ok_or_else(row_not_found)?;
        if otp.is_exhausted() || otp.verified_at.is_some() || otp.superseded_at.is_some() {
            return Ok(None);
        }
        otp.attempts += 1;
        Ok(Some(otp.clone()))
    }

    async fn mark_otp_delivered(&self, otp_id: Uuid, now: DateTime<Utc>) -> Result<(), Error> {
        let mut state = self.state.write().await;
        if let Some(otp) = state.otps.get_mut(&otp_id) {
            otp.delivered_at = Some(now);
        }
        Ok(())
    }

    async fn mark_otp_verified(&self, otp_id: Uuid, now: DateTime<Utc>) -> Result<bool, Error> {
        let mut state = self.state.write().await;
        match state.otps.get_mut(&otp_id) {
            Some(otp) if otp.verified_at.is_none() && otp.superseded_at.is_none() => {
                otp.verified_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AuditExt for InMemoryStore {
    async fn insert_audit_event(&self, event: &AuditEvent) -> Result<(), Error> {
        if self.fail_audit_writes.load(Ordering::SeqCst) {
            return Err(injected("audit write"));
        }
        self.state.write().await.audit.push(event.clone());
        Ok(())
    }

    async fn list_audit_events(
        &self,
        tenant_id: Uuid,
        proposal_id: Option<Uuid>,
    ) -> Result<Vec<AuditEvent>, Error> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .filter(|event| event.tenant_id == tenant_id)
            .filter(|event| proposal_id.map_or(true, |id| event.proposal_id == Some(id)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_write(from: ProposalStatus, to: ProposalStatus, proposal_id: Uuid) -> StatusWrite {
        StatusWrite {
            to,
            history: Some(ProposalStatusChange {
                id: Uuid::new_v4(),
                proposal_id,
                from_status: from,
                to_status: to,
                actor: "test".to_string(),
                created_at: Utc::now(),
            }),
        }
    }

    #[tokio::test]
    async fn test_status_update_is_guarded_by_expected_status() {
        let store = InMemoryStore::new();
        let (_, _, proposal) = store.seed_demo().await;

        let write = status_write(ProposalStatus::Viewed, ProposalStatus::Accepted, proposal.id);
        let stale = store
            .update_proposal_status(proposal.id, ProposalStatus::Viewed, &write, ProposalPatch::default())
            .await
            .unwrap();
        assert!(stale.is_none());
        assert!(store.get_status_history(proposal.id).await.unwrap().is_empty());

        let write = status_write(ProposalStatus::Sent, ProposalStatus::Viewed, proposal.id);
        let patch = ProposalPatch { viewed_at: Some(Utc::now()), ..Default::default() };
        let updated = store
            .update_proposal_status(proposal.id, ProposalStatus::Sent, &write, patch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, ProposalStatus::Viewed);
        assert!(updated.viewed_at.is_some());
        assert_eq!(store.get_status_history(proposal.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_new_otp_supersedes_previous_codes() {
        let store = InMemoryStore::new();
        let session_id = Uuid::new_v4();
        let make = |hash: &str| OtpVerification {
            id: Uuid::new_v4(),
            session_id,
            client_id: Uuid::new_v4(),
            method: OtpMethod::Email,
            target: "a@b.c".to_string(),
            code_hash: hash.to_string(),
            attempts: 0,
            max_attempts: 5,
            expires_at: Utc::now() + Duration::minutes(10),
            delivered_at: None,
            verified_at: None,
            superseded_at: None,
            created_at: Utc::now(),
        };

        let first = store.create_otp(&make("first")).await.unwrap();
        let second = store.create_otp(&make("second")).await.unwrap();

        let current = store.get_current_otp(session_id).await.unwrap().unwrap();
        assert_eq!(current.id, second.id);
        assert_ne!(current.id, first.id);
        assert_eq!(store.count_otps_since(session_id, Utc::now() - Duration::minutes(15)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_close_portal_only_once() {
        let store = InMemoryStore::new();
        let (_, _, proposal) = store.seed_demo().await;
        let past = Utc::now() - Duration::hours(1);
        store
            .update_proposal_raw(proposal.id, |p| {
                p.portal_open = true;
                p.portal_closed_at = Some(past);
            })
            .await;

        assert!(store.close_portal(proposal.id, Utc::now()).await.unwrap());
        assert!(!store.close_portal(proposal.id, Utc::now()).await.unwrap());
    }
}
