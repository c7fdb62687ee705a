// service/access_service.rs
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::{proposaldb::ClientScope, Store},
    models::{
        accessmodel::{AccessSession, MagicLink},
        proposalmodel::{Client, Proposal, ProposalStatus},
    },
    service::{
        audit_service,
        effects::{EffectRunner, Effects},
        error::ServiceError,
    },
    utils::token::{generate_magic_link_token, generate_session_token},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MagicLinkRejection {
    NotFound,
    Expired,
    AlreadyConsumed,
    TenantMismatch,
}

impl MagicLinkRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MagicLinkRejection::NotFound => "not_found",
            MagicLinkRejection::Expired => "expired",
            MagicLinkRejection::AlreadyConsumed => "already_consumed",
            MagicLinkRejection::TenantMismatch => "tenant_mismatch",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            MagicLinkRejection::NotFound => "This link is not valid",
            MagicLinkRejection::Expired => "This link has expired, please ask for a new one",
            MagicLinkRejection::AlreadyConsumed => "This link has already been used",
            MagicLinkRejection::TenantMismatch => "This link does not belong to this company",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MagicLinkAccess {
    pub client: Client,
    pub magic_link: MagicLink,
    pub quote: Proposal,
    pub session: AccessSession,
    pub reused_session: bool,
}

#[derive(Debug, Clone)]
pub enum MagicLinkOutcome {
    Valid(Box<MagicLinkAccess>),
    Invalid { reason: MagicLinkRejection },
}

/// An authenticated customer, as attached to requests by the session
/// middleware.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session: AccessSession,
    pub client: Client,
}

impl SessionContext {
    pub fn scope(&self) -> ClientScope {
        ClientScope {
            tenant_id: self.session.tenant_id,
            client_id: self.session.client_id,
        }
    }
}

#[derive(Clone)]
pub struct AccessService {
    store: Arc<dyn Store>,
    effects: EffectRunner,
    session_ttl: Duration,
    magic_link_ttl: Duration,
}

impl AccessService {
    pub fn new(
        store: Arc<dyn Store>,
        effects: EffectRunner,
        session_ttl: Duration,
        magic_link_ttl: Duration,
    ) -> Self {
        Self {
            store,
            effects,
            session_ttl,
            magic_link_ttl,
        }
    }

    /// Mints a link that opens one proposal. `max_uses = None` allows reuse
    /// until expiry.
    pub async fn issue_magic_link(
        &self,
        tenant_id: Uuid,
        client_id: Uuid,
        quote_id: Uuid,
        ttl: Option<Duration>,
        max_uses: Option<i32>,
    ) -> Result<MagicLink, ServiceError> {
        let scope = ClientScope { tenant_id, client_id };
        self.store
            .get_proposal_scoped(scope, quote_id)
            .await?
            .ok_or(ServiceError::ProposalNotFound(quote_id))?;

        if matches!(max_uses, Some(n) if n < 1) {
            return Err(ServiceError::Validation("max uses must be at least 1".to_string()));
        }

        let now = Utc::now();
        let link = MagicLink {
            id: Uuid::new_v4(),
            token: generate_magic_link_token(),
            tenant_id,
            client_id,
            quote_id,
            expires_at: now + ttl.unwrap_or(self.magic_link_ttl),
            max_uses,
            use_count: 0,
            session_id: None,
            last_used_at: None,
            created_at: now,
        };

        let link = self.store.create_magic_link(&link).await?;
        tracing::info!("Issued magic link {} for proposal {}", link.id, quote_id);
        Ok(link)
    }

    pub async fn validate_magic_link(
        &self,
        token: &str,
        ip_address: Option<String>,
        user_agent: Option<String>,
        expected_tenant: Option<Uuid>,
    ) -> Result<MagicLinkOutcome, ServiceError> {
        let now = Utc::now();
        let invalid = |reason: MagicLinkRejection| {
            tracing::info!("Magic link rejected: {}", reason.as_str());
            Ok(MagicLinkOutcome::Invalid { reason })
        };

        let Some(link) = self.store.get_magic_link_by_token(token).await? else {
            return invalid(MagicLinkRejection::NotFound);
        };
        if link.is_expired(now) {
            return invalid(MagicLinkRejection::Expired);
        }
        if expected_tenant.is_some_and(|tenant| tenant != link.tenant_id) {
            return invalid(MagicLinkRejection::TenantMismatch);
        }

        let scope = ClientScope {
            tenant_id: link.tenant_id,
            client_id: link.client_id,
        };
        let (Some(client), Some(quote)) = (
            self.store.get_client(scope).await?,
            self.store.get_proposal_scoped(scope, link.quote_id).await?,
        ) else {
            return invalid(MagicLinkRejection::NotFound);
        };

        // A link that already produced a live session hands that session back.
        if let Some(session_id) = link.session_id {
            if let Some(session) = self.store.get_session(session_id).await? {
                if !session.is_expired(now) {
                    self.store
                        .touch_session(session.id, ip_address, user_agent, now)
                        .await?;
                    let mut effects = Effects::new();
                    effects.audit(audit_service::magic_link_validated(&link, &session, true));
                    self.effects.run(effects).await;

                    return Ok(MagicLinkOutcome::Valid(Box::new(MagicLinkAccess {
                        client,
                        magic_link: link,
                        quote,
                        session,
                        reused_session: true,
                    })));
                }
            }
        }

        if link.is_consumed() {
            return invalid(MagicLinkRejection::AlreadyConsumed);
        }

        let session = AccessSession {
            id: Uuid::new_v4(),
            token: generate_session_token(),
            tenant_id: link.tenant_id,
            client_id: link.client_id,
            magic_link_id: Some(link.id),
            quote_ids: vec![link.quote_id],
            is_verified: false,
            verified_at: None,
            expires_at: now + self.session_ttl,
            ip_address,
            user_agent,
            last_accessed_at: Some(now),
            created_at: now,
        };
        // Claim the use first; only the winner of a race gets a session.
        let Some(link) = self.store.record_magic_link_use(link.id, session.id, now).await? else {
            return invalid(MagicLinkRejection::AlreadyConsumed);
        };
        let session = self.store.create_session(&session).await?;

        tracing::info!(
            "Magic link {} opened session {} for client {}",
            link.id,
            session.id,
            client.id
        );

        let mut effects = Effects::new();
        effects.audit(audit_service::magic_link_validated(&link, &session, false));
        self.effects.run(effects).await;

        Ok(MagicLinkOutcome::Valid(Box::new(MagicLinkAccess {
            client,
            magic_link: link,
            quote,
            session,
            reused_session: false,
        })))
    }

    /// Resolves a session token for the auth middleware. No audit trail.
    pub async fn authenticate(
        &self,
        token: &str,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<SessionContext, ServiceError> {
        let now = Utc::now();
        let session = self
            .store
            .get_session_by_token(token)
            .await?
            .ok_or(ServiceError::SessionInvalid)?;

        if session.is_expired(now) {
            return Err(ServiceError::SessionExpired);
        }

        let client = self
            .store
            .get_client(ClientScope {
                tenant_id: session.tenant_id,
                client_id: session.client_id,
            })
            .await?
            .ok_or(ServiceError::SessionInvalid)?;

        self.store
            .touch_session(session.id, ip_address, user_agent, now)
            .await?;

        Ok(SessionContext { session, client })
    }

    pub async fn validate_session(
        &self,
        token: &str,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<SessionContext, ServiceError> {
        let context = self.authenticate(token, ip_address, user_agent).await?;

        let mut effects = Effects::new();
        effects.audit(audit_service::session_validated(&context.session));
        self.effects.run(effects).await;

        Ok(context)
    }

    pub async fn revoke_session(&self, context: &SessionContext) -> Result<(), ServiceError> {
        self.store
            .expire_session(context.session.id, Utc::now())
            .await?;

        let mut effects = Effects::new();
        effects.audit(audit_service::session_revoked(&context.session));
        self.effects.run(effects).await;

        tracing::info!("Session {} revoked", context.session.id);
        Ok(())
    }

    /// Unverified sessions reach only the proposals they were opened for;
    /// verified sessions reach every sent proposal of the client.
    pub async fn authorize_quote(
        &self,
        context: &SessionContext,
        quote_id: Uuid,
    ) -> Result<ClientScope, ServiceError> {
        let scope = context.scope();
        if context.session.can_access(quote_id) {
            return Ok(scope);
        }
        if !context.session.is_verified {
            return Err(ServiceError::VerificationRequired(quote_id));
        }

        match self.store.get_proposal_scoped(scope, quote_id).await? {
            Some(proposal) if proposal.status != ProposalStatus::Draft => Ok(scope),
            _ => Err(ServiceError::ProposalNotFound(quote_id)),
        }
    }
}
