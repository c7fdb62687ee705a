// service/proposal_service.rs
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db::{
        cache::{self, client_tag, proposal_list_key, proposal_tag, proposal_tags, tenant_tag, CachePort, PROPOSAL_LIST_TTL},
        proposaldb::{ClientScope, ProposalPatch, StatusWrite},
        Store,
    },
    mail::mails,
    models::proposalmodel::{Client, GbbTier, Job, Proposal, ProposalStatus, Tenant},
    service::{
        access_service::SessionContext,
        audit_service,
        document_service::{proposal_snapshot, DocumentKind},
        effects::{EffectRunner, Effects},
        error::ServiceError,
        portal_service::PortalService,
        status_flow::{StatusWriter, StrictStatusFlow},
        tier_pricing::{compute_tiers, TierPricing},
    },
};

const MAX_DECLINE_REASON_LEN: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalSummary {
    pub id: Uuid,
    pub quote_number: String,
    pub status: ProposalStatus,
    pub total: BigDecimal,
    pub selected_tier: Option<GbbTier>,
    pub deposit_amount: Option<BigDecimal>,
    pub portal_open: bool,
    pub portal_closed_at: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Proposal> for ProposalSummary {
    fn from(proposal: &Proposal) -> Self {
        Self {
            id: proposal.id,
            quote_number: proposal.quote_number.clone(),
            status: proposal.status,
            total: proposal.total.clone(),
            selected_tier: proposal.selected_tier,
            deposit_amount: proposal.deposit_amount.clone(),
            portal_open: proposal.portal_open,
            portal_closed_at: proposal.portal_closed_at,
            valid_until: proposal.valid_until,
            created_at: proposal.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalView {
    pub proposal: Proposal,
    /// `None` when the contractor's pricing settings are unusable.
    pub tier_pricing: Option<TierPricing>,
    pub tenant_name: String,
    pub currency: String,
    pub job: Option<Job>,
}

#[derive(Clone)]
pub struct ProposalService {
    store: Arc<dyn Store>,
    cache: Arc<dyn CachePort>,
    effects: EffectRunner,
    portal: PortalService,
}

impl ProposalService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn CachePort>,
        effects: EffectRunner,
        portal: PortalService,
    ) -> Self {
        Self {
            store,
            cache,
            effects,
            portal,
        }
    }

    async fn load(&self, scope: ClientScope, proposal_id: Uuid) -> Result<Proposal, ServiceError> {
        self.store
            .get_proposal_scoped(scope, proposal_id)
            .await?
            .ok_or(ServiceError::ProposalNotFound(proposal_id))
    }

    async fn parties(&self, proposal: &Proposal) -> Result<(Tenant, Client), ServiceError> {
        let scope = ClientScope {
            tenant_id: proposal.tenant_id,
            client_id: proposal.client_id,
        };
        let tenant = self.store.get_tenant(proposal.tenant_id).await?;
        let client = self.store.get_client(scope).await?;
        match (tenant, client) {
            (Some(tenant), Some(client)) => Ok((tenant, client)),
            _ => Err(ServiceError::ProposalNotFound(proposal.id)),
        }
    }

    /// Proposals the session may see. Unverified sessions only get the ones
    /// their magic link was for.
    pub async fn list_proposals(&self, context: &SessionContext) -> Result<Vec<ProposalSummary>, ServiceError> {
        let scope = context.scope();
        let key = proposal_list_key(scope.tenant_id, scope.client_id);

        let all = match cache::get_json::<Vec<ProposalSummary>>(self.cache.as_ref(), &key).await {
            Some(hit) => hit,
            None => {
                let summaries: Vec<ProposalSummary> = self
                    .store
                    .list_client_proposals(scope)
                    .await?
                    .iter()
                    .map(ProposalSummary::from)
                    .collect();

                let mut tags = vec![client_tag(scope.client_id), tenant_tag(scope.tenant_id)];
                tags.extend(summaries.iter().map(|s| proposal_tag(s.id)));
                cache::set_json(self.cache.as_ref(), &key, &summaries, &tags, PROPOSAL_LIST_TTL).await;
                summaries
            }
        };

        let mut visible: Vec<ProposalSummary> = if context.session.is_verified {
            all
        } else {
            all.into_iter()
                .filter(|summary| context.session.can_access(summary.id))
                .collect()
        };

        // Portals past their window are closed here too, cached or not.
        let now = Utc::now();
        for summary in visible
            .iter_mut()
            .filter(|s| s.portal_open && s.portal_closed_at.is_some_and(|closes| now > closes))
        {
            if let Some(proposal) = self.store.get_proposal_scoped(scope, summary.id).await? {
                summary.portal_open = self.portal.refresh_expiry(proposal).await?.portal_open;
            }
        }

        Ok(visible)
    }

    /// Full proposal with live tier prices. The first read of a sent
    /// proposal marks it viewed.
    pub async fn get_proposal(&self, scope: ClientScope, proposal_id: Uuid) -> Result<ProposalView, ServiceError> {
        let proposal = self.load(scope, proposal_id).await?;
        if proposal.status == ProposalStatus::Draft {
            return Err(ServiceError::ProposalNotFound(proposal_id));
        }
        let proposal = self.portal.refresh_expiry(proposal).await?;
        let proposal = self.mark_viewed(proposal).await?;

        let (tenant, _) = self.parties(&proposal).await?;
        let tier_pricing = match compute_tiers(&proposal.base_total, &tenant.deposit_percent) {
            Ok(pricing) => Some(pricing),
            Err(e) => {
                tracing::warn!("Cannot price proposal {}: {}", proposal.id, e);
                None
            }
        };
        let job = if proposal.status.is_paid() {
            self.store.get_job_by_quote(proposal.id).await?
        } else {
            None
        };

        Ok(ProposalView {
            proposal,
            tier_pricing,
            tenant_name: tenant.name,
            currency: tenant.currency,
            job,
        })
    }

    /// Sent -> Viewed. Any other status is returned untouched.
    pub async fn mark_viewed(&self, proposal: Proposal) -> Result<Proposal, ServiceError> {
        if proposal.status != ProposalStatus::Sent {
            return Ok(proposal);
        }

        let write = StrictStatusFlow.plan(&proposal, ProposalStatus::Viewed, "customer")?;
        let patch = ProposalPatch {
            viewed_at: Some(Utc::now()),
            ..Default::default()
        };
        let Some(updated) = self
            .store
            .update_proposal_status(proposal.id, ProposalStatus::Sent, &write, patch)
            .await?
        else {
            // Someone else moved it first; show what is stored now.
            return self
                .load(
                    ClientScope {
                        tenant_id: proposal.tenant_id,
                        client_id: proposal.client_id,
                    },
                    proposal.id,
                )
                .await;
        };

        let mut effects = Effects::new();
        effects.audit(audit_service::status_changed(&updated, ProposalStatus::Sent, "customer"));
        if let Ok((tenant, client)) = self.parties(&updated).await {
            effects.email(mails::proposal_viewed(&tenant, &client, &updated));
        }
        effects.invalidate(proposal_tags(updated.tenant_id, updated.client_id, updated.id));
        self.effects.run(effects).await;

        Ok(updated)
    }

    /// Locks in a tier. The tier total becomes the proposal total and the
    /// deposit computed here is the amount every later payment is checked
    /// against.
    pub async fn accept(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        tier: GbbTier,
    ) -> Result<Proposal, ServiceError> {
        let now = Utc::now();
        let proposal = self.load(scope, proposal_id).await?;

        match proposal.status {
            ProposalStatus::Draft => {
                return Err(ServiceError::WrongState {
                    proposal_id,
                    status: proposal.status,
                })
            }
            status if status.is_decided() => {
                return Err(ServiceError::AlreadyProcessed { proposal_id, status })
            }
            _ => {}
        }
        if proposal.deposit_transaction_id.is_some() {
            return Err(ServiceError::AlreadyProcessed {
                proposal_id,
                status: proposal.status,
            });
        }
        if proposal.is_expired(now) {
            return Err(ServiceError::ProposalExpired(proposal_id));
        }

        let (tenant, client) = self.parties(&proposal).await?;
        let pricing = compute_tiers(&proposal.base_total, &tenant.deposit_percent)?;
        let price = pricing.for_tier(tier);

        let write = StrictStatusFlow.plan(&proposal, ProposalStatus::Accepted, "customer")?;
        let patch = ProposalPatch {
            selected_tier: Some(tier),
            total: Some(price.total.clone()),
            deposit_amount: Some(price.deposit.clone()),
            accepted_at: Some(now),
            ..Default::default()
        };
        let updated = self.guarded_update(&proposal, &write, patch).await?;

        tracing::info!(
            "Proposal {} accepted at tier {} (total {}, deposit {})",
            proposal_id,
            tier.as_str(),
            price.total,
            price.deposit
        );

        let mut effects = Effects::new();
        effects
            .audit(audit_service::status_changed(&updated, proposal.status, "customer"))
            .email(mails::proposal_accepted(&tenant, &client, &updated))
            .render(DocumentKind::Proposal, proposal_snapshot(&updated, &tenant, &client, None))
            .invalidate(proposal_tags(updated.tenant_id, updated.client_id, updated.id));
        self.effects.run(effects).await;

        Ok(updated)
    }

    pub async fn decline(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        reason: Option<String>,
    ) -> Result<Proposal, ServiceError> {
        let proposal = self.load(scope, proposal_id).await?;

        match proposal.status {
            ProposalStatus::Draft => {
                return Err(ServiceError::WrongState {
                    proposal_id,
                    status: proposal.status,
                })
            }
            status if status == ProposalStatus::Declined || status.is_paid() => {
                return Err(ServiceError::AlreadyProcessed { proposal_id, status })
            }
            _ => {}
        }

        let reason = reason
            .map(|r| ammonia::clean(r.trim()))
            .filter(|r| !r.is_empty());
        if reason
            .as_ref()
            .is_some_and(|r| r.chars().count() > MAX_DECLINE_REASON_LEN)
        {
            return Err(ServiceError::Validation(format!(
                "Reason must be at most {} characters",
                MAX_DECLINE_REASON_LEN
            )));
        }

        let write = StrictStatusFlow.plan(&proposal, ProposalStatus::Declined, "customer")?;
        let patch = ProposalPatch {
            declined_at: Some(Utc::now()),
            decline_reason: reason,
            ..Default::default()
        };
        let updated = self.guarded_update(&proposal, &write, patch).await?;

        tracing::info!("Proposal {} declined", proposal_id);

        let mut effects = Effects::new();
        effects.audit(audit_service::status_changed(&updated, proposal.status, "customer"));
        if let Ok((tenant, client)) = self.parties(&updated).await {
            effects.email(mails::proposal_declined(&tenant, &client, &updated));
        }
        effects.invalidate(proposal_tags(updated.tenant_id, updated.client_id, updated.id));
        self.effects.run(effects).await;

        Ok(updated)
    }

    async fn guarded_update(
        &self,
        proposal: &Proposal,
        write: &StatusWrite,
        patch: ProposalPatch,
    ) -> Result<Proposal, ServiceError> {
        match self
            .store
            .update_proposal_status(proposal.id, proposal.status, write, patch)
            .await?
        {
            Some(updated) => Ok(updated),
            None => {
                // Lost a race; report what the winner left behind.
                let status = self
                    .store
                    .get_proposal_scoped(
                        ClientScope {
                            tenant_id: proposal.tenant_id,
                            client_id: proposal.client_id,
                        },
                        proposal.id,
                    )
                    .await?
                    .map_or(proposal.status, |current| current.status);
                Err(ServiceError::AlreadyProcessed {
                    proposal_id: proposal.id,
                    status,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::proposaldb::ProposalExt;
    use crate::testing::Harness;
    use chrono::Duration;
    use std::str::FromStr;

    #[tokio::test]
    async fn test_first_read_marks_viewed_once() {
        let h = Harness::new().await;
        let view = h
            .state
            .proposal_service
            .get_proposal(h.scope(), h.proposal.id)
            .await
            .unwrap();
        assert_eq!(view.proposal.status, ProposalStatus::Viewed);
        assert!(view.tier_pricing.is_some());

        h.state
            .proposal_service
            .get_proposal(h.scope(), h.proposal.id)
            .await
            .unwrap();
        let history = h.store.get_status_history(h.proposal.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(h.notifier.emails().len(), 1);
    }

    #[tokio::test]
    async fn test_accept_locks_in_tier_price() {
        let h = Harness::new().await;
        let accepted = h
            .state
            .proposal_service
            .accept(h.scope(), h.proposal.id, GbbTier::Best)
            .await
            .unwrap();

        // 4200 * 1.15 = 4830.00, 30% deposit = 1449.00
        assert_eq!(accepted.status, ProposalStatus::Accepted);
        assert_eq!(accepted.selected_tier, Some(GbbTier::Best));
        assert_eq!(accepted.total, BigDecimal::from_str("4830.00").unwrap());
        assert_eq!(accepted.deposit_amount, Some(BigDecimal::from_str("1449.00").unwrap()));
        assert_eq!(accepted.base_total, BigDecimal::from(4200));
    }

    #[tokio::test]
    async fn test_second_decision_is_already_processed() {
        let h = Harness::new().await;
        let service = &h.state.proposal_service;
        service.accept(h.scope(), h.proposal.id, GbbTier::Good).await.unwrap();

        let err = service
            .accept(h.scope(), h.proposal.id, GbbTier::Best)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyProcessed { .. }));

        // Declining after acceptance is still allowed until money moves.
        let declined = service
            .decline(h.scope(), h.proposal.id, Some("Found a cheaper quote".to_string()))
            .await
            .unwrap();
        assert_eq!(declined.status, ProposalStatus::Declined);

        let err = service
            .decline(h.scope(), h.proposal.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyProcessed { .. }));
    }

    #[tokio::test]
    async fn test_expired_proposal_cannot_be_accepted() {
        let h = Harness::new().await;
        h.store
            .update_proposal_raw(h.proposal.id, |p| p.valid_until = Some(Utc::now() - Duration::days(1)))
            .await;

        let err = h
            .state
            .proposal_service
            .accept(h.scope(), h.proposal.id, GbbTier::Better)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ProposalExpired(_)));

        let stored = h.store.proposal(h.proposal.id).await.unwrap();
        assert_eq!(stored.status, ProposalStatus::Sent);
        assert_eq!(stored.total, h.proposal.total);
        assert_eq!(stored.deposit_amount, None);
        assert_eq!(stored.selected_tier, None);
        assert!(h.store.get_status_history(h.proposal.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decline_reason_is_sanitized() {
        let h = Harness::new().await;
        let declined = h
            .state
            .proposal_service
            .decline(h.scope(), h.proposal.id, Some("<img src=x onerror=alert(1)>Too pricey".to_string()))
            .await
            .unwrap();
        let reason = declined.decline_reason.unwrap();
        assert!(!reason.contains("onerror"));
        assert!(reason.contains("Too pricey"));
    }

    #[tokio::test]
    async fn test_other_clients_proposals_are_not_found() {
        let h = Harness::new().await;
        let foreign = ClientScope {
            tenant_id: h.tenant.id,
            client_id: Uuid::new_v4(),
        };
        let err = h
            .state
            .proposal_service
            .accept(foreign, h.proposal.id, GbbTier::Good)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ProposalNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_is_cached_and_invalidated_on_change() {
        let h = Harness::new().await;
        let mut context = h.context().await;
        context.session.is_verified = true;
        let service = &h.state.proposal_service;

        let before = service.list_proposals(&context).await.unwrap();
        assert_eq!(before[0].status, ProposalStatus::Sent);

        service.accept(h.scope(), h.proposal.id, GbbTier::Good).await.unwrap();
        let after = service.list_proposals(&context).await.unwrap();
        assert_eq!(after[0].status, ProposalStatus::Accepted);
    }

    #[tokio::test]
    async fn test_list_closes_elapsed_portals() {
        let h = Harness::new().await;
        let mut context = h.context().await;
        context.session.is_verified = true;
        let service = &h.state.proposal_service;

        h.pay_deposit().await;
        h.store
            .update_proposal_raw(h.proposal.id, |p| {
                p.portal_closed_at = Some(Utc::now() - Duration::days(1))
            })
            .await;

        let listed = service.list_proposals(&context).await.unwrap();
        assert!(!listed[0].portal_open);
        let stored = h.store.proposal(h.proposal.id).await.unwrap();
        assert!(!stored.portal_open);

        let again = service.list_proposals(&context).await.unwrap();
        assert!(!again[0].portal_open);
        let expired_events = h
            .audit_events()
            .await
            .into_iter()
            .filter(|e| e.event_type == "portal_expired")
            .count();
        assert_eq!(expired_events, 1);
    }

    #[tokio::test]
    async fn test_unverified_list_is_limited_to_session_quotes() {
        let h = Harness::new().await;
        let context = h.context().await;
        h.add_proposal(ProposalStatus::Sent).await;

        let listed = h.state.proposal_service.list_proposals(&context).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, h.proposal.id);
    }
}
