// service/deposit_service.rs
use std::collections::HashMap;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::{
        cache::proposal_tags,
        proposaldb::{ClientScope, DepositApplication, DepositPlan},
        Store,
    },
    mail::mails,
    models::proposalmodel::{Client, Job, JobStatus, Proposal, ProposalStatus, Tenant},
    service::{
        audit_service,
        document_service::{proposal_snapshot, DocumentKind},
        effects::{EffectRunner, Effects},
        error::ServiceError,
        payment_provider::{PaymentGateway, PaymentIntent, PaymentIntentStatus},
        status_flow::plan_with_fallback,
    },
    utils::money::to_minor_units,
};

/// Metadata key the processor echoes back so a payment can be tied to its
/// proposal.
pub const PROPOSAL_ID_KEY: &str = "proposalId";
pub const TENANT_ID_KEY: &str = "tenantId";
pub const CLIENT_ID_KEY: &str = "clientId";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentCreated {
    pub payment_intent_id: String,
    pub client_secret: String,
    pub amount: BigDecimal,
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct DepositVerification {
    pub proposal: Proposal,
    pub job: Option<Job>,
    /// True when this reference had already been applied earlier.
    pub already_processed: bool,
}

#[derive(Clone)]
pub struct DepositService {
    store: Arc<dyn Store>,
    effects: EffectRunner,
    gateway: Arc<dyn PaymentGateway>,
    default_portal_days: i64,
}

fn job_from(proposal: &Proposal, client: &Client, reference: &str, deposit: &BigDecimal) -> Job {
    let now = Utc::now();
    Job {
        id: Uuid::new_v4(),
        tenant_id: proposal.tenant_id,
        quote_id: proposal.id,
        client_id: proposal.client_id,
        customer_name: client.name.clone(),
        customer_email: client.email.clone(),
        customer_phone: client.phone.clone(),
        job_address: client.address.clone(),
        selected_tier: proposal.selected_tier,
        total: proposal.total.clone(),
        deposit_amount: deposit.clone(),
        deposit_transaction_id: reference.to_string(),
        status: if proposal.selections_complete() {
            JobStatus::SelectionsComplete
        } else {
            JobStatus::DepositPaid
        },
        created_at: now,
        updated_at: now,
    }
}

impl DepositService {
    pub fn new(
        store: Arc<dyn Store>,
        effects: EffectRunner,
        gateway: Arc<dyn PaymentGateway>,
        default_portal_days: i64,
    ) -> Self {
        Self {
            store,
            effects,
            gateway,
            default_portal_days,
        }
    }

    async fn parties(&self, scope: ClientScope, proposal_id: Uuid) -> Result<(Tenant, Client), ServiceError> {
        let tenant = self.store.get_tenant(scope.tenant_id).await?;
        let client = self.store.get_client(scope).await?;
        match (tenant, client) {
            (Some(tenant), Some(client)) => Ok((tenant, client)),
            _ => Err(ServiceError::ProposalNotFound(proposal_id)),
        }
    }

    fn expected_deposit_minor(proposal: &Proposal) -> Result<(BigDecimal, i64), ServiceError> {
        let deposit = proposal
            .deposit_amount
            .clone()
            .ok_or(ServiceError::WrongState {
                proposal_id: proposal.id,
                status: proposal.status,
            })?;
        let minor = to_minor_units(&deposit).ok_or_else(|| {
            ServiceError::InvalidPricingInput(format!("deposit {} cannot be charged", deposit))
        })?;
        Ok((deposit, minor))
    }

    /// Starts the deposit payment for an accepted proposal, charging the
    /// deposit stored at acceptance.
    pub async fn create_payment_intent(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
    ) -> Result<PaymentIntentCreated, ServiceError> {
        let proposal = self
            .store
            .get_proposal_scoped(scope, proposal_id)
            .await?
            .ok_or(ServiceError::ProposalNotFound(proposal_id))?;

        if proposal.status.is_paid() || proposal.deposit_transaction_id.is_some() {
            return Err(ServiceError::AlreadyProcessed {
                proposal_id,
                status: proposal.status,
            });
        }
        if proposal.status != ProposalStatus::Accepted {
            return Err(ServiceError::WrongState {
                proposal_id,
                status: proposal.status,
            });
        }

        let (deposit, amount_minor) = Self::expected_deposit_minor(&proposal)?;
        if amount_minor <= 0 {
            return Err(ServiceError::InvalidPricingInput(
                "there is no deposit to collect".to_string(),
            ));
        }
        let (tenant, _) = self.parties(scope, proposal_id).await?;

        let mut metadata = HashMap::new();
        metadata.insert(PROPOSAL_ID_KEY.to_string(), proposal.id.to_string());
        metadata.insert(TENANT_ID_KEY.to_string(), proposal.tenant_id.to_string());
        metadata.insert(CLIENT_ID_KEY.to_string(), proposal.client_id.to_string());
        metadata.insert("quoteNumber".to_string(), proposal.quote_number.clone());
        if let Some(tier) = proposal.selected_tier {
            metadata.insert("selectedTier".to_string(), tier.as_str().to_string());
        }

        let intent = self
            .gateway
            .create_payment_intent(amount_minor, &tenant.currency, &metadata)
            .await?;
        let client_secret = intent.client_secret.clone().ok_or_else(|| {
            ServiceError::PaymentProvider("payment intent has no client secret".to_string())
        })?;

        let mut effects = Effects::new();
        effects.audit(audit_service::payment_intent_created(&proposal, &intent.id, amount_minor));
        self.effects.run(effects).await;

        Ok(PaymentIntentCreated {
            payment_intent_id: intent.id,
            client_secret,
            amount: deposit,
            amount_minor,
            currency: intent.currency,
        })
    }

    /// Confirms a deposit with the processor, then records it, opens the
    /// selection portal and creates the job as one unit. Safe to call any
    /// number of times with the same reference.
    pub async fn verify_deposit_and_open_portal(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        reference: &str,
    ) -> Result<DepositVerification, ServiceError> {
        let proposal = self
            .store
            .get_proposal_scoped(scope, proposal_id)
            .await?
            .ok_or(ServiceError::ProposalNotFound(proposal_id))?;

        if let Some(existing) = proposal.deposit_transaction_id.as_deref() {
            if existing == reference {
                tracing::info!("Deposit {} already applied to proposal {}", reference, proposal_id);
                let job = self.store.get_job_by_quote(proposal_id).await?;
                return Ok(DepositVerification {
                    proposal,
                    job,
                    already_processed: true,
                });
            }
            tracing::warn!(
                "Proposal {} already paid with {}, refusing {}",
                proposal_id,
                existing,
                reference
            );
            return Err(ServiceError::PaymentConflict {
                proposal_id,
                existing_reference: existing.to_string(),
                supplied_reference: reference.to_string(),
            });
        }

        if proposal.status != ProposalStatus::Accepted {
            return Err(ServiceError::WrongState {
                proposal_id,
                status: proposal.status,
            });
        }

        let intent = self.gateway.retrieve_payment_intent(reference).await?;
        if let Err(e) = self.check_intent(&proposal, reference, &intent) {
            tracing::warn!("Payment {} rejected for proposal {}: {}", reference, proposal_id, e);
            if matches!(e, ServiceError::AmountMismatch { .. } | ServiceError::ProposalMismatch { .. }) {
                let mut effects = Effects::new();
                effects.audit(audit_service::payment_rejected(&proposal, reference, e.code()));
                self.effects.run(effects).await;
            }
            return Err(e);
        }

        let (tenant, client) = self.parties(scope, proposal_id).await?;
        let portal_days = tenant
            .portal_duration_days
            .map(i64::from)
            .unwrap_or(self.default_portal_days);

        let planner = |locked: &Proposal| {
            let now = Utc::now();
            let deposit = locked.deposit_amount.clone().unwrap_or_default();
            DepositPlan {
                status: plan_with_fallback(locked, ProposalStatus::DepositPaid, "payment"),
                verified_at: now,
                portal_closes_at: now + Duration::days(portal_days),
                job: job_from(locked, &client, reference, &deposit),
            }
        };

        let application = match self
            .store
            .apply_deposit_confirmation(scope, proposal_id, reference, &planner)
            .await
        {
            Ok(application) => application,
            Err(e) => {
                // The processor holds the money but nothing was recorded.
                tracing::error!(
                    "Deposit {} for proposal {} verified but could not be recorded: {}",
                    reference,
                    proposal_id,
                    e
                );
                return Err(ServiceError::DatabaseUpdateFailed {
                    reference: reference.to_string(),
                    detail: e.to_string(),
                });
            }
        };

        match application {
            DepositApplication::Applied { proposal: updated, job } => {
                tracing::info!(
                    "Deposit {} verified for proposal {}, job {} created",
                    reference,
                    proposal_id,
                    job.id
                );

                let mut effects = Effects::new();
                effects
                    .audit(audit_service::status_changed(&updated, proposal.status, "payment"))
                    .audit(audit_service::deposit_verified(&updated, &job))
                    .email(mails::deposit_confirmation(&tenant, &client, &updated, &job))
                    .email(mails::deposit_received(&tenant, &client, &updated, &job))
                    .render(
                        DocumentKind::Invoice,
                        proposal_snapshot(&updated, &tenant, &client, Some(&job)),
                    )
                    .invalidate(proposal_tags(updated.tenant_id, updated.client_id, updated.id));
                self.effects.run(effects).await;

                Ok(DepositVerification {
                    proposal: updated,
                    job: Some(job),
                    already_processed: false,
                })
            }
            DepositApplication::AlreadyApplied { proposal, job } => Ok(DepositVerification {
                proposal,
                job,
                already_processed: true,
            }),
            DepositApplication::Conflict { existing_reference } => Err(ServiceError::PaymentConflict {
                proposal_id,
                existing_reference,
                supplied_reference: reference.to_string(),
            }),
            DepositApplication::NotFound => Err(ServiceError::ProposalNotFound(proposal_id)),
        }
    }

    fn check_intent(
        &self,
        proposal: &Proposal,
        reference: &str,
        intent: &PaymentIntent,
    ) -> Result<(), ServiceError> {
        match &intent.status {
            PaymentIntentStatus::Succeeded => {}
            PaymentIntentStatus::Processing => {
                return Err(ServiceError::PaymentProcessing(reference.to_string()))
            }
            PaymentIntentStatus::RequiresPaymentMethod => {
                return Err(ServiceError::PaymentFailed(reference.to_string()))
            }
            PaymentIntentStatus::Canceled => {
                return Err(ServiceError::PaymentCanceled(reference.to_string()))
            }
            other => {
                return Err(ServiceError::UnexpectedPaymentStatus {
                    reference: reference.to_string(),
                    status: other.as_str().to_string(),
                })
            }
        }

        let (_, expected_minor) = Self::expected_deposit_minor(proposal)?;
        if intent.amount != expected_minor {
            return Err(ServiceError::AmountMismatch {
                expected_minor,
                received_minor: intent.amount,
            });
        }

        let found = intent.metadata.get(PROPOSAL_ID_KEY);
        if found.map(String::as_str) != Some(proposal.id.to_string().as_str()) {
            return Err(ServiceError::ProposalMismatch {
                reference: reference.to_string(),
                expected: proposal.id,
                found: found.cloned(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::proposalmodel::GbbTier;
    use crate::testing::Harness;
    use std::str::FromStr;

    async fn accepted(h: &Harness) -> Proposal {
        h.state
            .proposal_service
            .accept(h.scope(), h.proposal.id, GbbTier::Better)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_payment_intent_charges_stored_deposit() {
        let h = Harness::new().await;
        accepted(&h).await;

        let created = h
            .state
            .deposit_service
            .create_payment_intent(h.scope(), h.proposal.id)
            .await
            .unwrap();
        // 4200 at 30%
        assert_eq!(created.amount, BigDecimal::from_str("1260.00").unwrap());
        assert_eq!(created.amount_minor, 126_000);
        let intent = h.gateway.intent(&created.payment_intent_id).unwrap();
        assert_eq!(
            intent.metadata.get(PROPOSAL_ID_KEY),
            Some(&h.proposal.id.to_string())
        );
    }

    #[tokio::test]
    async fn test_payment_intent_requires_acceptance() {
        let h = Harness::new().await;
        let err = h
            .state
            .deposit_service
            .create_payment_intent(h.scope(), h.proposal.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::WrongState { .. }));
    }

    #[tokio::test]
    async fn test_verify_opens_portal_and_creates_one_job() {
        let h = Harness::new().await;
        accepted(&h).await;
        let reference = h.succeeded_intent(126_000, h.proposal.id).await;

        let first = h
            .state
            .deposit_service
            .verify_deposit_and_open_portal(h.scope(), h.proposal.id, &reference)
            .await
            .unwrap();
        assert!(!first.already_processed);
        assert_eq!(first.proposal.status, ProposalStatus::DepositPaid);
        assert!(first.proposal.portal_open);
        assert_eq!(
            first.proposal.portal_closed_at,
            first
                .proposal
                .deposit_verified_at
                .map(|at| at + Duration::days(14))
        );
        let job = first.job.unwrap();
        assert_eq!(job.deposit_amount, BigDecimal::from_str("1260.00").unwrap());
        assert_eq!(job.customer_email, h.client.email);

        let again = h
            .state
            .deposit_service
            .verify_deposit_and_open_portal(h.scope(), h.proposal.id, &reference)
            .await
            .unwrap();
        assert!(again.already_processed);
        assert_eq!(again.job.map(|j| j.id), Some(job.id));
        assert_eq!(h.store.job_count(h.proposal.id).await, 1);
        assert_eq!(h.notifier.emails().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_confirmations_create_a_single_job() {
        let h = Harness::new().await;
        accepted(&h).await;
        let reference = h.succeeded_intent(126_000, h.proposal.id).await;
        let service = h.state.deposit_service.clone();

        let calls = (0..8).map(|_| {
            let service = service.clone();
            let reference = reference.clone();
            let scope = h.scope();
            let id = h.proposal.id;
            tokio::spawn(async move {
                service
                    .verify_deposit_and_open_portal(scope, id, &reference)
                    .await
            })
        });
        let results = futures::future::join_all(calls).await;

        let applied = results
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(|outcome| !outcome.already_processed)
            .count();
        assert_eq!(applied, 1);
        assert_eq!(h.store.job_count(h.proposal.id).await, 1);
    }

    #[tokio::test]
    async fn test_second_reference_conflicts() {
        let h = Harness::new().await;
        accepted(&h).await;
        let first = h.succeeded_intent(126_000, h.proposal.id).await;
        let second = h.succeeded_intent(126_000, h.proposal.id).await;

        let confirmed = h
            .state
            .deposit_service
            .verify_deposit_and_open_portal(h.scope(), h.proposal.id, &first)
            .await
            .unwrap()
            .proposal;
        let err = h
            .state
            .deposit_service
            .verify_deposit_and_open_portal(h.scope(), h.proposal.id, &second)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::PaymentConflict { .. }));
        assert_eq!(h.store.job_count(h.proposal.id).await, 1);

        let stored = h.store.proposal(h.proposal.id).await.unwrap();
        assert_eq!(stored.status, ProposalStatus::DepositPaid);
        assert_eq!(stored.deposit_amount, confirmed.deposit_amount);
        assert_eq!(stored.deposit_transaction_id.as_deref(), Some(first.as_str()));
        assert_eq!(stored.portal_closed_at, confirmed.portal_closed_at);
    }

    #[tokio::test]
    async fn test_processor_checks() {
        let h = Harness::new().await;
        accepted(&h).await;
        let service = &h.state.deposit_service;

        let short = h.succeeded_intent(100, h.proposal.id).await;
        let err = service
            .verify_deposit_and_open_portal(h.scope(), h.proposal.id, &short)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::AmountMismatch { expected_minor: 126_000, received_minor: 100 }
        ));

        // One cent either way is still a mismatch.
        for received in [125_999, 126_001] {
            let reference = h.succeeded_intent(received, h.proposal.id).await;
            let err = service
                .verify_deposit_and_open_portal(h.scope(), h.proposal.id, &reference)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                ServiceError::AmountMismatch { expected_minor: 126_000, received_minor } if received_minor == received
            ));
        }

        let foreign = h.succeeded_intent(126_000, Uuid::new_v4()).await;
        let err = service
            .verify_deposit_and_open_portal(h.scope(), h.proposal.id, &foreign)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ProposalMismatch { .. }));

        for (status, check) in [
            (PaymentIntentStatus::Processing, "payment_processing"),
            (PaymentIntentStatus::RequiresPaymentMethod, "payment_failed"),
            (PaymentIntentStatus::Canceled, "payment_canceled"),
            (PaymentIntentStatus::RequiresAction, "unexpected_payment_status"),
        ] {
            let reference = h.intent_with_status(status, 126_000, h.proposal.id).await;
            let err = service
                .verify_deposit_and_open_portal(h.scope(), h.proposal.id, &reference)
                .await
                .unwrap_err();
            assert_eq!(err.code(), check);
        }

        let stored = h.store.proposal(h.proposal.id).await.unwrap();
        assert_eq!(stored.status, ProposalStatus::Accepted);
        assert!(stored.deposit_transaction_id.is_none());
        assert!(!stored.portal_open);
        assert_eq!(h.store.job_count(h.proposal.id).await, 0);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_nothing_behind() {
        let h = Harness::new().await;
        accepted(&h).await;
        let reference = h.succeeded_intent(126_000, h.proposal.id).await;
        h.store.fail_next_deposit_write();

        let err = h
            .state
            .deposit_service
            .verify_deposit_and_open_portal(h.scope(), h.proposal.id, &reference)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DatabaseUpdateFailed { .. }));

        let stored = h.store.proposal(h.proposal.id).await.unwrap();
        assert_eq!(stored.status, ProposalStatus::Accepted);
        assert!(!stored.portal_open);
        assert_eq!(h.store.job_count(h.proposal.id).await, 0);

        // The retry goes through.
        let retried = h
            .state
            .deposit_service
            .verify_deposit_and_open_portal(h.scope(), h.proposal.id, &reference)
            .await
            .unwrap();
        assert!(!retried.already_processed);
    }

    #[tokio::test]
    async fn test_declined_proposal_is_not_paid() {
        let h = Harness::new().await;
        accepted(&h).await;
        h.state
            .proposal_service
            .decline(h.scope(), h.proposal.id, None)
            .await
            .unwrap();
        let reference = h.succeeded_intent(126_000, h.proposal.id).await;

        let err = h
            .state
            .deposit_service
            .verify_deposit_and_open_portal(h.scope(), h.proposal.id, &reference)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::WrongState { .. }));
    }
}
