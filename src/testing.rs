// testing.rs
//! Fakes and a seeded harness shared by the unit and router tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    config::Config,
    db::{
        cache::MemoryCache,
        memory::InMemoryStore,
        proposaldb::ClientScope,
    },
    mail::sendmail::{EmailMessage, Notifier},
    models::{
        accessmodel::MagicLink,
        auditmodel::AuditEvent,
        proposalmodel::{Client, GbbTier, Proposal, ProposalArea, ProposalStatus, Tenant},
    },
    service::{
        access_service::{MagicLinkOutcome, SessionContext},
        audit_service::AuditService,
        document_service::{DocumentKind, DocumentRenderer},
        error::ServiceError,
        payment_provider::{PaymentGateway, PaymentIntent, PaymentIntentStatus},
    },
    utils::money::to_minor_units,
    Adapters, AppState,
};

pub fn sample_proposal() -> Proposal {
    let now = Utc::now();
    Proposal {
        id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        client_id: Uuid::new_v4(),
        quote_number: "Q-2001".to_string(),
        base_total: BigDecimal::from(1000),
        total: BigDecimal::from(1000),
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
        areas: vec![ProposalArea {
            id: Uuid::new_v4(),
            name: "Bedroom walls".to_string(),
            selection: None,
        }],
        created_at: now,
        updated_at: now,
    }
}

/// In-process payment processor. Intents live in a map keyed by id.
#[derive(Default)]
pub struct FakeGateway {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    counter: AtomicUsize,
}

impl FakeGateway {
    fn next_id(&self) -> String {
        format!("pi_test_{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn intent(&self, id: &str) -> Option<PaymentIntent> {
        self.intents.lock().unwrap().get(id).cloned()
    }

    pub fn insert(&self, status: PaymentIntentStatus, amount: i64, proposal_id: Uuid) -> String {
        let id = self.next_id();
        let mut metadata = HashMap::new();
        metadata.insert("proposalId".to_string(), proposal_id.to_string());
        self.intents.lock().unwrap().insert(
            id.clone(),
            PaymentIntent {
                id: id.clone(),
                status,
                amount,
                currency: "usd".to_string(),
                client_secret: Some(format!("{}_secret", id)),
                metadata,
            },
        );
        id
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<PaymentIntent, ServiceError> {
        let id = self.next_id();
        let intent = PaymentIntent {
            id: id.clone(),
            status: PaymentIntentStatus::RequiresPaymentMethod,
            amount: amount_minor,
            currency: currency.to_string(),
            client_secret: Some(format!("{}_secret", id)),
            metadata: metadata.clone(),
        };
        self.intents.lock().unwrap().insert(id, intent.clone());
        Ok(intent)
    }

    async fn retrieve_payment_intent(&self, reference: &str) -> Result<PaymentIntent, ServiceError> {
        self.intent(reference)
            .ok_or_else(|| ServiceError::PaymentProvider(format!("No such payment_intent: {}", reference)))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    emails: Mutex<Vec<EmailMessage>>,
    sms: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn emails(&self) -> Vec<EmailMessage> {
        self.emails.lock().unwrap().clone()
    }

    pub fn fail_deliveries(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// The code carried by the most recent OTP email or SMS.
    pub fn last_otp_code(&self) -> Option<String> {
        let from_email = self.emails.lock().unwrap().iter().rev().find_map(|message| {
            message
                .placeholders
                .iter()
                .find(|(key, _)| key == "{{otp_code}}")
                .map(|(_, value)| value.clone())
        });
        from_email.or_else(|| {
            self.sms.lock().unwrap().last().map(|(_, body)| {
                body.chars().filter(char::is_ascii_digit).take(6).collect()
            })
        })
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("mail server unavailable".to_string());
        }
        self.emails.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("sms gateway unavailable".to_string());
        }
        self.sms.lock().unwrap().push((to.to_string(), body.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingRenderer {
    rendered: Mutex<Vec<DocumentKind>>,
}

impl RecordingRenderer {
    pub fn rendered(&self) -> Vec<DocumentKind> {
        self.rendered.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentRenderer for RecordingRenderer {
    async fn render(&self, kind: DocumentKind, _snapshot: &Value) -> Result<(), String> {
        self.rendered.lock().unwrap().push(kind);
        Ok(())
    }
}

/// Seeded app state on the in-memory store with effects run inline.
pub struct Harness {
    pub state: Arc<AppState>,
    pub store: InMemoryStore,
    pub notifier: Arc<RecordingNotifier>,
    pub gateway: Arc<FakeGateway>,
    pub renderer: Arc<RecordingRenderer>,
    pub tenant: Tenant,
    pub client: Client,
    pub proposal: Proposal,
}

impl Harness {
    pub async fn new() -> Self {
        let store = InMemoryStore::new();
        let (tenant, client, proposal) = store.seed_demo().await;
        let notifier = Arc::new(RecordingNotifier::default());
        let gateway = Arc::new(FakeGateway::default());
        let renderer = Arc::new(RecordingRenderer::default());

        let adapters = Adapters {
            gateway: gateway.clone(),
            notifier: notifier.clone(),
            renderer: renderer.clone(),
            cache: Arc::new(MemoryCache::new()),
        };
        let state = AppState::new(Config::for_tests(), Arc::new(store.clone()), adapters, false);

        Self {
            state: Arc::new(state),
            store,
            notifier,
            gateway,
            renderer,
            tenant,
            client,
            proposal,
        }
    }

    pub fn scope(&self) -> ClientScope {
        ClientScope {
            tenant_id: self.tenant.id,
            client_id: self.client.id,
        }
    }

    pub async fn issue_link(&self, max_uses: Option<i32>) -> MagicLink {
        self.state
            .access_service
            .issue_magic_link(self.tenant.id, self.client.id, self.proposal.id, None, max_uses)
            .await
            .unwrap()
    }

    /// Opens a fresh unverified session for the seeded proposal.
    pub async fn open_session(&self) -> (String, Uuid) {
        let link = self.issue_link(None).await;
        match self
            .state
            .access_service
            .validate_magic_link(&link.token, None, None, None)
            .await
            .unwrap()
        {
            MagicLinkOutcome::Valid(access) => (access.session.token.clone(), access.session.id),
            MagicLinkOutcome::Invalid { reason } => panic!("seeded link rejected: {:?}", reason),
        }
    }

    pub async fn context(&self) -> SessionContext {
        let (token, _) = self.open_session().await;
        self.state
            .access_service
            .authenticate(&token, None, None)
            .await
            .unwrap()
    }

    /// Another proposal for the seeded client, created after the seeded one.
    pub async fn add_proposal(&self, status: ProposalStatus) -> Proposal {
        let mut proposal = sample_proposal();
        proposal.tenant_id = self.tenant.id;
        proposal.client_id = self.client.id;
        proposal.status = status;
        proposal.quote_number = format!("Q-{}", &proposal.id.simple().to_string()[..6]);
        proposal.created_at = self.proposal.created_at + Duration::seconds(1);
        self.store.insert_proposal(proposal.clone()).await;
        proposal
    }

    pub async fn succeeded_intent(&self, amount_minor: i64, proposal_id: Uuid) -> String {
        self.intent_with_status(PaymentIntentStatus::Succeeded, amount_minor, proposal_id)
            .await
    }

    pub async fn intent_with_status(
        &self,
        status: PaymentIntentStatus,
        amount_minor: i64,
        proposal_id: Uuid,
    ) -> String {
        self.gateway.insert(status, amount_minor, proposal_id)
    }

    /// Accepts the seeded proposal at the better tier and pays its deposit.
    pub async fn pay_deposit(&self) -> Proposal {
        let accepted = self
            .state
            .proposal_service
            .accept(self.scope(), self.proposal.id, GbbTier::Better)
            .await
            .unwrap();
        let amount = accepted
            .deposit_amount
            .as_ref()
            .and_then(to_minor_units)
            .unwrap();
        let reference = self.succeeded_intent(amount, self.proposal.id).await;

        self.state
            .deposit_service
            .verify_deposit_and_open_portal(self.scope(), self.proposal.id, &reference)
            .await
            .unwrap()
            .proposal
    }

    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        AuditService::new(Arc::new(self.store.clone()))
            .events_for_proposal(self.tenant.id, self.proposal.id)
            .await
            .unwrap()
    }
}
