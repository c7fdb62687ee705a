// service/document_service.rs
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    models::proposalmodel::{Client, Job, Proposal, Tenant},
    service::tier_pricing::compute_tiers,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentKind {
    Proposal,
    Invoice,
    WorkOrder,
    MaterialList,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Proposal => "proposal",
            DocumentKind::Invoice => "invoice",
            DocumentKind::WorkOrder => "work-order",
            DocumentKind::MaterialList => "material-list",
        }
    }
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(&self, kind: DocumentKind, snapshot: &Value) -> Result<(), String>;
}

/// Posts snapshots to an external rendering service.
pub struct HttpDocumentRenderer {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDocumentRenderer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DocumentRenderer for HttpDocumentRenderer {
    async fn render(&self, kind: DocumentKind, snapshot: &Value) -> Result<(), String> {
        let url = format!("{}/render/{}", self.base_url, kind.as_str());
        let response = self
            .client
            .post(&url)
            .json(snapshot)
            .send()
            .await
            .map_err(|e| format!("Network error: {}", e))?;

        let status = response.status();
        if status.is_success() {
            tracing::info!("Requested {} render", kind.as_str());
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(format!("Renderer error ({}): {}", status.as_u16(), body))
        }
    }
}

/// Used when no rendering service is configured.
pub struct LoggingRenderer;

#[async_trait]
impl DocumentRenderer for LoggingRenderer {
    async fn render(&self, kind: DocumentKind, snapshot: &Value) -> Result<(), String> {
        tracing::info!(
            "Document rendering disabled, skipping {} for {}",
            kind.as_str(),
            snapshot["quoteNumber"].as_str().unwrap_or("unknown quote")
        );
        Ok(())
    }
}

/// Proposal data as the renderer needs it: areas with their resolved
/// selections, the selected tier and the pricing the customer agreed to.
pub fn proposal_snapshot(
    proposal: &Proposal,
    tenant: &Tenant,
    client: &Client,
    job: Option<&Job>,
) -> Value {
    let tiers = compute_tiers(&proposal.base_total, &tenant.deposit_percent).ok();
    json!({
        "proposalId": proposal.id,
        "quoteNumber": proposal.quote_number,
        "tenant": { "id": tenant.id, "name": tenant.name, "currency": tenant.currency },
        "customer": {
            "name": client.name,
            "email": client.email,
            "phone": client.phone,
            "address": client.address,
        },
        "status": proposal.status,
        "selectedTier": proposal.selected_tier,
        "tierPricing": tiers,
        "total": proposal.total,
        "depositAmount": proposal.deposit_amount,
        "depositTransactionId": proposal.deposit_transaction_id,
        "areas": proposal.areas,
        "jobId": job.map(|j| j.id),
    })
}
