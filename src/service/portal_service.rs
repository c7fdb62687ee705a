// service/portal_service.rs
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db::{cache::proposal_tags, proposaldb::ClientScope, Store},
    mail::mails,
    models::proposalmodel::{AreaSelection, Job, Proposal, ProposalArea, ProposalStatus, Sheen},
    service::{
        audit_service,
        document_service::{proposal_snapshot, DocumentKind},
        effects::{EffectRunner, Effects},
        error::ServiceError,
        status_flow::{StatusWriter, StrictStatusFlow},
    },
};

const MAX_NAME_LEN: usize = 100;
const MAX_NOTES_LEN: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalStatus {
    pub proposal_id: Uuid,
    pub status: ProposalStatus,
    pub portal_open: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub closes_at: Option<DateTime<Utc>>,
    pub days_remaining: Option<i64>,
    pub deposit_verified: bool,
    pub selections_complete: bool,
    pub areas: Vec<ProposalArea>,
    pub incomplete_areas: Vec<String>,
}

impl PortalStatus {
    fn from_proposal(proposal: &Proposal, now: DateTime<Utc>) -> Self {
        let days_remaining = proposal
            .portal_closed_at
            .filter(|_| proposal.portal_open)
            .map(|closes| (closes - now).num_days().max(0));

        Self {
            proposal_id: proposal.id,
            status: proposal.status,
            portal_open: proposal.portal_open,
            opened_at: proposal.portal_opened_at,
            closes_at: proposal.portal_closed_at,
            days_remaining,
            deposit_verified: proposal.deposit_verified(),
            selections_complete: proposal.selections_complete(),
            areas: proposal.areas.clone(),
            incomplete_areas: proposal.incomplete_areas(),
        }
    }
}

/// One area's choice as submitted by the customer. Replaces whatever was
/// saved for that area before.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaSelectionInput {
    pub area_id: Uuid,
    pub color_code: Option<String>,
    pub color_name: Option<String>,
    pub custom_color: Option<String>,
    pub sheen: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SelectionsSubmitted {
    pub proposal: Proposal,
    pub job: Option<Job>,
}

#[derive(Clone)]
pub struct PortalService {
    store: Arc<dyn Store>,
    effects: EffectRunner,
}

fn clean_text(value: Option<String>, field: &str, max_len: usize) -> Result<Option<String>, ServiceError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let cleaned = ammonia::clean(raw.trim());
    if cleaned.is_empty() {
        return Ok(None);
    }
    if cleaned.chars().count() > max_len {
        return Err(ServiceError::Validation(format!(
            "{} must be at most {} characters",
            field, max_len
        )));
    }
    Ok(Some(cleaned))
}

fn normalize_color_code(value: Option<String>) -> Result<Option<String>, ServiceError> {
    let Some(raw) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let hex = Regex::new(r"^#[0-9A-Fa-f]{6}$")
        .map_err(|e| ServiceError::Validation(format!("Color validation unavailable: {}", e)))?;
    if !hex.is_match(&raw) {
        return Err(ServiceError::Validation(format!(
            "Color code '{}' must look like #RRGGBB",
            raw
        )));
    }
    Ok(Some(raw.to_uppercase()))
}

/// Validates and sanitizes the customer's input into the stored shape.
pub fn build_selection(input: AreaSelectionInput) -> Result<AreaSelection, ServiceError> {
    let sheen = match input.sheen.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(raw.parse::<Sheen>().map_err(ServiceError::Validation)?),
        None => None,
    };

    Ok(AreaSelection {
        color_code: normalize_color_code(input.color_code)?,
        color_name: clean_text(input.color_name, "Color name", MAX_NAME_LEN)?,
        custom_color: clean_text(input.custom_color, "Custom color", MAX_NAME_LEN)?,
        sheen,
        notes: clean_text(input.notes, "Notes", MAX_NOTES_LEN)?,
    })
}

impl PortalService {
    pub fn new(store: Arc<dyn Store>, effects: EffectRunner) -> Self {
        Self { store, effects }
    }

    async fn load(&self, scope: ClientScope, proposal_id: Uuid) -> Result<Proposal, ServiceError> {
        let proposal = self
            .store
            .get_proposal_scoped(scope, proposal_id)
            .await?
            .ok_or(ServiceError::ProposalNotFound(proposal_id))?;
        self.refresh_expiry(proposal).await
    }

    /// Closes a portal whose window has run out. Whichever request gets
    /// there first emits the expiry effects; the rest just see it closed.
    pub async fn refresh_expiry(&self, mut proposal: Proposal) -> Result<Proposal, ServiceError> {
        let now = Utc::now();
        if !proposal.portal_window_elapsed(now) {
            return Ok(proposal);
        }

        let closed_here = self.store.close_portal(proposal.id, now).await?;
        proposal.portal_open = false;

        if closed_here {
            tracing::info!("Selection portal for proposal {} expired", proposal.id);

            let mut effects = Effects::new();
            effects.audit(audit_service::portal_expired(&proposal));
            if let Some(tenant) = self.store.get_tenant(proposal.tenant_id).await? {
                effects.email(mails::portal_expired(&tenant, &proposal));
            }
            effects.invalidate(proposal_tags(proposal.tenant_id, proposal.client_id, proposal.id));
            self.effects.run(effects).await;
        }

        Ok(proposal)
    }

    pub async fn portal_status(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
    ) -> Result<PortalStatus, ServiceError> {
        let proposal = self.load(scope, proposal_id).await?;
        Ok(PortalStatus::from_proposal(&proposal, Utc::now()))
    }

    pub async fn save_area_selections(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
        selections: Vec<AreaSelectionInput>,
    ) -> Result<Proposal, ServiceError> {
        let proposal = self.load(scope, proposal_id).await?;
        if !proposal.portal_open {
            return Err(ServiceError::PortalClosed(proposal_id));
        }
        if selections.is_empty() {
            return Err(ServiceError::Validation("At least one selection is required".to_string()));
        }

        let known: HashSet<Uuid> = proposal.areas.iter().map(|area| area.id).collect();
        let mut seen = HashSet::new();
        let mut areas = proposal.areas.clone();
        let mut touched = Vec::with_capacity(selections.len());

        for input in selections {
            let area_id = input.area_id;
            if !known.contains(&area_id) {
                return Err(ServiceError::Validation(format!("Unknown area {}", area_id)));
            }
            if !seen.insert(area_id) {
                return Err(ServiceError::Validation(format!("Area {} appears more than once", area_id)));
            }

            let selection = build_selection(input)?;
            if let Some(area) = areas.iter_mut().find(|area| area.id == area_id) {
                area.selection = Some(selection);
            }
            touched.push(area_id);
        }

        let updated = self
            .store
            .save_area_selections(scope, proposal_id, areas, Utc::now())
            .await?
            .ok_or(ServiceError::PortalClosed(proposal_id))?;

        let mut effects = Effects::new();
        effects
            .audit(audit_service::selections_saved(&updated, &touched))
            .invalidate(proposal_tags(updated.tenant_id, updated.client_id, updated.id));
        self.effects.run(effects).await;

        Ok(updated)
    }

    /// Locks in every area's selection, closes the portal and hands the job
    /// to production.
    pub async fn submit_all_selections(
        &self,
        scope: ClientScope,
        proposal_id: Uuid,
    ) -> Result<SelectionsSubmitted, ServiceError> {
        let proposal = self.load(scope, proposal_id).await?;
        if !proposal.portal_open {
            return Err(ServiceError::PortalClosed(proposal_id));
        }

        let incomplete = proposal.incomplete_areas();
        if !incomplete.is_empty() {
            return Err(ServiceError::IncompleteSelections(incomplete));
        }

        let write = StrictStatusFlow.plan(&proposal, ProposalStatus::SelectionsComplete, "customer")?;
        let (updated, job) = self
            .store
            .complete_selections(scope, proposal_id, proposal.status, &write, Utc::now())
            .await?
            .ok_or(ServiceError::PortalClosed(proposal_id))?;

        tracing::info!("Selections submitted for proposal {}", proposal_id);

        let mut effects = Effects::new();
        effects
            .audit(audit_service::status_changed(&updated, proposal.status, "customer"))
            .audit(audit_service::selections_submitted(&updated, job.as_ref()));
        let tenant = self.store.get_tenant(updated.tenant_id).await?;
        let client = self.store.get_client(scope).await?;
        if let (Some(tenant), Some(client)) = (tenant, client) {
            let snapshot = proposal_snapshot(&updated, &tenant, &client, job.as_ref());
            effects
                .render(DocumentKind::WorkOrder, snapshot.clone())
                .render(DocumentKind::MaterialList, snapshot)
                .email(mails::selections_submitted(&tenant, &client, &updated));
        }
        effects.invalidate(proposal_tags(updated.tenant_id, updated.client_id, updated.id));
        self.effects.run(effects).await;

        Ok(SelectionsSubmitted { proposal: updated, job })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::proposalmodel::JobStatus;
    use crate::testing::Harness;
    use chrono::Duration;

    fn full_selection(area_id: Uuid) -> AreaSelectionInput {
        AreaSelectionInput {
            area_id,
            color_code: Some("#a1b2c3".to_string()),
            color_name: Some("Harbor Mist".to_string()),
            custom_color: None,
            sheen: Some("eggshell".to_string()),
            notes: Some("<b>Two coats</b><script>alert(1)</script>".to_string()),
        }
    }

    #[test]
    fn test_build_selection_sanitizes_and_normalizes() {
        let selection = build_selection(full_selection(Uuid::new_v4())).unwrap();
        assert_eq!(selection.color_code.as_deref(), Some("#A1B2C3"));
        assert_eq!(selection.sheen, Some(Sheen::Eggshell));
        let notes = selection.notes.unwrap();
        assert!(!notes.contains("<script>"));
        assert!(notes.contains("Two coats"));
    }

    #[test]
    fn test_build_selection_rejects_bad_input() {
        let mut input = full_selection(Uuid::new_v4());
        input.color_code = Some("blue".to_string());
        assert!(matches!(build_selection(input), Err(ServiceError::Validation(_))));

        let mut input = full_selection(Uuid::new_v4());
        input.sheen = Some("shiny".to_string());
        assert!(matches!(build_selection(input), Err(ServiceError::Validation(_))));

        let mut input = full_selection(Uuid::new_v4());
        input.notes = Some("x".repeat(MAX_NOTES_LEN + 1));
        assert!(matches!(build_selection(input), Err(ServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn test_closed_portal_refuses_writes_in_every_state() {
        let h = Harness::new().await;
        let scope = h.scope();
        let area_id = h.proposal.areas[0].id;

        for status in [
            ProposalStatus::Draft,
            ProposalStatus::Sent,
            ProposalStatus::Viewed,
            ProposalStatus::Accepted,
            ProposalStatus::DepositPaid,
            ProposalStatus::SelectionsComplete,
            ProposalStatus::Declined,
        ] {
            h.store
                .update_proposal_raw(h.proposal.id, |p| {
                    p.status = status;
                    p.portal_open = false;
                })
                .await;

            let err = h
                .state
                .portal_service
                .save_area_selections(scope, h.proposal.id, vec![full_selection(area_id)])
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::PortalClosed(_)), "{status:?}");

            let err = h
                .state
                .portal_service
                .submit_all_selections(scope, h.proposal.id)
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::PortalClosed(_)), "{status:?}");
        }
    }

    #[tokio::test]
    async fn test_elapsed_window_closes_lazily_once() {
        let h = Harness::new().await;
        h.pay_deposit().await;
        h.store
            .update_proposal_raw(h.proposal.id, |p| {
                p.portal_closed_at = Some(Utc::now() - Duration::minutes(1))
            })
            .await;

        let status = h
            .state
            .portal_service
            .portal_status(h.scope(), h.proposal.id)
            .await
            .unwrap();
        assert!(!status.portal_open);
        assert_eq!(status.days_remaining, None);

        h.state
            .portal_service
            .portal_status(h.scope(), h.proposal.id)
            .await
            .unwrap();
        let expired_events = h
            .audit_events()
            .await
            .into_iter()
            .filter(|e| e.event_type == "portal_expired")
            .count();
        assert_eq!(expired_events, 1);

        let err = h
            .state
            .portal_service
            .save_area_selections(h.scope(), h.proposal.id, vec![full_selection(h.proposal.areas[0].id)])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::PortalClosed(_)));
    }

    #[tokio::test]
    async fn test_submit_requires_every_area() {
        let h = Harness::new().await;
        h.pay_deposit().await;
        let first = h.proposal.areas[0].id;

        h.state
            .portal_service
            .save_area_selections(h.scope(), h.proposal.id, vec![full_selection(first)])
            .await
            .unwrap();

        let err = h
            .state
            .portal_service
            .submit_all_selections(h.scope(), h.proposal.id)
            .await
            .unwrap_err();
        match err {
            ServiceError::IncompleteSelections(names) => {
                assert_eq!(names, vec![h.proposal.areas[1].name.clone()])
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_area_is_rejected() {
        let h = Harness::new().await;
        h.pay_deposit().await;

        let err = h
            .state
            .portal_service
            .save_area_selections(h.scope(), h.proposal.id, vec![full_selection(Uuid::new_v4())])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_submit_closes_portal_and_advances_job() {
        let h = Harness::new().await;
        h.pay_deposit().await;
        let selections = h.proposal.areas.iter().map(|a| full_selection(a.id)).collect();

        h.state
            .portal_service
            .save_area_selections(h.scope(), h.proposal.id, selections)
            .await
            .unwrap();
        let submitted = h
            .state
            .portal_service
            .submit_all_selections(h.scope(), h.proposal.id)
            .await
            .unwrap();

        assert_eq!(submitted.proposal.status, ProposalStatus::SelectionsComplete);
        assert!(!submitted.proposal.portal_open);
        assert_eq!(submitted.job.map(|j| j.status), Some(JobStatus::SelectionsComplete));
        assert_eq!(h.renderer.rendered(), vec![
            DocumentKind::Proposal,
            DocumentKind::Invoice,
            DocumentKind::WorkOrder,
            DocumentKind::MaterialList,
        ]);

        let err = h
            .state
            .portal_service
            .submit_all_selections(h.scope(), h.proposal.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::PortalClosed(_)));
    }
}
