use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    models::proposalmodel::{GbbTier, JobStatus, ProposalStatus},
    service::{
        deposit_service::DepositVerification,
        portal_service::{AreaSelectionInput, SelectionsSubmitted},
    },
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptProposalDto {
    pub selected_tier: GbbTier,
}

#[derive(Validate, Debug, Default, Clone, Serialize, Deserialize)]
pub struct DeclineProposalDto {
    #[validate(length(max = 1000, message = "Reason must be at most 1000 characters"))]
    pub reason: Option<String>,
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyDepositDto {
    #[validate(length(min = 1, max = 255, message = "Payment intent id is required"))]
    pub payment_intent_id: String,
}

#[derive(Validate, Debug, Clone, Deserialize)]
pub struct SaveSelectionsDto {
    #[validate(length(min = 1, max = 200, message = "Between 1 and 200 selections are allowed"))]
    pub selections: Vec<AreaSelectionInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositVerifiedDto {
    pub proposal_id: Uuid,
    pub status: ProposalStatus,
    pub deposit_verified: bool,
    pub portal_open: bool,
    pub portal_closes_at: Option<DateTime<Utc>>,
    pub job_id: Option<Uuid>,
    pub already_processed: bool,
}

impl From<&DepositVerification> for DepositVerifiedDto {
    fn from(outcome: &DepositVerification) -> Self {
        Self {
            proposal_id: outcome.proposal.id,
            status: outcome.proposal.status,
            deposit_verified: outcome.proposal.deposit_verified(),
            portal_open: outcome.proposal.portal_open,
            portal_closes_at: outcome.proposal.portal_closed_at,
            job_id: outcome.job.as_ref().map(|job| job.id),
            already_processed: outcome.already_processed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionsSubmittedDto {
    pub proposal_id: Uuid,
    pub status: ProposalStatus,
    pub job_id: Option<Uuid>,
    pub job_status: Option<JobStatus>,
}

impl From<&SelectionsSubmitted> for SelectionsSubmittedDto {
    fn from(outcome: &SelectionsSubmitted) -> Self {
        Self {
            proposal_id: outcome.proposal.id,
            status: outcome.proposal.status,
            job_id: outcome.job.as_ref().map(|job| job.id),
            job_status: outcome.job.as_ref().map(|job| job.status),
        }
    }
}
