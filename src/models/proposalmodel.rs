// models/proposalmodel.rs
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub contact_email: String,
    /// Percentage of the accepted tier total collected as deposit (0-100).
    pub deposit_percent: BigDecimal,
    pub portal_duration_days: Option<i32>,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "gbb_tier", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GbbTier {
    Good,
    Better,
    Best,
}

impl GbbTier {
    pub const ALL: [GbbTier; 3] = [GbbTier::Good, GbbTier::Better, GbbTier::Best];

    pub fn as_str(&self) -> &'static str {
        match self {
            GbbTier::Good => "good",
            GbbTier::Better => "better",
            GbbTier::Best => "best",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "proposal_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    Sent,
    Viewed,
    Accepted,
    DepositPaid,
    SelectionsComplete,
    Declined,
}

/// Every legal status edge. Anything not listed here is rejected by the
/// strict status flow.
const TRANSITIONS: &[(ProposalStatus, ProposalStatus)] = &[
    (ProposalStatus::Draft, ProposalStatus::Sent),
    (ProposalStatus::Sent, ProposalStatus::Viewed),
    (ProposalStatus::Viewed, ProposalStatus::Viewed),
    (ProposalStatus::Sent, ProposalStatus::Accepted),
    (ProposalStatus::Viewed, ProposalStatus::Accepted),
    (ProposalStatus::Sent, ProposalStatus::Declined),
    (ProposalStatus::Viewed, ProposalStatus::Declined),
    (ProposalStatus::Accepted, ProposalStatus::Declined),
    (ProposalStatus::Accepted, ProposalStatus::DepositPaid),
    (ProposalStatus::DepositPaid, ProposalStatus::SelectionsComplete),
];

impl ProposalStatus {
    pub fn can_transition_to(self, to: ProposalStatus) -> bool {
        TRANSITIONS.iter().any(|&(from, next)| from == self && next == to)
    }

    /// Past the customer's accept/decline decision.
    pub fn is_decided(self) -> bool {
        matches!(
            self,
            ProposalStatus::Accepted
                | ProposalStatus::DepositPaid
                | ProposalStatus::SelectionsComplete
                | ProposalStatus::Declined
        )
    }

    pub fn is_paid(self) -> bool {
        matches!(
            self,
            ProposalStatus::DepositPaid | ProposalStatus::SelectionsComplete
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Draft => "draft",
            ProposalStatus::Sent => "sent",
            ProposalStatus::Viewed => "viewed",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::DepositPaid => "deposit_paid",
            ProposalStatus::SelectionsComplete => "selections_complete",
            ProposalStatus::Declined => "declined",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sheen {
    Flat,
    Matte,
    Eggshell,
    Satin,
    SemiGloss,
    Gloss,
}

impl std::str::FromStr for Sheen {
    type Err = String;

    /// Accepts `semi-gloss`, `Semi Gloss` and `semi_gloss` alike.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "flat" => Ok(Sheen::Flat),
            "matte" => Ok(Sheen::Matte),
            "eggshell" => Ok(Sheen::Eggshell),
            "satin" => Ok(Sheen::Satin),
            "semi_gloss" | "semigloss" => Ok(Sheen::SemiGloss),
            "gloss" => Ok(Sheen::Gloss),
            _ => Err(format!("Unknown sheen '{}'", value.trim())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AreaSelection {
    pub color_code: Option<String>,
    pub color_name: Option<String>,
    pub custom_color: Option<String>,
    pub sheen: Option<Sheen>,
    pub notes: Option<String>,
}

impl AreaSelection {
    pub fn has_color(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.trim().is_empty());
        present(&self.color_code) || present(&self.custom_color)
    }

    pub fn is_complete(&self) -> bool {
        self.has_color() && self.sheen.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProposalArea {
    pub id: Uuid,
    pub name: String,
    pub selection: Option<AreaSelection>,
}

impl ProposalArea {
    pub fn is_complete(&self) -> bool {
        self.selection.as_ref().map_or(false, AreaSelection::is_complete)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub quote_number: String,
    /// Price before any tier multiplier. Never overwritten.
    pub base_total: BigDecimal,
    /// Current price; replaced by the tier-adjusted total on acceptance.
    pub total: BigDecimal,
    pub status: ProposalStatus,
    pub selected_tier: Option<GbbTier>,
    pub deposit_amount: Option<BigDecimal>,
    pub deposit_transaction_id: Option<String>,
    pub deposit_verified_at: Option<DateTime<Utc>>,
    pub portal_open: bool,
    pub portal_opened_at: Option<DateTime<Utc>>,
    pub portal_closed_at: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub declined_at: Option<DateTime<Utc>>,
    pub decline_reason: Option<String>,
    #[sqlx(json)]
    pub areas: Vec<ProposalArea>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    pub fn deposit_verified(&self) -> bool {
        self.deposit_transaction_id.is_some() && self.status.is_paid()
    }

    pub fn selections_complete(&self) -> bool {
        self.status == ProposalStatus::SelectionsComplete
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.map_or(false, |until| now > until)
    }

    /// Open in storage but past its closing time; the next read closes it.
    pub fn portal_window_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.portal_open && self.portal_closed_at.map_or(false, |closes| now > closes)
    }

    pub fn incomplete_areas(&self) -> Vec<String> {
        self.areas
            .iter()
            .filter(|area| !area.is_complete())
            .map(|area| area.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ProposalStatusChange {
    pub id: Uuid,
    pub proposal_id: Uuid,
    pub from_status: ProposalStatus,
    pub to_status: ProposalStatus,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    DepositPaid,
    SelectionsComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub quote_id: Uuid,
    pub client_id: Uuid,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub job_address: Option<String>,
    pub selected_tier: Option<GbbTier>,
    pub total: BigDecimal,
    pub deposit_amount: BigDecimal,
    pub deposit_transaction_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_edges() {
        use ProposalStatus::*;
        assert!(Draft.can_transition_to(Sent));
        assert!(Viewed.can_transition_to(Viewed));
        assert!(Accepted.can_transition_to(DepositPaid));
        assert!(DepositPaid.can_transition_to(SelectionsComplete));

        assert!(!Declined.can_transition_to(DepositPaid));
        assert!(!DepositPaid.can_transition_to(Accepted));
        assert!(!SelectionsComplete.can_transition_to(DepositPaid));
        assert!(!Sent.can_transition_to(DepositPaid));
        assert!(!Draft.can_transition_to(Accepted));
    }

    #[test]
    fn test_area_selection_completeness() {
        let mut selection = AreaSelection {
            color_code: Some("#aabbcc".to_string()),
            ..Default::default()
        };
        assert!(selection.has_color());
        assert!(!selection.is_complete());

        selection.sheen = Some(Sheen::Eggshell);
        assert!(selection.is_complete());

        let custom_only = AreaSelection {
            custom_color: Some("Match the trim in the hallway".to_string()),
            sheen: Some(Sheen::Satin),
            ..Default::default()
        };
        assert!(custom_only.is_complete());

        let blank = AreaSelection {
            color_code: Some("   ".to_string()),
            sheen: Some(Sheen::Flat),
            ..Default::default()
        };
        assert!(!blank.is_complete());
    }

    #[test]
    fn test_sheen_parsing() {
        assert_eq!("Semi-Gloss".parse::<Sheen>(), Ok(Sheen::SemiGloss));
        assert_eq!(" eggshell ".parse::<Sheen>(), Ok(Sheen::Eggshell));
        assert!("shiny".parse::<Sheen>().is_err());
    }
}
