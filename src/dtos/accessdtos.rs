use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    models::{
        accessmodel::{AccessSession, OtpMethod},
        proposalmodel::Client,
    },
    service::{
        access_service::{MagicLinkAccess, SessionContext},
        proposal_service::ProposalSummary,
    },
};

fn validate_otp_code(code: &str) -> Result<(), ValidationError> {
    if code.len() == 6 && code.chars().all(|c| c.is_ascii_digit()) {
        return Ok(());
    }
    let mut error = ValidationError::new("invalid_code");
    error.message = Some(Cow::from("Code must be 6 digits"));
    Err(error)
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
pub struct RequestOtpDto {
    pub method: OtpMethod,

    #[validate(length(min = 3, max = 255, message = "Target must be between 3-255 characters"))]
    pub target: Option<String>,
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOtpDto {
    #[validate(custom = "validate_otp_code")]
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummaryDto {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

impl From<&Client> for ClientSummaryDto {
    fn from(client: &Client) -> Self {
        Self {
            id: client.id,
            name: client.name.clone(),
            email: client.email.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponseDto {
    pub session_id: Uuid,
    pub tenant_id: Uuid,
    pub client: ClientSummaryDto,
    pub quote_ids: Vec<Uuid>,
    pub is_verified: bool,
    pub expires_at: DateTime<Utc>,
}

impl SessionResponseDto {
    pub fn new(session: &AccessSession, client: &Client) -> Self {
        Self {
            session_id: session.id,
            tenant_id: session.tenant_id,
            client: ClientSummaryDto::from(client),
            quote_ids: session.quote_ids.clone(),
            is_verified: session.is_verified,
            expires_at: session.expires_at,
        }
    }
}

impl From<&SessionContext> for SessionResponseDto {
    fn from(context: &SessionContext) -> Self {
        Self::new(&context.session, &context.client)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MagicLinkResponseDto {
    pub session_token: String,
    pub session: SessionResponseDto,
    pub quote: ProposalSummary,
    pub reused_session: bool,
}

impl From<&MagicLinkAccess> for MagicLinkResponseDto {
    fn from(access: &MagicLinkAccess) -> Self {
        Self {
            session_token: access.session.token.clone(),
            session: SessionResponseDto::new(&access.session, &access.client),
            quote: ProposalSummary::from(&access.quote),
            reused_session: access.reused_session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_otp_code_must_be_six_digits() {
        assert!(VerifyOtpDto { code: "123456".to_string() }.validate().is_ok());
        assert!(VerifyOtpDto { code: "12345".to_string() }.validate().is_err());
        assert!(VerifyOtpDto { code: "12a456".to_string() }.validate().is_err());
    }
}
