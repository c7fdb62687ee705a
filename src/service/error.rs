use thiserror::Error;
use uuid::Uuid;
use axum::http::StatusCode;

use crate::{
    error::{ErrorMessage, HttpError},
    models::proposalmodel::ProposalStatus,
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid pricing input: {0}")]
    InvalidPricingInput(String),

    #[error("Proposal {0} not found")]
    ProposalNotFound(Uuid),

    #[error("Proposal {proposal_id} is {status:?} and cannot be changed this way")]
    WrongState { proposal_id: Uuid, status: ProposalStatus },

    #[error("Proposal {proposal_id} has already been processed ({status:?})")]
    AlreadyProcessed { proposal_id: Uuid, status: ProposalStatus },

    #[error("Proposal {0} has expired")]
    ProposalExpired(Uuid),

    #[error("Session is invalid")]
    SessionInvalid,

    #[error("Session has expired")]
    SessionExpired,

    #[error("Verification is required to access proposal {0}")]
    VerificationRequired(Uuid),

    #[error("Too many OTP requests, please wait before requesting another code")]
    RateLimited,

    #[error("No active verification code, please request a new one")]
    NoActiveCode,

    #[error("Verification code has expired, please request a new one")]
    OtpExpired,

    #[error("Incorrect verification code, {attempts_remaining} attempts remaining")]
    CodeMismatch { attempts_remaining: i32 },

    #[error("Too many incorrect attempts, please request a new code")]
    Exhausted,

    #[error("Failed to deliver verification code: {0}")]
    OtpDeliveryFailed(String),

    #[error("Proposal {proposal_id} deposit was already verified with a different payment ({existing_reference}), refusing {supplied_reference}")]
    PaymentConflict {
        proposal_id: Uuid,
        existing_reference: String,
        supplied_reference: String,
    },

    #[error("Payment {0} is still processing, please retry shortly")]
    PaymentProcessing(String),

    #[error("Payment {0} failed, a new payment method is required")]
    PaymentFailed(String),

    #[error("Payment {0} was canceled")]
    PaymentCanceled(String),

    #[error("Payment {reference} has unexpected status '{status}'")]
    UnexpectedPaymentStatus { reference: String, status: String },

    #[error("Payment amount {received_minor} does not match the expected deposit {expected_minor}")]
    AmountMismatch { expected_minor: i64, received_minor: i64 },

    #[error("Payment {reference} belongs to proposal {found:?}, not {expected}")]
    ProposalMismatch {
        reference: String,
        expected: Uuid,
        found: Option<String>,
    },

    #[error("Payment provider error: {0}")]
    PaymentProvider(String),

    #[error("Payment {reference} succeeded but recording it failed ({detail}); manual reconciliation is required")]
    DatabaseUpdateFailed { reference: String, detail: String },

    #[error("The selection portal for proposal {0} is closed")]
    PortalClosed(Uuid),

    #[error("Selections are incomplete for: {}", .0.join(", "))]
    IncompleteSelections(Vec<String>),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::ProposalNotFound(_) => StatusCode::NOT_FOUND,

            ServiceError::InvalidPricingInput(_)
            | ServiceError::ProposalExpired(_)
            | ServiceError::NoActiveCode
            | ServiceError::OtpExpired
            | ServiceError::CodeMismatch { .. }
            | ServiceError::Exhausted
            | ServiceError::PaymentFailed(_)
            | ServiceError::PaymentCanceled(_)
            | ServiceError::UnexpectedPaymentStatus { .. }
            | ServiceError::AmountMismatch { .. }
            | ServiceError::ProposalMismatch { .. }
            | ServiceError::IncompleteSelections(_)
            | ServiceError::Validation(_) => StatusCode::BAD_REQUEST,

            ServiceError::SessionInvalid | ServiceError::SessionExpired => StatusCode::UNAUTHORIZED,

            ServiceError::VerificationRequired(_) | ServiceError::PortalClosed(_) => StatusCode::FORBIDDEN,

            ServiceError::WrongState { .. }
            | ServiceError::AlreadyProcessed { .. }
            | ServiceError::PaymentConflict { .. } => StatusCode::CONFLICT,

            ServiceError::PaymentProcessing(_) => StatusCode::ACCEPTED,

            ServiceError::RateLimited => StatusCode::TOO_MANY_REQUESTS,

            ServiceError::PaymentProvider(_) => StatusCode::BAD_GATEWAY,

            ServiceError::OtpDeliveryFailed(_)
            | ServiceError::DatabaseUpdateFailed { .. }
            | ServiceError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for the `error` field of responses.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidPricingInput(_) => "invalid_pricing_input",
            ServiceError::ProposalNotFound(_) => "not_found",
            ServiceError::WrongState { .. } => "wrong_state",
            ServiceError::AlreadyProcessed { .. } => "already_processed",
            ServiceError::ProposalExpired(_) => "expired",
            ServiceError::SessionInvalid => "session_invalid",
            ServiceError::SessionExpired => "session_expired",
            ServiceError::VerificationRequired(_) => "verification_required",
            ServiceError::RateLimited => "rate_limited",
            ServiceError::NoActiveCode => "no_active_code",
            ServiceError::OtpExpired => "code_expired",
            ServiceError::CodeMismatch { .. } => "code_mismatch",
            ServiceError::Exhausted => "exhausted",
            ServiceError::OtpDeliveryFailed(_) => "delivery_failed",
            ServiceError::PaymentConflict { .. } => "payment_conflict",
            ServiceError::PaymentProcessing(_) => "payment_processing",
            ServiceError::PaymentFailed(_) => "payment_failed",
            ServiceError::PaymentCanceled(_) => "payment_canceled",
            ServiceError::UnexpectedPaymentStatus { .. } => "unexpected_payment_status",
            ServiceError::AmountMismatch { .. } => "amount_mismatch",
            ServiceError::ProposalMismatch { .. } => "proposal_mismatch",
            ServiceError::PaymentProvider(_) => "payment_provider_error",
            ServiceError::DatabaseUpdateFailed { .. } => "database_update_failed",
            ServiceError::PortalClosed(_) => "portal_closed",
            ServiceError::IncompleteSelections(_) => "incomplete_selections",
            ServiceError::Validation(_) => "validation_error",
            ServiceError::Database(_) => "internal_error",
        }
    }
}

impl From<ServiceError> for HttpError {
    fn from(error: ServiceError) -> Self {
        let status = error.status_code();
        let code = error.code();
        let message = match &error {
            // Raw driver errors stay in the logs.
            ServiceError::Database(e) => {
                tracing::error!("Database error: {}", e);
                ErrorMessage::ServerError.to_string()
            }
            _ => error.to_string(),
        };
        HttpError::new(message, status).with_code(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_mapping_of_payment_taxonomy() {
        let conflict = ServiceError::PaymentConflict {
            proposal_id: Uuid::new_v4(),
            existing_reference: "pi_a".to_string(),
            supplied_reference: "pi_b".to_string(),
        };
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ServiceError::PaymentProcessing("pi_a".to_string()).status_code(),
            StatusCode::ACCEPTED
        );
        assert_eq!(
            ServiceError::AmountMismatch { expected_minor: 50000, received_minor: 49999 }.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::PortalClosed(Uuid::new_v4()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_database_update_failed_keeps_reference_in_message() {
        let err = ServiceError::DatabaseUpdateFailed {
            reference: "pi_123".to_string(),
            detail: "connection reset".to_string(),
        };
        let http: HttpError = err.into();
        assert_eq!(http.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(http.message.contains("pi_123"));
        assert_eq!(http.code, "database_update_failed");
    }

    #[test]
    fn test_raw_database_errors_are_not_leaked() {
        let http: HttpError = ServiceError::Database(sqlx::Error::RowNotFound).into();
        assert_eq!(http.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!http.message.contains("no rows"));
    }
}
