// service/otp_service.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::Store,
    mail::{mails, sendmail::Notifier},
    models::accessmodel::{AccessSession, OtpMethod, OtpVerification},
    service::{
        access_service::SessionContext,
        audit_service,
        effects::{EffectRunner, Effects},
        error::ServiceError,
    },
    utils::{
        otp_generator::generate_otp,
        token::{constant_time_eq, hash_secret},
    },
};

pub const OTP_EXPIRY_MINUTES: i64 = 10;
pub const OTP_MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpIssued {
    pub otp_id: Uuid,
    pub method: OtpMethod,
    pub masked_target: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OtpVerified {
    pub session: AccessSession,
    pub quote_ids: Vec<Uuid>,
}

#[derive(Clone)]
pub struct OtpService {
    store: Arc<dyn Store>,
    effects: EffectRunner,
    notifier: Arc<dyn Notifier>,
    max_requests: i64,
    window: Duration,
}

/// `jordan@example.com` -> `j*****@example.com`, `+15551234567` -> `********4567`.
pub fn mask_target(method: OtpMethod, target: &str) -> String {
    match method {
        OtpMethod::Email => match target.split_once('@') {
            Some((local, domain)) => {
                let first: String = local.chars().take(1).collect();
                format!("{}{}@{}", first, "*".repeat(local.chars().count().saturating_sub(1)), domain)
            }
            None => "*".repeat(target.len()),
        },
        OtpMethod::Sms => {
            let chars: Vec<char> = target.chars().collect();
            let keep = chars.len().min(4);
            let tail: String = chars[chars.len() - keep..].iter().collect();
            format!("{}{}", "*".repeat(chars.len() - keep), tail)
        }
    }
}

impl OtpService {
    pub fn new(
        store: Arc<dyn Store>,
        effects: EffectRunner,
        notifier: Arc<dyn Notifier>,
        max_requests: i64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            effects,
            notifier,
            max_requests,
            window,
        }
    }

    /// Issues a fresh code for the session and delivers it before returning.
    /// Any earlier open code of the session stops being verifiable.
    pub async fn create_otp_verification(
        &self,
        context: &SessionContext,
        method: OtpMethod,
        target: Option<String>,
    ) -> Result<OtpIssued, ServiceError> {
        let now = Utc::now();
        let session = &context.session;
        let client = &context.client;

        let recent = self
            .store
            .count_otps_since(session.id, now - self.window)
            .await?;
        if recent >= self.max_requests {
            tracing::warn!("OTP rate limit hit for session {} ({} recent)", session.id, recent);
            return Err(ServiceError::RateLimited);
        }

        // Codes only go to the contact details the contractor has on file.
        let on_file = match method {
            OtpMethod::Email => Some(client.email.clone()),
            OtpMethod::Sms => client.phone.clone(),
        }
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            ServiceError::Validation(format!("No {} on file for this customer", contact_label(method)))
        })?;

        if let Some(requested) = target.as_deref().map(str::trim) {
            if !requested.eq_ignore_ascii_case(&on_file) {
                return Err(ServiceError::Validation(format!(
                    "Codes can only be sent to the {} on file",
                    contact_label(method)
                )));
            }
        }

        let code = generate_otp();
        let otp = OtpVerification {
            id: Uuid::new_v4(),
            session_id: session.id,
            client_id: client.id,
            method,
            target: on_file.clone(),
            code_hash: hash_secret(&code),
            attempts: 0,
            max_attempts: OTP_MAX_ATTEMPTS,
            expires_at: now + Duration::minutes(OTP_EXPIRY_MINUTES),
            delivered_at: None,
            verified_at: None,
            superseded_at: None,
            created_at: now,
        };
        let otp = self.store.create_otp(&otp).await?;

        let delivery = match method {
            OtpMethod::Email => {
                let message = mails::otp_email(&on_file, &client.name, &code, OTP_EXPIRY_MINUTES);
                self.notifier.send_email(&message).await
            }
            OtpMethod::Sms => {
                let body = mails::otp_sms(&code, OTP_EXPIRY_MINUTES);
                self.notifier.send_sms(&on_file, &body).await
            }
        };
        if let Err(e) = delivery {
            tracing::error!("Failed to deliver OTP {} for session {}: {}", otp.id, session.id, e);
            return Err(ServiceError::OtpDeliveryFailed(e));
        }

        self.store.mark_otp_delivered(otp.id, Utc::now()).await?;

        let mut effects = Effects::new();
        effects.audit(audit_service::otp_requested(session, &otp));
        self.effects.run(effects).await;

        Ok(OtpIssued {
            otp_id: otp.id,
            method,
            masked_target: mask_target(method, &on_file),
            expires_at: otp.expires_at,
        })
    }

    /// Checks the code against the session's current one. Success upgrades
    /// the session to every sent proposal of the client.
    pub async fn verify_otp(
        &self,
        context: &SessionContext,
        code: &str,
        ip_address: Option<&str>,
    ) -> Result<OtpVerified, ServiceError> {
        let now = Utc::now();
        let session = &context.session;

        let otp = self
            .store
            .get_current_otp(session.id)
            .await?
            .ok_or(ServiceError::NoActiveCode)?;

        if otp.is_expired(now) {
            return Err(ServiceError::OtpExpired);
        }
        if otp.is_exhausted() {
            return Err(ServiceError::Exhausted);
        }

        // Every guess spends an attempt before the code is compared.
        let otp = self
            .store
            .claim_otp_attempt(otp.id)
            .await?
            .ok_or(ServiceError::Exhausted)?;

        if !constant_time_eq(&hash_secret(code.trim()), &otp.code_hash) {
            tracing::info!(
                "Wrong OTP for session {}, {} attempts remaining",
                session.id,
                otp.attempts_remaining()
            );
            return Err(ServiceError::CodeMismatch {
                attempts_remaining: otp.attempts_remaining(),
            });
        }

        if !self.store.mark_otp_verified(otp.id, now).await? {
            return Err(ServiceError::NoActiveCode);
        }

        let quote_ids: Vec<Uuid> = self
            .store
            .list_client_proposals(context.scope())
            .await?
            .into_iter()
            .map(|proposal| proposal.id)
            .collect();
        let session = self
            .store
            .upgrade_session(session.id, quote_ids.clone(), now)
            .await?;

        tracing::info!("Session {} verified, {} proposals unlocked", session.id, quote_ids.len());

        let mut effects = Effects::new();
        effects.audit(audit_service::otp_verified(&session, ip_address));
        self.effects.run(effects).await;

        Ok(OtpVerified { session, quote_ids })
    }
}

fn contact_label(method: OtpMethod) -> &'static str {
    match method {
        OtpMethod::Email => "email address",
        OtpMethod::Sms => "phone number",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::accessdb::AccessExt;
    use crate::models::proposalmodel::ProposalStatus;
    use crate::testing::Harness;

    #[test]
    fn test_mask_target() {
        assert_eq!(mask_target(OtpMethod::Email, "jordan@example.com"), "j*****@example.com");
        assert_eq!(mask_target(OtpMethod::Sms, "+15551234567"), "********4567");
        assert_eq!(mask_target(OtpMethod::Sms, "123"), "123");
    }

    #[tokio::test]
    async fn test_fourth_request_in_window_is_rate_limited() {
        let h = Harness::new().await;
        let context = h.context().await;
        let otp_service = &h.state.otp_service;

        for _ in 0..3 {
            otp_service
                .create_otp_verification(&context, OtpMethod::Email, None)
                .await
                .unwrap();
        }
        let err = otp_service
            .create_otp_verification(&context, OtpMethod::Email, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RateLimited));
        assert_eq!(h.notifier.emails().len(), 3);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_surfaced() {
        let h = Harness::new().await;
        let context = h.context().await;
        h.notifier.fail_deliveries(true);

        let err = h
            .state
            .otp_service
            .create_otp_verification(&context, OtpMethod::Email, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::OtpDeliveryFailed(_)));
    }

    #[tokio::test]
    async fn test_code_only_goes_to_contact_on_file() {
        let h = Harness::new().await;
        let context = h.context().await;

        let err = h
            .state
            .otp_service
            .create_otp_verification(&context, OtpMethod::Email, Some("attacker@evil.example".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        // The demo client has no phone number.
        let err = h
            .state
            .otp_service
            .create_otp_verification(&context, OtpMethod::Sms, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_wrong_codes_count_down_then_exhaust() {
        let h = Harness::new().await;
        let context = h.context().await;
        let otp_service = &h.state.otp_service;
        otp_service
            .create_otp_verification(&context, OtpMethod::Email, None)
            .await
            .unwrap();
        let code = h.notifier.last_otp_code().unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for expected_remaining in (0..OTP_MAX_ATTEMPTS).rev() {
            let err = otp_service.verify_otp(&context, wrong, None).await.unwrap_err();
            match err {
                ServiceError::CodeMismatch { attempts_remaining } => {
                    assert_eq!(attempts_remaining, expected_remaining)
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        // Even the right code is refused once the attempts are gone.
        let err = otp_service.verify_otp(&context, &code, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Exhausted));
    }

    #[tokio::test]
    async fn test_parallel_guesses_cannot_outrun_attempt_limit() {
        let h = Harness::new().await;
        let context = h.context().await;
        let otp_service = &h.state.otp_service;
        otp_service
            .create_otp_verification(&context, OtpMethod::Email, None)
            .await
            .unwrap();
        let code = h.notifier.last_otp_code().unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        let guesses = (0..20).map(|_| otp_service.verify_otp(&context, wrong, None));
        let results = futures::future::join_all(guesses).await;

        let mismatches = results
            .iter()
            .filter(|r| matches!(r, Err(ServiceError::CodeMismatch { .. })))
            .count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(ServiceError::Exhausted)))
            .count();
        assert_eq!(mismatches, OTP_MAX_ATTEMPTS as usize);
        assert_eq!(exhausted, 20 - OTP_MAX_ATTEMPTS as usize);

        let err = otp_service.verify_otp(&context, &code, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Exhausted));
    }

    #[tokio::test]
    async fn test_attempt_claims_stop_at_the_limit() {
        let h = Harness::new().await;
        let context = h.context().await;
        let issued = h
            .state
            .otp_service
            .create_otp_verification(&context, OtpMethod::Email, None)
            .await
            .unwrap();

        for spent in 1..=OTP_MAX_ATTEMPTS {
            let claimed = h.store.claim_otp_attempt(issued.otp_id).await.unwrap().unwrap();
            assert_eq!(claimed.attempts, spent);
        }
        assert!(h.store.claim_otp_attempt(issued.otp_id).await.unwrap().is_none());
        assert!(h.store.mark_otp_verified(issued.otp_id, Utc::now()).await.unwrap());
        assert!(!h.store.mark_otp_verified(issued.otp_id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_upgrades_session_to_all_sent_proposals() {
        let h = Harness::new().await;
        let context = h.context().await;
        let second = h.add_proposal(ProposalStatus::Sent).await;
        let draft = h.add_proposal(ProposalStatus::Draft).await;

        h.state
            .otp_service
            .create_otp_verification(&context, OtpMethod::Email, None)
            .await
            .unwrap();
        let code = h.notifier.last_otp_code().unwrap();

        let verified = h
            .state
            .otp_service
            .verify_otp(&context, &code, Some("10.0.0.2"))
            .await
            .unwrap();
        assert!(verified.session.is_verified);
        assert!(verified.quote_ids.contains(&h.proposal.id));
        assert!(verified.quote_ids.contains(&second.id));
        assert!(!verified.quote_ids.contains(&draft.id));

        // The code cannot be replayed.
        let err = h
            .state
            .otp_service
            .verify_otp(&context, &code, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoActiveCode));
    }

    #[tokio::test]
    async fn test_new_code_supersedes_the_previous_one() {
        let h = Harness::new().await;
        let context = h.context().await;
        let otp_service = &h.state.otp_service;

        otp_service
            .create_otp_verification(&context, OtpMethod::Email, None)
            .await
            .unwrap();
        let first = h.notifier.last_otp_code().unwrap();
        otp_service
            .create_otp_verification(&context, OtpMethod::Email, None)
            .await
            .unwrap();
        let second = h.notifier.last_otp_code().unwrap();

        if first != second {
            let err = otp_service.verify_otp(&context, &first, None).await.unwrap_err();
            assert!(matches!(err, ServiceError::CodeMismatch { .. }));
        }
        assert!(otp_service.verify_otp(&context, &second, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_code_is_refused() {
        let h = Harness::new().await;
        let context = h.context().await;
        let issued = h
            .state
            .otp_service
            .create_otp_verification(&context, OtpMethod::Email, None)
            .await
            .unwrap();
        let code = h.notifier.last_otp_code().unwrap();
        h.store
            .update_otp_raw(issued.otp_id, |otp| otp.expires_at = Utc::now() - Duration::seconds(1))
            .await;

        let err = h
            .state
            .otp_service
            .verify_otp(&context, &code, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::OtpExpired));
    }
}
