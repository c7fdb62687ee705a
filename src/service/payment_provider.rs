// service/payment_provider.rs
use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{config::Config, service::error::ServiceError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentIntentStatus {
    Succeeded,
    Processing,
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Canceled,
    Other(String),
}

impl From<String> for PaymentIntentStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "succeeded" => PaymentIntentStatus::Succeeded,
            "processing" => PaymentIntentStatus::Processing,
            "requires_payment_method" => PaymentIntentStatus::RequiresPaymentMethod,
            "requires_confirmation" => PaymentIntentStatus::RequiresConfirmation,
            "requires_action" => PaymentIntentStatus::RequiresAction,
            "canceled" => PaymentIntentStatus::Canceled,
            _ => PaymentIntentStatus::Other(value),
        }
    }
}

impl From<PaymentIntentStatus> for String {
    fn from(status: PaymentIntentStatus) -> Self {
        status.as_str().to_string()
    }
}

impl PaymentIntentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PaymentIntentStatus::Succeeded => "succeeded",
            PaymentIntentStatus::Processing => "processing",
            PaymentIntentStatus::RequiresPaymentMethod => "requires_payment_method",
            PaymentIntentStatus::RequiresConfirmation => "requires_confirmation",
            PaymentIntentStatus::RequiresAction => "requires_action",
            PaymentIntentStatus::Canceled => "canceled",
            PaymentIntentStatus::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: PaymentIntentStatus,
    /// Minor units (cents).
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<PaymentIntent, ServiceError>;

    async fn retrieve_payment_intent(&self, reference: &str) -> Result<PaymentIntent, ServiceError>;
}

/// Stripe-compatible REST client.
pub struct StripeGateway {
    secret_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl StripeGateway {
    pub fn new(config: &Config) -> Self {
        Self {
            secret_key: config.payment_secret_key.clone(),
            api_base: config.payment_api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn parse_intent(response: reqwest::Response) -> Result<PaymentIntent, ServiceError> {
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServiceError::PaymentProvider(format!("Invalid processor response: {}", e)))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("Payment processor request failed")
                .to_string();
            return Err(ServiceError::PaymentProvider(format!("({}) {}", status.as_u16(), message)));
        }

        serde_json::from_value::<PaymentIntent>(body)
            .map_err(|e| ServiceError::PaymentProvider(format!("Unexpected payment intent shape: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<PaymentIntent, ServiceError> {
        let mut form: Vec<(String, String)> = vec![
            ("amount".to_string(), amount_minor.to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
        ];
        for (key, value) in metadata {
            form.push((format!("metadata[{}]", key), value.clone()));
        }

        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| ServiceError::PaymentProvider(format!("Network error: {}", e)))?;

        let intent = Self::parse_intent(response).await?;
        tracing::info!("Created payment intent {} for {} {}", intent.id, amount_minor, currency);
        Ok(intent)
    }

    async fn retrieve_payment_intent(&self, reference: &str) -> Result<PaymentIntent, ServiceError> {
        let response = self
            .client
            .get(format!(
                "{}/v1/payment_intents/{}",
                self.api_base,
                urlencoding::encode(reference)
            ))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| ServiceError::PaymentProvider(format!("Network error: {}", e)))?;

        Self::parse_intent(response).await
    }
}

/// Checks a `t=<unix>,v1=<hex>` signature header over `"{t}.{payload}"`.
pub fn verify_webhook_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
    tolerance_secs: i64,
) -> bool {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return false;
    };
    if now_unix.abs_diff(timestamp) > tolerance_secs.unsigned_abs() {
        return false;
    }

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    signatures
        .iter()
        .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &str, t: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.", t).as_bytes());
        mac.update(payload);
        format!("t={},v1={}", t, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_webhook_signature_accepts_valid_header() {
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let header = sign(payload, "whsec_test", 1_700_000_000);
        assert!(verify_webhook_signature(payload, &header, "whsec_test", 1_700_000_100, 300));
    }

    #[test]
    fn test_webhook_signature_rejects_tampering_and_replay() {
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let header = sign(payload, "whsec_test", 1_700_000_000);

        assert!(!verify_webhook_signature(b"{}", &header, "whsec_test", 1_700_000_000, 300));
        assert!(!verify_webhook_signature(payload, &header, "other", 1_700_000_000, 300));
        assert!(!verify_webhook_signature(payload, &header, "whsec_test", 1_700_001_000, 300));
        assert!(!verify_webhook_signature(payload, "v1=abc", "whsec_test", 1_700_000_000, 300));
    }

    #[test]
    fn test_webhook_signature_rejects_extreme_timestamps() {
        let now = 1_700_000_000;
        for t in [i64::MIN, i64::MAX, -1] {
            let header = format!("t={},v1=00", t);
            assert!(!verify_webhook_signature(b"{}", &header, "whsec_test", now, 300));
        }
    }

    #[test]
    fn test_status_parsing_keeps_unknown_values() {
        let intent: PaymentIntent = serde_json::from_value(serde_json::json!({
            "id": "pi_1",
            "status": "requires_capture",
            "amount": 50000,
            "currency": "usd",
            "metadata": { "proposalId": "abc" }
        }))
        .unwrap();
        assert_eq!(intent.status, PaymentIntentStatus::Other("requires_capture".to_string()));
        assert_eq!(intent.metadata.get("proposalId").map(String::as_str), Some("abc"));
    }
}
