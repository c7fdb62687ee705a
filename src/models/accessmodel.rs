// models/accessmodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MagicLink {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub token: String,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub quote_id: Uuid,
    pub expires_at: DateTime<Utc>,
    /// `None` means unlimited uses until expiry.
    pub max_uses: Option<i32>,
    pub use_count: i32,
    pub session_id: Option<Uuid>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MagicLink {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_consumed(&self) -> bool {
        self.max_uses.map_or(false, |max| self.use_count >= max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AccessSession {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub token: String,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub magic_link_id: Option<Uuid>,
    pub quote_ids: Vec<Uuid>,
    pub is_verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AccessSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn can_access(&self, quote_id: Uuid) -> bool {
        self.quote_ids.contains(&quote_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "otp_method", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OtpMethod {
    Email,
    Sms,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OtpVerification {
    pub id: Uuid,
    pub session_id: Uuid,
    pub client_id: Uuid,
    pub method: OtpMethod,
    pub target: String,
    #[serde(skip_serializing)]
    pub code_hash: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub expires_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OtpVerification {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn attempts_remaining(&self) -> i32 {
        (self.max_attempts - self.attempts).max(0)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts_remaining() == 0
    }
}
