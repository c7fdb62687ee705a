// db/accessdb.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Error;
use uuid::Uuid;

use super::db::DBClient;
use crate::models::accessmodel::*;

#[async_trait]
pub trait AccessExt {
    // Magic links
    async fn create_magic_link(&self, link: &MagicLink) -> Result<MagicLink, Error>;
    async fn get_magic_link_by_token(&self, token: &str) -> Result<Option<MagicLink>, Error>;
    /// Counts one use against the link and binds it to `session_id`.
    /// `None` when the link has no uses left.
    async fn record_magic_link_use(
        &self,
        link_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<MagicLink>, Error>;

    // Sessions
    async fn create_session(&self, session: &AccessSession) -> Result<AccessSession, Error>;
    async fn get_session(&self, session_id: Uuid) -> Result<Option<AccessSession>, Error>;
    async fn get_session_by_token(&self, token: &str) -> Result<Option<AccessSession>, Error>;
    async fn touch_session(
        &self,
        session_id: Uuid,
        ip_address: Option<String>,
        user_agent: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), Error>;
    async fn upgrade_session(
        &self,
        session_id: Uuid,
        quote_ids: Vec<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<AccessSession, Error>;
    async fn expire_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), Error>;

    // One-time codes
    /// Persists a new code and supersedes every earlier open code of the
    /// same session.
    async fn create_otp(&self, otp: &OtpVerification) -> Result<OtpVerification, Error>;
    async fn count_otps_since(&self, session_id: Uuid, since: DateTime<Utc>) -> Result<i64, Error>;
    /// The newest code of the session that is neither superseded nor verified.
    async fn get_current_otp(&self, session_id: Uuid) -> Result<Option<OtpVerification>, Error>;
    /// Spends one attempt on an open code. `None` when the code is
    /// exhausted, verified or superseded.
    async fn claim_otp_attempt(&self, otp_id: Uuid) -> Result<Option<OtpVerification>, Error>;
    async fn mark_otp_delivered(&self, otp_id: Uuid, now: DateTime<Utc>) -> Result<(), Error>;
    /// `false` when the code was already verified or superseded.
    async fn mark_otp_verified(&self, otp_id: Uuid, now: DateTime<Utc>) -> Result<bool, Error>;
}

const SESSION_COLUMNS: &str = r#"
    id, token, tenant_id, client_id, magic_link_id, quote_ids, is_verified,
    verified_at, expires_at, ip_address, user_agent, last_accessed_at, created_at
"#;

const MAGIC_LINK_COLUMNS: &str = r#"
    id, token, tenant_id, client_id, quote_id, expires_at, max_uses,
    use_count, session_id, last_used_at, created_at
"#;

const OTP_COLUMNS: &str = r#"
    id, session_id, client_id, method, target, code_hash, attempts,
    max_attempts, expires_at, delivered_at, verified_at, superseded_at, created_at
"#;

#[async_trait]
impl AccessExt for DBClient {
    async fn create_magic_link(&self, link: &MagicLink) -> Result<MagicLink, Error> {
        sqlx::query_as::<_, MagicLink>(&format!(
            r#"
            INSERT INTO magic_links
            (id, token, tenant_id, client_id, quote_id, expires_at, max_uses, use_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8)
            RETURNING {}
            "#,
            MAGIC_LINK_COLUMNS
        ))
        .bind(link.id)
        .bind(&link.token)
        .bind(link.tenant_id)
        .bind(link.client_id)
        .bind(link.quote_id)
        .bind(link.expires_at)
        .bind(link.max_uses)
        .bind(link.created_at)
        .fetch_one(&self.pool)
        .await
    }

    async fn get_magic_link_by_token(&self, token: &str) -> Result<Option<MagicLink>, Error> {
        sqlx::query_as::<_, MagicLink>(&format!(
            "SELECT {} FROM magic_links WHERE token = $1",
            MAGIC_LINK_COLUMNS
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
    }

    async fn record_magic_link_use(
        &self,
        link_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<MagicLink>, Error> {
        sqlx::query_as::<_, MagicLink>(&format!(
            r#"
            UPDATE magic_links
            SET use_count = use_count + 1, session_id = $2, last_used_at = $3
            WHERE id = $1 AND (max_uses IS NULL OR use_count < max_uses)
            RETURNING {}
            "#,
            MAGIC_LINK_COLUMNS
        ))
        .bind(link_id)
        .bind(session_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
    }

    async fn create_session(&self, session: &AccessSession) -> Result<AccessSession, Error> {
        sqlx::query_as::<_, AccessSession>(&format!(
            r#"
            INSERT INTO access_sessions
            (id, token, tenant_id, client_id, magic_link_id, quote_ids, is_verified,
             expires_at, ip_address, user_agent, last_accessed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(session.id)
        .bind(&session.token)
        .bind(session.tenant_id)
        .bind(session.client_id)
        .bind(session.magic_link_id)
        .bind(&session.quote_ids)
        .bind(session.is_verified)
        .bind(session.expires_at)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(session.last_accessed_at)
        .bind(session.created_at)
        .fetch_one(&self.pool)
        .await
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<AccessSession>, Error> {
        sqlx::query_as::<_, AccessSession>(&format!(
            "SELECT {} FROM access_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_session_by_token(&self, token: &str) -> Result<Option<AccessSession>, Error> {
        sqlx::query_as::<_, AccessSession>(&format!(
            "SELECT {} FROM access_sessions WHERE token = $1",
            SESSION_COLUMNS
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
    }

    async fn touch_session(
        &self,
        session_id: Uuid,
        ip_address: Option<String>,
        user_agent: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE access_sessions
            SET last_accessed_at = $2,
                ip_address = COALESCE($3, ip_address),
                user_agent = COALESCE($4, user_agent)
            WHERE id = $1
            "#,
        )
        .bind(session_id)
        .bind(now)
        .bind(ip_address)
        .bind(user_agent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upgrade_session(
        &self,
        session_id: Uuid,
        quote_ids: Vec<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<AccessSession, Error> {
        sqlx::query_as::<_, AccessSession>(&format!(
            r#"
            UPDATE access_sessions
            SET is_verified = TRUE, verified_at = $2, quote_ids = $3
            WHERE id = $1
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(now)
        .bind(&quote_ids)
        .fetch_one(&self.pool)
        .await
    }

    async fn expire_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query("UPDATE access_sessions SET expires_at = $2 WHERE id = $1 AND expires_at > $2")
            .bind(session_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_otp(&self, otp: &OtpVerification) -> Result<OtpVerification, Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE otp_verifications
            SET superseded_at = $2
            WHERE session_id = $1 AND superseded_at IS NULL AND verified_at IS NULL
            "#,
        )
        .bind(otp.session_id)
        .bind(otp.created_at)
        .execute(&mut *tx)
        .await?;

        let created = sqlx::query_as::<_, OtpVerification>(&format!(
            r#"
            INSERT INTO otp_verifications
            (id, session_id, client_id, method, target, code_hash, attempts, max_attempts, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, $9)
            RETURNING {}
            "#,
            OTP_COLUMNS
        ))
        .bind(otp.id)
        .bind(otp.session_id)
        .bind(otp.client_id)
        .bind(otp.method)
        .bind(&otp.target)
        .bind(&otp.code_hash)
        .bind(otp.max_attempts)
        .bind(otp.expires_at)
        .bind(otp.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn count_otps_since(&self, session_id: Uuid, since: DateTime<Utc>) -> Result<i64, Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM otp_verifications WHERE session_id = $1 AND created_at > $2",
        )
        .bind(session_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
    }

    async fn get_current_otp(&self, session_id: Uuid) -> Result<Option<OtpVerification>, Error> {
        sqlx::query_as::<_, OtpVerification>(&format!(
            r#"
            SELECT {} FROM otp_verifications
            WHERE session_id = $1 AND superseded_at IS NULL AND verified_at IS NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            OTP_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn claim_otp_attempt(&self, otp_id: Uuid) -> Result<Option<OtpVerification>, Error> {
        sqlx::query_as::<_, OtpVerification>(&format!(
            r#"
            UPDATE otp_verifications
            SET attempts = attempts + 1
            WHERE id = $1
              AND attempts < max_attempts
              AND verified_at IS NULL
              AND superseded_at IS NULL
            RETURNING {}
            "#,
            OTP_COLUMNS
        ))
        .bind(otp_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn mark_otp_delivered(&self, otp_id: Uuid, now: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query("UPDATE otp_verifications SET delivered_at = $2 WHERE id = $1")
            .bind(otp_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_otp_verified(&self, otp_id: Uuid, now: DateTime<Utc>) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE otp_verifications SET verified_at = $2
            WHERE id = $1 AND verified_at IS NULL AND superseded_at IS NULL
            "#,
        )
        .bind(otp_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
