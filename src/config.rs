// config.rs
use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    /// Without a database URL the service runs on the in-memory store.
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub app_url: String,
    pub port: u16,
    // Payment processor
    pub payment_secret_key: String,
    pub payment_api_base: String,
    pub payment_webhook_secret: String,
    // Email / documents
    pub resend_api_key: Option<String>,
    pub from_email: String,
    pub sms_gateway_url: Option<String>,
    pub document_service_url: Option<String>,
    // Access rules
    pub session_ttl_hours: i64,
    pub magic_link_ttl_hours: i64,
    pub otp_max_requests: i64,
    pub otp_window_minutes: i64,
    pub default_portal_duration_days: i64,
    pub allowed_origins: Vec<String>,
    pub log_level: String,
}

impl Config {
    pub fn init() -> anyhow::Result<Config> {
        let database_url = optional_var("DATABASE_URL");
        let redis_url = optional_var("REDIS_URL");
        let app_url = std::env::var("APP_URL")
            .unwrap_or_else(|_| "http://localhost:5173".to_string());

        let port = parse_var("PORT", 8000u16)?;

        let payment_secret_key = std::env::var("PAYMENT_SECRET_KEY")
            .unwrap_or_else(|_| "sk_test_placeholder".to_string());
        let payment_api_base = std::env::var("PAYMENT_API_BASE")
            .unwrap_or_else(|_| "https://api.stripe.com".to_string());
        let payment_webhook_secret = std::env::var("PAYMENT_WEBHOOK_SECRET")
            .unwrap_or_else(|_| "whsec_placeholder".to_string());

        let resend_api_key = optional_var("RESEND_API_KEY");
        let from_email = std::env::var("FROM_EMAIL")
            .unwrap_or_else(|_| "Quotedesk <noreply@quotedesk.app>".to_string());
        let sms_gateway_url = optional_var("SMS_GATEWAY_URL");
        let document_service_url = optional_var("DOCUMENT_SERVICE_URL");

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .map(|origins| {
                origins
                    .split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| vec![app_url.clone()]);

        Ok(Config {
            database_url,
            redis_url,
            app_url,
            port,
            payment_secret_key,
            payment_api_base,
            payment_webhook_secret,
            resend_api_key,
            from_email,
            sms_gateway_url,
            document_service_url,
            session_ttl_hours: parse_var("SESSION_TTL_HOURS", 72)?,
            magic_link_ttl_hours: parse_var("MAGIC_LINK_TTL_HOURS", 24 * 7)?,
            otp_max_requests: parse_var("OTP_MAX_REQUESTS", 3)?,
            otp_window_minutes: parse_var("OTP_WINDOW_MINUTES", 15)?,
            default_portal_duration_days: parse_var("DEFAULT_PORTAL_DURATION_DAYS", 14)?,
            allowed_origins,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "debug".to_string()),
        })
    }

    /// Settings used by unit and router tests.
    #[cfg(test)]
    pub fn for_tests() -> Config {
        Config {
            database_url: None,
            redis_url: None,
            app_url: "http://localhost:5173".to_string(),
            port: 0,
            payment_secret_key: "sk_test".to_string(),
            payment_api_base: "http://127.0.0.1:9".to_string(),
            payment_webhook_secret: "whsec_test".to_string(),
            resend_api_key: None,
            from_email: "Quotedesk <noreply@quotedesk.test>".to_string(),
            sms_gateway_url: None,
            document_service_url: None,
            session_ttl_hours: 72,
            magic_link_ttl_hours: 168,
            otp_max_requests: 3,
            otp_window_minutes: 15,
            default_portal_duration_days: 14,
            allowed_origins: vec!["http://localhost:5173".to_string()],
            log_level: "debug".to_string(),
        }
    }
}

fn optional_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} must be a number, got '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}
