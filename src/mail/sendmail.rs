use std::fs;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::{sleep, Duration};

use crate::config::Config;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 1000;

/// A rendered-on-send email: template path plus `{{placeholder}}` values.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub template_path: &'static str,
    pub placeholders: Vec<(String, String)>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), String>;
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), String>;
}

pub fn render_template(template_path: &str, placeholders: &[(String, String)]) -> Result<String, String> {
    let mut html_template = match fs::read_to_string(template_path) {
        Ok(content) => content,
        Err(e) => {
            tracing::error!("Failed to read email template {}: {}", template_path, e);
            return Err(format!("Template not found: {}", template_path));
        }
    };

    for (key, value) in placeholders {
        html_template = html_template.replace(key, value);
    }
    Ok(html_template)
}

/// Sends email through the Resend API and SMS through an optional HTTP
/// gateway.
pub struct ResendMailer {
    api_key: Option<String>,
    from_email: String,
    sms_gateway_url: Option<String>,
    client: reqwest::Client,
}

impl ResendMailer {
    pub fn new(config: &Config) -> Self {
        Self {
            api_key: config.resend_api_key.clone(),
            from_email: config.from_email.clone(),
            sms_gateway_url: config.sms_gateway_url.clone(),
            client: reqwest::Client::new(),
        }
    }

    async fn send_with_retries(&self, to_email: &str, subject: &str, html_body: &str) -> Result<(), String> {
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match self.send_via_resend(to_email, subject, html_body).await {
                Ok(email_id) => {
                    tracing::info!("Email sent to {} (id: {})", to_email, email_id);
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRIES {
                        let delay = RETRY_DELAY_MS * (2_u64.pow(attempt - 1));
                        tracing::warn!(
                            "Email send attempt {} failed for {}. Retrying in {}ms...",
                            attempt,
                            to_email,
                            delay
                        );
                        sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        let error_msg = last_error
            .map(|e| format!("Failed after {} retries: {}", MAX_RETRIES, e))
            .unwrap_or_else(|| "Unknown email sending error".to_string());

        tracing::error!("Email failed for {}: {}", to_email, error_msg);
        Err(error_msg)
    }

    async fn send_via_resend(&self, to_email: &str, subject: &str, html_body: &str) -> Result<String, String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| "RESEND_API_KEY environment variable not set".to_string())?;

        let request_body = json!({
            "from": self.from_email,
            "to": to_email,
            "subject": subject,
            "html": html_body,
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .bearer_auth(api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| format!("Network error: {}", e))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .unwrap_or_else(|_| "No response body".to_string());

        if status.is_success() {
            if let Ok(body) = serde_json::from_str::<serde_json::Value>(&response_text) {
                if let Some(id) = body.get("id").and_then(|v| v.as_str()) {
                    return Ok(id.to_string());
                }
            }
            Ok("success".to_string())
        } else {
            Err(format!("Resend API error ({}): {}", status.as_u16(), response_text))
        }
    }
}

#[async_trait]
impl Notifier for ResendMailer {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), String> {
        if message.to.is_empty() {
            return Err("Email recipient cannot be empty".to_string());
        }
        if !message.to.contains('@') {
            return Err(format!("Invalid email address: {}", message.to));
        }
        if self.api_key.is_none() {
            tracing::warn!("Email delivery disabled, '{}' to {} not sent", message.subject, message.to);
            return Err("Email delivery is not configured".to_string());
        }

        let html = render_template(message.template_path, &message.placeholders)?;
        self.send_with_retries(&message.to, &message.subject, &html).await
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), String> {
        let Some(gateway) = self.sms_gateway_url.as_deref() else {
            return Err("SMS delivery is not configured".to_string());
        };

        let response = self
            .client
            .post(gateway)
            .json(&json!({ "to": to, "body": body }))
            .send()
            .await
            .map_err(|e| format!("Network error: {}", e))?;

        if response.status().is_success() {
            tracing::info!("SMS sent to {}", to);
            Ok(())
        } else {
            Err(format!("SMS gateway error ({})", response.status().as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template_fills_placeholders() {
        let html = render_template(
            "src/mail/templates/OTP-email.html",
            &[
                ("{{client_name}}".to_string(), "Jordan".to_string()),
                ("{{otp_code}}".to_string(), "123456".to_string()),
                ("{{expires_minutes}}".to_string(), "10".to_string()),
            ],
        )
        .unwrap();
        assert!(html.contains("123456"));
        assert!(html.contains("Jordan"));
        assert!(!html.contains("{{otp_code}}"));
    }

    #[test]
    fn test_missing_template_is_an_error() {
        assert!(render_template("src/mail/templates/missing.html", &[]).is_err());
    }
}
