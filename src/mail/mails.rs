use super::sendmail::EmailMessage;
use crate::{
    models::proposalmodel::{Client, Job, Proposal, Tenant},
    utils::money::format_money,
};

const OTP_TEMPLATE: &str = "src/mail/templates/OTP-email.html";
const CONTRACTOR_TEMPLATE: &str = "src/mail/templates/Contractor-notice.html";
const DEPOSIT_TEMPLATE: &str = "src/mail/templates/Deposit-confirmation.html";

fn placeholder(key: &str, value: impl Into<String>) -> (String, String) {
    (format!("{{{{{}}}}}", key), value.into())
}

pub fn otp_email(to_email: &str, client_name: &str, otp_code: &str, expires_minutes: i64) -> EmailMessage {
    EmailMessage {
        to: to_email.to_string(),
        subject: "Your verification code".to_string(),
        template_path: OTP_TEMPLATE,
        placeholders: vec![
            placeholder("client_name", client_name),
            placeholder("otp_code", otp_code),
            placeholder("expires_minutes", expires_minutes.to_string()),
        ],
    }
}

pub fn otp_sms(otp_code: &str, expires_minutes: i64) -> String {
    format!(
        "Your verification code is {}. It expires in {} minutes.",
        otp_code, expires_minutes
    )
}

fn contractor_notice(tenant: &Tenant, proposal: &Proposal, subject: String, headline: String, body: String) -> EmailMessage {
    EmailMessage {
        to: tenant.contact_email.clone(),
        subject,
        template_path: CONTRACTOR_TEMPLATE,
        placeholders: vec![
            placeholder("tenant_name", tenant.name.clone()),
            placeholder("headline", headline),
            placeholder("body", body),
            placeholder("quote_number", proposal.quote_number.clone()),
        ],
    }
}

pub fn proposal_viewed(tenant: &Tenant, client: &Client, proposal: &Proposal) -> EmailMessage {
    contractor_notice(
        tenant,
        proposal,
        format!("{} opened proposal {}", client.name, proposal.quote_number),
        "Your proposal was viewed".to_string(),
        format!("{} opened proposal {} for the first time.", client.name, proposal.quote_number),
    )
}

pub fn proposal_accepted(tenant: &Tenant, client: &Client, proposal: &Proposal) -> EmailMessage {
    let tier = proposal.selected_tier.map(|t| t.as_str()).unwrap_or("base");
    let deposit = proposal
        .deposit_amount
        .as_ref()
        .map(|d| format_money(d, &tenant.currency))
        .unwrap_or_default();
    contractor_notice(
        tenant,
        proposal,
        format!("Proposal {} accepted", proposal.quote_number),
        "Your proposal was accepted".to_string(),
        format!(
            "{} accepted the {} option for {}. A deposit of {} is now due.",
            client.name,
            tier,
            format_money(&proposal.total, &tenant.currency),
            deposit
        ),
    )
}

pub fn proposal_declined(tenant: &Tenant, client: &Client, proposal: &Proposal) -> EmailMessage {
    let reason = proposal.decline_reason.clone().unwrap_or_else(|| "No reason given".to_string());
    contractor_notice(
        tenant,
        proposal,
        format!("Proposal {} declined", proposal.quote_number),
        "Your proposal was declined".to_string(),
        format!("{} declined proposal {}. Reason: {}", client.name, proposal.quote_number, reason),
    )
}

pub fn deposit_received(tenant: &Tenant, client: &Client, proposal: &Proposal, job: &Job) -> EmailMessage {
    contractor_notice(
        tenant,
        proposal,
        format!("Deposit received for {}", proposal.quote_number),
        "Deposit received, job created".to_string(),
        format!(
            "{} paid a deposit of {} (payment {}). The selection portal is open.",
            client.name,
            format_money(&job.deposit_amount, &tenant.currency),
            job.deposit_transaction_id
        ),
    )
}

pub fn deposit_confirmation(tenant: &Tenant, client: &Client, proposal: &Proposal, job: &Job) -> EmailMessage {
    let closes = proposal
        .portal_closed_at
        .map(|at| at.format("%B %-d, %Y").to_string())
        .unwrap_or_default();
    EmailMessage {
        to: client.email.clone(),
        subject: format!("Deposit received for {}", proposal.quote_number),
        template_path: DEPOSIT_TEMPLATE,
        placeholders: vec![
            placeholder("client_name", client.name.clone()),
            placeholder("tenant_name", tenant.name.clone()),
            placeholder("quote_number", proposal.quote_number.clone()),
            placeholder("deposit_amount", format_money(&job.deposit_amount, &tenant.currency)),
            placeholder("portal_closes", closes),
        ],
    }
}

pub fn portal_expired(tenant: &Tenant, proposal: &Proposal) -> EmailMessage {
    contractor_notice(
        tenant,
        proposal,
        format!("Selection portal closed for {}", proposal.quote_number),
        "Selection window ended".to_string(),
        format!(
            "The selection portal for {} closed before the customer submitted every selection.",
            proposal.quote_number
        ),
    )
}

pub fn selections_submitted(tenant: &Tenant, client: &Client, proposal: &Proposal) -> EmailMessage {
    contractor_notice(
        tenant,
        proposal,
        format!("Selections complete for {}", proposal.quote_number),
        "All selections submitted".to_string(),
        format!(
            "{} submitted colours and sheens for {} areas. The work order is ready.",
            client.name,
            proposal.areas.len()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_uses_double_braces() {
        assert_eq!(placeholder("otp_code", "1").0, "{{otp_code}}");
    }

    #[test]
    fn test_otp_email_carries_code() {
        let message = otp_email("a@example.com", "Ana", "654321", 10);
        assert_eq!(message.template_path, OTP_TEMPLATE);
        assert!(message
            .placeholders
            .contains(&("{{otp_code}}".to_string(), "654321".to_string())));
    }
}
