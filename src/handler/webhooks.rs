use std::sync::Arc;

use axum::{
    body::Bytes,
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Extension, Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    db::proposaldb::ClientScope,
    error::HttpError,
    service::{
        deposit_service::{CLIENT_ID_KEY, PROPOSAL_ID_KEY, TENANT_ID_KEY},
        payment_provider::verify_webhook_signature,
    },
    AppState,
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub fn webhooks_handler() -> Router {
    Router::new().route("/payments", post(payment_webhook))
}

fn metadata_uuid(object: &Value, key: &str) -> Option<Uuid> {
    object["metadata"][key]
        .as_str()
        .and_then(|value| Uuid::parse_str(value).ok())
}

/// Processor callback. Confirms deposits the same way the client-driven
/// verify does, so whichever arrives second is a no-op.
pub async fn payment_webhook(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| HttpError::bad_request("Missing or invalid webhook signature"))?;

    if !verify_webhook_signature(
        &body,
        signature,
        &app_state.env.payment_webhook_secret,
        Utc::now().timestamp(),
        SIGNATURE_TOLERANCE_SECS,
    ) {
        tracing::warn!("Invalid payment webhook signature received");
        return Err(HttpError::unauthorized("Invalid webhook signature"));
    }

    let event: Value = serde_json::from_slice(&body)
        .map_err(|e| HttpError::bad_request(format!("Invalid webhook payload: {}", e)))?;
    let event_type = event["type"]
        .as_str()
        .ok_or_else(|| HttpError::bad_request("Missing event type in webhook payload"))?;

    match event_type {
        "payment_intent.succeeded" => {
            let object = &event["data"]["object"];
            let target = (
                object["id"].as_str().filter(|id| !id.is_empty()),
                metadata_uuid(object, PROPOSAL_ID_KEY),
                metadata_uuid(object, TENANT_ID_KEY),
                metadata_uuid(object, CLIENT_ID_KEY),
            );
            let (Some(reference), Some(proposal_id), Some(tenant_id), Some(client_id)) = target else {
                tracing::warn!("Payment webhook without proposal metadata, ignoring");
                return Ok(Json(json!({ "status": "ignored" })));
            };

            let scope = ClientScope { tenant_id, client_id };
            match app_state
                .deposit_service
                .verify_deposit_and_open_portal(scope, proposal_id, reference)
                .await
            {
                Ok(outcome) => {
                    tracing::info!(
                        "Webhook confirmed deposit {} for proposal {} (already processed: {})",
                        reference,
                        proposal_id,
                        outcome.already_processed
                    );
                }
                Err(e) if e.status_code().is_server_error() => {
                    tracing::error!("Webhook deposit {} failed: {}", reference, e);
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!("Webhook deposit {} not applied: {}", reference, e);
                    return Ok(Json(json!({ "status": "ignored", "reason": e.code() })));
                }
            }
        }
        _ => {
            tracing::info!("Unhandled payment webhook event: {}", event_type);
        }
    }

    Ok(Json(json!({ "status": "success" })))
}
