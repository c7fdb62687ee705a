use std::sync::Arc;

use axum::{
    extract::Path,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::{
        proposaldtos::{AcceptProposalDto, DeclineProposalDto, DepositVerifiedDto, VerifyDepositDto},
        ApiResponse,
    },
    error::HttpError,
    middleware::authorize_quote,
    service::{access_service::SessionContext, proposal_service::ProposalSummary},
    AppState,
};

pub fn proposals_handler() -> Router {
    Router::new()
        .route("/", get(list_proposals))
        .route("/:proposal_id", get(get_proposal))
        .route("/:proposal_id/accept", post(accept_proposal))
        .route("/:proposal_id/decline", post(decline_proposal))
        .route("/:proposal_id/create-payment-intent", post(create_payment_intent))
        .route("/:proposal_id/verify-deposit", post(verify_deposit))
}

pub async fn list_proposals(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<SessionContext>,
) -> Result<impl IntoResponse, HttpError> {
    let proposals = app_state.proposal_service.list_proposals(&context).await?;

    Ok(Json(ApiResponse::success("Proposals retrieved successfully", proposals)))
}

pub async fn get_proposal(
    Path(proposal_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<SessionContext>,
) -> Result<impl IntoResponse, HttpError> {
    let scope = authorize_quote(&app_state, &context, proposal_id).await?;
    let view = app_state.proposal_service.get_proposal(scope, proposal_id).await?;

    Ok(Json(ApiResponse::success("Proposal retrieved successfully", view)))
}

pub async fn accept_proposal(
    Path(proposal_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<SessionContext>,
    Json(body): Json<AcceptProposalDto>,
) -> Result<impl IntoResponse, HttpError> {
    let scope = authorize_quote(&app_state, &context, proposal_id).await?;
    let proposal = app_state
        .proposal_service
        .accept(scope, proposal_id, body.selected_tier)
        .await?;

    Ok(Json(ApiResponse::success(
        "Proposal accepted, please pay the deposit to continue",
        ProposalSummary::from(&proposal),
    )))
}

pub async fn decline_proposal(
    Path(proposal_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<SessionContext>,
    body: Option<Json<DeclineProposalDto>>,
) -> Result<impl IntoResponse, HttpError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let scope = authorize_quote(&app_state, &context, proposal_id).await?;
    let proposal = app_state
        .proposal_service
        .decline(scope, proposal_id, body.reason)
        .await?;

    Ok(Json(ApiResponse::success(
        "Proposal declined",
        ProposalSummary::from(&proposal),
    )))
}

pub async fn create_payment_intent(
    Path(proposal_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<SessionContext>,
) -> Result<impl IntoResponse, HttpError> {
    let scope = authorize_quote(&app_state, &context, proposal_id).await?;
    let created = app_state
        .deposit_service
        .create_payment_intent(scope, proposal_id)
        .await?;

    Ok(Json(ApiResponse::success("Payment intent created", created)))
}

pub async fn verify_deposit(
    Path(proposal_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<SessionContext>,
    Json(body): Json<VerifyDepositDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let scope = authorize_quote(&app_state, &context, proposal_id).await?;
    let outcome = app_state
        .deposit_service
        .verify_deposit_and_open_portal(scope, proposal_id, body.payment_intent_id.trim())
        .await?;

    let message = if outcome.already_processed {
        "Deposit already verified"
    } else {
        "Deposit verified, the selection portal is open"
    };
    Ok(Json(ApiResponse::success(message, DepositVerifiedDto::from(&outcome))))
}
