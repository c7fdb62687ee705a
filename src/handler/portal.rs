use std::sync::Arc;

use axum::{
    extract::Path,
    response::IntoResponse,
    routing::{get, post, put},
    Extension, Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::{
        proposaldtos::{SaveSelectionsDto, SelectionsSubmittedDto},
        ApiResponse,
    },
    error::HttpError,
    middleware::authorize_quote,
    service::access_service::SessionContext,
    AppState,
};

pub fn portal_handler() -> Router {
    Router::new()
        .route("/:proposal_id/portal-status", get(portal_status))
        .route("/:proposal_id/selections", put(save_selections))
        .route("/:proposal_id/selections/submit", post(submit_selections))
}

pub async fn portal_status(
    Path(proposal_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<SessionContext>,
) -> Result<impl IntoResponse, HttpError> {
    let scope = authorize_quote(&app_state, &context, proposal_id).await?;
    let status = app_state.portal_service.portal_status(scope, proposal_id).await?;

    Ok(Json(ApiResponse::success("Portal status retrieved", status)))
}

pub async fn save_selections(
    Path(proposal_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<SessionContext>,
    Json(body): Json<SaveSelectionsDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let scope = authorize_quote(&app_state, &context, proposal_id).await?;
    app_state
        .portal_service
        .save_area_selections(scope, proposal_id, body.selections)
        .await?;
    let status = app_state.portal_service.portal_status(scope, proposal_id).await?;

    Ok(Json(ApiResponse::success("Selections saved", status)))
}

pub async fn submit_selections(
    Path(proposal_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<SessionContext>,
) -> Result<impl IntoResponse, HttpError> {
    let scope = authorize_quote(&app_state, &context, proposal_id).await?;
    let submitted = app_state
        .portal_service
        .submit_all_selections(scope, proposal_id)
        .await?;

    Ok(Json(ApiResponse::success(
        "Selections submitted, your job is scheduled for production",
        SelectionsSubmittedDto::from(&submitted),
    )))
}
