// routes.rs
use std::sync::Arc;

use axum::{middleware, routing::get, Extension, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    handler::{
        access::access_handler, portal::portal_handler, proposals::proposals_handler,
        webhooks::webhooks_handler,
    },
    middleware::session_auth,
    AppState,
};

async fn health_check(Extension(app_state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Server is running",
        "store": app_state.store.backend(),
    }))
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Every proposal and portal route needs a live session
    let proposal_routes = Router::new()
        .merge(proposals_handler())
        .merge(portal_handler())
        .layer(middleware::from_fn(session_auth));

    let api_route = Router::new()
        .merge(access_handler())
        .nest("/proposals", proposal_routes)
        .nest("/webhooks", webhooks_handler())
        .layer(TraceLayer::new_for_http())
        .layer(Extension(app_state.clone()));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_route)
        .layer(Extension(app_state))
}
