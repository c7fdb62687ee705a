use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header, HeaderMap},
    middleware::Next,
    response::IntoResponse,
    Extension,
};
use axum_extra::extract::cookie::CookieJar;
use uuid::Uuid;

use crate::{
    db::proposaldb::ClientScope,
    error::{ErrorMessage, HttpError},
    service::{access_service::SessionContext, error::ServiceError},
    AppState,
};

pub const SESSION_COOKIE: &str = "portal_session";
pub const SESSION_HEADER: &str = "x-session-token";
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Session token from the portal cookie, a bearer header or the
/// `x-session-token` header, in that order.
pub fn session_token(cookie_jar: &CookieJar, headers: &HeaderMap) -> Option<String> {
    cookie_jar
        .get(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|auth_header| auth_header.to_str().ok())
                .and_then(|auth_value| auth_value.strip_prefix("Bearer "))
                .map(|token| token.trim().to_string())
        })
        .or_else(|| {
            headers
                .get(SESSION_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(|token| token.trim().to_string())
        })
        .filter(|token| !token.is_empty())
}

/// Caller IP (first `x-forwarded-for` hop, else `x-real-ip`) and user agent.
pub fn client_meta(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let ip = header_str("x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next().map(|hop| hop.trim().to_string()))
        .or_else(|| header_str("x-real-ip"));
    let user_agent = header_str(header::USER_AGENT.as_str());
    (ip, user_agent)
}

pub fn tenant_hint(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
}

pub async fn session_auth(
    cookie_jar: CookieJar,
    Extension(app_state): Extension<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, HttpError> {
    let token = session_token(&cookie_jar, req.headers()).ok_or_else(|| {
        HttpError::unauthorized(ErrorMessage::SessionNotProvided.to_string()).with_code("session_missing")
    })?;
    let (ip, user_agent) = client_meta(req.headers());

    let context = app_state
        .access_service
        .authenticate(&token, ip, user_agent)
        .await
        .map_err(|e| match e {
            ServiceError::SessionExpired => {
                HttpError::unauthorized(ErrorMessage::SessionExpired.to_string()).with_code("session_expired")
            }
            ServiceError::SessionInvalid => {
                HttpError::unauthorized(ErrorMessage::InvalidSession.to_string()).with_code("session_invalid")
            }
            other => HttpError::from(other),
        })?;

    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}

/// Checks the session may reach this proposal and returns the scope every
/// store read must go through.
pub async fn authorize_quote(
    app_state: &AppState,
    context: &SessionContext,
    quote_id: Uuid,
) -> Result<ClientScope, HttpError> {
    app_state
        .access_service
        .authorize_quote(context, quote_id)
        .await
        .map_err(HttpError::from)
}
