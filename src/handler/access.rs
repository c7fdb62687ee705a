use std::sync::Arc;

use axum::{
    extract::Path,
    http::HeaderMap,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use validator::Validate;

use crate::{
    dtos::{
        accessdtos::{MagicLinkResponseDto, RequestOtpDto, SessionResponseDto, VerifyOtpDto},
        ApiResponse,
    },
    error::{ErrorMessage, HttpError},
    middleware::{client_meta, session_auth, session_token, tenant_hint, SESSION_COOKIE},
    service::{access_service::{MagicLinkOutcome, SessionContext}, otp_service::OTP_EXPIRY_MINUTES},
    AppState,
};

pub fn access_handler() -> Router {
    let protected = Router::new()
        .route("/request-otp", post(request_otp))
        .route("/verify-otp", post(verify_otp))
        .route("/logout", post(logout))
        .layer(middleware::from_fn(session_auth));

    Router::new()
        .route("/access/:token", get(open_magic_link))
        .route("/validate-session", post(validate_session))
        .merge(protected)
}

fn session_cookie(token: String, max_age_hours: i64) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .max_age(time::Duration::hours(max_age_hours))
        .http_only(true)
        .same_site(SameSite::Lax)
        .build()
}

pub async fn open_magic_link(
    Path(token): Path<String>,
    headers: HeaderMap,
    cookie_jar: CookieJar,
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let (ip, user_agent) = client_meta(&headers);

    let outcome = app_state
        .access_service
        .validate_magic_link(&token, ip, user_agent, tenant_hint(&headers))
        .await?;

    let access = match outcome {
        MagicLinkOutcome::Valid(access) => access,
        MagicLinkOutcome::Invalid { reason } => {
            return Err(HttpError::unauthorized(reason.message()).with_code(reason.as_str()));
        }
    };

    let jar = cookie_jar.add(session_cookie(
        access.session.token.clone(),
        app_state.env.session_ttl_hours,
    ));
    let response = ApiResponse::success("Access granted", MagicLinkResponseDto::from(access.as_ref()));

    Ok((jar, Json(response)))
}

pub async fn validate_session(
    headers: HeaderMap,
    cookie_jar: CookieJar,
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let token = session_token(&cookie_jar, &headers)
        .ok_or_else(|| HttpError::unauthorized(ErrorMessage::SessionNotProvided.to_string()).with_code("session_missing"))?;
    let (ip, user_agent) = client_meta(&headers);

    let context = app_state
        .access_service
        .validate_session(&token, ip, user_agent)
        .await?;

    Ok(Json(ApiResponse::success(
        "Session is valid",
        SessionResponseDto::from(&context),
    )))
}

pub async fn request_otp(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<SessionContext>,
    Json(body): Json<RequestOtpDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let issued = app_state
        .otp_service
        .create_otp_verification(&context, body.method, body.target)
        .await?;

    Ok(Json(ApiResponse::success(
        &format!("Verification code sent, it expires in {} minutes", OTP_EXPIRY_MINUTES),
        issued,
    )))
}

pub async fn verify_otp(
    headers: HeaderMap,
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<SessionContext>,
    Json(body): Json<VerifyOtpDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;
    let (ip, _) = client_meta(&headers);

    let verified = app_state
        .otp_service
        .verify_otp(&context, &body.code, ip.as_deref())
        .await?;

    Ok(Json(ApiResponse::success(
        "Verification successful",
        SessionResponseDto::new(&verified.session, &context.client),
    )))
}

pub async fn logout(
    cookie_jar: CookieJar,
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<SessionContext>,
) -> Result<impl IntoResponse, HttpError> {
    app_state.access_service.revoke_session(&context).await?;

    let jar = cookie_jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    Ok((jar, Json(ApiResponse::message("Signed out"))))
}
