//! HTTP routes of the session guard

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use axum_extra::{
    TypedHeader,
    extract::CookieJar,
    headers::{Authorization, authorization::Bearer},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use crate::error::GuardError;
use crate::middleware::{refresh_cookie, refresh_token, session_guard};
use crate::models::{AuthContext, RevocationReason, Session};
use crate::service::SessionService;

/// Errors surfaced by the route handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found")]
    NotFound,

    #[error("Service unavailable")]
    ServiceUnavailable,

    #[error("Internal server error")]
    InternalServerError,
}

impl From<GuardError> for ApiError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::SessionNotFound(_) => ApiError::NotFound,
            e if e.is_store_failure() => {
                error!("Store failure while serving request: {}", e);
                ApiError::ServiceUnavailable
            }
            e => {
                error!("Request failed: {}", e);
                ApiError::InternalServerError
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// A session as listed to its owner
#[derive(Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub current: bool,
}

#[derive(Deserialize)]
pub struct LogoutAllParams {
    /// Spare the session making the request
    #[serde(default)]
    pub keep_current: bool,
}

/// Create the router; every route except the exempt ones passes the guard
pub fn create_router(service: SessionService) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/me", get(me))
        .route("/auth/sessions", get(list_sessions))
        .route("/auth/sessions/:session_id", delete(revoke_session))
        .route("/auth/logout", post(logout))
        .route("/auth/logout-all", post(logout_all))
        .layer(middleware::from_fn_with_state(service.clone(), session_guard))
        .with_state(service)
}

/// Health check endpoint, reporting store reachability
pub async fn health_check(State(service): State<SessionService>) -> impl IntoResponse {
    let health = service.health_check().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if health.healthy { "ok" } else { "degraded" },
            "service": "session-guard",
            "store": health,
        })),
    )
}

/// Identity of the caller
pub async fn me(Extension(context): Extension<AuthContext>) -> impl IntoResponse {
    Json(json!({
        "user_id": context.user_id,
        "session_id": context.session_id,
        "organization_id": context.organization_id,
    }))
}

/// Sessions of the caller, newest first
pub async fn list_sessions(
    State(service): State<SessionService>,
    Extension(context): Extension<AuthContext>,
) -> ApiResult<Json<Vec<SessionView>>> {
    let sessions = service.list_sessions(&context.user_id).await?;
    Ok(Json(
        sessions
            .into_iter()
            .map(|session| SessionView {
                current: session.session_id == context.session_id,
                session,
            })
            .collect(),
    ))
}

/// Revoke one of the caller's own sessions
pub async fn revoke_session(
    State(service): State<SessionService>,
    Extension(context): Extension<AuthContext>,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = service.session(&session_id).await?;
    if session.user_id != context.user_id {
        // Indistinguishable from a missing session
        return Err(ApiError::NotFound);
    }

    let revoked = service
        .revoke_session(&session_id, RevocationReason::UserLogout)
        .await?;
    info!("User {} revoked session {}", context.user_id, session_id);

    Ok(Json(json!({ "session_id": session_id, "revoked": revoked })))
}

/// Log out of the current session
pub async fn logout(
    State(service): State<SessionService>,
    Extension(context): Extension<AuthContext>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let access = bearer.map(|TypedHeader(auth)| auth.token().to_string());
    let refresh = refresh_token(&jar, &headers, service.config());

    service
        .logout(&context, access.as_deref(), refresh.as_deref())
        .await?;

    let mut response = Json(json!({"message": "Logged out successfully"})).into_response();
    clear_refresh_cookie(&service, response.headers_mut());
    Ok(response)
}

/// Log out of every session of the caller
pub async fn logout_all(
    State(service): State<SessionService>,
    Extension(context): Extension<AuthContext>,
    Query(params): Query<LogoutAllParams>,
) -> ApiResult<impl IntoResponse> {
    let except = params.keep_current.then_some(context.session_id.as_str());
    let revoked = service
        .revoke_all_for_user(&context.user_id, RevocationReason::UserLogout, except)
        .await?;

    let mut response = Json(json!({ "revoked": revoked })).into_response();
    if !params.keep_current {
        clear_refresh_cookie(&service, response.headers_mut());
    }
    Ok(response)
}

fn clear_refresh_cookie(service: &SessionService, headers: &mut HeaderMap) {
    if let Ok(value) = HeaderValue::from_str(&refresh_cookie(service.config(), "", 0)) {
        headers.append(header::SET_COOKIE, value);
    }
}
