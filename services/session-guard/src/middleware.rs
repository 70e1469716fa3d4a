//! Axum adapter for the decision engine

use std::net::SocketAddr;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    extract::CookieJar,
    headers::{Authorization, UserAgent, authorization::Bearer},
};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::GuardConfig;
use crate::decision::{AuthDecision, DenyReason, RequestCredentials};
use crate::models::ClientInfo;
use crate::service::SessionService;

/// Alternative carrier for the refresh token when cookies are unavailable
pub const REFRESH_TOKEN_HEADER: &str = "x-refresh-token";
/// Carries a rotated access token back to the client
pub const NEW_ACCESS_TOKEN_HEADER: &str = "x-new-access-token";

/// Authenticate every request that is not on an exempt path
///
/// Denials short-circuit with a JSON body; authenticated requests get an
/// [`AuthContext`](crate::models::AuthContext) extension.
pub async fn session_guard(
    State(service): State<SessionService>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    user_agent: Option<TypedHeader<UserAgent>>,
    jar: CookieJar,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let config = service.config();
    let credentials = RequestCredentials {
        path: req.uri().path().to_string(),
        access_token: bearer.map(|TypedHeader(auth)| auth.token().to_string()),
        refresh_token: refresh_token(&jar, req.headers(), config),
        client: ClientInfo::new(
            client_ip(&req),
            user_agent.map(|TypedHeader(ua)| ua.as_str().to_string()),
        ),
    };

    let decision = service.authorize(&credentials).await;
    if decision.exempt {
        return next.run(req).await;
    }
    if let Some(reason) = decision.deny_reason {
        debug!("Denied {} {}: {}", req.method(), credentials.path, reason);
        return deny(reason);
    }
    let Some(context) = decision.context() else {
        return deny(DenyReason::InternalError);
    };

    req.extensions_mut().insert(context);
    let mut response = next.run(req).await;
    if decision.refreshed {
        attach_refreshed_tokens(&decision, config, response.headers_mut());
    }
    response
}

/// Refresh token from the configured cookie, falling back to a header
pub fn refresh_token(jar: &CookieJar, headers: &HeaderMap, config: &GuardConfig) -> Option<String> {
    jar.get(&config.refresh_cookie_name)
        .map(|cookie| cookie.value().to_string())
        .or_else(|| {
            headers
                .get(REFRESH_TOKEN_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .filter(|token| !token.is_empty())
}

/// Originating address: first `X-Forwarded-For` hop, then `X-Real-IP`, then
/// the peer address when the server records it
fn client_ip(req: &Request<Body>) -> Option<String> {
    let headers = req.headers();
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|value| value.to_str().ok()))
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}

fn deny(reason: DenyReason) -> Response {
    let status = reason.status();
    let body = Json(json!({
        "error": status.canonical_reason().unwrap_or("Unauthorized"),
        "reason": reason.as_str(),
    }));

    let mut response = (status, body).into_response();
    let challenge = format!("Bearer error=\"{}\"", reason.as_str());
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

fn attach_refreshed_tokens(decision: &AuthDecision, config: &GuardConfig, headers: &mut HeaderMap) {
    if let Some(refresh) = &decision.new_refresh_token {
        match HeaderValue::from_str(&refresh_cookie(config, refresh, config.refresh_cookie_max_age_secs)) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(e) => warn!("Could not encode refresh cookie: {}", e),
        }
    }
    if let Some(access) = &decision.new_access_token {
        match HeaderValue::from_str(access) {
            Ok(value) => {
                headers.insert(NEW_ACCESS_TOKEN_HEADER, value);
            }
            Err(e) => warn!("Could not encode rotated access token: {}", e),
        }
    }
}

/// `Set-Cookie` value for the refresh token; a zero max age clears it
pub fn refresh_cookie(config: &GuardConfig, value: &str, max_age_secs: i64) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        config.refresh_cookie_name, value, max_age_secs
    );
    if config.secure_cookies {
        cookie.push_str("; Secure");
    }
    cookie
}
