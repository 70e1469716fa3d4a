//! Per-request authentication decisions
//!
//! [`AuthGuard::evaluate`] walks one request through the checks in order:
//! exempt path, credential presence, blacklist, signature and expiry (with a
//! refresh fallback), session lookup, session state, activity heuristics.
//! Any store failure along the way denies the request.

use std::sync::Arc;

use axum::http::StatusCode;
use common::Clock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityPolicy, ActivityReport};
use crate::audit::{AuditEvent, AuditEventType, Auditor};
use crate::blacklist::TokenBlacklist;
use crate::error::GuardError;
use crate::jwt::{Claims, TokenType, TokenVerifier};
use crate::models::{AuthContext, ClientInfo, RevocationReason, Session, SessionState};
use crate::rotation::RefreshRotation;
use crate::session::SessionStore;

/// Machine-readable cause of a denial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    MissingToken,
    InvalidToken,
    BlacklistedToken,
    SessionNotFound,
    SessionRevoked,
    SessionExpired,
    SessionSuspicious,
    SuspiciousActivity,
    StoreUnavailable,
    InternalError,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::MissingToken => "missing_token",
            DenyReason::InvalidToken => "invalid_token",
            DenyReason::BlacklistedToken => "blacklisted_token",
            DenyReason::SessionNotFound => "session_not_found",
            DenyReason::SessionRevoked => "session_revoked",
            DenyReason::SessionExpired => "session_expired",
            DenyReason::SessionSuspicious => "session_suspicious",
            DenyReason::SuspiciousActivity => "suspicious_activity",
            DenyReason::StoreUnavailable => "store_unavailable",
            DenyReason::InternalError => "internal_error",
        }
    }

    /// 401 when no usable credential was presented; 403 when the credential
    /// is known but its session is no longer active
    pub fn status(&self) -> StatusCode {
        match self {
            DenyReason::MissingToken
            | DenyReason::InvalidToken
            | DenyReason::SessionNotFound => StatusCode::UNAUTHORIZED,
            DenyReason::BlacklistedToken
            | DenyReason::SessionRevoked
            | DenyReason::SessionExpired
            | DenyReason::SessionSuspicious
            | DenyReason::SuspiciousActivity => StatusCode::FORBIDDEN,
            DenyReason::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            DenyReason::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn for_state(state: SessionState) -> Self {
        match state {
            SessionState::Revoked => DenyReason::SessionRevoked,
            SessionState::Expired => DenyReason::SessionExpired,
            SessionState::Suspicious => DenyReason::SessionSuspicious,
            // An active session is never denied for its state; reaching this
            // means it turned inactive between two reads
            SessionState::Active => DenyReason::SessionRevoked,
        }
    }

    fn for_error(err: &GuardError) -> Self {
        match err {
            e if e.is_store_failure() => DenyReason::StoreUnavailable,
            GuardError::SessionNotFound(_) => DenyReason::SessionNotFound,
            GuardError::SessionInactive(_, state) => DenyReason::for_state(*state),
            GuardError::TokenReused => DenyReason::BlacklistedToken,
            GuardError::TokenInvalid(_) | GuardError::WrongTokenType { .. } => {
                DenyReason::InvalidToken
            }
            _ => DenyReason::InternalError,
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials and origin of one inbound request
#[derive(Debug, Clone, Default)]
pub struct RequestCredentials {
    pub path: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client: ClientInfo,
}

/// The outcome handed to the HTTP pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthDecision {
    pub authenticated: bool,
    /// The path bypasses authentication altogether
    pub exempt: bool,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub organization_id: Option<String>,
    pub deny_reason: Option<DenyReason>,
    pub refreshed: bool,
    pub new_access_token: Option<String>,
    pub new_refresh_token: Option<String>,
}

impl AuthDecision {
    pub fn exempt() -> Self {
        Self {
            exempt: true,
            ..Self::default()
        }
    }

    pub fn denied(reason: DenyReason) -> Self {
        Self {
            deny_reason: Some(reason),
            ..Self::default()
        }
    }

    pub fn authenticated(session: &Session) -> Self {
        Self {
            authenticated: true,
            user_id: Some(session.user_id.clone()),
            session_id: Some(session.session_id.clone()),
            organization_id: session.organization_id.clone(),
            ..Self::default()
        }
    }

    pub fn is_denied(&self) -> bool {
        self.deny_reason.is_some()
    }

    /// Identity for downstream handlers, present only when authenticated
    pub fn context(&self) -> Option<AuthContext> {
        match (self.authenticated, &self.user_id, &self.session_id) {
            (true, Some(user_id), Some(session_id)) => Some(AuthContext {
                user_id: user_id.clone(),
                session_id: session_id.clone(),
                organization_id: self.organization_id.clone(),
            }),
            _ => None,
        }
    }
}

/// Request-time orchestrator over the blacklist and session store
#[derive(Clone)]
pub struct AuthGuard {
    sessions: SessionStore,
    blacklist: TokenBlacklist,
    rotation: RefreshRotation,
    verifier: Arc<dyn TokenVerifier>,
    policy: ActivityPolicy,
    auditor: Auditor,
    clock: Arc<dyn Clock>,
    exempt: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl AuthGuard {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: SessionStore,
        blacklist: TokenBlacklist,
        rotation: RefreshRotation,
        verifier: Arc<dyn TokenVerifier>,
        policy: ActivityPolicy,
        auditor: Auditor,
        clock: Arc<dyn Clock>,
        exempt: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    ) -> Self {
        Self {
            sessions,
            blacklist,
            rotation,
            verifier,
            policy,
            auditor,
            clock,
            exempt,
        }
    }

    /// Decide whether one request is authenticated
    pub async fn evaluate(&self, request: &RequestCredentials) -> AuthDecision {
        if (self.exempt)(&request.path) {
            return AuthDecision::exempt();
        }

        let Some(token) = request.access_token.as_deref() else {
            return AuthDecision::denied(DenyReason::MissingToken);
        };

        match self.blacklist.is_blacklisted(token).await {
            Ok(false) => {}
            Ok(true) => return AuthDecision::denied(DenyReason::BlacklistedToken),
            Err(e) => return self.fail_closed("blacklist lookup", &e),
        }

        let claims = match self.verifier.verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!("Access token rejected: {}", e);
                return match request.refresh_token.as_deref() {
                    Some(refresh) => self.refresh(refresh, &request.client).await,
                    None => AuthDecision::denied(DenyReason::InvalidToken),
                };
            }
        };

        let session = match self.load_session(&claims, TokenType::Access).await {
            Ok(session) => session,
            Err(decision) => return decision,
        };

        if let Some(decision) = self.check_session(&session, token, &request.client).await {
            return decision;
        }

        match self.sessions.touch(&session.session_id).await {
            Ok(true) => AuthDecision::authenticated(&session),
            Ok(false) => self.lost_race(&session.session_id).await,
            Err(e) => self.fail_closed("session touch", &e),
        }
    }

    /// The access token failed verification; try to continue with the
    /// refresh token instead
    async fn refresh(&self, refresh_token: &str, client: &ClientInfo) -> AuthDecision {
        match self.blacklist.is_blacklisted(refresh_token).await {
            Ok(false) => {}
            Ok(true) => return AuthDecision::denied(DenyReason::BlacklistedToken),
            Err(e) => return self.fail_closed("refresh blacklist lookup", &e),
        }

        let claims = match self.verifier.verify(refresh_token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!("Refresh token rejected: {}", e);
                return AuthDecision::denied(DenyReason::InvalidToken);
            }
        };

        let session = match self.load_session(&claims, TokenType::Refresh).await {
            Ok(session) => session,
            Err(decision) => return decision,
        };

        if let Some(decision) = self.check_session(&session, refresh_token, client).await {
            return decision;
        }

        let pair = match self
            .rotation
            .exchange(refresh_token, &session.user_id, &session.session_id)
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                let reason = DenyReason::for_error(&e);
                if reason == DenyReason::StoreUnavailable {
                    error!("Refresh rotation failed, denying request: {}", e);
                } else {
                    warn!("Refresh rotation refused: {}", e);
                }
                return AuthDecision::denied(reason);
            }
        };

        if let Err(e) = self.sessions.touch(&session.session_id).await {
            return self.fail_closed("session touch after refresh", &e);
        }

        info!("Refreshed credentials for session {}", session.session_id);
        AuthDecision {
            refreshed: true,
            new_access_token: Some(pair.access_token),
            new_refresh_token: Some(pair.refresh_token),
            ..AuthDecision::authenticated(&session)
        }
    }

    /// Resolve the session a verified token is bound to
    async fn load_session(
        &self,
        claims: &Claims,
        expected: TokenType,
    ) -> Result<Session, AuthDecision> {
        if claims.token_type != expected {
            debug!("Expected {} token, got {}", expected.as_str(), claims.token_type.as_str());
            return Err(AuthDecision::denied(DenyReason::InvalidToken));
        }
        let Some(session_id) = claims.sid.as_deref() else {
            debug!("Token for {} carries no session id", claims.sub);
            return Err(AuthDecision::denied(DenyReason::InvalidToken));
        };

        let session = match self.sessions.get(session_id).await {
            Ok(session) => session,
            Err(GuardError::SessionNotFound(_)) => {
                return Err(AuthDecision::denied(DenyReason::SessionNotFound));
            }
            Err(e) => return Err(self.fail_closed("session lookup", &e)),
        };

        if session.user_id != claims.sub {
            warn!(
                "Token subject {} does not own session {}",
                claims.sub, session.session_id
            );
            return Err(AuthDecision::denied(DenyReason::InvalidToken));
        }
        Ok(session)
    }

    /// State and activity checks on a loaded session; `None` means pass
    async fn check_session(
        &self,
        session: &Session,
        token: &str,
        client: &ClientInfo,
    ) -> Option<AuthDecision> {
        let now = self.clock.now();
        let state = session.effective_state(now);

        if state != SessionState::Active {
            if state == SessionState::Revoked {
                let reason = session
                    .revocation_reason
                    .unwrap_or(RevocationReason::AdminRevoke);
                if let Err(e) = self
                    .blacklist
                    .blacklist(token, &session.user_id, Some(&session.session_id), reason)
                    .await
                {
                    warn!(
                        "Failed to blacklist token of revoked session {}: {}",
                        session.session_id, e
                    );
                }
            }
            return Some(AuthDecision::denied(DenyReason::for_state(state)));
        }

        let report = self.policy.assess(session, client, now);
        if report.ip_changed {
            info!(
                "Session {} seen from new address {:?} (created from {:?})",
                session.session_id, client.ip_address, session.client_info.ip_address
            );
        }
        if report.is_suspicious() {
            self.quarantine(session, token, client, &report).await;
            return Some(AuthDecision::denied(DenyReason::SuspiciousActivity));
        }

        None
    }

    /// Revoke a session that tripped the heuristics and burn the token used
    ///
    /// The revoke and the blacklist write are independent; if the second one
    /// fails the session is still revoked and denied on its next use.
    async fn quarantine(
        &self,
        session: &Session,
        token: &str,
        client: &ClientInfo,
        report: &ActivityReport,
    ) {
        warn!(
            "Suspicious activity on session {} of user {}: {:?}",
            session.session_id,
            session.user_id,
            report.signals()
        );

        if let Err(e) = self.sessions.mark_suspicious(&session.session_id).await {
            warn!("Failed to flag session {}: {}", session.session_id, e);
        }
        if let Err(e) = self
            .sessions
            .revoke(&session.session_id, RevocationReason::SuspiciousActivity)
            .await
        {
            error!(
                "Failed to revoke suspicious session {}: {}",
                session.session_id, e
            );
        }
        if let Err(e) = self
            .blacklist
            .blacklist(
                token,
                &session.user_id,
                Some(&session.session_id),
                RevocationReason::SuspiciousActivity,
            )
            .await
        {
            warn!(
                "Failed to blacklist token of suspicious session {}: {}",
                session.session_id, e
            );
        }

        let mut event = AuditEvent::new(AuditEventType::SuspiciousActivity, session.user_id.as_str())
            .organization(session.organization_id.as_deref())
            .detail("session_id", session.session_id.as_str())
            .detail("signals", report.signals())
            .detail("access_count", session.access_count);
        if report.ip_changed {
            event = event
                .detail("original_ip", session.client_info.ip_address.as_deref())
                .detail("current_ip", client.ip_address.as_deref());
        }
        if report.user_agent_changed {
            event = event
                .detail("original_user_agent", session.client_info.user_agent.as_deref())
                .detail("current_user_agent", client.user_agent.as_deref());
        }
        self.auditor.emit(event);
    }

    /// `touch` refused a session that passed the checks a moment ago
    async fn lost_race(&self, session_id: &str) -> AuthDecision {
        match self.sessions.get(session_id).await {
            Ok(session) => {
                let state = session.effective_state(self.clock.now());
                AuthDecision::denied(DenyReason::for_state(state))
            }
            Err(GuardError::SessionNotFound(_)) => {
                AuthDecision::denied(DenyReason::SessionNotFound)
            }
            Err(e) => self.fail_closed("session re-read", &e),
        }
    }

    fn fail_closed(&self, operation: &str, err: &GuardError) -> AuthDecision {
        error!("{} failed, denying request: {}", operation, err);
        AuthDecision::denied(DenyReason::for_error(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_classes_map_to_statuses() {
        assert_eq!(DenyReason::MissingToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(DenyReason::InvalidToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(DenyReason::BlacklistedToken.status(), StatusCode::FORBIDDEN);
        assert_eq!(DenyReason::SessionNotFound.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(DenyReason::SessionRevoked.status(), StatusCode::FORBIDDEN);
        assert_eq!(DenyReason::SessionExpired.status(), StatusCode::FORBIDDEN);
        assert_eq!(DenyReason::SessionSuspicious.status(), StatusCode::FORBIDDEN);
        assert_eq!(DenyReason::SuspiciousActivity.status(), StatusCode::FORBIDDEN);
        assert_eq!(DenyReason::StoreUnavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn errors_map_to_reasons() {
        assert_eq!(
            DenyReason::for_error(&GuardError::Timeout(250)),
            DenyReason::StoreUnavailable
        );
        assert_eq!(
            DenyReason::for_error(&GuardError::SessionInactive("s".into(), SessionState::Expired)),
            DenyReason::SessionExpired
        );
        assert_eq!(
            DenyReason::for_error(&GuardError::TokenReused),
            DenyReason::BlacklistedToken
        );
        assert_eq!(
            DenyReason::for_error(&GuardError::Issuance("key".into())),
            DenyReason::InternalError
        );
    }

    #[test]
    fn only_authenticated_decisions_carry_a_context() {
        assert_eq!(AuthDecision::denied(DenyReason::MissingToken).context(), None);
        assert_eq!(AuthDecision::exempt().context(), None);

        let session = Session::new("42", Some("acme".into()), ClientInfo::default(), 0, 60);
        let context = AuthDecision::authenticated(&session).context().expect("context");
        assert_eq!(context.user_id, "42");
        assert_eq!(context.session_id, session.session_id);
        assert_eq!(context.organization_id.as_deref(), Some("acme"));
    }
}
