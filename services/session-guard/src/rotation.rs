//! Single-use refresh token rotation
//!
//! The presented refresh token is blacklisted before a replacement is minted,
//! so a replay racing the rotation is already rejected by the blacklist. The
//! blacklist write is set-if-absent: only the request that writes the entry
//! gets a replacement. Any other request presenting the same token is refused
//! with [`GuardError::TokenReused`]; the session stays active.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditEventType, Auditor};
use crate::blacklist::{BlacklistOutcome, TokenBlacklist};
use crate::error::{GuardError, GuardResult};
use crate::jwt::{TokenIssuer, TokenType, TokenVerifier};
use crate::models::RevocationReason;
use crate::session::SessionStore;

/// Freshly minted credentials
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

#[derive(Clone)]
pub struct RefreshRotation {
    blacklist: TokenBlacklist,
    sessions: SessionStore,
    verifier: Arc<dyn TokenVerifier>,
    issuer: Arc<dyn TokenIssuer>,
    auditor: Auditor,
}

impl RefreshRotation {
    pub fn new(
        blacklist: TokenBlacklist,
        sessions: SessionStore,
        verifier: Arc<dyn TokenVerifier>,
        issuer: Arc<dyn TokenIssuer>,
        auditor: Auditor,
    ) -> Self {
        Self {
            blacklist,
            sessions,
            verifier,
            issuer,
            auditor,
        }
    }

    /// Exchange a refresh token for a new one bound to the same session
    ///
    /// The old token is blacklisted first. If the session is gone or no
    /// longer active, no replacement is issued.
    pub async fn rotate(
        &self,
        old_refresh_token: &str,
        user_id: &str,
        session_id: &str,
    ) -> GuardResult<String> {
        let organization_id = self
            .consume(old_refresh_token, user_id, session_id)
            .await?;
        self.issuer.issue(
            TokenType::Refresh,
            user_id,
            session_id,
            organization_id.as_deref(),
        )
    }

    /// Rotate the refresh token and mint a matching access token
    pub async fn exchange(
        &self,
        old_refresh_token: &str,
        user_id: &str,
        session_id: &str,
    ) -> GuardResult<TokenPair> {
        let organization_id = self
            .consume(old_refresh_token, user_id, session_id)
            .await?;
        let org = organization_id.as_deref();

        Ok(TokenPair {
            refresh_token: self
                .issuer
                .issue(TokenType::Refresh, user_id, session_id, org)?,
            access_token: self
                .issuer
                .issue(TokenType::Access, user_id, session_id, org)?,
            token_type: "Bearer",
            expires_in: self.issuer.lifetime(TokenType::Access),
        })
    }

    /// Validate and burn the old token, then count the refresh on the session.
    /// Returns the session's organization for the replacement tokens.
    async fn consume(
        &self,
        old_refresh_token: &str,
        user_id: &str,
        session_id: &str,
    ) -> GuardResult<Option<String>> {
        let claims = self
            .verifier
            .verify(old_refresh_token)
            .map_err(|e| GuardError::TokenInvalid(e.to_string()))?;

        if claims.token_type != TokenType::Refresh {
            return Err(GuardError::WrongTokenType {
                expected: TokenType::Refresh.as_str(),
            });
        }
        if claims.sub != user_id || claims.sid.as_deref() != Some(session_id) {
            return Err(GuardError::TokenInvalid(
                "token does not belong to this session".to_string(),
            ));
        }

        let outcome = self
            .blacklist
            .revoke_token(
                old_refresh_token,
                user_id,
                Some(session_id),
                RevocationReason::TokenRotation,
            )
            .await?;

        match outcome {
            BlacklistOutcome::Written => {}
            BlacklistOutcome::AlreadyBlacklisted => {
                warn!(
                    "Refresh token already consumed on session {} of user {}",
                    session_id, user_id
                );
                self.auditor
                    .emit(
                        AuditEvent::new(AuditEventType::RefreshTokenReused, user_id)
                            .organization(claims.org.as_deref())
                            .detail("session_id", session_id),
                    );
                return Err(GuardError::TokenReused);
            }
            BlacklistOutcome::AlreadyExpired => {
                return Err(GuardError::TokenInvalid("token has expired".to_string()));
            }
        }

        let session = self.sessions.record_refresh(session_id).await?;

        info!(
            "Rotated refresh token for session {} (refresh #{})",
            session_id, session.refresh_count
        );
        self.auditor
            .emit(
                AuditEvent::new(AuditEventType::TokenRotated, user_id)
                    .organization(session.organization_id.as_deref())
                    .detail("session_id", session_id)
                    .detail("refresh_count", session.refresh_count),
            );

        Ok(session.organization_id)
    }
}
