//! Token blacklist
//!
//! Entries are keyed by the SHA-256 of the raw token under
//! `blacklist:{hash}` and expire together with the token they block, so the
//! ledger bounds itself without any sweep.

use std::sync::Arc;

use common::{Clock, StateStore};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::audit::{AuditEvent, AuditEventType, Auditor};
use crate::deadline::within;
use crate::error::{GuardError, GuardResult};
use crate::jwt::TokenVerifier;
use crate::models::{BlacklistEntry, RevocationReason};

/// One-way hash of a raw token
pub fn hash_token(raw_token: &str) -> String {
    hex::encode(Sha256::digest(raw_token.as_bytes()))
}

pub fn blacklist_key(token_hash: &str) -> String {
    format!("blacklist:{}", token_hash)
}

/// What a blacklist write did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistOutcome {
    /// This call created the entry
    Written,
    /// The token was already blacklisted
    AlreadyBlacklisted,
    /// The token is past its own expiry; nothing was written
    AlreadyExpired,
}

#[derive(Clone)]
pub struct TokenBlacklist {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    verifier: Arc<dyn TokenVerifier>,
    auditor: Auditor,
    timeout_ms: u64,
}

impl TokenBlacklist {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        verifier: Arc<dyn TokenVerifier>,
        auditor: Auditor,
        timeout_ms: u64,
    ) -> Self {
        Self {
            store,
            clock,
            verifier,
            auditor,
            timeout_ms,
        }
    }

    /// Blacklist a token until its natural expiry
    ///
    /// Succeeds without writing when the token has already expired.
    pub async fn blacklist(
        &self,
        raw_token: &str,
        user_id: &str,
        session_id: Option<&str>,
        reason: RevocationReason,
    ) -> GuardResult<bool> {
        self.revoke_token(raw_token, user_id, session_id, reason)
            .await
            .map(|_| true)
    }

    /// Blacklist a token and report whether this call was the one that did it
    ///
    /// The write is set-if-absent, so of several concurrent callers exactly
    /// one observes [`BlacklistOutcome::Written`].
    pub async fn revoke_token(
        &self,
        raw_token: &str,
        user_id: &str,
        session_id: Option<&str>,
        reason: RevocationReason,
    ) -> GuardResult<BlacklistOutcome> {
        let claims = self
            .verifier
            .decode_unverified(raw_token)
            .map_err(|e| GuardError::TokenInvalid(e.to_string()))?;

        let now = self.clock.now();
        let token_hash = hash_token(raw_token);
        let Some(ttl) = u64::try_from(claims.exp - now).ok().filter(|ttl| *ttl > 0) else {
            debug!("Token {} already expired, not blacklisting", &token_hash[..12]);
            return Ok(BlacklistOutcome::AlreadyExpired);
        };

        let entry = BlacklistEntry {
            token_hash: token_hash.clone(),
            user_id: user_id.to_string(),
            session_id: session_id.map(str::to_string),
            expires_at: claims.exp,
            reason,
            blacklisted_at: now,
        };
        let payload = serde_json::to_string(&entry)?;

        let written = within(
            self.timeout_ms,
            self.store.set_nx_ex(&blacklist_key(&token_hash), &payload, ttl),
        )
        .await?;

        if !written {
            debug!("Token {} was already blacklisted", &token_hash[..12]);
            return Ok(BlacklistOutcome::AlreadyBlacklisted);
        }

        info!(
            "Blacklisted token {} of user {} for {}s: {}",
            &token_hash[..12],
            user_id,
            ttl,
            reason
        );
        self.auditor
            .emit(
                AuditEvent::new(AuditEventType::TokenBlacklisted, user_id)
                    .organization(claims.org.as_deref())
                    .detail("token_hash", token_hash)
                    .detail("session_id", session_id)
                    .detail("reason", reason.as_str())
                    .detail("ttl", ttl),
            );

        Ok(BlacklistOutcome::Written)
    }

    /// Whether this exact token has been blacklisted
    pub async fn is_blacklisted(&self, raw_token: &str) -> GuardResult<bool> {
        let key = blacklist_key(&hash_token(raw_token));
        within(self.timeout_ms, self.store.exists(&key)).await
    }

    /// The stored entry for a token, if any
    pub async fn entry(&self, raw_token: &str) -> GuardResult<Option<BlacklistEntry>> {
        let key = blacklist_key(&hash_token(raw_token));
        let raw = within(self.timeout_ms, self.store.get(&key)).await?;
        Ok(raw.and_then(|payload| serde_json::from_str(&payload).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::jwt::{JwtConfig, JwtKeys, JwtService, TokenIssuer, TokenType};
    use common::{ManualClock, MemoryStore};

    struct Fixture {
        blacklist: TokenBlacklist,
        jwt: JwtService,
        store: MemoryStore,
        clock: ManualClock,
        audit: MemoryAuditSink,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(1_700_000_000);
        let store = MemoryStore::new(Arc::new(clock.clone()));
        let jwt = JwtService::new(
            JwtConfig {
                keys: JwtKeys::Hmac("blacklist-secret".into()),
                access_token_expiry: 900,
                refresh_token_expiry: 86_400,
            },
            Arc::new(clock.clone()),
        )
        .expect("jwt config");
        let audit = MemoryAuditSink::default();
        let blacklist = TokenBlacklist::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            Arc::new(jwt.clone()),
            Auditor::new(Arc::new(audit.clone()), 100),
            250,
        );
        Fixture {
            blacklist,
            jwt,
            store,
            clock,
            audit,
        }
    }

    #[tokio::test]
    async fn blacklisted_tokens_are_found_until_their_expiry() -> GuardResult<()> {
        let f = fixture();
        let token = f.jwt.issue(TokenType::Access, "42", "s1", None)?;

        assert!(!f.blacklist.is_blacklisted(&token).await?);
        assert!(f.blacklist.blacklist(&token, "42", Some("s1"), RevocationReason::UserLogout).await?);
        assert!(f.blacklist.is_blacklisted(&token).await?);

        let key = blacklist_key(&hash_token(&token));
        assert_eq!(f.store.ttl(&key).await?, Some(900));

        f.clock.advance(900);
        assert!(!f.blacklist.is_blacklisted(&token).await?);
        Ok(())
    }

    #[tokio::test]
    async fn expired_tokens_are_not_written() -> GuardResult<()> {
        let f = fixture();
        let token = f.jwt.issue(TokenType::Access, "42", "s1", None)?;
        f.clock.advance(901);

        assert!(f.blacklist.blacklist(&token, "42", None, RevocationReason::AdminRevoke).await?);
        assert!(f.store.is_empty().await);
        assert!(!f.blacklist.is_blacklisted(&token).await?);
        assert_eq!(f.audit.count(AuditEventType::TokenBlacklisted).await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_first_writer_wins() -> GuardResult<()> {
        let f = fixture();
        let token = f.jwt.issue(TokenType::Refresh, "42", "s1", None)?;

        let first = f
            .blacklist
            .revoke_token(&token, "42", Some("s1"), RevocationReason::TokenRotation)
            .await?;
        let second = f
            .blacklist
            .revoke_token(&token, "42", Some("s1"), RevocationReason::SecurityBreach)
            .await?;

        assert_eq!(first, BlacklistOutcome::Written);
        assert_eq!(second, BlacklistOutcome::AlreadyBlacklisted);
        let entry = f.blacklist.entry(&token).await?.expect("entry stored");
        assert_eq!(entry.reason, RevocationReason::TokenRotation);
        assert_eq!(entry.expires_at, 1_700_000_000 + 86_400);
        assert_eq!(f.audit.count(AuditEventType::TokenBlacklisted).await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn raw_tokens_are_never_stored() -> GuardResult<()> {
        let f = fixture();
        let token = f.jwt.issue(TokenType::Access, "42", "s1", None)?;
        f.blacklist.blacklist(&token, "42", Some("s1"), RevocationReason::UserLogout).await?;

        for key in f.store.scan_keys("*", 10).await? {
            assert!(!key.contains(&token));
            let value = f.store.get(&key).await?.unwrap_or_default();
            assert!(!value.contains(&token));
        }
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_tokens_are_rejected() {
        let f = fixture();
        let result = f
            .blacklist
            .blacklist("not-a-jwt", "42", None, RevocationReason::UserLogout)
            .await;
        assert!(matches!(result, Err(GuardError::TokenInvalid(_))));
    }
}
