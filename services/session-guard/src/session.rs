//! Session store backed by the shared state store
//!
//! Records live under `session:{id}` with a TTL fixed at creation; a per-user
//! set under `user_sessions:{user_id}` indexes them. Every mutation is a
//! read-modify-write committed with a TTL-preserving compare-and-swap, so
//! concurrent requests on different instances never lose updates and never
//! extend a session's lifetime.

use std::sync::Arc;

use common::{Clock, StateStore};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditEventType, Auditor};
use crate::deadline::within;
use crate::error::{GuardError, GuardResult};
use crate::models::{ClientInfo, RevocationReason, Session, SessionState};

const MAX_CAS_ATTEMPTS: usize = 16;

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

pub fn user_index_key(user_id: &str) -> String {
    format!("user_sessions:{}", user_id)
}

/// What a mutation closure decided to do with the record it was given
enum Change {
    Write,
    Keep,
}

/// Result of a compare-and-swap mutation
enum Mutation {
    Missing,
    Unchanged(Session),
    Updated(Session),
}

/// Session store for handling login sessions in the shared store
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    auditor: Auditor,
    default_ttl: u64,
    timeout_ms: u64,
}

impl SessionStore {
    /// Create a new session store
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        auditor: Auditor,
        default_ttl: u64,
        timeout_ms: u64,
    ) -> Self {
        Self {
            store,
            clock,
            auditor,
            default_ttl,
            timeout_ms,
        }
    }

    /// Create a new session for a user
    ///
    /// The record and its index membership are written as one atomic unit.
    pub async fn create(
        &self,
        user_id: &str,
        client_info: ClientInfo,
        organization_id: Option<String>,
        ttl: Option<u64>,
    ) -> GuardResult<Session> {
        let ttl = ttl.unwrap_or(self.default_ttl).max(1);
        let session = Session::new(user_id, organization_id, client_info, self.clock.now(), ttl);
        let payload = serde_json::to_string(&session)?;

        within(
            self.timeout_ms,
            self.store.insert_indexed(
                &session_key(&session.session_id),
                &payload,
                ttl,
                &user_index_key(user_id),
                &session.session_id,
            ),
        )
        .await?;

        info!(
            "Created session {} for user {} (ttl {}s)",
            session.session_id, user_id, ttl
        );
        self.auditor
            .emit(
                AuditEvent::new(AuditEventType::SessionCreated, user_id)
                    .organization(session.organization_id.as_deref())
                    .detail("session_id", session.session_id.as_str())
                    .detail("ttl", ttl),
            );

        Ok(session)
    }

    /// Get a session by id
    ///
    /// Missing, expired and undecodable records all yield
    /// [`GuardError::SessionNotFound`].
    pub async fn get(&self, session_id: &str) -> GuardResult<Session> {
        let key = session_key(session_id);
        let raw = within(self.timeout_ms, self.store.get(&key)).await?;
        raw.and_then(|payload| decode(&key, &payload))
            .ok_or_else(|| GuardError::SessionNotFound(session_id.to_string()))
    }

    /// Record an access: bump `last_accessed_at` and `access_count`
    ///
    /// Returns `false` if the session is missing or no longer authoritative.
    /// The absolute expiry is left untouched.
    pub async fn touch(&self, session_id: &str) -> GuardResult<bool> {
        let outcome = self
            .mutate(session_id, |session, now| {
                if !session.is_authoritative(now) {
                    return Change::Keep;
                }
                session.last_accessed_at = now;
                session.access_count += 1;
                Change::Write
            })
            .await?;

        Ok(matches!(outcome, Mutation::Updated(_)))
    }

    /// Revoke a session
    ///
    /// Idempotent: revoking a revoked session succeeds without touching it.
    /// Returns `false` only when the session does not exist.
    pub async fn revoke(&self, session_id: &str, reason: RevocationReason) -> GuardResult<bool> {
        match self.revoke_inner(session_id, reason).await? {
            Mutation::Missing => Ok(false),
            Mutation::Unchanged(_) | Mutation::Updated(_) => Ok(true),
        }
    }

    async fn revoke_inner(
        &self,
        session_id: &str,
        reason: RevocationReason,
    ) -> GuardResult<Mutation> {
        let outcome = self
            .mutate(session_id, |session, now| {
                if session.state == SessionState::Revoked {
                    return Change::Keep;
                }
                session.state = SessionState::Revoked;
                session.revocation_reason = Some(reason);
                session.revoked_at = Some(now);
                Change::Write
            })
            .await?;

        if let Mutation::Updated(session) = &outcome {
            info!(
                "Revoked session {} for user {}: {}",
                session.session_id, session.user_id, reason
            );
            self.auditor
                .emit(
                    AuditEvent::new(AuditEventType::SessionRevoked, session.user_id.as_str())
                        .organization(session.organization_id.as_deref())
                        .detail("session_id", session.session_id.as_str())
                        .detail("reason", reason.as_str()),
                );
        }

        Ok(outcome)
    }

    /// Flag an active session as suspicious
    ///
    /// The caller is expected to revoke it right after; if that revoke is
    /// lost, the suspicious state alone already stops it authorizing.
    pub async fn mark_suspicious(&self, session_id: &str) -> GuardResult<bool> {
        let outcome = self
            .mutate(session_id, |session, _now| {
                if session.state != SessionState::Active {
                    return Change::Keep;
                }
                session.state = SessionState::Suspicious;
                session.revocation_reason = Some(RevocationReason::SuspiciousActivity);
                Change::Write
            })
            .await?;

        Ok(matches!(outcome, Mutation::Updated(_)))
    }

    /// Count a refresh against an authoritative session
    pub async fn record_refresh(&self, session_id: &str) -> GuardResult<Session> {
        let outcome = self
            .mutate(session_id, |session, now| {
                if !session.is_authoritative(now) {
                    return Change::Keep;
                }
                session.refresh_count += 1;
                session.last_accessed_at = now;
                Change::Write
            })
            .await?;

        let now = self.clock.now();
        match outcome {
            Mutation::Updated(session) => Ok(session),
            Mutation::Unchanged(session) => Err(GuardError::SessionInactive(
                session.session_id.clone(),
                session.effective_state(now),
            )),
            Mutation::Missing => Err(GuardError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Revoke every session of a user, optionally sparing one
    ///
    /// Each revoke is atomic on its own; the sweep is not. Failures are
    /// logged and skipped, and the count reports sessions actually revoked
    /// by this call.
    pub async fn revoke_all_for_user(
        &self,
        user_id: &str,
        reason: RevocationReason,
        except_session_id: Option<&str>,
    ) -> GuardResult<usize> {
        let ids = within(self.timeout_ms, self.store.members(&user_index_key(user_id))).await?;

        let mut revoked = 0;
        for id in ids.iter().filter(|id| Some(id.as_str()) != except_session_id) {
            match self.revoke_inner(id, reason).await {
                Ok(Mutation::Updated(_)) => revoked += 1,
                Ok(_) => {}
                Err(e) => warn!("Failed to revoke session {} of user {}: {}", id, user_id, e),
            }
        }

        info!(
            "Revoked {} of {} sessions for user {}: {}",
            revoked,
            ids.len(),
            user_id,
            reason
        );
        self.auditor
            .emit(
                AuditEvent::new(AuditEventType::SessionsBulkRevoked, user_id)
                    .detail("reason", reason.as_str())
                    .detail("revoked", revoked)
                    .detail("indexed", ids.len())
                    .detail("except_session_id", except_session_id),
            );

        Ok(revoked)
    }

    /// All live sessions of a user, newest first
    ///
    /// Index entries whose record has expired are pruned on the way. Records
    /// that cannot be read are skipped, so the result may be partial.
    pub async fn list(&self, user_id: &str) -> GuardResult<Vec<Session>> {
        let index = user_index_key(user_id);
        let ids = within(self.timeout_ms, self.store.members(&index)).await?;

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(session) => sessions.push(session),
                Err(GuardError::SessionNotFound(_)) => self.prune_member(&index, &id).await,
                Err(e) => warn!("Skipping session {} of user {}: {}", id, user_id, e),
            }
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// Drop index members whose records are gone; returns how many were dropped
    pub async fn prune_index(&self, user_id: &str) -> GuardResult<usize> {
        let index = user_index_key(user_id);
        let ids = within(self.timeout_ms, self.store.members(&index)).await?;

        let mut pruned = 0;
        for id in ids {
            let alive = within(self.timeout_ms, self.store.exists(&session_key(&id))).await?;
            if !alive {
                self.prune_member(&index, &id).await;
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    async fn prune_member(&self, index: &str, session_id: &str) {
        debug!("Pruning dangling session {} from {}", session_id, index);
        if let Err(e) = within(self.timeout_ms, self.store.remove_member(index, session_id)).await {
            warn!("Failed to prune {} from {}: {}", session_id, index, e);
        }
    }

    /// Apply `change` to the stored record with compare-and-swap, retrying
    /// when another writer got there first
    async fn mutate<F>(&self, session_id: &str, mut change: F) -> GuardResult<Mutation>
    where
        F: FnMut(&mut Session, i64) -> Change,
    {
        let key = session_key(session_id);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = within(self.timeout_ms, self.store.get(&key)).await? else {
                return Ok(Mutation::Missing);
            };
            let Some(mut session) = decode(&key, &current) else {
                return Ok(Mutation::Missing);
            };

            if let Change::Keep = change(&mut session, self.clock.now()) {
                return Ok(Mutation::Unchanged(session));
            }

            let updated = serde_json::to_string(&session)?;
            let swapped = within(
                self.timeout_ms,
                self.store.compare_and_swap(&key, &current, &updated),
            )
            .await?;
            if swapped {
                return Ok(Mutation::Updated(session));
            }
            debug!("Concurrent update on {}, retrying", key);
        }

        Err(GuardError::Contention(key))
    }
}

/// Decode a stored record; corrupt payloads are logged and left in place
fn decode(key: &str, payload: &str) -> Option<Session> {
    match serde_json::from_str(payload) {
        Ok(session) => Some(session),
        Err(e) => {
            warn!("Corrupt session record at {}: {}", key, e);
            None
        }
    }
}
