//! Long-lived session service
//!
//! One `SessionService` is constructed at startup, initialized explicitly,
//! and handed to the request pipeline. It owns the session store, blacklist,
//! rotation and decision engine, and exposes the administrative operations.

use std::sync::Arc;

use anyhow::Result;
use common::{Clock, StateStore};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditSink, Auditor};
use crate::blacklist::TokenBlacklist;
use crate::config::GuardConfig;
use crate::deadline::within;
use crate::decision::{AuthDecision, AuthGuard, RequestCredentials};
use crate::error::{GuardError, GuardResult};
use crate::jwt::{TokenIssuer, TokenType, TokenVerifier};
use crate::models::{AuthContext, ClientInfo, RevocationReason, Session, SessionState};
use crate::rotation::{RefreshRotation, TokenPair};
use crate::session::SessionStore;

const USER_INDEX_PATTERN: &str = "user_sessions:*";
const SESSION_PATTERN: &str = "session:*";
const BLACKLIST_PATTERN: &str = "blacklist:*";

/// A freshly created session and the credentials bound to it
#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub session: Session,
    pub tokens: TokenPair,
}

/// Store reachability as seen from this instance
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Approximate counts from a bounded key scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    /// False when the store could not be scanned; all counts are then zero
    pub available: bool,
    /// The scan hit its limit, so counts are a lower bound
    pub truncated: bool,
    pub sampled_sessions: usize,
    pub active: usize,
    pub revoked: usize,
    pub expired: usize,
    pub suspicious: usize,
    pub blacklisted_tokens: usize,
}

#[derive(Clone)]
pub struct SessionService {
    config: Arc<GuardConfig>,
    store: Arc<dyn StateStore>,
    sessions: SessionStore,
    blacklist: TokenBlacklist,
    guard: AuthGuard,
    issuer: Arc<dyn TokenIssuer>,
    verifier: Arc<dyn TokenVerifier>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<Mutex<Option<JobScheduler>>>,
}

impl SessionService {
    pub fn new(
        config: GuardConfig,
        store: Arc<dyn StateStore>,
        verifier: Arc<dyn TokenVerifier>,
        issuer: Arc<dyn TokenIssuer>,
        audit_sink: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let auditor = Auditor::new(audit_sink, config.audit_timeout_ms);
        let sessions = SessionStore::new(
            store.clone(),
            clock.clone(),
            auditor.clone(),
            config.session_ttl_secs,
            config.store_timeout_ms,
        );
        let blacklist = TokenBlacklist::new(
            store.clone(),
            clock.clone(),
            verifier.clone(),
            auditor.clone(),
            config.store_timeout_ms,
        );
        let rotation = RefreshRotation::new(
            blacklist.clone(),
            sessions.clone(),
            verifier.clone(),
            issuer.clone(),
            auditor.clone(),
        );

        let config = Arc::new(config);
        let exempt = {
            let config = config.clone();
            Arc::new(move |path: &str| config.is_exempt(path))
        };
        let guard = AuthGuard::new(
            sessions.clone(),
            blacklist.clone(),
            rotation,
            verifier.clone(),
            config.activity_policy(),
            auditor,
            clock.clone(),
            exempt,
        );

        Self {
            config,
            store,
            sessions,
            blacklist,
            guard,
            issuer,
            verifier,
            clock,
            scheduler: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Verify the store is reachable and start the index sweep
    ///
    /// An unreachable store is fatal: the service must not serve
    /// authenticated traffic without it.
    pub async fn initialize(&self) -> Result<()> {
        let health = self.health_check().await;
        if !health.healthy {
            anyhow::bail!(
                "State store unreachable: {}",
                health.error.unwrap_or_default()
            );
        }
        info!("State store reachable in {}ms", health.latency_ms);

        let schedule = self.config.sweep_schedule.trim();
        if schedule.is_empty() {
            info!("Index sweep disabled");
            return Ok(());
        }

        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            debug!("Session service already initialized");
            return Ok(());
        }

        let scheduler = JobScheduler::new().await?;
        let store = self.store.clone();
        let sessions = self.sessions.clone();
        let limit = self.config.sweep_scan_limit;
        let job = Job::new_async(schedule, move |_, _| {
            let store = store.clone();
            let sessions = sessions.clone();
            Box::pin(async move {
                let pruned = sweep_indexes(store.as_ref(), &sessions, limit).await;
                info!("Index sweep pruned {} dangling sessions", pruned);
            })
        })?;
        scheduler.add(job).await?;
        scheduler.start().await?;
        *slot = Some(scheduler);

        info!("Started index sweep with schedule: {}", schedule);
        Ok(())
    }

    /// Stop background work
    pub async fn close(&self) -> Result<()> {
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown().await?;
            info!("Stopped index sweep");
        }
        Ok(())
    }

    /// Run one request through the decision engine
    pub async fn authorize(&self, credentials: &RequestCredentials) -> AuthDecision {
        self.guard.evaluate(credentials).await
    }

    /// Create a session and mint the token pair bound to it
    ///
    /// Credential checks belong to the caller.
    pub async fn login(
        &self,
        user_id: &str,
        client_info: ClientInfo,
        organization_id: Option<String>,
        ttl: Option<u64>,
    ) -> GuardResult<LoginOutcome> {
        let session = self
            .sessions
            .create(user_id, client_info, organization_id, ttl)
            .await?;
        let org = session.organization_id.as_deref();

        let tokens = TokenPair {
            access_token: self.issuer.issue(
                TokenType::Access,
                user_id,
                &session.session_id,
                org,
            )?,
            refresh_token: self.issuer.issue(
                TokenType::Refresh,
                user_id,
                &session.session_id,
                org,
            )?,
            token_type: "Bearer",
            expires_in: self.issuer.lifetime(TokenType::Access),
        };

        Ok(LoginOutcome { session, tokens })
    }

    /// End the caller's session and burn the tokens it presented
    ///
    /// Tokens bound to a different session are left alone.
    pub async fn logout(
        &self,
        context: &AuthContext,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> GuardResult<bool> {
        let revoked = self
            .sessions
            .revoke(&context.session_id, RevocationReason::UserLogout)
            .await?;

        for token in [access_token, refresh_token].into_iter().flatten() {
            let bound = self
                .verifier
                .decode_unverified(token)
                .map(|claims| claims.sid.as_deref() == Some(context.session_id.as_str()))
                .unwrap_or(false);
            if !bound {
                debug!("Skipping token not bound to session {}", context.session_id);
                continue;
            }
            self.blacklist
                .blacklist(
                    token,
                    &context.user_id,
                    Some(&context.session_id),
                    RevocationReason::UserLogout,
                )
                .await?;
        }

        info!(
            "User {} logged out of session {}",
            context.user_id, context.session_id
        );
        Ok(revoked)
    }

    pub async fn revoke_session(
        &self,
        session_id: &str,
        reason: RevocationReason,
    ) -> GuardResult<bool> {
        self.sessions.revoke(session_id, reason).await
    }

    pub async fn revoke_all_for_user(
        &self,
        user_id: &str,
        reason: RevocationReason,
        except_session_id: Option<&str>,
    ) -> GuardResult<usize> {
        self.sessions
            .revoke_all_for_user(user_id, reason, except_session_id)
            .await
    }

    pub async fn list_sessions(&self, user_id: &str) -> GuardResult<Vec<Session>> {
        self.sessions.list(user_id).await
    }

    /// Session by id, for ownership checks by the caller
    pub async fn session(&self, session_id: &str) -> GuardResult<Session> {
        self.sessions.get(session_id).await
    }

    /// Ping the store and time the round trip
    pub async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let result = within(self.config.store_timeout_ms, self.store.ping()).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(()) => HealthStatus {
                healthy: true,
                latency_ms,
                error: None,
            },
            Err(e) => {
                error!("State store health check failed: {}", e);
                HealthStatus {
                    healthy: false,
                    latency_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Approximate session and blacklist counts from at most `sample` keys each
    ///
    /// Never fails; an unreachable store yields `available: false`.
    pub async fn stats(&self, sample: usize) -> SessionStats {
        match self.collect_stats(sample).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Session statistics unavailable: {}", e);
                SessionStats::default()
            }
        }
    }

    async fn collect_stats(&self, sample: usize) -> GuardResult<SessionStats> {
        let timeout = self.config.store_timeout_ms;
        let now = self.clock.now();

        let keys = within(timeout, self.store.scan_keys(SESSION_PATTERN, sample)).await?;
        let mut stats = SessionStats {
            available: true,
            truncated: keys.len() >= sample,
            ..SessionStats::default()
        };

        for key in &keys {
            let Some(payload) = within(timeout, self.store.get(key)).await? else {
                continue;
            };
            let Ok(session) = serde_json::from_str::<Session>(&payload) else {
                continue;
            };
            stats.sampled_sessions += 1;
            match session.effective_state(now) {
                SessionState::Active => stats.active += 1,
                SessionState::Revoked => stats.revoked += 1,
                SessionState::Expired => stats.expired += 1,
                SessionState::Suspicious => stats.suspicious += 1,
            }
        }

        let blacklisted = within(timeout, self.store.scan_keys(BLACKLIST_PATTERN, sample)).await?;
        stats.truncated |= blacklisted.len() >= sample;
        stats.blacklisted_tokens = blacklisted.len();

        Ok(stats)
    }

    /// Prune dangling index members now instead of waiting for the schedule
    pub async fn sweep(&self) -> usize {
        sweep_indexes(
            self.store.as_ref(),
            &self.sessions,
            self.config.sweep_scan_limit,
        )
        .await
    }
}

/// Visit up to `limit` user indexes and drop members whose records expired
async fn sweep_indexes(store: &dyn StateStore, sessions: &SessionStore, limit: usize) -> usize {
    let indexes = match store.scan_keys(USER_INDEX_PATTERN, limit).await {
        Ok(indexes) => indexes,
        Err(e) => {
            warn!("Index sweep could not scan: {}", e);
            return 0;
        }
    };

    let mut pruned = 0;
    for index in indexes {
        let Some(user_id) = index.strip_prefix("user_sessions:") else {
            continue;
        };
        match sessions.prune_index(user_id).await {
            Ok(count) => pruned += count,
            Err(GuardError::Store(e)) if e.is_unavailable() => {
                warn!("Index sweep stopped, store unavailable: {}", e);
                break;
            }
            Err(e) => warn!("Failed to sweep sessions of user {}: {}", user_id, e),
        }
    }
    pruned
}
