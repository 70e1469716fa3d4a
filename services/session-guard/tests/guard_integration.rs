//! End-to-end tests driving the real router over an in-process store
//!
//! Time is simulated with `ManualClock`; two services sharing one store
//! stand in for two application instances.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use common::{Clock, ManualClock, MemoryStore, StateStore, StoreResult};
use serde_json::Value;
use session_guard::{
    GuardConfig, SessionService,
    audit::{AuditEvent, AuditEventType, AuditSink, Auditor, MemoryAuditSink},
    blacklist::{blacklist_key, hash_token},
    jwt::{JwtConfig, JwtKeys, JwtService},
    models::{ClientInfo, RevocationReason, SessionState},
    routes::create_router,
    service::LoginOutcome,
    session::SessionStore,
};
use tokio::task::JoinSet;
use tower::ServiceExt;

const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";
const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
const IP: &str = "203.0.113.7";

/// Store that hangs record reads and pings while `stalled_reads` is set, and
/// existence checks while `stalled_lookups` is set
#[derive(Clone)]
struct StallingStore {
    inner: MemoryStore,
    stalled_reads: Arc<AtomicBool>,
    stalled_lookups: Arc<AtomicBool>,
}

impl StallingStore {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            stalled_reads: Arc::new(AtomicBool::new(false)),
            stalled_lookups: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn pause(flag: &AtomicBool) {
        if flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

#[async_trait]
impl StateStore for StallingStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Self::pause(&self.stalled_reads).await;
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Self::pause(&self.stalled_lookups).await;
        self.inner.exists(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()> {
        self.inner.set_ex(key, value, ttl_seconds).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<bool> {
        self.inner.set_nx_ex(key, value, ttl_seconds).await
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> StoreResult<bool> {
        self.inner.compare_and_swap(key, expected, new).await
    }

    async fn insert_indexed(
        &self,
        record_key: &str,
        value: &str,
        ttl_seconds: u64,
        index_key: &str,
        member: &str,
    ) -> StoreResult<()> {
        self.inner
            .insert_indexed(record_key, value, ttl_seconds, index_key, member)
            .await
    }

    async fn members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.inner.members(key).await
    }

    async fn remove_member(&self, key: &str, member: &str) -> StoreResult<()> {
        self.inner.remove_member(key, member).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<u64>> {
        self.inner.ttl(key).await
    }

    async fn scan_keys(&self, pattern: &str, limit: usize) -> StoreResult<Vec<String>> {
        self.inner.scan_keys(pattern, limit).await
    }

    async fn ping(&self) -> StoreResult<()> {
        Self::pause(&self.stalled_reads).await;
        self.inner.ping().await
    }
}

/// Audit sink that never finishes recording
struct StalledSink;

#[async_trait]
impl AuditSink for StalledSink {
    async fn record(&self, _event: &AuditEvent) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

struct Instance {
    app: Router,
    service: SessionService,
    audit: MemoryAuditSink,
}

struct Cluster {
    store: MemoryStore,
    clock: ManualClock,
    jwt: JwtService,
}

impl Cluster {
    fn new() -> Self {
        let clock = ManualClock::new(1_700_000_000);
        let store = MemoryStore::new(Arc::new(clock.clone()));
        let jwt = JwtService::new(
            JwtConfig {
                keys: JwtKeys::Hmac("integration-secret".into()),
                access_token_expiry: 900,
                refresh_token_expiry: 86_400,
            },
            Arc::new(clock.clone()),
        )
        .expect("jwt config");
        Self { store, clock, jwt }
    }

    fn config() -> GuardConfig {
        GuardConfig {
            sweep_schedule: String::new(),
            secure_cookies: false,
            ..GuardConfig::default()
        }
    }

    fn instance(&self) -> Instance {
        self.instance_on(Arc::new(self.store.clone()), Self::config())
    }

    fn instance_on(&self, store: Arc<dyn StateStore>, config: GuardConfig) -> Instance {
        let audit = MemoryAuditSink::default();
        let mut instance = self.instance_with_sink(store, config, Arc::new(audit.clone()));
        instance.audit = audit;
        instance
    }

    /// Instance whose audit events go to `sink`; `Instance::audit` stays empty
    fn instance_with_sink(
        &self,
        store: Arc<dyn StateStore>,
        config: GuardConfig,
        sink: Arc<dyn AuditSink>,
    ) -> Instance {
        let service = SessionService::new(
            config,
            store,
            Arc::new(self.jwt.clone()),
            Arc::new(self.jwt.clone()),
            sink,
            Arc::new(self.clock.clone()),
        );
        Instance {
            app: create_router(service.clone()),
            service,
            audit: MemoryAuditSink::default(),
        }
    }
}

async fn login(instance: &Instance) -> LoginOutcome {
    instance
        .service
        .login(
            "42",
            ClientInfo::new(Some(IP.into()), Some(FIREFOX.into())),
            None,
            None,
        )
        .await
        .expect("login")
}

fn request(method: &str, uri: &str, access: Option<&str>, refresh: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::USER_AGENT, FIREFOX)
        .header("x-forwarded-for", IP);
    if let Some(access) = access {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", access));
    }
    if let Some(refresh) = refresh {
        builder = builder.header(header::COOKIE, format!("refresh_token={}", refresh));
    }
    builder.body(Body::empty()).expect("request")
}

async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.expect("router is infallible")
}

async fn json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn deny_reason(response: Response) -> String {
    json(response).await["reason"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn authenticated_requests_reach_handlers() {
    let cluster = Cluster::new();
    let a = cluster.instance();
    let outcome = login(&a).await;

    let response = send(&a.app, request("GET", "/me", Some(&outcome.tokens.access_token), None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["user_id"], "42");
    assert_eq!(body["session_id"], outcome.session.session_id.as_str());

    let session = a.service.session(&outcome.session.session_id).await.expect("session");
    assert_eq!(session.access_count, 2);
}

#[tokio::test]
async fn missing_and_garbage_credentials_are_unauthorized() {
    let cluster = Cluster::new();
    let a = cluster.instance();

    let response = send(&a.app, request("GET", "/me", None, None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    assert_eq!(deny_reason(response).await, "missing_token");

    let response = send(&a.app, request("GET", "/me", Some("not-a-jwt"), None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(deny_reason(response).await, "invalid_token");
}

#[tokio::test]
async fn exempt_paths_skip_authentication() {
    let cluster = Cluster::new();
    let a = cluster.instance();

    let response = send(&a.app, request("GET", "/health", None, None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"]["healthy"], true);
}

#[tokio::test]
async fn revoked_sessions_are_forbidden() {
    let cluster = Cluster::new();
    let a = cluster.instance();
    let outcome = login(&a).await;

    a.service
        .revoke_session(&outcome.session.session_id, RevocationReason::UserLogout)
        .await
        .expect("revoke");
    let response = send(&a.app, request("GET", "/me", Some(&outcome.tokens.access_token), None)).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(deny_reason(response).await, "session_revoked");
    let token_key = blacklist_key(&hash_token(&outcome.tokens.access_token));
    assert!(cluster.store.exists(&token_key).await.expect("store"));
}

#[tokio::test]
async fn revocation_on_one_instance_applies_on_another() {
    let cluster = Cluster::new();
    let a = cluster.instance();
    let b = cluster.instance();
    let first = login(&a).await;
    let second = login(&a).await;

    let response = send(
        &a.app,
        request("POST", "/auth/logout-all?keep_current=true", Some(&first.tokens.access_token), None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["revoked"], 1);

    let response = send(&b.app, request("GET", "/me", Some(&second.tokens.access_token), None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(deny_reason(response).await, "session_revoked");

    let response = send(&b.app, request("GET", "/me", Some(&first.tokens.access_token), None)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn logout_burns_the_presented_tokens() {
    let cluster = Cluster::new();
    let a = cluster.instance();
    let b = cluster.instance();
    let outcome = login(&a).await;

    let response = send(
        &a.app,
        request(
            "POST",
            "/auth/logout",
            Some(&outcome.tokens.access_token),
            Some(&outcome.tokens.refresh_token),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let cleared = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(cleared.contains("Max-Age=0"));

    let response = send(&b.app, request("GET", "/me", Some(&outcome.tokens.access_token), None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(deny_reason(response).await, "blacklisted_token");
}

#[tokio::test]
async fn only_own_sessions_can_be_revoked() {
    let cluster = Cluster::new();
    let a = cluster.instance();
    let mine = login(&a).await;
    let theirs = a
        .service
        .login("7", ClientInfo::default(), None, None)
        .await
        .expect("login");

    let uri = format!("/auth/sessions/{}", theirs.session.session_id);
    let response = send(&a.app, request("DELETE", &uri, Some(&mine.tokens.access_token), None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let session = a.service.session(&theirs.session.session_id).await.expect("session");
    assert_eq!(session.state, SessionState::Active);

    let response = send(&a.app, request("GET", "/auth/sessions", Some(&mine.tokens.access_token), None)).await;
    let listed = json(response).await;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
    assert_eq!(listed[0]["current"], true);
}

#[tokio::test]
async fn rotated_refresh_tokens_are_single_use() {
    let cluster = Cluster::new();
    let a = cluster.instance();
    let outcome = login(&a).await;
    let session_id = outcome.session.session_id.clone();

    let second = send(
        &a.app,
        request("GET", "/me", Some(&outcome.tokens.access_token), None),
    )
    .await;
    assert_eq!(second.status(), StatusCode::OK);

    // Let the access token lapse so the request falls back to the refresh token
    cluster.clock.advance(901);

    let response = send(
        &a.app,
        request("GET", "/me", Some(&outcome.tokens.access_token), Some(&outcome.tokens.refresh_token)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let new_access = response
        .headers()
        .get("x-new-access-token")
        .and_then(|v| v.to_str().ok())
        .expect("rotated access token")
        .to_string();
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .expect("rotated refresh cookie")
        .to_string();
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Strict"));
    let new_refresh = cookie
        .split(';')
        .next()
        .and_then(|pair| pair.strip_prefix("refresh_token="))
        .expect("cookie value")
        .to_string();

    // Replaying the consumed refresh token is refused
    let replay = send(
        &a.app,
        request("GET", "/me", Some(&outcome.tokens.access_token), Some(&outcome.tokens.refresh_token)),
    )
    .await;
    assert_eq!(replay.status(), StatusCode::FORBIDDEN);
    assert_eq!(deny_reason(replay).await, "blacklisted_token");

    // The replacements work
    let response = send(&a.app, request("GET", "/me", Some(&new_access), None)).await;
    assert_eq!(response.status(), StatusCode::OK);

    cluster.clock.advance(901);
    let response = send(
        &a.app,
        request("GET", "/me", Some(&new_access), Some(&new_refresh)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let session = a.service.session(&session_id).await.expect("session");
    assert_eq!(session.refresh_count, 2);
    assert_eq!(session.state, SessionState::Active);
    assert_eq!(a.audit.count(AuditEventType::TokenRotated).await, 2);
}

#[tokio::test]
async fn access_velocity_revokes_the_session() {
    let cluster = Cluster::new();
    let a = cluster.instance();
    let outcome = login(&a).await;
    let session_id = outcome.session.session_id.clone();

    // Another instance hammers the session within ten minutes of login
    let sessions = SessionStore::new(
        Arc::new(cluster.store.clone()),
        Arc::new(cluster.clock.clone()),
        Auditor::new(Arc::new(MemoryAuditSink::default()), 100),
        604_800,
        250,
    );
    cluster.clock.advance(300);
    for _ in 0..1001 {
        assert!(sessions.touch(&session_id).await.expect("touch"));
    }
    let touched = sessions.get(&session_id).await.expect("session");
    assert_eq!(touched.access_count, 1002);
    assert!(
        GuardConfig::default()
            .activity_policy()
            .assess(&touched, &touched.client_info, cluster.clock.now())
            .is_suspicious()
    );

    let response = send(&a.app, request("GET", "/me", Some(&outcome.tokens.access_token), None)).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(deny_reason(response).await, "suspicious_activity");
    let token_key = blacklist_key(&hash_token(&outcome.tokens.access_token));
    assert!(cluster.store.exists(&token_key).await.expect("store"));

    let session = a.service.session(&session_id).await.expect("session");
    assert_eq!(session.state, SessionState::Revoked);
    assert_eq!(session.revocation_reason, Some(RevocationReason::SuspiciousActivity));
    assert_eq!(a.audit.count(AuditEventType::SuspiciousActivity).await, 1);
}

#[tokio::test]
async fn a_different_browser_is_suspicious_but_a_new_address_is_not() {
    let cluster = Cluster::new();
    let a = cluster.instance();
    let outcome = login(&a).await;

    let moved = Request::builder()
        .uri("/me")
        .header(header::USER_AGENT, FIREFOX)
        .header("x-forwarded-for", "198.51.100.9")
        .header(header::AUTHORIZATION, format!("Bearer {}", outcome.tokens.access_token))
        .body(Body::empty())
        .expect("request");
    assert_eq!(send(&a.app, moved).await.status(), StatusCode::OK);

    let switched = Request::builder()
        .uri("/me")
        .header(header::USER_AGENT, CHROME)
        .header("x-forwarded-for", IP)
        .header(header::AUTHORIZATION, format!("Bearer {}", outcome.tokens.access_token))
        .body(Body::empty())
        .expect("request");
    let response = send(&a.app, switched).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(deny_reason(response).await, "suspicious_activity");
}

#[tokio::test]
async fn a_stalled_store_fails_closed() {
    let cluster = Cluster::new();
    let stalling = StallingStore::new(cluster.store.clone());
    let a = cluster.instance_on(
        Arc::new(stalling.clone()),
        GuardConfig {
            store_timeout_ms: 50,
            ..Cluster::config()
        },
    );
    let outcome = login(&a).await;

    stalling.stalled_reads.store(true, Ordering::SeqCst);
    let response = send(&a.app, request("GET", "/me", Some(&outcome.tokens.access_token), None)).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(deny_reason(response).await, "store_unavailable");

    let response = send(&a.app, request("GET", "/health", None, None)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    stalling.stalled_reads.store(false, Ordering::SeqCst);
    let response = send(&a.app, request("GET", "/me", Some(&outcome.tokens.access_token), None)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn a_stalled_blacklist_lookup_fails_closed() {
    let cluster = Cluster::new();
    let stalling = StallingStore::new(cluster.store.clone());
    let a = cluster.instance_on(
        Arc::new(stalling.clone()),
        GuardConfig {
            store_timeout_ms: 50,
            ..Cluster::config()
        },
    );
    let outcome = login(&a).await;

    stalling.stalled_lookups.store(true, Ordering::SeqCst);
    let started = Instant::now();
    let response = send(&a.app, request("GET", "/me", Some(&outcome.tokens.access_token), None)).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(deny_reason(response).await, "store_unavailable");
    assert!(started.elapsed() < Duration::from_secs(1));

    // The session record was never reached, so nothing was counted
    stalling.stalled_lookups.store(false, Ordering::SeqCst);
    let session = a.service.session(&outcome.session.session_id).await.expect("session");
    assert_eq!(session.access_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_refreshes_leave_the_session_active() {
    let cluster = Cluster::new();
    let a = cluster.instance();
    let outcome = login(&a).await;
    let session_id = outcome.session.session_id.clone();

    // Several tabs hold the same lapsed access token and refresh cookie
    cluster.clock.advance(901);
    let mut requests = JoinSet::new();
    for _ in 0..4 {
        let app = a.app.clone();
        let req = request(
            "GET",
            "/me",
            Some(&outcome.tokens.access_token),
            Some(&outcome.tokens.refresh_token),
        );
        requests.spawn(async move { app.oneshot(req).await.expect("router is infallible") });
    }

    let mut rotated = Vec::new();
    let mut refused = Vec::new();
    while let Some(joined) = requests.join_next().await {
        let response = joined.expect("request task");
        if response.status() == StatusCode::OK {
            let access = response
                .headers()
                .get("x-new-access-token")
                .and_then(|v| v.to_str().ok())
                .expect("rotated access token")
                .to_string();
            rotated.push(access);
        } else {
            let status = response.status();
            refused.push((status, deny_reason(response).await));
        }
    }

    assert_eq!(rotated.len(), 1);
    assert_eq!(refused.len(), 3);
    for (status, reason) in &refused {
        assert_eq!(*status, StatusCode::FORBIDDEN);
        assert_eq!(reason, "blacklisted_token");
    }

    let session = a.service.session(&session_id).await.expect("session");
    assert_eq!(session.state, SessionState::Active);
    assert_eq!(session.revocation_reason, None);
    assert_eq!(session.refresh_count, 1);

    let response = send(&a.app, request("GET", "/me", Some(&rotated[0]), None)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn a_stalled_audit_sink_does_not_delay_decisions() {
    let cluster = Cluster::new();
    let a = cluster.instance_with_sink(
        Arc::new(cluster.store.clone()),
        GuardConfig {
            audit_timeout_ms: 10_000,
            ..Cluster::config()
        },
        Arc::new(StalledSink),
    );

    let started = Instant::now();
    let outcome = login(&a).await;
    assert!(started.elapsed() < Duration::from_secs(1));

    // A browser switch revokes, blacklists and audits on the request path
    let switched = Request::builder()
        .uri("/me")
        .header(header::USER_AGENT, CHROME)
        .header("x-forwarded-for", IP)
        .header(header::AUTHORIZATION, format!("Bearer {}", outcome.tokens.access_token))
        .body(Body::empty())
        .expect("request");
    let started = Instant::now();
    let response = send(&a.app, switched).await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(deny_reason(response).await, "suspicious_activity");
    let session = a.service.session(&outcome.session.session_id).await.expect("session");
    assert_eq!(session.state, SessionState::Revoked);
}
