//! Session model and related functionality

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::RevocationReason;

/// Lifecycle state of a session
///
/// Only `Active` authorizes requests; every other state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Revoked,
    Expired,
    Suspicious,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Revoked => "revoked",
            SessionState::Expired => "expired",
            SessionState::Suspicious => "suspicious",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network origin of a request, captured at login and compared later
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn new(ip_address: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            ip_address,
            user_agent,
        }
    }
}

/// Session entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub created_at: i64,
    pub last_accessed_at: i64,
    pub expires_at: i64,
    pub state: SessionState,
    pub client_info: ClientInfo,
    pub revocation_reason: Option<RevocationReason>,
    pub revoked_at: Option<i64>,
    pub access_count: u64,
    pub refresh_count: u64,
}

impl Session {
    /// A freshly created session; creation counts as the first access
    pub fn new(
        user_id: &str,
        organization_id: Option<String>,
        client_info: ClientInfo,
        now: i64,
        ttl_seconds: u64,
    ) -> Self {
        let session_id = generate_session_id(user_id, now, &client_info);
        Self {
            session_id,
            user_id: user_id.to_string(),
            organization_id,
            created_at: now,
            last_accessed_at: now,
            expires_at: now.saturating_add(i64::try_from(ttl_seconds).unwrap_or(i64::MAX)),
            state: SessionState::Active,
            client_info,
            revocation_reason: None,
            revoked_at: None,
            access_count: 1,
            refresh_count: 0,
        }
    }

    /// Whether the session may authorize a request at `now`
    pub fn is_authoritative(&self, now: i64) -> bool {
        self.state == SessionState::Active && now < self.expires_at
    }

    /// The state as seen at `now`: an active record past its expiry reads as
    /// expired even if the store has not reclaimed it yet
    pub fn effective_state(&self, now: i64) -> SessionState {
        if self.state == SessionState::Active && now >= self.expires_at {
            SessionState::Expired
        } else {
            self.state
        }
    }
}

/// Derive an opaque session id from the subject, creation time, client
/// fingerprint and fresh randomness
fn generate_session_id(user_id: &str, now: i64, client_info: &ClientInfo) -> String {
    let nonce: [u8; 16] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(now.to_be_bytes());
    hasher.update(b"|");
    hasher.update(client_info.ip_address.as_deref().unwrap_or_default());
    hasher.update(b"|");
    hasher.update(client_info.user_agent.as_deref().unwrap_or_default());
    hasher.update(nonce);
    hex::encode(&hasher.finalize()[..20])
}
