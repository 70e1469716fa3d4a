//! Session guard models

pub mod revocation;
pub mod session;

// Re-export for convenience
pub use revocation::{BlacklistEntry, RevocationReason};
pub use session::{ClientInfo, Session, SessionState};

/// Identity attached to an authenticated request for downstream handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub session_id: String,
    pub organization_id: Option<String>,
}
