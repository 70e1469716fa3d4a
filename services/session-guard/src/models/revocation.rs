//! Revocation reasons and blacklist records

use serde::{Deserialize, Serialize};

/// Why a session or token stopped being valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    UserLogout,
    AdminRevoke,
    SecurityBreach,
    SuspiciousActivity,
    TokenRotation,
    PolicyViolation,
    PasswordChange,
    DeviceLimit,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::UserLogout => "user_logout",
            RevocationReason::AdminRevoke => "admin_revoke",
            RevocationReason::SecurityBreach => "security_breach",
            RevocationReason::SuspiciousActivity => "suspicious_activity",
            RevocationReason::TokenRotation => "token_rotation",
            RevocationReason::PolicyViolation => "policy_violation",
            RevocationReason::PasswordChange => "password_change",
            RevocationReason::DeviceLimit => "device_limit",
        }
    }
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RevocationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_logout" => Ok(RevocationReason::UserLogout),
            "admin_revoke" => Ok(RevocationReason::AdminRevoke),
            "security_breach" => Ok(RevocationReason::SecurityBreach),
            "suspicious_activity" => Ok(RevocationReason::SuspiciousActivity),
            "token_rotation" => Ok(RevocationReason::TokenRotation),
            "policy_violation" => Ok(RevocationReason::PolicyViolation),
            "password_change" => Ok(RevocationReason::PasswordChange),
            "device_limit" => Ok(RevocationReason::DeviceLimit),
            other => Err(format!("unknown revocation reason: {}", other)),
        }
    }
}

/// One invalidated token, keyed by the hash of the raw token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub token_hash: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub expires_at: i64,
    pub reason: RevocationReason,
    pub blacklisted_at: i64,
}
