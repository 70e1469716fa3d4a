//! Suspicious session activity heuristics
//!
//! Two signals flag a session: the browser family changed since login, or
//! the session was used implausibly often shortly after creation. A changed
//! network address is recorded for the audit trail but never flags a session
//! on its own, since mobile and NAT clients change addresses legitimately.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::models::{ClientInfo, Session};

/// Coarse browser family derived from a user-agent string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserFamily {
    Edge,
    Opera,
    Samsung,
    Firefox,
    Chrome,
    Safari,
    Curl,
    Other,
}

/// Classify a user agent; order matters since Chromium derivatives also
/// advertise Chrome and Safari
pub fn browser_family(user_agent: &str) -> BrowserFamily {
    static PATTERNS: OnceLock<Vec<(BrowserFamily, Regex)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            (BrowserFamily::Edge, r"\bEdg(e|A|iOS)?/"),
            (BrowserFamily::Opera, r"\b(OPR|Opera)/"),
            (BrowserFamily::Samsung, r"\bSamsungBrowser/"),
            (BrowserFamily::Firefox, r"\b(Firefox|FxiOS)/"),
            (BrowserFamily::Chrome, r"\b(Chrome|CriOS|Chromium)/"),
            (BrowserFamily::Safari, r"\bVersion/[\d.]+.*\bSafari/"),
            (BrowserFamily::Curl, r"^curl/"),
        ]
        .into_iter()
        .map(|(family, pattern)| {
            (
                family,
                Regex::new(pattern).expect("Failed to compile user agent regex"),
            )
        })
        .collect()
    });

    patterns
        .iter()
        .find(|(_, regex)| regex.is_match(user_agent))
        .map(|(family, _)| *family)
        .unwrap_or(BrowserFamily::Other)
}

/// Tunable thresholds for the access-velocity signal
#[derive(Debug, Clone, Copy)]
pub struct ActivityPolicy {
    /// Accesses above this count are too many for a young session
    pub velocity_threshold: u64,
    /// How long after creation a session counts as young, in seconds
    pub velocity_window_secs: i64,
}

impl Default for ActivityPolicy {
    fn default() -> Self {
        Self {
            velocity_threshold: 1000,
            velocity_window_secs: 3600,
        }
    }
}

/// Outcome of one heuristic pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivityReport {
    pub user_agent_changed: bool,
    pub velocity_exceeded: bool,
    pub ip_changed: bool,
}

impl ActivityReport {
    /// Only the user-agent and velocity signals can flag a session
    pub fn is_suspicious(&self) -> bool {
        self.user_agent_changed || self.velocity_exceeded
    }

    /// Names of the signals that tripped, address change included
    pub fn signals(&self) -> Vec<&'static str> {
        let mut signals = Vec::new();
        if self.user_agent_changed {
            signals.push("user_agent_family_changed");
        }
        if self.velocity_exceeded {
            signals.push("access_velocity");
        }
        if self.ip_changed {
            signals.push("ip_address_changed");
        }
        signals
    }
}

impl ActivityPolicy {
    /// Compare the current request against what the session recorded at login
    pub fn assess(&self, session: &Session, current: &ClientInfo, now: i64) -> ActivityReport {
        let recorded = &session.client_info;

        let user_agent_changed = match (&recorded.user_agent, &current.user_agent) {
            (Some(before), Some(after)) => browser_family(before) != browser_family(after),
            _ => false,
        };

        let velocity_exceeded = session.access_count > self.velocity_threshold
            && now - session.created_at < self.velocity_window_secs;

        let ip_changed = match (&recorded.ip_address, &current.ip_address) {
            (Some(before), Some(after)) => before != after,
            _ => false,
        };

        ActivityReport {
            user_agent_changed,
            velocity_exceeded,
            ip_changed,
        }
    }
}
