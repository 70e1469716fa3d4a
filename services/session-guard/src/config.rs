//! Runtime settings for the session guard
//!
//! Defaults are overridden by `GUARD_*` environment variables, e.g.
//! `GUARD_STORE_TIMEOUT_MS=150` or `GUARD_EXEMPT_PATHS=/health,/auth/login`.

use serde::Deserialize;

use crate::activity::ActivityPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Lifetime of a session from creation, in seconds
    pub session_ttl_secs: u64,
    /// Deadline for each state store call
    pub store_timeout_ms: u64,
    /// Deadline for each audit sink call
    pub audit_timeout_ms: u64,
    /// Access count above which a young session is suspicious
    pub velocity_threshold: u64,
    /// Age below which the velocity check applies, in seconds
    pub velocity_window_secs: i64,
    /// Request paths that bypass authentication (exact or `prefix/*`)
    pub exempt_paths: Vec<String>,
    /// Cookie carrying the refresh token
    pub refresh_cookie_name: String,
    /// Max-Age of the refresh cookie, in seconds
    pub refresh_cookie_max_age_secs: i64,
    /// Mark cookies `Secure`
    pub secure_cookies: bool,
    /// HTTP listen address
    pub bind_addr: String,
    /// Cron schedule of the index hygiene sweep
    pub sweep_schedule: String,
    /// Maximum user indexes visited per sweep
    pub sweep_scan_limit: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 604_800, // 7 days
            store_timeout_ms: 250,
            audit_timeout_ms: 500,
            velocity_threshold: 1000,
            velocity_window_secs: 3600,
            exempt_paths: vec![
                "/health".to_string(),
                "/auth/login".to_string(),
                "/auth/register".to_string(),
            ],
            refresh_cookie_name: "refresh_token".to_string(),
            refresh_cookie_max_age_secs: 604_800,
            secure_cookies: true,
            bind_addr: "0.0.0.0:3000".to_string(),
            sweep_schedule: "0 */15 * * * *".to_string(),
            sweep_scan_limit: 1000,
        }
    }
}

impl GuardConfig {
    /// Load defaults overlaid with `GUARD_*` environment variables
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("GUARD")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("exempt_paths"),
            )
            .build()?
            .try_deserialize()
    }

    pub fn activity_policy(&self) -> ActivityPolicy {
        ActivityPolicy {
            velocity_threshold: self.velocity_threshold,
            velocity_window_secs: self.velocity_window_secs,
        }
    }

    /// Whether requests to `path` skip authentication
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|exempt| match exempt.strip_suffix("/*") {
            Some(prefix) => path == prefix || path.starts_with(&format!("{}/", prefix)),
            None => path == exempt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults_without_environment() {
        let config = GuardConfig::load().expect("defaults load");
        assert_eq!(config.session_ttl_secs, 604_800);
        assert_eq!(config.store_timeout_ms, 250);
        assert_eq!(config.velocity_threshold, 1000);
        assert!(config.secure_cookies);
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        // SAFETY: serialized with every other test touching the environment
        unsafe {
            std::env::set_var("GUARD_STORE_TIMEOUT_MS", "120");
            std::env::set_var("GUARD_SECURE_COOKIES", "false");
            std::env::set_var("GUARD_EXEMPT_PATHS", "/health,/public/*");
        }

        let config = GuardConfig::load();

        unsafe {
            std::env::remove_var("GUARD_STORE_TIMEOUT_MS");
            std::env::remove_var("GUARD_SECURE_COOKIES");
            std::env::remove_var("GUARD_EXEMPT_PATHS");
        }

        let config = config.expect("overrides load");
        assert_eq!(config.store_timeout_ms, 120);
        assert!(!config.secure_cookies);
        assert_eq!(config.exempt_paths, vec!["/health", "/public/*"]);
        assert_eq!(config.velocity_window_secs, 3600);
    }

    #[test]
    fn exempt_paths_match_exactly_or_by_prefix() {
        let config = GuardConfig {
            exempt_paths: vec!["/health".into(), "/public/*".into()],
            ..GuardConfig::default()
        };
        assert!(config.is_exempt("/health"));
        assert!(!config.is_exempt("/healthz"));
        assert!(config.is_exempt("/public"));
        assert!(config.is_exempt("/public/logo.png"));
        assert!(!config.is_exempt("/publicity"));
        assert!(!config.is_exempt("/me"));
    }
}
