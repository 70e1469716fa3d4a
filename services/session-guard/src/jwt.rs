//! JWT service for token generation and verification
//!
//! This module defines the verification contract the session guard consumes
//! ([`TokenVerifier`]) and the issuance contract rotation needs
//! ([`TokenIssuer`]), and implements both with `jsonwebtoken` using either
//! RS256 key pairs or an HS256 shared secret. Expiry is checked against the
//! injected clock rather than the library's own wall-clock check.

use std::sync::Arc;

use anyhow::Result;
use common::Clock;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{GuardError, GuardResult};

/// Signing material
#[derive(Debug, Clone)]
pub enum JwtKeys {
    /// HS256 shared secret
    Hmac(String),
    /// RS256 PEM key pair
    Rsa {
        private_key: String,
        public_key: String,
    },
}

/// JWT configuration
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub keys: JwtKeys,
    /// Access token expiration time in seconds (default: 15 minutes)
    pub access_token_expiry: u64,
    /// Refresh token expiration time in seconds (default: 7 days)
    pub refresh_token_expiry: u64,
}

impl JwtConfig {
    /// Create a new JwtConfig from environment variables
    ///
    /// # Environment Variables
    /// - `JWT_SECRET`: HS256 secret; when set, the RSA variables are ignored
    /// - `JWT_PRIVATE_KEY`: Private key for signing tokens (PEM format) or path to private key file
    /// - `JWT_PUBLIC_KEY`: Public key for verifying tokens (PEM format) or path to public key file
    /// - `JWT_ACCESS_TOKEN_EXPIRY`: Access token expiry in seconds (default: 900)
    /// - `JWT_REFRESH_TOKEN_EXPIRY`: Refresh token expiry in seconds (default: 604800)
    pub fn from_env() -> Result<Self> {
        let keys = match std::env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => JwtKeys::Hmac(secret),
            _ => JwtKeys::Rsa {
                private_key: read_pem("JWT_PRIVATE_KEY")?,
                public_key: read_pem("JWT_PUBLIC_KEY")?,
            },
        };

        let access_token_expiry = std::env::var("JWT_ACCESS_TOKEN_EXPIRY")
            .unwrap_or_else(|_| "900".to_string()) // 15 minutes
            .parse()
            .unwrap_or(900);

        let refresh_token_expiry = std::env::var("JWT_REFRESH_TOKEN_EXPIRY")
            .unwrap_or_else(|_| "604800".to_string()) // 7 days
            .parse()
            .unwrap_or(604800);

        Ok(JwtConfig {
            keys,
            access_token_expiry,
            refresh_token_expiry,
        })
    }
}

/// Read a PEM from an environment variable holding either the PEM itself or
/// a path to it
fn read_pem(var: &str) -> Result<String> {
    let value =
        std::env::var(var).map_err(|_| anyhow::anyhow!("{} environment variable not set", var))?;

    if value.starts_with("-----BEGIN") {
        return Ok(value);
    }

    let pem = std::fs::read_to_string(&value)
        .map_err(|e| anyhow::anyhow!("Failed to read {} file {}: {}", var, value, e))?;
    Ok(pem.trim().to_string())
}

/// Token type enum
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Access token
    Access,
    /// Refresh token
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

/// JWT claims structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user) id
    pub sub: String,
    /// Session the token was issued under
    pub sid: Option<String>,
    /// Organization scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    /// Issued at time
    pub iat: i64,
    /// Expiration time
    pub exp: i64,
    /// Unique token id
    pub jti: String,
    /// Token type (access or refresh)
    pub token_type: TokenType,
}

/// Why a token was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("token has expired")]
    Expired,
    #[error("token is malformed or its signature is invalid: {0}")]
    Invalid(String),
}

/// Signature/expiry verification and claim extraction
pub trait TokenVerifier: Send + Sync {
    /// Fully verify a token and return its claims
    fn verify(&self, token: &str) -> Result<Claims, VerificationError>;

    /// Read claims without checking signature or expiry
    fn decode_unverified(&self, token: &str) -> Result<Claims, VerificationError>;
}

/// Minting of tokens bound to a session
pub trait TokenIssuer: Send + Sync {
    fn issue(
        &self,
        token_type: TokenType,
        user_id: &str,
        session_id: &str,
        organization_id: Option<&str>,
    ) -> GuardResult<String>;

    /// Lifetime of tokens of this type, in seconds
    fn lifetime(&self, token_type: TokenType) -> u64;
}

/// JWT service
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    validation: Validation,
    config: JwtConfig,
    clock: Arc<dyn Clock>,
}

impl JwtService {
    /// Initialize a new JWT service
    pub fn new(config: JwtConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let (encoding_key, decoding_key, algorithm) = match &config.keys {
            JwtKeys::Hmac(secret) => (
                EncodingKey::from_secret(secret.as_bytes()),
                DecodingKey::from_secret(secret.as_bytes()),
                Algorithm::HS256,
            ),
            JwtKeys::Rsa {
                private_key,
                public_key,
            } => (
                EncodingKey::from_rsa_pem(private_key.as_bytes())?,
                DecodingKey::from_rsa_pem(public_key.as_bytes())?,
                Algorithm::RS256,
            ),
        };

        let mut validation = Validation::new(algorithm);
        // Expiry is checked against our own clock below
        validation.validate_exp = false;
        validation.leeway = 0;

        Ok(JwtService {
            encoding_key,
            decoding_key,
            algorithm,
            validation,
            config,
            clock,
        })
    }
}

impl TokenVerifier for JwtService {
    fn verify(&self, token: &str) -> Result<Claims, VerificationError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| VerificationError::Invalid(e.to_string()))?;

        if token_data.claims.exp <= self.clock.now() {
            return Err(VerificationError::Expired);
        }
        Ok(token_data.claims)
    }

    fn decode_unverified(&self, token: &str) -> Result<Claims, VerificationError> {
        let mut validation = Validation::new(self.algorithm);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;

        let token_data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| VerificationError::Invalid(e.to_string()))?;
        Ok(token_data.claims)
    }
}

impl TokenIssuer for JwtService {
    fn issue(
        &self,
        token_type: TokenType,
        user_id: &str,
        session_id: &str,
        organization_id: Option<&str>,
    ) -> GuardResult<String> {
        let now = self.clock.now();
        let lifetime = i64::try_from(self.lifetime(token_type)).unwrap_or(i64::MAX);

        let claims = Claims {
            sub: user_id.to_string(),
            sid: Some(session_id.to_string()),
            org: organization_id.map(str::to_string),
            iat: now,
            exp: now.saturating_add(lifetime),
            jti: Uuid::new_v4().to_string(),
            token_type,
        };

        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| GuardError::Issuance(e.to_string()))
    }

    fn lifetime(&self, token_type: TokenType) -> u64 {
        match token_type {
            TokenType::Access => self.config.access_token_expiry,
            TokenType::Refresh => self.config.refresh_token_expiry,
        }
    }
}
