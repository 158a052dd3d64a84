//! Credential validation.
//!
//! Token issuance is external. The core validates two credential types:
//! JWTs for human/API submitters and per-robot symmetric tokens checked
//! against SHA-256 fingerprints in the store. Both sit behind the
//! `TokenValidator` trait so the transport layers never see key material.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::common::{db_id, CoreError, Result};
use crate::kernel::store::Store;

/// The validated identity handed back to transports.
#[derive(Debug, Clone)]
pub struct Credential {
    pub subject: String,
    pub roles: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// The subject parsed as a robot id, for robot-role credentials.
    pub fn robot_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.subject).ok()
    }
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Credential>;
}

/// SHA-256 fingerprint of a token; the only form a token takes at rest.
pub fn token_fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// JWT (submitters / observers)
// ============================================================================

/// JWT Claims - data stored in the token
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub roles: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    pub jti: String,
}

/// JWT Service - creates and verifies HS256 tokens
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_expire_minutes: i64,
}

impl JwtService {
    pub fn new(secret: &str, issuer: String, access_expire_minutes: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
            access_expire_minutes,
        }
    }

    /// Create a new access token for a subject
    pub fn create_token(&self, subject: &str, roles: Vec<String>) -> Result<String> {
        let now = Utc::now();
        let exp = now + chrono::Duration::minutes(self.access_expire_minutes);

        let claims = Claims {
            sub: subject.to_string(),
            roles,
            exp: exp.timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
            jti: db_id().to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| CoreError::Unauthorized(format!("token encoding failed: {e}")))
    }

    /// Verify and decode a token; returns claims if valid and unexpired
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| CoreError::Unauthorized(format!("invalid token: {e}")))
    }
}

#[async_trait]
impl TokenValidator for JwtService {
    async fn validate(&self, token: &str) -> Result<Credential> {
        let claims = self.verify_token(token)?;
        Ok(Credential {
            subject: claims.sub,
            roles: claims.roles,
            expires_at: DateTime::from_timestamp(claims.exp, 0),
        })
    }
}

// ============================================================================
// Robot tokens (worker sessions)
// ============================================================================

/// Validates robot session tokens against stored fingerprints. With robot
/// auth disabled (development), any non-empty token is accepted and the
/// session's robot id is taken from the register frame.
pub struct RobotTokenValidator {
    store: Arc<dyn Store>,
    enabled: bool,
}

impl RobotTokenValidator {
    pub fn new(store: Arc<dyn Store>, enabled: bool) -> Self {
        Self { store, enabled }
    }
}

#[async_trait]
impl TokenValidator for RobotTokenValidator {
    async fn validate(&self, token: &str) -> Result<Credential> {
        if token.is_empty() {
            return Err(CoreError::Unauthorized("empty robot token".into()));
        }
        if !self.enabled {
            return Ok(Credential {
                subject: String::new(),
                roles: vec!["robot".to_string()],
                expires_at: None,
            });
        }

        let fingerprint = token_fingerprint(token);
        let key = self
            .store
            .find_robot_key(&fingerprint)
            .await?
            .ok_or_else(|| CoreError::Unauthorized("unknown robot token".into()))?;
        if key.is_revoked() {
            return Err(CoreError::Unauthorized("robot token revoked".into()));
        }

        Ok(Credential {
            subject: key.robot_id.to_string(),
            roles: vec!["robot".to_string()],
            expires_at: None,
        })
    }
}
