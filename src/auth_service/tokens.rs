//! JWT issuance and verification (HS256 shared secret)
//!
//! The auth service signs access and refresh tokens; the gateway's auth gate
//! verifies them with the same shared secret. Expiry failures are kept
//! distinct from malformed/bad-signature failures so callers can report
//! "token expired" rather than a generic rejection.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const TOKEN_TYPE_ACCESS: &str = "access";
pub const TOKEN_TYPE_REFRESH: &str = "refresh";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Issuer
    pub iss: String,
    /// "access" or "refresh"
    pub token_type: String,
    /// Unique token id; refresh jtis are tracked per user for revocation
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
}

/// Verify an HS256 token against the shared secret. Zero leeway so expiry
/// is exact.
pub fn verify(secret: &str, token: &str) -> Result<Claims, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => Ok(data.claims),
        Err(e) => match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(TokenError::Expired),
            _ => Err(TokenError::Invalid),
        },
    }
}

/// A freshly issued token with its tracking metadata.
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: i64,
}

/// Signs access/refresh token pairs for the auth service.
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    secret: String,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, issuer: &str, access_ttl_mins: i64, refresh_ttl_days: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            secret: secret.to_string(),
            issuer: issuer.to_string(),
            access_ttl: Duration::minutes(access_ttl_mins),
            refresh_ttl: Duration::days(refresh_ttl_days),
        }
    }

    pub fn issue_access(
        &self,
        user_id: Uuid,
        email: &str,
        roles: &[String],
    ) -> anyhow::Result<IssuedToken> {
        self.issue(user_id, email, roles, TOKEN_TYPE_ACCESS, self.access_ttl)
    }

    pub fn issue_refresh(
        &self,
        user_id: Uuid,
        email: &str,
        roles: &[String],
    ) -> anyhow::Result<IssuedToken> {
        self.issue(user_id, email, roles, TOKEN_TYPE_REFRESH, self.refresh_ttl)
    }

    fn issue(
        &self,
        user_id: Uuid,
        email: &str,
        roles: &[String],
        token_type: &str,
        ttl: Duration,
    ) -> anyhow::Result<IssuedToken> {
        let now = Utc::now();
        let exp = now + ttl;
        let jti = Uuid::new_v4().to_string();

        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            roles: roles.to_vec(),
            iss: self.issuer.clone(),
            token_type: token_type.to_string(),
            jti: jti.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;

        Ok(IssuedToken {
            token,
            jti,
            expires_at: exp.timestamp(),
        })
    }

    /// Verify a token issued with this issuer's secret.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        verify(&self.secret, token)
    }
}
