//! Gateway-side authentication gate
//!
//! Protected routes present a bearer token which is verified locally against
//! the shared HS256 secret. Verified claims are cached briefly so hot paths
//! skip signature checks; a cached token is trusted until its cache entry
//! expires, even if revoked upstream in the meantime.
//!
//! When an introspection endpoint is configured, cache misses are also checked
//! against the auth service so revoked-but-unexpired tokens get caught. The
//! call is best-effort: if the auth service is unreachable, locally verified
//! claims stand.

use crate::auth_service::bearer_token;
use crate::auth_service::tokens::{self, Claims, TokenError, TOKEN_TYPE_ACCESS};
use crate::config::AuthGateConfig;
use crate::error::{ApiError, ApiResult};
use axum::http::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often the background sweeper evicts expired cache entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct CachedEntry {
    claims: Claims,
    cached_at: Instant,
}

/// Token-keyed cache of verified claims with a fixed TTL.
pub struct TokenCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedEntry>>,
}

impl TokenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached claims for a token, if present and fresh. Stale entries are
    /// evicted on access.
    pub fn get(&self, token: &str) -> Option<Claims> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(token) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => Some(entry.claims.clone()),
            Some(_) => {
                entries.remove(token);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, token: &str, claims: Claims) {
        self.entries.lock().unwrap().insert(
            token.to_string(),
            CachedEntry {
                claims,
                cached_at: Instant::now(),
            },
        );
    }

    /// Evict all expired entries.
    pub fn sweep(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, e| e.cached_at.elapsed() < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The shape of the auth service's introspection response; only `active`
/// matters here.
#[derive(Debug, Deserialize)]
struct IntrospectReply {
    active: bool,
}

pub struct AuthGate {
    secret: String,
    cache: Arc<TokenCache>,
    introspect_url: Option<String>,
    client: reqwest::Client,
}

impl AuthGate {
    pub fn new(config: &AuthGateConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.introspect_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            secret: config.jwt_secret.clone(),
            cache: Arc::new(TokenCache::new(Duration::from_secs(config.cache_ttl_secs))),
            introspect_url: config.introspect_url.clone(),
            client,
        }
    }

    /// Validate the request's bearer token and return its claims.
    pub async fn authenticate(&self, headers: &HeaderMap) -> ApiResult<Claims> {
        let token = bearer_token(headers)
            .ok_or_else(|| ApiError::Authentication("missing bearer token".to_string()))?;

        if let Some(claims) = self.cache.get(token) {
            return Ok(claims);
        }

        let claims = tokens::verify(&self.secret, token).map_err(|e| match e {
            TokenError::Expired => ApiError::Authentication("token expired".to_string()),
            TokenError::Invalid => ApiError::Authentication("invalid token".to_string()),
        })?;

        if claims.token_type != TOKEN_TYPE_ACCESS {
            return Err(ApiError::Authentication("invalid token type".to_string()));
        }

        if let Some(url) = &self.introspect_url {
            match self.introspect(url, token).await {
                Some(false) => {
                    debug!("introspection reports token inactive");
                    return Err(ApiError::Authentication("token revoked".to_string()));
                }
                Some(true) => {}
                // Unreachable auth service must not take the gateway down
                // with it; the local signature check already passed.
                None => warn!("token introspection unavailable, using local verification"),
            }
        }

        self.cache.insert(token, claims.clone());
        Ok(claims)
    }

    async fn introspect(&self, url: &str, token: &str) -> Option<bool> {
        let reply = self
            .client
            .post(url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .ok()?;
        let body: IntrospectReply = reply.json().await.ok()?;
        Some(body.active)
    }

    pub fn cache(&self) -> Arc<TokenCache> {
        Arc::clone(&self.cache)
    }

    /// Spawn the periodic cache sweeper.
    pub fn spawn_sweeper(&self) {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                cache.sweep();
            }
        });
    }
}

/// Add identity headers for the upstream, derived from verified claims.
pub fn inject_identity_headers(headers: &mut HeaderMap, claims: &Claims) {
    if let Ok(value) = HeaderValue::from_str(&claims.sub) {
        headers.insert("x-user-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&claims.email) {
        headers.insert("x-user-email", value);
    }
    if let Ok(value) = HeaderValue::from_str(&claims.roles.join(",")) {
        headers.insert("x-user-roles", value);
    }
    headers.insert("x-authenticated", HeaderValue::from_static("true"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_service::tokens::TokenIssuer;
    use uuid::Uuid;

    const SECRET: &str = "gate-test-secret";

    fn gate() -> AuthGate {
        AuthGate::new(&AuthGateConfig {
            jwt_secret: SECRET.to_string(),
            cache_ttl_secs: 300,
            introspect_url: None,
            introspect_timeout_secs: 2,
        })
    }

    fn access_token() -> String {
        TokenIssuer::new(SECRET, "pylon-auth", 15, 7)
            .issue_access(Uuid::new_v4(), "dev@example.com", &["user".to_string()])
            .unwrap()
            .token
    }

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", token).parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_valid_token_authenticates_and_caches() {
        let gate = gate();
        let token = access_token();

        let claims = gate.authenticate(&headers_with(&token)).await.unwrap();
        assert_eq!(claims.email, "dev@example.com");
        assert_eq!(gate.cache.len(), 1);

        // Second call is a cache hit
        let again = gate.authenticate(&headers_with(&token)).await.unwrap();
        assert_eq!(again.jti, claims.jti);
    }

    #[tokio::test]
    async fn test_missing_and_malformed_headers_rejected() {
        let gate = gate();

        let empty = HeaderMap::new();
        assert!(matches!(
            gate.authenticate(&empty).await,
            Err(ApiError::Authentication(_))
        ));

        let garbage = headers_with("not-a-jwt");
        let err = gate.authenticate(&garbage).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid token");
    }

    #[tokio::test]
    async fn test_expired_token_reported_as_expired() {
        use chrono::{Duration as ChronoDuration, Utc};
        use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

        let now = Utc::now();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            email: "dev@example.com".to_string(),
            roles: vec![],
            iss: "pylon-auth".to_string(),
            token_type: TOKEN_TYPE_ACCESS.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: (now - ChronoDuration::hours(2)).timestamp(),
            exp: (now - ChronoDuration::hours(1)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let gate = gate();
        let err = gate.authenticate(&headers_with(&token)).await.unwrap_err();
        assert_eq!(err.to_string(), "token expired");
    }

    #[tokio::test]
    async fn test_refresh_token_rejected_at_gate() {
        let gate = gate();
        let refresh = TokenIssuer::new(SECRET, "pylon-auth", 15, 7)
            .issue_refresh(Uuid::new_v4(), "dev@example.com", &[])
            .unwrap()
            .token;

        let err = gate.authenticate(&headers_with(&refresh)).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid token type");
    }

    #[test]
    fn test_cache_expiry() {
        let cache = TokenCache::new(Duration::from_millis(50));
        let claims = Claims {
            sub: "u1".to_string(),
            email: "dev@example.com".to_string(),
            roles: vec![],
            iss: "pylon-auth".to_string(),
            token_type: TOKEN_TYPE_ACCESS.to_string(),
            jti: "j1".to_string(),
            iat: 0,
            exp: i64::MAX,
        };

        cache.insert("tok", claims);
        assert!(cache.get("tok").is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("tok").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_evicts_stale_entries() {
        let cache = TokenCache::new(Duration::from_millis(10));
        let claims = Claims {
            sub: "u1".to_string(),
            email: "a@b.c".to_string(),
            roles: vec![],
            iss: "pylon-auth".to_string(),
            token_type: TOKEN_TYPE_ACCESS.to_string(),
            jti: "j1".to_string(),
            iat: 0,
            exp: i64::MAX,
        };

        cache.insert("tok-1", claims.clone());
        cache.insert("tok-2", claims);
        std::thread::sleep(Duration::from_millis(20));
        cache.sweep();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_identity_headers() {
        let claims = Claims {
            sub: "user-123".to_string(),
            email: "dev@example.com".to_string(),
            roles: vec!["user".to_string(), "admin".to_string()],
            iss: "pylon-auth".to_string(),
            token_type: TOKEN_TYPE_ACCESS.to_string(),
            jti: "j1".to_string(),
            iat: 0,
            exp: 0,
        };

        let mut headers = HeaderMap::new();
        inject_identity_headers(&mut headers, &claims);

        assert_eq!(headers.get("x-user-id").unwrap(), "user-123");
        assert_eq!(headers.get("x-user-email").unwrap(), "dev@example.com");
        assert_eq!(headers.get("x-user-roles").unwrap(), "user,admin");
        assert_eq!(headers.get("x-authenticated").unwrap(), "true");
    }
}
