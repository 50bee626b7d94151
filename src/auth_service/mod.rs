//! Auth microservice: registration, login, token issuance and refresh,
//! profile management, and admin user management
//!
//! Business rules live on `AuthService` methods returning `ApiResult`, with
//! thin axum handlers on top. Login failures count toward a lockout; refresh
//! tokens rotate on use and are tracked per user by jti.

pub mod store;
pub mod tokens;

use crate::config::AuthServiceConfig;
use crate::error::{ApiError, ApiResult};
use crate::health::HealthChecker;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use store::{Role, StoreError, User, UserProfile, UserStore};
use tokens::{Claims, TokenError, TokenIssuer, TOKEN_TYPE_ACCESS, TOKEN_TYPE_REFRESH};
use tracing::{info, warn};
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 8;

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email pattern"))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub display_name: Option<String>,
    pub department: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IntrospectRequest {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IntrospectResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl IntrospectResponse {
    fn inactive() -> Self {
        Self {
            active: false,
            sub: None,
            email: None,
            roles: None,
            exp: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetRoleRequest {
    pub role: Role,
}

pub struct AuthService {
    store: Arc<dyn UserStore>,
    issuer: TokenIssuer,
    health: HealthChecker,
    lockout_max_attempts: u32,
    lockout_secs: i64,
    diagnostic_mode: bool,
}

impl AuthService {
    pub fn new(config: &AuthServiceConfig, store: Arc<dyn UserStore>) -> Self {
        let issuer = TokenIssuer::new(
            &config.jwt_secret,
            &config.issuer,
            config.access_ttl_mins,
            config.refresh_ttl_days,
        );

        Self {
            store,
            issuer,
            health: HealthChecker::new(),
            lockout_max_attempts: config.lockout_max_attempts,
            lockout_secs: config.lockout_secs,
            diagnostic_mode: config.diagnostic_mode,
        }
    }

    fn internal(&self, err: StoreError) -> ApiError {
        if self.diagnostic_mode {
            ApiError::Internal(err.to_string())
        } else {
            ApiError::Internal("storage failure".to_string())
        }
    }

    pub async fn register(&self, req: RegisterRequest) -> ApiResult<UserProfile> {
        if !email_regex().is_match(&req.email) {
            return Err(ApiError::Validation("invalid email address".to_string()));
        }
        if req.password.len() < MIN_PASSWORD_LEN {
            return Err(ApiError::Validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        if req.display_name.trim().is_empty() {
            return Err(ApiError::Validation("display_name is required".to_string()));
        }

        let hash = hash_password(&req.password)?;
        let user = User::new(&req.email, req.display_name.trim(), hash);
        let profile = UserProfile::from(&user);

        match self.store.insert(user).await {
            Ok(()) => {
                info!(email = %profile.email, "user registered");
                Ok(profile)
            }
            Err(StoreError::DuplicateEmail) => Err(ApiError::Conflict(
                "email already registered".to_string(),
            )),
            Err(e) => Err(self.internal(e)),
        }
    }

    pub async fn login(&self, req: LoginRequest) -> ApiResult<TokenResponse> {
        let mut user = self
            .store
            .find_by_email(&req.email)
            .await
            .map_err(|e| self.internal(e))?
            .ok_or_else(|| ApiError::Authentication("invalid credentials".to_string()))?;

        if !user.active {
            return Err(ApiError::Authentication(
                "account is deactivated".to_string(),
            ));
        }
        if user.is_locked() {
            return Err(ApiError::Locked(
                "account locked after repeated failed logins".to_string(),
            ));
        }

        if !verify_password(&req.password, &user.password_hash) {
            user.record_failed_login(self.lockout_max_attempts, self.lockout_secs);
            let locked = user.is_locked();
            warn!(email = %user.email, failed_logins = user.failed_logins, "failed login");
            self.store.update(user).await.map_err(|e| self.internal(e))?;

            return Err(if locked {
                ApiError::Locked("account locked after repeated failed logins".to_string())
            } else {
                ApiError::Authentication("invalid credentials".to_string())
            });
        }

        user.reset_lockout();
        user.prune_expired_refresh_tokens();
        let response = self.issue_pair(&mut user)?;
        self.store.update(user).await.map_err(|e| self.internal(e))?;

        Ok(response)
    }

    pub async fn refresh(&self, req: RefreshRequest) -> ApiResult<TokenResponse> {
        let claims = self.verify_token(&req.refresh_token)?;
        if claims.token_type != TOKEN_TYPE_REFRESH {
            return Err(ApiError::Authentication("invalid token type".to_string()));
        }

        let mut user = self.user_from_claims(&claims).await?;
        if !user.has_refresh_token(&claims.jti) {
            return Err(ApiError::Authentication(
                "refresh token revoked".to_string(),
            ));
        }

        // Rotation: the presented token is spent, a new pair is issued
        user.remove_refresh_token(&claims.jti);
        user.prune_expired_refresh_tokens();
        let response = self.issue_pair(&mut user)?;
        self.store.update(user).await.map_err(|e| self.internal(e))?;

        Ok(response)
    }

    pub async fn logout(&self, req: RefreshRequest) -> ApiResult<()> {
        let claims = match self.issuer.verify(&req.refresh_token) {
            Ok(claims) => claims,
            // An expired token is already unusable; logout is a no-op
            Err(TokenError::Expired) => return Ok(()),
            Err(TokenError::Invalid) => {
                return Err(ApiError::Authentication("invalid token".to_string()))
            }
        };

        let mut user = self.user_from_claims(&claims).await?;
        user.remove_refresh_token(&claims.jti);
        self.store.update(user).await.map_err(|e| self.internal(e))?;
        Ok(())
    }

    pub async fn profile(&self, headers: &HeaderMap) -> ApiResult<UserProfile> {
        let (_claims, user) = self.authenticate(headers).await?;
        Ok(UserProfile::from(&user))
    }

    pub async fn update_profile(
        &self,
        headers: &HeaderMap,
        req: UpdateProfileRequest,
    ) -> ApiResult<UserProfile> {
        let (_claims, mut user) = self.authenticate(headers).await?;

        if let Some(display_name) = req.display_name {
            if display_name.trim().is_empty() {
                return Err(ApiError::Validation(
                    "display_name must not be empty".to_string(),
                ));
            }
            user.display_name = display_name.trim().to_string();
        }
        if let Some(department) = req.department {
            user.department = Some(department);
        }
        user.updated_at = chrono::Utc::now();

        let profile = UserProfile::from(&user);
        self.store.update(user).await.map_err(|e| self.internal(e))?;
        Ok(profile)
    }

    /// RFC 7662-shaped introspection; any verification failure is simply
    /// `active: false`, not an error.
    pub async fn introspect(&self, req: IntrospectRequest) -> IntrospectResponse {
        let claims = match self.issuer.verify(&req.token) {
            Ok(claims) => claims,
            Err(_) => return IntrospectResponse::inactive(),
        };

        match self.user_from_claims(&claims).await {
            Ok(user) => IntrospectResponse {
                active: true,
                sub: Some(claims.sub),
                roles: Some(user.roles()),
                email: Some(user.email),
                exp: Some(claims.exp),
            },
            Err(_) => IntrospectResponse::inactive(),
        }
    }

    pub async fn list_users(&self, headers: &HeaderMap) -> ApiResult<Vec<UserProfile>> {
        self.require_admin(headers).await?;
        let users = self.store.list().await.map_err(|e| self.internal(e))?;
        Ok(users.iter().map(UserProfile::from).collect())
    }

    pub async fn set_role(
        &self,
        headers: &HeaderMap,
        id: Uuid,
        req: SetRoleRequest,
    ) -> ApiResult<UserProfile> {
        self.require_admin(headers).await?;

        let mut user = self
            .store
            .find_by_id(id)
            .await
            .map_err(|e| self.internal(e))?
            .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;

        user.role = req.role;
        user.updated_at = chrono::Utc::now();
        let profile = UserProfile::from(&user);
        self.store.update(user).await.map_err(|e| self.internal(e))?;

        info!(user_id = %id, role = profile.role.as_str(), "role changed");
        Ok(profile)
    }

    /// Soft delete: the record stays, the account stops working.
    pub async fn deactivate(&self, headers: &HeaderMap, id: Uuid) -> ApiResult<()> {
        self.require_admin(headers).await?;

        let mut user = self
            .store
            .find_by_id(id)
            .await
            .map_err(|e| self.internal(e))?
            .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;

        user.active = false;
        user.refresh_tokens.clear();
        user.updated_at = chrono::Utc::now();
        self.store.update(user).await.map_err(|e| self.internal(e))?;

        info!(user_id = %id, "user deactivated");
        Ok(())
    }

    pub fn liveness(&self) -> crate::health::HealthResponse {
        self.health.liveness()
    }

    fn verify_token(&self, token: &str) -> ApiResult<Claims> {
        self.issuer.verify(token).map_err(|e| match e {
            TokenError::Expired => ApiError::Authentication("token expired".to_string()),
            TokenError::Invalid => ApiError::Authentication("invalid token".to_string()),
        })
    }

    async fn user_from_claims(&self, claims: &Claims) -> ApiResult<User> {
        let id = Uuid::parse_str(&claims.sub)
            .map_err(|_| ApiError::Authentication("invalid token subject".to_string()))?;

        let user = self
            .store
            .find_by_id(id)
            .await
            .map_err(|e| self.internal(e))?
            .ok_or_else(|| ApiError::Authentication("unknown user".to_string()))?;

        if !user.active {
            return Err(ApiError::Authentication(
                "account is deactivated".to_string(),
            ));
        }
        Ok(user)
    }

    /// Validate the request's bearer access token and load its user.
    async fn authenticate(&self, headers: &HeaderMap) -> ApiResult<(Claims, User)> {
        let token = bearer_token(headers)
            .ok_or_else(|| ApiError::Authentication("missing bearer token".to_string()))?;

        let claims = self.verify_token(token)?;
        if claims.token_type != TOKEN_TYPE_ACCESS {
            return Err(ApiError::Authentication("invalid token type".to_string()));
        }

        let user = self.user_from_claims(&claims).await?;
        Ok((claims, user))
    }

    async fn require_admin(&self, headers: &HeaderMap) -> ApiResult<User> {
        let (_claims, user) = self.authenticate(headers).await?;
        if user.role != Role::Admin {
            return Err(ApiError::Authorization("admin role required".to_string()));
        }
        Ok(user)
    }

    fn issue_pair(&self, user: &mut User) -> ApiResult<TokenResponse> {
        let roles = user.roles();
        let access = self
            .issuer
            .issue_access(user.id, &user.email, &roles)
            .map_err(|e| ApiError::Internal(format!("token signing failed: {}", e)))?;
        let refresh = self
            .issuer
            .issue_refresh(user.id, &user.email, &roles)
            .map_err(|e| ApiError::Internal(format!("token signing failed: {}", e)))?;

        user.add_refresh_token(&refresh.jti, refresh.expires_at);

        Ok(TokenResponse {
            access_token: access.token,
            refresh_token: refresh.token,
            token_type: "Bearer".to_string(),
            expires_at: access.expires_at,
        })
    }
}

/// Extract the bearer token from the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Internal(format!("password hashing failed: {}", e)))
}

fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Build the auth service router.
pub fn router(service: Arc<AuthService>) -> Router {
    Router::new()
        .route("/auth/register", post(register_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/me", get(me_handler).put(update_me_handler))
        .route("/auth/introspect", post(introspect_handler))
        .route("/users", get(list_users_handler))
        .route("/users/:id/role", put(set_role_handler))
        .route("/users/:id", delete(deactivate_handler))
        .route("/health", get(health_handler))
        .with_state(service)
}

async fn register_handler(
    State(service): State<Arc<AuthService>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let profile = service.register(req).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

async fn login_handler(
    State(service): State<Arc<AuthService>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    service.login(req).await.map(Json)
}

async fn refresh_handler(
    State(service): State<Arc<AuthService>>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<TokenResponse>> {
    service.refresh(req).await.map(Json)
}

async fn logout_handler(
    State(service): State<Arc<AuthService>>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    service.logout(req).await?;
    Ok(Json(serde_json::json!({ "message": "logged out" })))
}

async fn me_handler(
    State(service): State<Arc<AuthService>>,
    headers: HeaderMap,
) -> ApiResult<Json<UserProfile>> {
    service.profile(&headers).await.map(Json)
}

async fn update_me_handler(
    State(service): State<Arc<AuthService>>,
    headers: HeaderMap,
    Json(req): Json<UpdateProfileRequest>,
) -> ApiResult<Json<UserProfile>> {
    service.update_profile(&headers, req).await.map(Json)
}

async fn introspect_handler(
    State(service): State<Arc<AuthService>>,
    Json(req): Json<IntrospectRequest>,
) -> Json<IntrospectResponse> {
    Json(service.introspect(req).await)
}

async fn list_users_handler(
    State(service): State<Arc<AuthService>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<UserProfile>>> {
    service.list_users(&headers).await.map(Json)
}

async fn set_role_handler(
    State(service): State<Arc<AuthService>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<SetRoleRequest>,
) -> ApiResult<Json<UserProfile>> {
    service.set_role(&headers, id, req).await.map(Json)
}

async fn deactivate_handler(
    State(service): State<Arc<AuthService>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    service.deactivate(&headers, id).await?;
    Ok(Json(serde_json::json!({ "message": "user deactivated" })))
}

async fn health_handler(State(service): State<Arc<AuthService>>) -> impl IntoResponse {
    (StatusCode::OK, Json(service.liveness()))
}
