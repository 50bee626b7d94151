//! User records and the storage seam
//!
//! Persistence is an external collaborator: the service talks to a
//! `UserStore` trait and ships an in-memory implementation used by tests and
//! single-node deployments. A document-database implementation plugs in
//! behind the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

/// A refresh token issued to a user, tracked by jti for revocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub jti: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
    pub role: Role,
    pub department: Option<String>,
    /// Soft delete: deactivated users stay in the store but cannot log in
    pub active: bool,
    pub failed_logins: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub refresh_tokens: Vec<RefreshTokenRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: &str, display_name: &str, password_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: email.to_lowercase(),
            display_name: display_name.to_string(),
            password_hash,
            role: Role::User,
            department: None,
            active: true,
            failed_logins: 0,
            locked_until: None,
            refresh_tokens: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_until.map(|t| t > Utc::now()).unwrap_or(false)
    }

    /// Count a failed login; lock the account once the threshold is hit.
    pub fn record_failed_login(&mut self, max_attempts: u32, lock_secs: i64) {
        self.failed_logins += 1;
        if self.failed_logins >= max_attempts {
            self.locked_until = Some(Utc::now() + Duration::seconds(lock_secs));
        }
        self.updated_at = Utc::now();
    }

    pub fn reset_lockout(&mut self) {
        self.failed_logins = 0;
        self.locked_until = None;
        self.updated_at = Utc::now();
    }

    pub fn add_refresh_token(&mut self, jti: &str, expires_at: i64) {
        self.refresh_tokens.push(RefreshTokenRecord {
            jti: jti.to_string(),
            expires_at,
        });
        self.updated_at = Utc::now();
    }

    /// Remove a refresh token by jti. Returns whether it was present.
    pub fn remove_refresh_token(&mut self, jti: &str) -> bool {
        let before = self.refresh_tokens.len();
        self.refresh_tokens.retain(|t| t.jti != jti);
        self.updated_at = Utc::now();
        self.refresh_tokens.len() < before
    }

    pub fn has_refresh_token(&self, jti: &str) -> bool {
        self.refresh_tokens.iter().any(|t| t.jti == jti)
    }

    /// Drop refresh tokens past their expiry.
    pub fn prune_expired_refresh_tokens(&mut self) {
        let now = Utc::now().timestamp();
        self.refresh_tokens.retain(|t| t.expires_at > now);
    }

    pub fn roles(&self) -> Vec<String> {
        vec![self.role.as_str().to_string()]
    }
}

/// Public view of a user, safe to return to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub department: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            role: user.role,
            department: user.department.clone(),
            active: user.active,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("email already registered")]
    DuplicateEmail,
    #[error("user not found")]
    NotFound,
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert(&self, user: User) -> Result<(), StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    /// Replace the stored record keyed by `user.id`. The in-memory store
    /// holds its lock across the write, so counter updates are atomic.
    async fn update(&self, user: User) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<User>, StoreError>;
}

/// In-memory store backing tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn insert(&self, user: User) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        if users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(StoreError::DuplicateEmail);
        }
        users.insert(user.id, user);
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn update(&self, user: User) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        match users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn list(&self) -> Result<Vec<User>, StoreError> {
        let mut users: Vec<User> = self.users.read().await.values().cloned().collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = InMemoryUserStore::new();
        let user = User::new("Dev@Example.com", "Dev", "hash".to_string());
        let id = user.id;

        store.insert(user).await.unwrap();

        // Email is normalized and lookup is case-insensitive
        let found = store.find_by_email("dev@example.com").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().id, id);
        assert!(store.find_by_id(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let store = InMemoryUserStore::new();
        store
            .insert(User::new("dev@example.com", "One", "h1".to_string()))
            .await
            .unwrap();

        let result = store
            .insert(User::new("DEV@example.com", "Two", "h2".to_string()))
            .await;
        assert!(matches!(result, Err(StoreError::DuplicateEmail)));
    }

    #[tokio::test]
    async fn test_update_missing_user() {
        let store = InMemoryUserStore::new();
        let user = User::new("ghost@example.com", "Ghost", "h".to_string());
        assert!(matches!(
            store.update(user).await,
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_lockout_after_threshold() {
        let mut user = User::new("dev@example.com", "Dev", "h".to_string());

        for _ in 0..4 {
            user.record_failed_login(5, 900);
        }
        assert!(!user.is_locked());

        user.record_failed_login(5, 900);
        assert!(user.is_locked());

        user.reset_lockout();
        assert!(!user.is_locked());
        assert_eq!(user.failed_logins, 0);
    }

    #[test]
    fn test_refresh_token_bookkeeping() {
        let mut user = User::new("dev@example.com", "Dev", "h".to_string());
        let future = Utc::now().timestamp() + 3600;

        user.add_refresh_token("jti-1", future);
        user.add_refresh_token("jti-2", 1); // long expired
        assert!(user.has_refresh_token("jti-1"));

        user.prune_expired_refresh_tokens();
        assert!(user.has_refresh_token("jti-1"));
        assert!(!user.has_refresh_token("jti-2"));

        assert!(user.remove_refresh_token("jti-1"));
        assert!(!user.remove_refresh_token("jti-1"));
    }
}
