//! Connection gate: credential token → verified identity, or refusal.
//!
//! ```text
//! handshake token ──► ConnectionGate::admit
//!                         │ missing?            → AuthError::MissingToken
//!                         ▼
//!                     IdentityProvider::verify  (JWT signature + expiry,
//!                         │                      user lookup)
//!                         ▼
//!                     status == active?         → AuthError::Disabled
//!                         ▼
//!                      Identity (immutable for the connection)
//! ```
//!
//! The account status is read from the user directory on every connection
//! attempt; a token issued before an account was disabled is still refused.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Disabled,
}

/// A user account as held by the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: Uuid,
    pub username: String,
    pub status: AccountStatus,
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub status: AccountStatus,
}

impl From<UserRecord> for Identity {
    fn from(record: UserRecord) -> Self {
        Self {
            user_id: record.user_id,
            username: record.username,
            status: record.status,
        }
    }
}

/// Why a connection was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Authentication token not provided")]
    MissingToken,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    Expired,
    #[error("User does not exist")]
    UnknownUser,
    #[error("Account is disabled")]
    Disabled,
    #[error("Identity lookup failed: {0}")]
    Unavailable(String),
}

/// Exchanges a credential token for an identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Source of user accounts and their current status.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, StoreError>;
}

/// JWT claims. `userId` is accepted for tokens minted by the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    #[serde(alias = "userId")]
    sub: String,
    exp: i64,
    #[serde(default)]
    iat: i64,
}

/// HS256 JWT verification backed by a user directory.
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
    users: Arc<dyn UserDirectory>,
}

impl JwtIdentityProvider {
    pub fn new(secret: &str, users: Arc<dyn UserDirectory>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            users,
        }
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken,
            },
        )?;

        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| AuthError::InvalidToken)?;

        let record = self
            .users
            .find_user(user_id)
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?
            .ok_or(AuthError::UnknownUser)?;

        Ok(record.into())
    }
}

/// Mint an HS256 token for `user_id` valid for `ttl`.
pub fn issue_token(secret: &str, user_id: Uuid, ttl: Duration) -> Result<String, AuthError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (now + ttl).timestamp(),
        iat: now.timestamp(),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AuthError::InvalidToken)
}

/// Fails closed: either an active identity or a refusal reason.
#[derive(Clone)]
pub struct ConnectionGate {
    provider: Arc<dyn IdentityProvider>,
}

impl ConnectionGate {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }

    pub async fn admit(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let token = match token.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(AuthError::MissingToken),
        };

        let identity = self.provider.verify(token).await?;
        if identity.status != AccountStatus::Active {
            return Err(AuthError::Disabled);
        }
        Ok(identity)
    }
}

/// User directory held in memory.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<Uuid, UserRecord>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: UserRecord) {
        self.users.write().insert(record.user_id, record);
    }

    /// Create an active user and return its id.
    pub fn add_active(&self, username: impl Into<String>) -> Uuid {
        let user_id = Uuid::new_v4();
        self.insert(UserRecord {
            user_id,
            username: username.into(),
            status: AccountStatus::Active,
        });
        user_id
    }

    /// Returns false when the user is unknown.
    pub fn set_status(&self, user_id: Uuid, status: AccountStatus) -> bool {
        match self.users.write().get_mut(&user_id) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.read().get(&user_id).cloned())
    }
}
