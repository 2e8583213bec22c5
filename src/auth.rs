use chrono::{Duration, Utc};
use log::{info, warn};
use thiserror::Error;
use tokio::task::spawn_blocking;

use crate::{
    config::MAX_SESSION_DAYS,
    security::{generate_session_token, hash_password, hash_session_token, verify_password},
    store::{Store, StoreError, UserRecord},
};

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Email or password is incorrect
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Invalid email address")]
    InvalidEmail,
    #[error("Password must be at least {} characters", MIN_PASSWORD_LEN)]
    WeakPassword,
    #[error("An account with this email already exists")]
    EmailTaken,
    #[error(transparent)]
    Store(StoreError),
    #[error("HashError: {0}")]
    Hash(String),
    #[error("Session expiry is out of range")]
    SessionExpiry,
}

impl From<StoreError> for AuthError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(_) => Self::EmailTaken,
            other => Self::Store(other),
        }
    }
}

/// A freshly opened session. `token` is the only copy of the secret.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub token: String,
    pub user: UserRecord,
    pub max_age: Duration,
}

#[derive(Clone)]
pub struct Auth {
    store: Store,
    session_ttl: Duration,
}

impl Auth {
    /// `session_days` is clamped to `1..=MAX_SESSION_DAYS`.
    pub fn new(store: Store, session_days: i64) -> Self {
        Self {
            store,
            session_ttl: Duration::days(session_days.clamp(1, MAX_SESSION_DAYS)),
        }
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<SessionGrant, AuthError> {
        let email = normalize_email(email)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        let password = password.to_string();
        let hashed = spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| AuthError::Hash(e.to_string()))?
            .map_err(|e| AuthError::Hash(e.to_string()))?;

        let user = self.store.create_user(&email, &hashed).await?;
        info!("registered {}", user.email);
        self.open_session(user).await
    }

    /// Logs in a user, returning a new session
    pub async fn login(&self, email: &str, password: &str) -> Result<SessionGrant, AuthError> {
        if let Err(err) = self.store.purge_expired_sessions(Utc::now()).await {
            warn!("could not purge expired sessions: {err}");
        }

        let email = normalize_email(email).map_err(|_| AuthError::InvalidCredentials)?;
        let user = self
            .store
            .user_by_email(&email)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        let password = password.to_string();
        let stored = user.password_hash.clone();
        let valid = spawn_blocking(move || verify_password(&password, &stored))
            .await
            .map_err(|e| AuthError::Hash(e.to_string()))?
            .map_err(|e| AuthError::Hash(e.to_string()))?;

        if !valid {
            return Err(AuthError::InvalidCredentials);
        }
        self.open_session(user).await
    }

    /// Deletes the associated session, if it exists
    pub async fn logout(&self, token: &str) -> Result<(), AuthError> {
        self.store
            .delete_session(&hash_session_token(token))
            .await?;
        Ok(())
    }

    /// Returns the user owning a live session
    pub async fn authenticate(&self, token: &str) -> Result<Option<UserRecord>, AuthError> {
        if token.is_empty() {
            return Ok(None);
        }
        Ok(self
            .store
            .session_user(&hash_session_token(token), Utc::now())
            .await?)
    }

    async fn open_session(&self, user: UserRecord) -> Result<SessionGrant, AuthError> {
        let token = generate_session_token();
        let expires_at = Utc::now()
            .checked_add_signed(self.session_ttl)
            .ok_or(AuthError::SessionExpiry)?;
        self.store
            .create_session(&user.id, &hash_session_token(&token), expires_at)
            .await?;

        Ok(SessionGrant {
            token,
            user,
            max_age: self.session_ttl,
        })
    }
}

/// Lowercases and trims, rejecting anything without a plausible
/// `local@domain.tld` shape.
pub fn normalize_email(raw: &str) -> Result<String, AuthError> {
    let email = raw.trim().to_lowercase();
    let Some((local, domain)) = email.split_once('@') else {
        return Err(AuthError::InvalidEmail);
    };
    let plausible = !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace);
    if !plausible {
        return Err(AuthError::InvalidEmail);
    }
    Ok(email)
}
