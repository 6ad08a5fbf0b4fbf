use std::sync::Arc;

use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::password::PasswordHashing;
use crate::auth::repo::AccountStore;
use crate::auth::repo_types::NewUser;
use crate::error::{AuthError, AuthResult, ConflictKind, StoreError};
use crate::state::AppState;

pub const MIN_PASSWORD_LEN: usize = 8;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn check_new_password(password: &str) -> AuthResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Public view of a freshly registered user.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

/// Registration, login and password change against the account store.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn AccountStore>,
    hashing: PasswordHashing,
}

impl FromRef<AppState> for CredentialStore {
    fn from_ref(state: &AppState) -> Self {
        Self::new(state.store.clone(), state.hashing.clone())
    }
}

impl CredentialStore {
    pub fn new(store: Arc<dyn AccountStore>, hashing: PasswordHashing) -> Self {
        Self { store, hashing }
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> AuthResult<UserSummary> {
        let name = name.trim();
        let email = normalize_email(email);
        if name.is_empty() {
            return Err(AuthError::Validation("Name is required".into()));
        }
        if !is_valid_email(&email) {
            return Err(AuthError::Validation("Invalid email".into()));
        }
        check_new_password(password)?;

        if self.store.find_by_email(&email).await?.is_some() {
            warn!(email = %email, "email already registered");
            return Err(AuthError::Conflict(ConflictKind::EmailTaken));
        }

        let hash = self.hashing.hash(password.to_string()).await?;
        let user = self
            .store
            .create_user(NewUser {
                email,
                password_hash: Some(hash),
                display_name: name.to_string(),
                avatar_url: None,
                is_verified: false,
            })
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation { .. } => AuthError::Conflict(ConflictKind::EmailTaken),
                other => AuthError::Store(other),
            })?;

        info!(user_id = %user.id, "user registered");
        Ok(UserSummary {
            id: user.id,
            name: user.display_name,
            email: user.email,
        })
    }

    /// Returns `(user_id, email)` on success. Unknown email, password-less
    /// account and wrong password are indistinguishable to the caller.
    pub async fn verify_credentials(&self, email: &str, password: &str) -> AuthResult<(Uuid, String)> {
        let email = normalize_email(email);
        let user = self.store.find_by_email(&email).await?;
        let stored = user.as_ref().and_then(|u| u.password_hash.clone());
        let matched = self.hashing.verify(password.to_string(), stored).await?;

        match user {
            Some(user) if matched => {
                info!(user_id = %user.id, "credentials verified");
                Ok((user.id, user.email))
            }
            _ => {
                warn!("credential check failed");
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    pub async fn change_password(&self, user_id: Uuid, old: &str, new: &str) -> AuthResult<()> {
        check_new_password(new)?;
        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::NotFound)?;

        let has_password = user.password_hash.is_some();
        let matched = self
            .hashing
            .verify(old.to_string(), user.password_hash)
            .await?;
        if !matched {
            warn!(user_id = %user_id, has_password, "old password mismatch");
            return Err(AuthError::InvalidCredentials);
        }

        let hash = self.hashing.hash(new.to_string()).await?;
        if !self.store.update_password(user_id, &hash).await? {
            return Err(AuthError::NotFound);
        }
        info!(user_id = %user_id, "password changed");
        Ok(())
    }
}
