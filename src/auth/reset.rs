use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRef;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::claims::TokenType;
use crate::auth::jwt::{subject_id, TokenService};
use crate::auth::password::{constant_time_eq, PasswordHashing};
use crate::auth::repo::AccountStore;
use crate::auth::services::{check_new_password, is_valid_email, normalize_email};
use crate::error::{AuthError, AuthResult};
use crate::state::AppState;

/// Delivery channel for reset links.
#[async_trait]
pub trait ResetNotifier: Send + Sync {
    async fn send_reset(
        &self,
        email: &str,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()>;
}

/// Writes reset links to the log. Stand-in until a mail service is wired up.
pub struct LogNotifier;

#[async_trait]
impl ResetNotifier for LogNotifier {
    async fn send_reset(
        &self,
        email: &str,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        info!(email = %email, expires_at = %expires_at, "password reset requested");
        debug!(email = %email, token = %token, "password reset token");
        Ok(())
    }
}

/// Single-use password reset backed by a fingerprint on the user row.
#[derive(Clone)]
pub struct PasswordResetFlow {
    store: Arc<dyn AccountStore>,
    tokens: Arc<TokenService>,
    hashing: PasswordHashing,
    notifier: Arc<dyn ResetNotifier>,
}

impl FromRef<AppState> for PasswordResetFlow {
    fn from_ref(state: &AppState) -> Self {
        Self::new(
            state.store.clone(),
            state.tokens.clone(),
            state.hashing.clone(),
            state.notifier.clone(),
        )
    }
}

impl PasswordResetFlow {
    pub fn new(
        store: Arc<dyn AccountStore>,
        tokens: Arc<TokenService>,
        hashing: PasswordHashing,
        notifier: Arc<dyn ResetNotifier>,
    ) -> Self {
        Self {
            store,
            tokens,
            hashing,
            notifier,
        }
    }

    /// Unknown emails succeed without side effects.
    pub async fn request_reset(&self, email: &str) -> AuthResult<()> {
        let email = normalize_email(email);
        if !is_valid_email(&email) {
            return Err(AuthError::Validation("Invalid email".into()));
        }
        let Some(user) = self.store.find_by_email(&email).await? else {
            debug!("reset requested for unknown email");
            return Ok(());
        };

        let (token, expires_at) = self.tokens.issue_reset_token(user.id, &user.email)?;
        self.store
            .set_reset_token(user.id, &token, expires_at)
            .await?;

        if let Err(e) = self.notifier.send_reset(&user.email, &token, expires_at).await {
            warn!(user_id = %user.id, error = %e, "failed to deliver reset link");
        }
        info!(user_id = %user.id, "reset token issued");
        Ok(())
    }

    /// An expired token is cleaned up even when `new_password` is unacceptable.
    pub async fn complete_reset(&self, token: &str, new_password: &str) -> AuthResult<()> {
        let claims = match self.tokens.verify_kind(token, TokenType::PasswordReset) {
            Ok(claims) => claims,
            Err(AuthError::TokenExpired) => {
                self.discard_expired_token(token).await;
                return Err(AuthError::TokenExpired);
            }
            Err(e) => return Err(e),
        };
        check_new_password(new_password)?;
        let user_id = subject_id(&claims)?;
        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::TokenInvalid)?;

        let Some(stored) = user.reset_token_hash.filter(|s| !s.is_empty()) else {
            debug!(user_id = %user_id, "no reset token on record");
            return Err(AuthError::TokenInvalid);
        };
        let now = OffsetDateTime::now_utc();
        if user.reset_token_expires_at.map_or(true, |exp| exp <= now) {
            self.clear_best_effort(user_id).await;
            return Err(AuthError::TokenInvalid);
        }
        if !constant_time_eq(stored.as_bytes(), token.as_bytes()) {
            debug!(user_id = %user_id, "reset token does not match record");
            return Err(AuthError::TokenInvalid);
        }

        let hash = self.hashing.hash(new_password.to_string()).await?;
        if !self.store.consume_reset_token(user_id, token, &hash).await? {
            // Lost to a concurrent completion or expired meanwhile.
            return Err(AuthError::TokenInvalid);
        }
        info!(user_id = %user_id, "password reset completed");
        Ok(())
    }

    /// A correctly signed reset token past its `exp` clears the stored
    /// fingerprint when it is the one on record.
    async fn discard_expired_token(&self, token: &str) {
        let Ok(claims) = self
            .tokens
            .verify_kind_allow_expired(token, TokenType::PasswordReset)
        else {
            return;
        };
        let Ok(user_id) = subject_id(&claims) else {
            return;
        };
        match self.store.find_by_id(user_id).await {
            Ok(Some(user)) => {
                let on_record = user
                    .reset_token_hash
                    .as_deref()
                    .is_some_and(|stored| constant_time_eq(stored.as_bytes(), token.as_bytes()));
                if on_record {
                    self.clear_best_effort(user_id).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(user_id = %user_id, error = %e, "lookup for expired reset token failed"),
        }
    }

    async fn clear_best_effort(&self, user_id: Uuid) {
        match self.store.clear_reset_token(user_id).await {
            Ok(()) => info!(user_id = %user_id, "expired reset token cleared"),
            Err(e) => warn!(user_id = %user_id, error = %e, "failed to clear expired reset token"),
        }
    }
}
