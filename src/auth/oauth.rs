use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRef;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::auth::repo::{AccountStore, AccountTx};
use crate::auth::repo_types::{NewUser, User};
use crate::auth::services::normalize_email;
use crate::error::{AuthError, AuthResult, ConflictKind, StoreError};
use crate::state::AppState;

/// Identity vouched for by an external provider.
#[derive(Debug, Clone)]
pub struct IdentityAssertion {
    pub provider: String,
    pub provider_user_id: String,
    pub email: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// An OAuth2 authorization-code provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Consent page URL carrying `state`.
    fn authorize_url(&self, state: &str) -> AuthResult<String>;

    /// Exchange an authorization code for the user's profile.
    async fn fetch_identity(&self, code: &str) -> AuthResult<IdentityAssertion>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The external identity was already linked.
    Linked,
    /// Linked to an existing account found by email.
    NewlyLinked,
    /// A new pre-verified account was created for it.
    NewUser,
}

#[derive(Debug, Clone)]
pub struct LinkedIdentity {
    pub outcome: LinkOutcome,
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Clone)]
pub struct OAuthIdentityLinker {
    store: Arc<dyn AccountStore>,
}

impl FromRef<AppState> for OAuthIdentityLinker {
    fn from_ref(state: &AppState) -> Self {
        Self::new(state.store.clone())
    }
}

impl OAuthIdentityLinker {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, assertion), fields(provider = %assertion.provider))]
    pub async fn link(&self, assertion: &IdentityAssertion) -> AuthResult<LinkedIdentity> {
        let email = normalize_email(&assertion.email);
        if email.is_empty() || assertion.provider_user_id.trim().is_empty() {
            return Err(AuthError::Validation(
                "Identity provider returned incomplete profile".into(),
            ));
        }

        match self.try_link(assertion, &email).await {
            Err(AuthError::Store(e)) if e.is_race() => {
                warn!(error = %e, "identity link raced with a concurrent request; retrying");
                match self.try_link(assertion, &email).await {
                    Err(AuthError::Store(e)) if e.is_race() => {
                        warn!(error = %e, "identity link lost the race twice");
                        Err(AuthError::Conflict(ConflictKind::IdentityLinked))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn try_link(&self, a: &IdentityAssertion, email: &str) -> AuthResult<LinkedIdentity> {
        let mut tx = self.store.begin().await?;

        if let Some(link) = tx
            .find_oauth_account(&a.provider, &a.provider_user_id)
            .await?
        {
            let user = tx
                .find_user_by_id(link.user_id)
                .await?
                .ok_or(AuthError::Store(StoreError::NotFound))?;
            refresh_profile(tx.as_mut(), &user, a).await?;
            tx.commit().await?;
            info!(user_id = %user.id, "existing identity link");
            return Ok(LinkedIdentity {
                outcome: LinkOutcome::Linked,
                user_id: user.id,
                email: user.email,
            });
        }

        if let Some(user) = tx.find_user_by_email(email).await? {
            if let Some(existing) = tx.find_oauth_account_for_user(user.id, &a.provider).await? {
                warn!(
                    user_id = %user.id,
                    linked_to = %existing.provider_user_id,
                    "account already linked to another identity"
                );
                return Err(AuthError::Conflict(ConflictKind::IdentityLinked));
            }
            tx.insert_oauth_account(user.id, &a.provider, &a.provider_user_id)
                .await?;
            refresh_profile(tx.as_mut(), &user, a).await?;
            tx.commit().await?;
            info!(user_id = %user.id, "identity linked to existing account");
            return Ok(LinkedIdentity {
                outcome: LinkOutcome::NewlyLinked,
                user_id: user.id,
                email: user.email,
            });
        }

        let display_name = if a.display_name.trim().is_empty() {
            email.split('@').next().unwrap_or(email).to_string()
        } else {
            a.display_name.trim().to_string()
        };
        let user = tx
            .insert_user(NewUser {
                email: email.to_string(),
                password_hash: None,
                display_name,
                avatar_url: a.avatar_url.clone().filter(|s| !s.is_empty()),
                is_verified: true,
            })
            .await?;
        tx.insert_oauth_account(user.id, &a.provider, &a.provider_user_id)
            .await?;
        tx.commit().await?;
        info!(user_id = %user.id, "new account created from identity");
        Ok(LinkedIdentity {
            outcome: LinkOutcome::NewUser,
            user_id: user.id,
            email: user.email,
        })
    }
}

/// Copy the provider's current name and avatar onto the user when they differ.
async fn refresh_profile(
    tx: &mut dyn AccountTx,
    user: &User,
    a: &IdentityAssertion,
) -> Result<(), StoreError> {
    let name = a.display_name.trim();
    let name = if name.is_empty() {
        user.display_name.as_str()
    } else {
        name
    };
    let avatar = a
        .avatar_url
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(user.avatar_url.as_deref());
    if name != user.display_name || avatar != user.avatar_url.as_deref() {
        tx.set_profile(user.id, name, avatar).await?;
    }
    Ok(())
}
