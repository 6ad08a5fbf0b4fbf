//! In-memory `AccountStore` for tests. Enforces the same uniqueness rules as
//! the migration and gives transactions all-or-nothing semantics by staging a
//! copy of the tables under an exclusive lock.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::auth::repo::{AccountStore, AccountTx};
use crate::auth::repo_types::{
    NewUser, OAuthAccount, OnboardingDetails, ProfileUpdate, User, DEFAULT_ROLE,
};
use crate::error::StoreError;

#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub users: Vec<User>,
    pub oauth_accounts: Vec<OAuthAccount>,
}

impl Tables {
    pub fn insert_user(&mut self, new_user: NewUser) -> Result<User, StoreError> {
        if self.users.iter().any(|u| u.email == new_user.email) {
            return Err(StoreError::UniqueViolation {
                constraint: Some("users_email_key".into()),
            });
        }
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email,
            password_hash: new_user.password_hash,
            display_name: new_user.display_name,
            avatar_url: new_user.avatar_url,
            role: DEFAULT_ROLE.into(),
            is_verified: new_user.is_verified,
            user_type: None,
            classroom_code: None,
            onboarding_complete: false,
            selected_curriculum_id: None,
            reset_token_hash: None,
            reset_token_expires_at: None,
            created_at: now,
            updated_at: now,
        };
        self.users.push(user.clone());
        Ok(user)
    }

    pub fn insert_oauth_account(
        &mut self,
        user_id: Uuid,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<(), StoreError> {
        if self
            .oauth_accounts
            .iter()
            .any(|a| a.provider == provider && a.provider_user_id == provider_user_id)
        {
            return Err(StoreError::UniqueViolation {
                constraint: Some("oauth_accounts_provider_provider_user_id_key".into()),
            });
        }
        if self
            .oauth_accounts
            .iter()
            .any(|a| a.user_id == user_id && a.provider == provider)
        {
            return Err(StoreError::UniqueViolation {
                constraint: Some("oauth_accounts_user_id_provider_key".into()),
            });
        }
        self.oauth_accounts.push(OAuthAccount {
            user_id,
            provider: provider.into(),
            provider_user_id: provider_user_id.into(),
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    fn user_mut(&mut self, id: Uuid) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.id == id)
    }
}

type ConcurrentWrite = Box<dyn FnOnce(&mut Tables) + Send>;

#[derive(Clone, Default)]
pub struct InMemoryAccountStore {
    tables: Arc<Mutex<Tables>>,
    before_commit: Arc<StdMutex<Option<ConcurrentWrite>>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Tables {
        self.tables.lock().await.clone()
    }

    /// Make the next commit lose a race: `write` is applied to the committed
    /// tables as if another transaction got there first, and the commit fails
    /// with a serialization failure.
    pub fn lose_next_commit_to(&self, write: impl FnOnce(&mut Tables) + Send + 'static) {
        if let Ok(mut slot) = self.before_commit.lock() {
            *slot = Some(Box::new(write));
        }
    }

    pub async fn seed_user(&self, new_user: NewUser) -> User {
        let mut tables = self.tables.lock().await;
        match tables.insert_user(new_user) {
            Ok(user) => user,
            Err(e) => panic!("seed user: {e}"),
        }
    }

    pub async fn seed_link(&self, user_id: Uuid, provider: &str, provider_user_id: &str) {
        let mut tables = self.tables.lock().await;
        if let Err(e) = tables.insert_oauth_account(user_id, provider, provider_user_id) {
            panic!("seed link: {e}");
        }
    }

    pub async fn set_reset_expiry(&self, id: Uuid, expires_at: OffsetDateTime) {
        let mut tables = self.tables.lock().await;
        if let Some(user) = tables.user_mut(id) {
            user.reset_token_expires_at = Some(expires_at);
        }
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.users.iter().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.users.iter().find(|u| u.id == id).cloned())
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError> {
        self.tables.lock().await.insert_user(new_user)
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.user_mut(id) {
            Some(user) => {
                user.password_hash = Some(password_hash.into());
                user.updated_at = OffsetDateTime::now_utc();
                true
            }
            None => false,
        })
    }

    async fn update_profile(
        &self,
        id: Uuid,
        update: &ProfileUpdate,
    ) -> Result<Option<User>, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.user_mut(id).map(|user| {
            if let Some(name) = &update.display_name {
                user.display_name = name.clone();
            }
            if let Some(avatar) = &update.avatar_url {
                user.avatar_url = Some(avatar.clone());
            }
            user.updated_at = OffsetDateTime::now_utc();
            user.clone()
        }))
    }

    async fn delete_user(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables.users.len();
        tables.users.retain(|u| u.id != id);
        tables.oauth_accounts.retain(|a| a.user_id != id);
        Ok(tables.users.len() != before)
    }

    async fn set_onboarding(
        &self,
        id: Uuid,
        details: &OnboardingDetails,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.user_mut(id) {
            Some(user) => {
                user.user_type = Some(details.user_type.clone());
                user.classroom_code = details.classroom_code.clone();
                user.onboarding_complete = true;
                user.updated_at = OffsetDateTime::now_utc();
                true
            }
            None => false,
        })
    }

    async fn set_curriculum(&self, id: Uuid, curriculum_id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.user_mut(id) {
            Some(user) => {
                user.selected_curriculum_id = Some(curriculum_id.into());
                user.updated_at = OffsetDateTime::now_utc();
                true
            }
            None => false,
        })
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        fingerprint: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(user) = tables.user_mut(id) {
            user.reset_token_hash = Some(fingerprint.into());
            user.reset_token_expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn clear_reset_token(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(user) = tables.user_mut(id) {
            user.reset_token_hash = None;
            user.reset_token_expires_at = None;
        }
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        id: Uuid,
        fingerprint: &str,
        password_hash: &str,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        match tables.user_mut(id) {
            Some(user)
                if user.reset_token_hash.as_deref() == Some(fingerprint)
                    && user.reset_token_expires_at.is_some_and(|exp| exp > now) =>
            {
                user.password_hash = Some(password_hash.into());
                user.reset_token_hash = None;
                user.reset_token_expires_at = None;
                user.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn begin(&self) -> Result<Box<dyn AccountTx>, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTx {
            guard,
            staged,
            before_commit: self.before_commit.clone(),
        }))
    }
}

pub struct InMemoryTx {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
    before_commit: Arc<StdMutex<Option<ConcurrentWrite>>>,
}

#[async_trait]
impl AccountTx for InMemoryTx {
    async fn find_oauth_account(
        &mut self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<OAuthAccount>, StoreError> {
        Ok(self
            .staged
            .oauth_accounts
            .iter()
            .find(|a| a.provider == provider && a.provider_user_id == provider_user_id)
            .cloned())
    }

    async fn find_oauth_account_for_user(
        &mut self,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Option<OAuthAccount>, StoreError> {
        Ok(self
            .staged
            .oauth_accounts
            .iter()
            .find(|a| a.user_id == user_id && a.provider == provider)
            .cloned())
    }

    async fn find_user_by_id(&mut self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.staged.users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_user_by_email(&mut self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.staged.users.iter().find(|u| u.email == email).cloned())
    }

    async fn insert_user(&mut self, new_user: NewUser) -> Result<User, StoreError> {
        self.staged.insert_user(new_user)
    }

    async fn insert_oauth_account(
        &mut self,
        user_id: Uuid,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<(), StoreError> {
        self.staged
            .insert_oauth_account(user_id, provider, provider_user_id)
    }

    async fn set_profile(
        &mut self,
        user_id: Uuid,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(user) = self.staged.user_mut(user_id) {
            user.display_name = display_name.into();
            user.avatar_url = avatar_url.map(str::to_string);
            user.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTx {
            mut guard,
            staged,
            before_commit,
        } = *self;
        let concurrent = before_commit.lock().ok().and_then(|mut slot| slot.take());
        if let Some(write) = concurrent {
            write(&mut *guard);
            return Err(StoreError::SerializationFailure);
        }
        *guard = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.into(),
            password_hash: None,
            display_name: "Test".into(),
            avatar_url: None,
            is_verified: false,
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_a_unique_violation() {
        let store = InMemoryAccountStore::new();
        store.create_user(new_user("a@example.com")).await.unwrap();
        let err = store.create_user(new_user("a@example.com")).await.unwrap_err();
        assert!(err.is_race());
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_rows() {
        let store = InMemoryAccountStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            let user = tx.insert_user(new_user("b@example.com")).await.unwrap();
            tx.insert_oauth_account(user.id, "google", "g-1").await.unwrap();
        }
        let tables = store.snapshot().await;
        assert!(tables.users.is_empty());
        assert!(tables.oauth_accounts.is_empty());
    }

    #[tokio::test]
    async fn lost_commit_applies_the_concurrent_write_only() {
        let store = InMemoryAccountStore::new();
        store.lose_next_commit_to(|tables| {
            tables.insert_user(new_user("winner@example.com")).unwrap();
        });
        let mut tx = store.begin().await.unwrap();
        tx.insert_user(new_user("loser@example.com")).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::SerializationFailure));

        let tables = store.snapshot().await;
        assert_eq!(tables.users.len(), 1);
        assert_eq!(tables.users[0].email, "winner@example.com");
    }
}
