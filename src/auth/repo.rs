use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{
    NewUser, OAuthAccount, OnboardingDetails, ProfileUpdate, User, DEFAULT_ROLE,
};
use crate::db::with_timeout;
use crate::error::StoreError;

const USER_COLUMNS: &str = "id, email, password_hash, display_name, avatar_url, role, is_verified, \
     user_type, classroom_code, onboarding_complete, selected_curriculum_id, \
     reset_token_hash, reset_token_expires_at, created_at, updated_at";

const OAUTH_COLUMNS: &str = "user_id, provider, provider_user_id, created_at";

/// Persistence for `users` and `oauth_accounts`.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError>;

    /// Returns `false` when no row was updated.
    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<bool, StoreError>;
    async fn update_profile(
        &self,
        id: Uuid,
        update: &ProfileUpdate,
    ) -> Result<Option<User>, StoreError>;
    async fn delete_user(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Record onboarding answers and mark onboarding complete.
    async fn set_onboarding(
        &self,
        id: Uuid,
        details: &OnboardingDetails,
    ) -> Result<bool, StoreError>;
    async fn set_curriculum(&self, id: Uuid, curriculum_id: &str) -> Result<bool, StoreError>;

    async fn set_reset_token(
        &self,
        id: Uuid,
        fingerprint: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError>;
    async fn clear_reset_token(&self, id: Uuid) -> Result<(), StoreError>;

    /// Swap in a new password hash and clear the reset fingerprint, but only
    /// while `fingerprint` is still the stored, unexpired one.
    async fn consume_reset_token(
        &self,
        id: Uuid,
        fingerprint: &str,
        password_hash: &str,
    ) -> Result<bool, StoreError>;

    /// Open a serializable unit of work. Dropping it without `commit` rolls back.
    async fn begin(&self) -> Result<Box<dyn AccountTx>, StoreError>;
}

/// Operations available inside one atomic unit of work.
#[async_trait]
pub trait AccountTx: Send {
    async fn find_oauth_account(
        &mut self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<OAuthAccount>, StoreError>;
    async fn find_oauth_account_for_user(
        &mut self,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Option<OAuthAccount>, StoreError>;
    async fn find_user_by_id(&mut self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn find_user_by_email(&mut self, email: &str) -> Result<Option<User>, StoreError>;
    async fn insert_user(&mut self, new_user: NewUser) -> Result<User, StoreError>;
    async fn insert_oauth_account(
        &mut self,
        user_id: Uuid,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<(), StoreError>;
    async fn set_profile(
        &mut self,
        user_id: Uuid,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<(), StoreError>;
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Postgres-backed store. Every statement is bounded by `timeout`.
#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgAccountStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

fn insert_user_sql() -> String {
    format!(
        r#"
        INSERT INTO users (email, password_hash, display_name, avatar_url, role, is_verified)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {USER_COLUMNS}
        "#
    )
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let query = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.pool);
        with_timeout(self.timeout, query).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let query = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool);
        with_timeout(self.timeout, query).await
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError> {
        let sql = insert_user_sql();
        let query = sqlx::query_as::<_, User>(&sql)
            .bind(&new_user.email)
            .bind(&new_user.password_hash)
            .bind(&new_user.display_name)
            .bind(&new_user.avatar_url)
            .bind(DEFAULT_ROLE)
            .bind(new_user.is_verified)
            .fetch_one(&self.pool);
        with_timeout(self.timeout, query).await
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<bool, StoreError> {
        let query = sqlx::query(
            "UPDATE users SET password_hash = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(password_hash)
        .bind(id)
        .execute(&self.pool);
        let result = with_timeout(self.timeout, query).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_profile(
        &self,
        id: Uuid,
        update: &ProfileUpdate,
    ) -> Result<Option<User>, StoreError> {
        let sql = format!(
            r#"
            UPDATE users
               SET display_name = COALESCE($1, display_name),
                   avatar_url = COALESCE($2, avatar_url),
                   updated_at = NOW()
             WHERE id = $3
            RETURNING {USER_COLUMNS}
            "#
        );
        let query = sqlx::query_as::<_, User>(&sql)
            .bind(&update.display_name)
            .bind(&update.avatar_url)
            .bind(id)
            .fetch_optional(&self.pool);
        with_timeout(self.timeout, query).await
    }

    async fn delete_user(&self, id: Uuid) -> Result<bool, StoreError> {
        let query = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool);
        let result = with_timeout(self.timeout, query).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_onboarding(
        &self,
        id: Uuid,
        details: &OnboardingDetails,
    ) -> Result<bool, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE users
               SET user_type = $1,
                   classroom_code = $2,
                   onboarding_complete = TRUE,
                   updated_at = NOW()
             WHERE id = $3
            "#,
        )
        .bind(&details.user_type)
        .bind(&details.classroom_code)
        .bind(id)
        .execute(&self.pool);
        let result = with_timeout(self.timeout, query).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_curriculum(&self, id: Uuid, curriculum_id: &str) -> Result<bool, StoreError> {
        let query = sqlx::query(
            "UPDATE users SET selected_curriculum_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(curriculum_id)
        .bind(id)
        .execute(&self.pool);
        let result = with_timeout(self.timeout, query).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        fingerprint: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE users
               SET reset_token_hash = $1, reset_token_expires_at = $2, updated_at = NOW()
             WHERE id = $3
            "#,
        )
        .bind(fingerprint)
        .bind(expires_at)
        .bind(id)
        .execute(&self.pool);
        with_timeout(self.timeout, query).await?;
        Ok(())
    }

    async fn clear_reset_token(&self, id: Uuid) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE users
               SET reset_token_hash = NULL, reset_token_expires_at = NULL, updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool);
        with_timeout(self.timeout, query).await?;
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        id: Uuid,
        fingerprint: &str,
        password_hash: &str,
    ) -> Result<bool, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE users
               SET password_hash = $1,
                   reset_token_hash = NULL,
                   reset_token_expires_at = NULL,
                   updated_at = NOW()
             WHERE id = $2
               AND reset_token_hash = $3
               AND reset_token_expires_at > NOW()
            "#,
        )
        .bind(password_hash)
        .bind(id)
        .bind(fingerprint)
        .execute(&self.pool);
        let result = with_timeout(self.timeout, query).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn begin(&self) -> Result<Box<dyn AccountTx>, StoreError> {
        Ok(Box::new(self.begin_serializable().await?))
    }
}

impl PgAccountStore {
    async fn begin_serializable(&self) -> Result<PgAccountTx, StoreError> {
        let mut tx = with_timeout(self.timeout, self.pool.begin()).await?;
        let query = sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE").execute(&mut *tx);
        with_timeout(self.timeout, query).await?;
        Ok(PgAccountTx {
            tx,
            timeout: self.timeout,
        })
    }
}

pub struct PgAccountTx {
    tx: Transaction<'static, Postgres>,
    timeout: Duration,
}

#[async_trait]
impl AccountTx for PgAccountTx {
    async fn find_oauth_account(
        &mut self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<OAuthAccount>, StoreError> {
        let sql = format!(
            "SELECT {OAUTH_COLUMNS} FROM oauth_accounts WHERE provider = $1 AND provider_user_id = $2"
        );
        let query = sqlx::query_as::<_, OAuthAccount>(&sql)
            .bind(provider)
            .bind(provider_user_id)
            .fetch_optional(&mut *self.tx);
        with_timeout(self.timeout, query).await
    }

    async fn find_oauth_account_for_user(
        &mut self,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Option<OAuthAccount>, StoreError> {
        let sql = format!(
            "SELECT {OAUTH_COLUMNS} FROM oauth_accounts WHERE user_id = $1 AND provider = $2"
        );
        let query = sqlx::query_as::<_, OAuthAccount>(&sql)
            .bind(user_id)
            .bind(provider)
            .fetch_optional(&mut *self.tx);
        with_timeout(self.timeout, query).await
    }

    async fn find_user_by_id(&mut self, id: Uuid) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let query = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx);
        with_timeout(self.timeout, query).await
    }

    async fn find_user_by_email(&mut self, email: &str) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let query = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&mut *self.tx);
        with_timeout(self.timeout, query).await
    }

    async fn insert_user(&mut self, new_user: NewUser) -> Result<User, StoreError> {
        let sql = insert_user_sql();
        let query = sqlx::query_as::<_, User>(&sql)
            .bind(&new_user.email)
            .bind(&new_user.password_hash)
            .bind(&new_user.display_name)
            .bind(&new_user.avatar_url)
            .bind(DEFAULT_ROLE)
            .bind(new_user.is_verified)
            .fetch_one(&mut *self.tx);
        with_timeout(self.timeout, query).await
    }

    async fn insert_oauth_account(
        &mut self,
        user_id: Uuid,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"
            INSERT INTO oauth_accounts (user_id, provider, provider_user_id)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(provider_user_id)
        .execute(&mut *self.tx);
        with_timeout(self.timeout, query).await?;
        Ok(())
    }

    async fn set_profile(
        &mut self,
        user_id: Uuid,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(
            "UPDATE users SET display_name = $1, avatar_url = $2, updated_at = NOW() WHERE id = $3",
        )
        .bind(display_name)
        .bind(avatar_url)
        .bind(user_id)
        .execute(&mut *self.tx);
        with_timeout(self.timeout, query).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PgAccountTx { tx, timeout } = *self;
        with_timeout(timeout, tx.commit()).await
    }
}
