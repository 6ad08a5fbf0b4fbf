use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: Option<String>, // absent for OAuth-only accounts
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: String,
    pub is_verified: bool,
    pub user_type: Option<String>,
    pub classroom_code: Option<String>,
    pub onboarding_complete: bool,
    pub selected_curriculum_id: Option<String>,
    pub reset_token_hash: Option<String>,
    pub reset_token_expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Link between an external identity and a local user.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthAccount {
    pub user_id: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub created_at: OffsetDateTime,
}

/// Insert payload for `users`.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: Option<String>,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_verified: bool,
}

/// Partial profile update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.avatar_url.is_none()
    }
}

pub const DEFAULT_ROLE: &str = "student";

/// Answers collected on first sign-in.
#[derive(Debug, Clone)]
pub struct OnboardingDetails {
    pub user_type: String,
    pub classroom_code: Option<String>,
}
