use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::User;

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

/// Partial profile update. Omitted fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateProfileRequest {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OnboardingDetailsRequest {
    pub user_type: String,
    #[serde(default)]
    pub classroom_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCurriculumRequest {
    pub selected_curriculum_id: String,
}

/// Profile as returned to its owner.
#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: String,
    pub is_verified: bool,
    pub user_type: Option<String>,
    pub classroom_code: Option<String>,
    pub onboarding_complete: bool,
    pub selected_curriculum_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<User> for ProfileResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            display_name: user.display_name,
            avatar_url: user.avatar_url,
            role: user.role,
            is_verified: user.is_verified,
            user_type: user.user_type,
            classroom_code: user.classroom_code,
            onboarding_complete: user.onboarding_complete,
            selected_curriculum_id: user.selected_curriculum_id,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}
