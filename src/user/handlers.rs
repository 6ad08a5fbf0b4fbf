use axum::{
    extract::State,
    routing::{get, post, put},
    Json, Router,
};
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::MessageResponse,
        extractors::{AuthUser, JsonBody},
        repo_types::{OnboardingDetails, ProfileUpdate},
        services::CredentialStore,
    },
    error::{AuthError, AuthResult},
    state::AppState,
    user::dto::{
        ChangePasswordRequest, OnboardingDetailsRequest, ProfileResponse, UpdateCurriculumRequest,
        UpdateProfileRequest,
    },
};

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/user/me",
            get(get_me).put(update_me).patch(update_me).delete(delete_me),
        )
        .route("/user/change-password", post(change_password))
        .route("/user/onboarding-details", put(update_onboarding))
        .route("/user/curriculum", put(update_curriculum))
}

#[instrument(skip(state, user), fields(user_id = %user.0))]
pub async fn get_me(
    State(state): State<AppState>,
    user: AuthUser,
) -> AuthResult<Json<ProfileResponse>> {
    let found = state
        .store
        .find_by_id(user.0)
        .await?
        .ok_or(AuthError::NotFound)?;
    Ok(Json(found.into()))
}

#[instrument(skip(state, user, payload), fields(user_id = %user.0))]
pub async fn update_me(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(payload): JsonBody<UpdateProfileRequest>,
) -> AuthResult<Json<ProfileResponse>> {
    let update = ProfileUpdate {
        display_name: payload.display_name.map(|s| s.trim().to_string()),
        avatar_url: payload.avatar_url.map(|s| s.trim().to_string()),
    };
    if update.is_empty() {
        return Err(AuthError::Validation("No fields to update".into()));
    }
    if update.display_name.as_deref() == Some("") {
        return Err(AuthError::Validation("Display name cannot be empty".into()));
    }

    let updated = state
        .store
        .update_profile(user.0, &update)
        .await?
        .ok_or(AuthError::NotFound)?;
    info!("profile updated");
    Ok(Json(updated.into()))
}

#[instrument(skip(state, user), fields(user_id = %user.0))]
pub async fn delete_me(
    State(state): State<AppState>,
    user: AuthUser,
) -> AuthResult<Json<MessageResponse>> {
    if !state.store.delete_user(user.0).await? {
        return Err(AuthError::NotFound);
    }
    info!("account deleted");
    Ok(Json(MessageResponse::new("Account deleted successfully")))
}

#[instrument(skip(state, user, payload), fields(user_id = %user.0))]
pub async fn update_onboarding(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(payload): JsonBody<OnboardingDetailsRequest>,
) -> AuthResult<Json<MessageResponse>> {
    let user_type = payload.user_type.trim().to_string();
    if user_type.is_empty() {
        return Err(AuthError::Validation("User type is required".into()));
    }
    let details = OnboardingDetails {
        user_type,
        classroom_code: payload
            .classroom_code
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty()),
    };

    if !state.store.set_onboarding(user.0, &details).await? {
        warn!("no user to record onboarding for");
        return Err(AuthError::NotFound);
    }
    info!(user_type = %details.user_type, "onboarding details updated");
    Ok(Json(MessageResponse::new(
        "Onboarding details updated successfully",
    )))
}

#[instrument(skip(state, user, payload), fields(user_id = %user.0))]
pub async fn update_curriculum(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(payload): JsonBody<UpdateCurriculumRequest>,
) -> AuthResult<Json<MessageResponse>> {
    let curriculum_id = payload.selected_curriculum_id.trim();
    if curriculum_id.is_empty() {
        return Err(AuthError::Validation(
            "Selected curriculum ID is required".into(),
        ));
    }
    if !state.store.set_curriculum(user.0, curriculum_id).await? {
        warn!("no user to record curriculum for");
        return Err(AuthError::NotFound);
    }
    info!(curriculum_id = %curriculum_id, "curriculum selected");
    Ok(Json(MessageResponse::new(
        "User curriculum updated successfully",
    )))
}

#[instrument(skip(credentials, user, payload), fields(user_id = %user.0))]
pub async fn change_password(
    State(credentials): State<CredentialStore>,
    user: AuthUser,
    JsonBody(payload): JsonBody<ChangePasswordRequest>,
) -> AuthResult<Json<MessageResponse>> {
    credentials
        .change_password(user.0, &payload.old_password, &payload.new_password)
        .await?;
    Ok(Json(MessageResponse::new("Password changed successfully")))
}
