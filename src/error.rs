use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// SQLSTATE raised by Postgres when a serializable transaction loses a race.
const SERIALIZATION_FAILURE: &str = "40001";

/// Storage failures the auth core knows how to react to.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,

    #[error("unique constraint violation ({constraint:?})")]
    UniqueViolation { constraint: Option<String> },

    #[error("serialization failure")]
    SerializationFailure,

    #[error("database operation timed out")]
    Timeout,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// True for the errors a concurrent writer can cause; retrying may succeed.
    pub fn is_race(&self) -> bool {
        matches!(
            self,
            StoreError::UniqueViolation { .. } | StoreError::SerializationFailure
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::PoolTimedOut => StoreError::Timeout,
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    StoreError::UniqueViolation {
                        constraint: db_err.constraint().map(str::to_string),
                    }
                } else if db_err.code().as_deref() == Some(SERIALIZATION_FAILURE) {
                    StoreError::SerializationFailure
                } else {
                    StoreError::Other(anyhow::Error::from(err))
                }
            }
            _ => StoreError::Other(anyhow::Error::from(err)),
        }
    }
}

/// Which uniqueness rule a request collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Registration with an email that already has an account.
    EmailTaken,
    /// The local account is already linked to another external identity.
    IdentityLinked,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("token invalid")]
    TokenInvalid,

    #[error("token expired")]
    TokenExpired,

    #[error("conflict: {0:?}")]
    Conflict(ConflictKind),

    #[error("user not found")]
    NotFound,

    #[error("token signing key is not configured")]
    SigningUnavailable,

    #[error("oauth provider is not configured")]
    OAuthNotConfigured,

    #[error("identity provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthError::InvalidCredentials
            | AuthError::Unauthenticated(_)
            | AuthError::TokenInvalid
            | AuthError::TokenExpired => StatusCode::UNAUTHORIZED,
            AuthError::Conflict(ConflictKind::EmailTaken) => StatusCode::BAD_REQUEST,
            AuthError::Conflict(ConflictKind::IdentityLinked) => StatusCode::CONFLICT,
            AuthError::NotFound => StatusCode::NOT_FOUND,
            AuthError::Provider(_) => StatusCode::BAD_GATEWAY,
            AuthError::SigningUnavailable
            | AuthError::OAuthNotConfigured
            | AuthError::Store(_)
            | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to a client. Credential and token failures stay
    /// generic so callers cannot tell which check failed.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Validation(msg) | AuthError::Unauthenticated(msg) => msg.clone(),
            AuthError::InvalidCredentials => "Invalid credentials".into(),
            AuthError::TokenInvalid | AuthError::TokenExpired => "Invalid or expired token".into(),
            AuthError::Conflict(ConflictKind::EmailTaken) => {
                "User with this email already exists".into()
            }
            AuthError::Conflict(ConflictKind::IdentityLinked) => {
                "This account is already linked to a different profile".into()
            }
            AuthError::NotFound => "User not found".into(),
            AuthError::OAuthNotConfigured => "OAuth provider not configured".into(),
            AuthError::Provider(_) => "Identity provider request failed".into(),
            AuthError::SigningUnavailable | AuthError::Store(_) | AuthError::Internal(_) => {
                "Internal server error".into()
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match &self {
            AuthError::SigningUnavailable => {
                tracing::error!(alarm = true, "token signing unavailable: no private key configured");
            }
            AuthError::Store(_) | AuthError::Internal(_) | AuthError::OAuthNotConfigured => {
                tracing::error!(error = ?self, "internal error");
            }
            AuthError::Provider(msg) => {
                tracing::error!(error = %msg, "identity provider failure");
            }
            AuthError::Conflict(_) => tracing::warn!(error = %self, "conflict"),
            AuthError::InvalidCredentials
            | AuthError::Unauthenticated(_)
            | AuthError::TokenInvalid
            | AuthError::TokenExpired => tracing::info!(error = %self, "authentication failed"),
            AuthError::Validation(_) | AuthError::NotFound => {
                tracing::debug!(error = %self, "client error")
            }
        }

        let body = Json(json!({ "error": self.user_message() }));
        (self.status_code(), body).into_response()
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
