use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
    Json,
};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::claims::TokenType;
use crate::error::{AuthError, AuthResult};
use crate::state::AppState;

/// Identity projected into request extensions by `require_auth`.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub email: Option<String>,
}

/// Split `Bearer <token>`. Anything other than exactly two space separated
/// parts with a literal `Bearer` scheme is refused.
fn bearer_token(header: Option<&str>) -> AuthResult<&str> {
    let header = header.ok_or_else(|| {
        AuthError::Unauthenticated("Authorization header is required".into())
    })?;
    let parts: Vec<&str> = header.split(' ').collect();
    match parts.as_slice() {
        ["Bearer", token] if !token.is_empty() => Ok(*token),
        _ => Err(AuthError::Unauthenticated(
            "Authorization header format must be Bearer {token}".into(),
        )),
    }
}

/// Gate for protected routes.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if state.config.disable_auth {
        warn!(path = %req.uri().path(), "authentication disabled; request not checked");
        return Ok(next.run(req).await);
    }

    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    let token = bearer_token(header)?;
    let claims = state
        .tokens
        .verify(token, state.tokens.audience(), state.tokens.issuer())?;
    if claims.token_type != TokenType::Access {
        debug!(token_type = ?claims.token_type, "non-access token presented");
        return Err(AuthError::TokenInvalid);
    }

    match claims.subject() {
        Some(sub) => {
            let user = AuthenticatedUser {
                user_id: sub.to_string(),
                email: claims.email.clone(),
            };
            debug!(user_id = %user.user_id, email = ?user.email, "request authenticated");
            req.extensions_mut().insert(user);
        }
        None => warn!("access token without subject; continuing anonymously"),
    }
    Ok(next.run(req).await)
}

/// Caller's user id, for handlers behind `require_auth`.
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .extensions
            .get::<AuthenticatedUser>()
            .ok_or_else(|| AuthError::Unauthenticated("Authentication required".into()))?;
        let id = Uuid::parse_str(&user.user_id)
            .map_err(|_| AuthError::Unauthenticated("Authentication required".into()))?;
        Ok(AuthUser(id))
    }
}

/// `Json<T>` whose rejection is a 400 in the service's error format.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| AuthError::Validation(e.body_text()))?;
        Ok(JsonBody(value))
    }
}
