use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{
        header::{COOKIE, SET_COOKIE},
        HeaderMap, StatusCode,
    },
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use rand::{distributions::Alphanumeric, Rng};
use tracing::{info, instrument, warn};
use url::Url;

use crate::{
    auth::{
        dto::{
            ForgotPasswordRequest, LoginRequest, MessageResponse, OAuthCallbackQuery,
            RefreshRequest, RegisterRequest, ResetPasswordRequest,
        },
        extractors::JsonBody,
        jwt::{TokenPair, TokenService},
        oauth::{IdentityProvider, OAuthIdentityLinker},
        password::constant_time_eq,
        reset::PasswordResetFlow,
        services::{CredentialStore, UserSummary},
    },
    error::{AuthError, AuthResult},
    state::AppState,
};

const STATE_COOKIE: &str = "oauthstate";
const STATE_COOKIE_MAX_AGE_SECS: u32 = 600;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
        .route("/auth/oauth/google", get(google_login))
        .route("/auth/callback/google", get(google_callback))
}

#[instrument(skip(credentials, payload))]
pub async fn register(
    State(credentials): State<CredentialStore>,
    JsonBody(payload): JsonBody<RegisterRequest>,
) -> AuthResult<(StatusCode, Json<UserSummary>)> {
    let user = credentials
        .register(&payload.name, &payload.email, &payload.password)
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(credentials, tokens, payload))]
pub async fn login(
    State(credentials): State<CredentialStore>,
    State(tokens): State<Arc<TokenService>>,
    JsonBody(payload): JsonBody<LoginRequest>,
) -> AuthResult<Json<TokenPair>> {
    if payload.email.trim().is_empty() || payload.password.is_empty() {
        return Err(AuthError::Validation("Email and password are required".into()));
    }
    let (user_id, email) = credentials
        .verify_credentials(&payload.email, &payload.password)
        .await?;
    let pair = tokens.issue_access_and_refresh(user_id, &email)?;
    info!(user_id = %user_id, "user logged in");
    Ok(Json(pair))
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<RefreshRequest>,
) -> AuthResult<Json<TokenPair>> {
    let pair = state
        .tokens
        .refresh(state.store.as_ref(), &payload.refresh_token)
        .await?;
    Ok(Json(pair))
}

#[instrument(skip(flow, payload))]
pub async fn forgot_password(
    State(flow): State<PasswordResetFlow>,
    JsonBody(payload): JsonBody<ForgotPasswordRequest>,
) -> AuthResult<Json<MessageResponse>> {
    flow.request_reset(&payload.email).await?;
    Ok(Json(MessageResponse::new(
        "If an account with that email exists, a password reset link has been sent.",
    )))
}

#[instrument(skip(flow, payload))]
pub async fn reset_password(
    State(flow): State<PasswordResetFlow>,
    JsonBody(payload): JsonBody<ResetPasswordRequest>,
) -> AuthResult<Json<MessageResponse>> {
    flow.complete_reset(&payload.token, &payload.new_password).await?;
    Ok(Json(MessageResponse::new("Password has been reset successfully.")))
}

fn provider(state: &AppState) -> AuthResult<Arc<dyn IdentityProvider>> {
    state.provider.clone().ok_or(AuthError::OAuthNotConfigured)
}

fn random_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn state_cookie(value: &str, max_age: u32, secure: bool) -> String {
    let mut cookie =
        format!("{STATE_COOKIE}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

#[instrument(skip(state))]
pub async fn google_login(State(state): State<AppState>) -> AuthResult<Response> {
    let provider = provider(&state)?;
    let csrf = random_state();
    let url = provider.authorize_url(&csrf)?;
    let cookie = state_cookie(&csrf, STATE_COOKIE_MAX_AGE_SECS, state.config.is_production());
    Ok((AppendHeaders([(SET_COOKIE, cookie)]), Redirect::temporary(&url)).into_response())
}

#[instrument(skip(state, linker, headers, query))]
pub async fn google_callback(
    State(state): State<AppState>,
    State(linker): State<OAuthIdentityLinker>,
    headers: HeaderMap,
    Query(query): Query<OAuthCallbackQuery>,
) -> Response {
    let clear = state_cookie("", 0, state.config.is_production());
    match complete_google_login(&state, &linker, &headers, query).await {
        Ok(target) => {
            (AppendHeaders([(SET_COOKIE, clear)]), Redirect::temporary(&target)).into_response()
        }
        Err(e) => (AppendHeaders([(SET_COOKIE, clear)]), e).into_response(),
    }
}

async fn complete_google_login(
    state: &AppState,
    linker: &OAuthIdentityLinker,
    headers: &HeaderMap,
    query: OAuthCallbackQuery,
) -> AuthResult<String> {
    let provider = provider(state)?;
    if let Some(error) = query.error {
        warn!(error = %error, "provider returned an error");
        return Err(AuthError::Validation("OAuth sign-in was not completed".into()));
    }

    let expected = read_cookie(headers, STATE_COOKIE)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::Validation("Missing OAuth state cookie".into()))?;
    let presented = query.state.unwrap_or_default();
    if !constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
        warn!("oauth state mismatch");
        return Err(AuthError::Validation("Invalid OAuth state".into()));
    }
    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AuthError::Validation("Missing authorization code".into()))?;

    let assertion = provider.fetch_identity(&code).await?;
    let linked = linker.link(&assertion).await?;
    let pair = state
        .tokens
        .issue_access_and_refresh(linked.user_id, &linked.email)?;
    info!(user_id = %linked.user_id, outcome = ?linked.outcome, "oauth sign-in complete");

    let mut target = Url::parse(&state.config.frontend_oauth_callback_url)
        .map_err(|e| anyhow::anyhow!("invalid FRONTEND_OAUTH_CALLBACK_URL: {e}"))?;
    target
        .query_pairs_mut()
        .append_pair("access_token", &pair.access_token)
        .append_pair("refresh_token", &pair.refresh_token);
    Ok(target.to_string())
}
