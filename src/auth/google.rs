//! Google sign-in through the OAuth2 authorization-code flow.

use anyhow::Context;
use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use tracing::{error, info};

use crate::auth::oauth::{IdentityAssertion, IdentityProvider};
use crate::config::GoogleOAuthConfig;
use crate::error::{AuthError, AuthResult};

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Google userinfo response.
#[derive(Debug, Deserialize)]
struct GoogleUser {
    id: String,
    email: String,
    #[serde(default)]
    verified_email: Option<bool>,
    name: Option<String>,
    picture: Option<String>,
}

type ConfiguredClient = oauth2::Client<
    oauth2::basic::BasicErrorResponse,
    oauth2::basic::BasicTokenResponse,
    oauth2::basic::BasicTokenIntrospectionResponse,
    oauth2::StandardRevocableToken,
    oauth2::basic::BasicRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

pub struct GoogleOAuth {
    client: ConfiguredClient,
    http: reqwest::Client,
}

impl GoogleOAuth {
    pub fn new(config: &GoogleOAuthConfig) -> anyhow::Result<Self> {
        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(AUTH_URL.to_string()).context("google auth url")?)
            .set_token_uri(TokenUrl::new(TOKEN_URL.to_string()).context("google token url")?)
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_url.clone()).context("GOOGLE_REDIRECT_URL")?,
            );
        // The token endpoint must not be allowed to redirect us elsewhere.
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build http client")?;
        Ok(Self { client, http })
    }

    fn assertion_from(&self, user: GoogleUser) -> AuthResult<IdentityAssertion> {
        if user.verified_email == Some(false) {
            return Err(AuthError::Validation(
                "Google account email is not verified".into(),
            ));
        }
        Ok(IdentityAssertion {
            provider: self.name().to_string(),
            provider_user_id: user.id,
            email: user.email,
            display_name: user.name.unwrap_or_default(),
            avatar_url: user.picture.filter(|p| !p.is_empty()),
        })
    }
}

#[async_trait]
impl IdentityProvider for GoogleOAuth {
    fn name(&self) -> &'static str {
        "google"
    }

    fn authorize_url(&self, state: &str) -> AuthResult<String> {
        let state = state.to_string();
        let (url, _) = self
            .client
            .authorize_url(move || CsrfToken::new(state))
            .add_scope(Scope::new("openid".to_string()))
            .add_scope(Scope::new("email".to_string()))
            .add_scope(Scope::new("profile".to_string()))
            .url();
        Ok(url.to_string())
    }

    async fn fetch_identity(&self, code: &str) -> AuthResult<IdentityAssertion> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| {
                error!(error = %e, "google code exchange failed");
                AuthError::Provider(format!("code exchange failed: {e}"))
            })?;

        let response = self
            .http
            .get(USERINFO_URL)
            .bearer_auth(token.access_token().secret())
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("userinfo request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AuthError::Provider(format!(
                "userinfo returned {}",
                response.status()
            )));
        }
        let user: GoogleUser = response
            .json()
            .await
            .map_err(|e| AuthError::Provider(format!("userinfo decode failed: {e}")))?;

        info!(provider_user_id = %user.id, "google profile fetched");
        self.assertion_from(user)
    }
}
