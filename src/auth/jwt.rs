use std::sync::Arc;

use anyhow::Context;
use axum::extract::FromRef;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::auth::claims::{Claims, TokenType};
use crate::auth::repo::AccountStore;
use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Signs and verifies RS256 tokens with one keypair.
pub struct TokenService {
    encoding: Option<EncodingKey>,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    reset_ttl: Duration,
}

impl FromRef<AppState> for Arc<TokenService> {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}

impl TokenService {
    pub fn new(config: &JwtConfig) -> anyhow::Result<Self> {
        let encoding = match &config.private_key_pem {
            Some(pem) => Some(
                EncodingKey::from_rsa_pem(pem.as_bytes()).context("parse JWT_PRIVATE_KEY")?,
            ),
            None => {
                tracing::warn!("JWT_PRIVATE_KEY not set; token issuance disabled");
                None
            }
        };
        let decoding = DecodingKey::from_rsa_pem(config.public_key_pem.as_bytes())
            .context("parse JWT_PUBLIC_KEY")?;
        Ok(Self {
            encoding,
            decoding,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_ttl: Duration::minutes(config.access_ttl_minutes),
            refresh_ttl: Duration::minutes(config.refresh_ttl_minutes),
            reset_ttl: Duration::minutes(config.reset_ttl_minutes),
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub(crate) fn sign_claims(&self, claims: &Claims) -> AuthResult<String> {
        let key = self.encoding.as_ref().ok_or(AuthError::SigningUnavailable)?;
        let token = encode(&Header::new(Algorithm::RS256), claims, key)
            .context("encode jwt")?;
        Ok(token)
    }

    fn claims_for(
        &self,
        user_id: Uuid,
        email: Option<&str>,
        token_type: TokenType,
        ttl: Duration,
    ) -> (Claims, OffsetDateTime) {
        let now = OffsetDateTime::now_utc();
        let expires_at = now + ttl;
        let claims = Claims {
            sub: Some(user_id.to_string()),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: expires_at.unix_timestamp(),
            iat: now.unix_timestamp(),
            token_type,
            email: email.map(str::to_string),
        };
        (claims, expires_at)
    }

    /// Access token carries the email, refresh token does not.
    pub fn issue_access_and_refresh(&self, user_id: Uuid, email: &str) -> AuthResult<TokenPair> {
        let (access, _) = self.claims_for(user_id, Some(email), TokenType::Access, self.access_ttl);
        let (refresh, _) = self.claims_for(user_id, None, TokenType::Refresh, self.refresh_ttl);
        let pair = TokenPair {
            access_token: self.sign_claims(&access)?,
            refresh_token: self.sign_claims(&refresh)?,
        };
        debug!(user_id = %user_id, "issued access and refresh tokens");
        Ok(pair)
    }

    pub fn issue_reset_token(
        &self,
        user_id: Uuid,
        email: &str,
    ) -> AuthResult<(String, OffsetDateTime)> {
        let (claims, expires_at) =
            self.claims_for(user_id, Some(email), TokenType::PasswordReset, self.reset_ttl);
        let token = self.sign_claims(&claims)?;
        debug!(user_id = %user_id, "issued password reset token");
        Ok((token, expires_at))
    }

    fn validation(&self, audience: &str, issuer: &str, check_exp: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.validate_exp = check_exp;
        validation.set_audience(&[audience]);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation
    }

    /// Verify signature, algorithm, issuer, audience and expiry.
    pub fn verify(&self, token: &str, audience: &str, issuer: &str) -> AuthResult<Claims> {
        let validation = self.validation(audience, issuer, true);
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                kind => {
                    debug!(reason = ?kind, "jwt rejected");
                    AuthError::TokenInvalid
                }
            })
    }

    /// `verify` against this service's issuer and audience, plus a `token_type` check.
    pub fn verify_kind(&self, token: &str, kind: TokenType) -> AuthResult<Claims> {
        let claims = self.verify(token, &self.audience, &self.issuer)?;
        if claims.token_type != kind {
            debug!(expected = ?kind, actual = ?claims.token_type, "wrong token type");
            return Err(AuthError::TokenInvalid);
        }
        Ok(claims)
    }

    /// Like `verify_kind` but accepts a token past its `exp`. Only used to
    /// clean up state tied to a token that is already known to be expired.
    pub(crate) fn verify_kind_allow_expired(
        &self,
        token: &str,
        kind: TokenType,
    ) -> AuthResult<Claims> {
        let validation = self.validation(&self.audience, &self.issuer, false);
        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|_| AuthError::TokenInvalid)?;
        if claims.token_type != kind {
            return Err(AuthError::TokenInvalid);
        }
        Ok(claims)
    }

    /// Exchange a refresh token for a fresh pair, re-reading the user's email.
    pub async fn refresh(
        &self,
        store: &dyn AccountStore,
        refresh_token: &str,
    ) -> AuthResult<TokenPair> {
        let claims = self.verify_kind(refresh_token, TokenType::Refresh)?;
        let user_id = subject_id(&claims)?;
        let user = store
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::NotFound)?;
        self.issue_access_and_refresh(user.id, &user.email)
    }
}

/// Parse the `sub` claim as a user id.
pub(crate) fn subject_id(claims: &Claims) -> AuthResult<Uuid> {
    claims
        .subject()
        .and_then(|sub| Uuid::parse_str(sub).ok())
        .ok_or(AuthError::TokenInvalid)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::memory::InMemoryAccountStore;
    use crate::auth::repo_types::NewUser;

    pub(crate) const PRIMARY_PRIVATE: &str =
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/jwt/primary_private.pem"));
    pub(crate) const PRIMARY_PUBLIC: &str =
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/jwt/primary_public.pem"));
    const ROTATED_PRIVATE: &str =
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/jwt/rotated_private.pem"));

    pub(crate) fn jwt_config() -> JwtConfig {
        JwtConfig {
            private_key_pem: Some(PRIMARY_PRIVATE.into()),
            public_key_pem: PRIMARY_PUBLIC.into(),
            issuer: "test-issuer".into(),
            audience: "test-aud".into(),
            access_ttl_minutes: 15,
            refresh_ttl_minutes: 60,
            reset_ttl_minutes: 60,
        }
    }

    fn service() -> TokenService {
        TokenService::new(&jwt_config()).expect("token service")
    }

    fn claims(service: &TokenService, token_type: TokenType, exp_offset: i64) -> Claims {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        Claims {
            sub: Some(Uuid::new_v4().to_string()),
            iss: service.issuer.clone(),
            aud: service.audience.clone(),
            exp: now + exp_offset,
            iat: now,
            token_type,
            email: None,
        }
    }

    #[test]
    fn sign_and_verify_access_token() {
        let service = service();
        let user_id = Uuid::new_v4();
        let pair = service
            .issue_access_and_refresh(user_id, "a@example.com")
            .expect("issue");

        let claims = service
            .verify(&pair.access_token, "test-aud", "test-issuer")
            .expect("verify access");
        assert_eq!(claims.sub.as_deref(), Some(user_id.to_string().as_str()));
        assert_eq!(claims.token_type, TokenType::Access);
        assert_eq!(claims.email.as_deref(), Some("a@example.com"));
        assert!(claims.exp > claims.iat);

        let refresh = service
            .verify_kind(&pair.refresh_token, TokenType::Refresh)
            .expect("verify refresh");
        assert!(refresh.email.is_none());
    }

    #[test]
    fn reset_token_carries_email_and_expiry() {
        let service = service();
        let (token, expires_at) = service
            .issue_reset_token(Uuid::new_v4(), "r@example.com")
            .unwrap();
        let claims = service.verify_kind(&token, TokenType::PasswordReset).unwrap();
        assert_eq!(claims.email.as_deref(), Some("r@example.com"));
        assert_eq!(claims.exp, expires_at.unix_timestamp());
    }

    #[test]
    fn verify_kind_rejects_other_token_types() {
        let service = service();
        let pair = service
            .issue_access_and_refresh(Uuid::new_v4(), "a@example.com")
            .unwrap();
        assert!(matches!(
            service.verify_kind(&pair.access_token, TokenType::Refresh),
            Err(AuthError::TokenInvalid)
        ));
        assert!(matches!(
            service.verify_kind(&pair.refresh_token, TokenType::PasswordReset),
            Err(AuthError::TokenInvalid)
        ));
    }

    #[test]
    fn expired_token_is_reported_as_expired() {
        let service = service();
        let token = service
            .sign_claims(&claims(&service, TokenType::Access, -5))
            .unwrap();
        assert!(matches!(
            service.verify(&token, "test-aud", "test-issuer"),
            Err(AuthError::TokenExpired)
        ));
        assert!(service
            .verify_kind_allow_expired(&token, TokenType::Access)
            .is_ok());
    }

    #[test]
    fn token_signed_by_another_key_is_invalid() {
        let service = service();
        let mut other = jwt_config();
        other.private_key_pem = Some(ROTATED_PRIVATE.into());
        let other = TokenService::new(&other).unwrap();

        let token = other
            .issue_access_and_refresh(Uuid::new_v4(), "a@example.com")
            .unwrap()
            .access_token;
        assert!(matches!(
            service.verify(&token, "test-aud", "test-issuer"),
            Err(AuthError::TokenInvalid)
        ));

        // Bad signature takes precedence over expiry.
        let expired = other
            .sign_claims(&claims(&other, TokenType::Access, -5))
            .unwrap();
        assert!(matches!(
            service.verify(&expired, "test-aud", "test-issuer"),
            Err(AuthError::TokenInvalid)
        ));
    }

    #[test]
    fn hs256_token_keyed_with_public_key_is_rejected() {
        let service = service();
        let claims = claims(&service, TokenType::Access, 300);
        let forged = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(PRIMARY_PUBLIC.as_bytes()),
        )
        .unwrap();
        assert!(matches!(
            service.verify(&forged, "test-aud", "test-issuer"),
            Err(AuthError::TokenInvalid)
        ));
    }

    #[test]
    fn verify_rejects_wrong_issuer_or_audience() {
        let service = service();
        let token = service
            .issue_access_and_refresh(Uuid::new_v4(), "a@example.com")
            .unwrap()
            .access_token;
        assert!(matches!(
            service.verify(&token, "test-aud", "other-issuer"),
            Err(AuthError::TokenInvalid)
        ));
        assert!(matches!(
            service.verify(&token, "other-aud", "test-issuer"),
            Err(AuthError::TokenInvalid)
        ));
    }

    #[test]
    fn malformed_token_is_invalid() {
        let service = service();
        assert!(matches!(
            service.verify("not.a.jwt", "test-aud", "test-issuer"),
            Err(AuthError::TokenInvalid)
        ));
        assert!(matches!(
            service.verify("", "test-aud", "test-issuer"),
            Err(AuthError::TokenInvalid)
        ));
    }

    #[test]
    fn verify_only_service_cannot_sign() {
        let mut config = jwt_config();
        config.private_key_pem = None;
        let verifier = TokenService::new(&config).unwrap();
        assert!(matches!(
            verifier.issue_access_and_refresh(Uuid::new_v4(), "a@example.com"),
            Err(AuthError::SigningUnavailable)
        ));

        let token = service()
            .issue_access_and_refresh(Uuid::new_v4(), "a@example.com")
            .unwrap()
            .access_token;
        assert!(verifier.verify_kind(&token, TokenType::Access).is_ok());
    }

    #[tokio::test]
    async fn refresh_reissues_with_current_email() {
        let service = service();
        let store = InMemoryAccountStore::new();
        let user = store
            .seed_user(NewUser {
                email: "current@example.com".into(),
                password_hash: None,
                display_name: "Current".into(),
                avatar_url: None,
                is_verified: true,
            })
            .await;
        let pair = service
            .issue_access_and_refresh(user.id, "old@example.com")
            .unwrap();

        let refreshed = service.refresh(&store, &pair.refresh_token).await.unwrap();
        let claims = service
            .verify_kind(&refreshed.access_token, TokenType::Access)
            .unwrap();
        assert_eq!(claims.email.as_deref(), Some("current@example.com"));
    }

    #[tokio::test]
    async fn refresh_rejects_access_token_and_unknown_user() {
        let service = service();
        let store = InMemoryAccountStore::new();
        let pair = service
            .issue_access_and_refresh(Uuid::new_v4(), "gone@example.com")
            .unwrap();

        assert!(matches!(
            service.refresh(&store, &pair.access_token).await,
            Err(AuthError::TokenInvalid)
        ));
        assert!(matches!(
            service.refresh(&store, &pair.refresh_token).await,
            Err(AuthError::NotFound)
        ));
    }

    #[tokio::test]
    async fn refresh_requires_uuid_subject() {
        let service = service();
        let store = InMemoryAccountStore::new();
        let mut claims = claims(&service, TokenType::Refresh, 300);
        claims.sub = Some("not-a-uuid".into());
        let token = service.sign_claims(&claims).unwrap();
        assert!(matches!(
            service.refresh(&store, &token).await,
            Err(AuthError::TokenInvalid)
        ));

        claims.sub = None;
        let token = service.sign_claims(&claims).unwrap();
        assert!(matches!(
            service.refresh(&store, &token).await,
            Err(AuthError::TokenInvalid)
        ));
    }
}
