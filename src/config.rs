use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Longest lifetime a password reset token may be configured with.
const MAX_RESET_TTL_MINUTES: i64 = 6 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// PEM encoded RSA private key. Verify-only deployments leave this unset.
    pub private_key_pem: Option<String>,
    pub public_key_pem: String,
    pub issuer: String,
    pub audience: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
    pub reset_ttl_minutes: i64,
}

/// Argon2id work factor.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PasswordConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub env: String,
    pub jwt: JwtConfig,
    pub password: PasswordConfig,
    pub google: Option<GoogleOAuthConfig>,
    pub frontend_oauth_callback_url: String,
    pub disable_auth: bool,
    pub db_max_connections: u32,
    pub db_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".into());
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;

        let jwt = JwtConfig {
            private_key_pem: std::env::var("JWT_PRIVATE_KEY").ok().map(|v| unescape_pem(&v)),
            public_key_pem: std::env::var("JWT_PUBLIC_KEY")
                .map(|v| unescape_pem(&v))
                .context("JWT_PUBLIC_KEY is not set")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "water-classroom-auth".into()),
            audience: std::env::var("JWT_AUDIENCE")
                .unwrap_or_else(|_| "water-classroom-api".into()),
            access_ttl_minutes: env_parse("JWT_ACCESS_TTL_MINUTES").unwrap_or(15),
            refresh_ttl_minutes: env_parse("JWT_REFRESH_TTL_MINUTES").unwrap_or(60 * 24 * 7),
            reset_ttl_minutes: reset_ttl(env_parse("PASSWORD_RESET_TTL_MINUTES")),
        };

        let defaults = PasswordConfig::default();
        let password = PasswordConfig {
            memory_kib: env_parse("PASSWORD_HASH_MEMORY_KIB").unwrap_or(defaults.memory_kib),
            iterations: env_parse("PASSWORD_HASH_ITERATIONS").unwrap_or(defaults.iterations),
            parallelism: env_parse("PASSWORD_HASH_PARALLELISM").unwrap_or(defaults.parallelism),
        };

        let google = match (
            std::env::var("GOOGLE_CLIENT_ID"),
            std::env::var("GOOGLE_CLIENT_SECRET"),
            std::env::var("GOOGLE_REDIRECT_URL"),
        ) {
            (Ok(client_id), Ok(client_secret), Ok(redirect_url))
                if !client_id.is_empty() && !client_secret.is_empty() && !redirect_url.is_empty() =>
            {
                Some(GoogleOAuthConfig {
                    client_id,
                    client_secret,
                    redirect_url,
                })
            }
            _ => {
                tracing::warn!("Google OAuth credentials not fully configured; Google sign-in disabled");
                None
            }
        };

        let disable_auth = std::env::var("DISABLE_AUTH")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let config = Self {
            database_url,
            env,
            jwt,
            password,
            google,
            frontend_oauth_callback_url: std::env::var("FRONTEND_OAUTH_CALLBACK_URL")
                .unwrap_or_else(|_| "http://localhost:5173/auth/oauth-callback".into()),
            disable_auth,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS").unwrap_or(10),
            db_timeout_secs: env_parse("DB_TIMEOUT_SECS").unwrap_or(5),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.env == "production"
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_secs)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.disable_auth && self.is_production() {
            anyhow::bail!("DISABLE_AUTH cannot be enabled when APP_ENV=production");
        }
        if self.jwt.access_ttl_minutes <= 0 || self.jwt.refresh_ttl_minutes <= 0 {
            anyhow::bail!("token lifetimes must be positive");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// PEM blocks passed through env files often carry literal `\n` sequences.
fn unescape_pem(raw: &str) -> String {
    raw.replace("\\n", "\n")
}

fn reset_ttl(configured: Option<i64>) -> i64 {
    match configured {
        Some(minutes) if minutes > 0 && minutes <= MAX_RESET_TTL_MINUTES => minutes,
        Some(minutes) if minutes > MAX_RESET_TTL_MINUTES => {
            tracing::warn!(
                configured = minutes,
                max = MAX_RESET_TTL_MINUTES,
                "PASSWORD_RESET_TTL_MINUTES too long; clamping"
            );
            MAX_RESET_TTL_MINUTES
        }
        Some(minutes) => {
            tracing::warn!(configured = minutes, "invalid PASSWORD_RESET_TTL_MINUTES; defaulting to 60");
            60
        }
        None => 60,
    }
}
