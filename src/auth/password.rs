use std::sync::Arc;

use anyhow::Context;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use tracing::error;

use crate::config::PasswordConfig;
use crate::error::AuthResult;

fn argon2_for(config: PasswordConfig) -> anyhow::Result<Argon2<'static>> {
    let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
        .map_err(|e| anyhow::anyhow!("invalid argon2 params: {e}"))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

pub fn hash_password(plain: &str, config: PasswordConfig) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2_for(config)?
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

/// Verification reads the parameters embedded in the PHC string.
pub fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

/// Byte comparison whose running time does not depend on where inputs differ.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Hashing with the configured work factor, off the async runtime.
#[derive(Clone)]
pub struct PasswordHashing {
    config: PasswordConfig,
    dummy_hash: Arc<str>,
}

impl PasswordHashing {
    pub fn new(config: PasswordConfig) -> anyhow::Result<Self> {
        let dummy = hash_password("dummy-password-for-timing", config)
            .context("compute dummy password hash")?;
        Ok(Self {
            config,
            dummy_hash: dummy.into(),
        })
    }

    pub async fn hash(&self, plain: String) -> AuthResult<String> {
        let config = self.config;
        let hash = tokio::task::spawn_blocking(move || hash_password(&plain, config))
            .await
            .context("password hashing task panicked")??;
        Ok(hash)
    }

    /// Verify `plain` against `stored`. With no stored hash the dummy hash is
    /// checked instead and the result is always `false`. A stored value that
    /// is not a PHC string never verifies.
    pub async fn verify(&self, plain: String, stored: Option<String>) -> AuthResult<bool> {
        let (hash, real) = match stored {
            Some(hash) => (hash, true),
            None => (self.dummy_hash.to_string(), false),
        };
        let outcome = tokio::task::spawn_blocking(move || verify_password(&plain, &hash))
            .await
            .context("password verification task panicked")?;
        match outcome {
            Ok(matched) => Ok(real && matched),
            Err(e) => {
                error!(error = %e, "stored password hash is unreadable");
                Ok(false)
            }
        }
    }
}
