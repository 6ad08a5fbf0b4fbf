use std::{future::Future, time::Duration};

use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::AppConfig;
use crate::error::StoreError;

pub async fn connect(config: &AppConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.db_timeout())
        .connect(&config.database_url)
        .await
        .context("connect to database")?;
    Ok(pool)
}

/// Run a database future, failing with `StoreError::Timeout` once `limit` elapses.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => {
            tracing::warn!(timeout_ms = limit.as_millis() as u64, "database call timed out");
            Err(StoreError::Timeout)
        }
    }
}
