mod app;
mod auth;
mod config;
mod db;
mod error;
mod state;
mod user;

use crate::config::AppConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "classroom_auth=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = AppConfig::from_env()?;
    if config.disable_auth {
        tracing::warn!(env = %config.env, "DISABLE_AUTH is set; protected routes are open");
    }

    let pool = db::connect(&config).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let state = AppState::init(config, pool)?;
    app::serve(app::build_app(state)).await
}
