use crate::state::AppState;
use axum::Router;

pub mod claims;
pub mod dto;
pub mod extractors;
pub mod google;
pub mod handlers;
pub mod jwt;
pub mod oauth;
pub mod password;
pub mod repo;
pub mod repo_types;
pub mod reset;
pub mod services;

#[cfg(test)]
pub mod memory;

pub fn router() -> Router<AppState> {
    handlers::auth_routes()
}
