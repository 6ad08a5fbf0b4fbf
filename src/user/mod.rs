use crate::state::AppState;
use axum::Router;

pub mod dto;
pub mod handlers;

/// Routes that require an authenticated caller.
pub fn router() -> Router<AppState> {
    handlers::user_routes()
}
