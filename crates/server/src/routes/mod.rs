pub mod health;
pub mod terminal;

use axum::Router;

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(terminal::router())
        .with_state(state)
}
