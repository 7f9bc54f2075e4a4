use axum::{Router, routing::get};
use tower_http::cors::{Any, CorsLayer};

use crate::AppState;

pub mod health;
pub mod runs;
pub mod threads;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .merge(threads::router())
        .merge(runs::router())
        .layer(cors)
        .with_state(state)
}
