//! API layer -- axum routes, handlers, and error mapping.

mod error;
mod routes;
pub mod state;

use axum::Router;
use tower_http::trace::TraceLayer;

pub use self::error::ApiError;
use self::state::AppState;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> ApiError {
    ApiError::NotFound("no such route".to_string())
}
