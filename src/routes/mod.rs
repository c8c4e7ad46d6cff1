//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Binds the pixel websocket and the small REST surface used for catalog
//! and page-load bootstrap under a single Axum router.

pub mod canvas;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route("/api/canvas", post(canvas::create_canvas))
        .route("/api/canvas/{id}", get(canvas::get_canvas))
        .route("/api/pubs", get(canvas::list_pubs))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
