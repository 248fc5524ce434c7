//! HTTP transport (§6). Thin axum layer over [`crate::orchestrator::Engine`]
//! — every handler just validates the wire shape and delegates to engine/
//! registry/retention methods the CLI binary calls too.

mod error;
mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::orchestrator::Engine;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let state = AppState { engine };
    Router::new()
        .route("/runs", post(routes::submit_run).get(routes::list_runs))
        .route("/runs/:run_hash", get(routes::get_run))
        .route("/runs/:run_hash/cancel", post(routes::cancel_run))
        .route("/runs/:run_hash/events", get(routes::get_events))
        .route("/runs/:run_hash/events/stream", get(routes::stream_events))
        .route("/runs/:run_hash/artifacts", get(routes::get_artifacts))
        .route("/runs/:run_hash/artifact/:name", get(routes::get_artifact))
        .route("/runs/:run_hash/hashes", get(routes::get_hashes))
        .route("/runs/:run_hash/pin", post(routes::pin_run))
        .route("/runs/:run_hash/unpin", post(routes::unpin_run))
        .route("/runs/:run_hash/rehydrate", post(routes::rehydrate_run))
        .route("/healthz", get(routes::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
