//! Router and shared state.

use std::sync::Arc;

use axum::routing::{delete, get, patch, post};
use axum::Router;
use trellis::Engine;

use super::events::events_ws;
use super::handlers;

pub struct AppState {
    pub engine: Engine,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", post(handlers::create_run).get(handlers::list_runs))
        .route(
            "/runs/:run_id",
            get(handlers::get_run)
                .patch(handlers::update_run)
                .delete(handlers::delete_run),
        )
        .route("/runs/:run_id/nodes", post(handlers::create_node))
        .route(
            "/runs/:run_id/nodes/:node_id",
            patch(handlers::update_node).delete(handlers::delete_node),
        )
        .route(
            "/runs/:run_id/nodes/:node_id/reset",
            post(handlers::reset_node),
        )
        .route("/runs/:run_id/edges", post(handlers::create_edge))
        .route("/runs/:run_id/edges/:edge_id", delete(handlers::delete_edge))
        .route("/runs/:run_id/messages", post(handlers::post_message))
        .route("/runs/:run_id/approvals", get(handlers::list_approvals))
        .route(
            "/runs/:run_id/approvals/:approval_id",
            post(handlers::resolve_approval),
        )
        .route("/runs/:run_id/artifacts", post(handlers::record_artifact))
        .route("/runs/:run_id/envelopes", post(handlers::deliver_envelope))
        .route("/runs/:run_id/events", get(events_ws))
        .with_state(state)
}
