//! REST handlers: thin wrappers that deserialize the request, call the
//! engine, and serialize the result.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use run_event::{
    Approval, ApprovalResolution, Artifact, Edge, Envelope, NodePatch, NodeState, RunState,
    UserMessage,
};
use trellis::{
    CreateEdge, CreateNode, CreateRun, DeliverEnvelope, PostMessage, RecordArtifact,
    RunProjection, UpdateRun,
};

use super::app::AppState;
use super::error::ApiError;

pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRun>,
) -> Result<Json<RunState>, ApiError> {
    Ok(Json(state.engine.create_run(req).await?))
}

pub async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Vec<RunProjection>> {
    Json(state.engine.list_runs().await)
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunProjection>, ApiError> {
    Ok(Json(state.engine.get_run(&run_id).await?))
}

pub async fn update_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(req): Json<UpdateRun>,
) -> Result<Json<RunState>, ApiError> {
    Ok(Json(state.engine.update_run(&run_id, req).await?))
}

pub async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_run(&run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_node(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(req): Json<CreateNode>,
) -> Result<Json<NodeState>, ApiError> {
    Ok(Json(state.engine.create_node(&run_id, req).await?))
}

pub async fn update_node(
    State(state): State<Arc<AppState>>,
    Path((run_id, node_id)): Path<(String, String)>,
    Json(patch): Json<NodePatch>,
) -> Result<Json<NodeState>, ApiError> {
    Ok(Json(state.engine.update_node(&run_id, &node_id, patch).await?))
}

pub async fn delete_node(
    State(state): State<Arc<AppState>>,
    Path((run_id, node_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_node(&run_id, &node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reset_node(
    State(state): State<Arc<AppState>>,
    Path((run_id, node_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.engine.reset_node(&run_id, &node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_edge(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(req): Json<CreateEdge>,
) -> Result<Json<Edge>, ApiError> {
    Ok(Json(state.engine.create_edge(&run_id, req).await?))
}

pub async fn delete_edge(
    State(state): State<Arc<AppState>>,
    Path((run_id, edge_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_edge(&run_id, &edge_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(req): Json<PostMessage>,
) -> Result<Json<UserMessage>, ApiError> {
    Ok(Json(state.engine.post_message(&run_id, req).await?))
}

pub async fn list_approvals(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<Approval>>, ApiError> {
    Ok(Json(state.engine.list_approvals(&run_id).await?))
}

pub async fn resolve_approval(
    State(state): State<Arc<AppState>>,
    Path((_run_id, approval_id)): Path<(String, String)>,
    Json(resolution): Json<ApprovalResolution>,
) -> Result<StatusCode, ApiError> {
    state.engine.resolve_approval(&approval_id, resolution).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn record_artifact(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(req): Json<RecordArtifact>,
) -> Result<Json<Artifact>, ApiError> {
    Ok(Json(state.engine.record_artifact(&run_id, req).await?))
}

pub async fn deliver_envelope(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(req): Json<DeliverEnvelope>,
) -> Result<Json<Envelope>, ApiError> {
    Ok(Json(state.engine.deliver_envelope(&run_id, req).await?))
}
