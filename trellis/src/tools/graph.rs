//! Graph-mutating tools: spawn_node, create_edge, send_handoff.
//!
//! The executor stays a pure dispatcher; these handlers are injected by
//! the engine, which owns node/edge creation and envelope delivery.

use async_trait::async_trait;
use run_event::{
    ArtifactRef, EdgeType, EnvelopeStatus, NodeCapabilities, ResponseSpec,
};
use serde::Deserialize;
use serde_json::Value;

use super::{ToolEnv, ToolResult};

/// Engine-side handlers for the graph-mutating tools.
#[async_trait]
pub trait GraphTools: Send + Sync {
    async fn spawn_node(
        &self,
        run_id: &str,
        origin_node: &str,
        args: SpawnNodeArgs,
    ) -> Result<Value, String>;

    async fn create_edge(
        &self,
        run_id: &str,
        origin_node: &str,
        args: CreateEdgeArgs,
    ) -> Result<Value, String>;

    async fn send_handoff(
        &self,
        run_id: &str,
        origin_node: &str,
        args: SendHandoffArgs,
    ) -> Result<Value, String>;
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnNodeArgs {
    pub label: String,
    #[serde(default)]
    pub role_template: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub capabilities: Option<NodeCapabilities>,
    /// First message for the new node's inbox.
    #[serde(default)]
    pub task: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEdgeArgs {
    /// Defaults to the calling node.
    #[serde(default)]
    pub from: Option<String>,
    pub to: String,
    #[serde(rename = "type", default)]
    pub edge_type: Option<EdgeType>,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendHandoffArgs {
    /// Target node id or label; when absent, the first outgoing handoff
    /// edge of the sender resolves the target.
    #[serde(default)]
    pub to: Option<String>,
    pub message: String,
    #[serde(default)]
    pub structured: Option<Value>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    pub status: Option<EnvelopeStatus>,
    #[serde(default)]
    pub response: Option<ResponseSpec>,
    #[serde(default)]
    pub context_ref: Option<String>,
}

fn parse<T: for<'de> Deserialize<'de>>(args: &Value) -> Result<T, String> {
    serde_json::from_value(args.clone()).map_err(|e| format!("invalid arguments: {}", e))
}

pub(crate) async fn spawn_node(env: &ToolEnv, args: &Value) -> ToolResult {
    let args: SpawnNodeArgs = match parse(args) {
        Ok(a) => a,
        Err(e) => return ToolResult::failure(e),
    };
    match env.graph.spawn_node(&env.run_id, &env.node_id, args).await {
        Ok(output) => ToolResult::success(output),
        Err(e) => ToolResult::failure(e),
    }
}

pub(crate) async fn create_edge(env: &ToolEnv, args: &Value) -> ToolResult {
    let args: CreateEdgeArgs = match parse(args) {
        Ok(a) => a,
        Err(e) => return ToolResult::failure(e),
    };
    match env.graph.create_edge(&env.run_id, &env.node_id, args).await {
        Ok(output) => ToolResult::success(output),
        Err(e) => ToolResult::failure(e),
    }
}

pub(crate) async fn send_handoff(env: &ToolEnv, args: &Value) -> ToolResult {
    let args: SendHandoffArgs = match parse(args) {
        Ok(a) => a,
        Err(e) => return ToolResult::failure(e),
    };
    match env.graph.send_handoff(&env.run_id, &env.node_id, args).await {
        Ok(output) => ToolResult::success(output),
        Err(e) => ToolResult::failure(e),
    }
}
