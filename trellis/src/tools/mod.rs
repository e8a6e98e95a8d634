//! Tool execution: a dispatcher keyed on tool name.
//!
//! Workspace tools run against the run's working folder under the node's
//! capability flags and the run's global mode; graph-mutating tools are
//! dispatched to the injected [`GraphTools`] handlers. Every failure is a
//! tool error in the result; tool execution never raises.

mod graph;
mod workspace;

pub use graph::{CreateEdgeArgs, GraphTools, SendHandoffArgs, SpawnNodeArgs};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use run_event::{GlobalMode, NodeCapabilities, ToolCall};
use serde_json::Value;

/// Tool name for reading a file.
pub const TOOL_READ_FILE: &str = "read_file";
/// Tool name for writing a file.
pub const TOOL_WRITE_FILE: &str = "write_file";
/// Tool name for listing files.
pub const TOOL_LIST_FILES: &str = "list_files";
/// Tool name for deleting a file.
pub const TOOL_DELETE_FILE: &str = "delete_file";
/// Tool name for running a shell command.
pub const TOOL_COMMAND: &str = "command";
/// Tool name for spawning a node.
pub const TOOL_SPAWN_NODE: &str = "spawn_node";
/// Tool name for creating an edge.
pub const TOOL_CREATE_EDGE: &str = "create_edge";
/// Tool name for sending a handoff envelope.
pub const TOOL_SEND_HANDOFF: &str = "send_handoff";
/// Provider-side todo-list tool, intercepted rather than executed.
pub const TOOL_TODO_WRITE: &str = "TodoWrite";

/// Every tool name the engine understands; the fenced tool-call extractor
/// only accepts these.
pub const ENGINE_TOOL_NAMES: &[&str] = &[
    TOOL_READ_FILE,
    TOOL_WRITE_FILE,
    TOOL_LIST_FILES,
    TOOL_DELETE_FILE,
    TOOL_COMMAND,
    TOOL_SPAWN_NODE,
    TOOL_CREATE_EDGE,
    TOOL_SEND_HANDOFF,
    TOOL_TODO_WRITE,
];

/// True for tools that mutate the run graph.
pub fn is_agent_tool(name: &str) -> bool {
    matches!(name, TOOL_SPAWN_NODE | TOOL_CREATE_EDGE | TOOL_SEND_HANDOFF)
}

/// Result of one tool execution.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub ok: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(output: Value) -> Self {
        Self {
            ok: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Everything a tool execution may touch.
pub struct ToolEnv {
    pub run_id: String,
    pub node_id: String,
    pub cwd: PathBuf,
    pub capabilities: NodeCapabilities,
    pub global_mode: GlobalMode,
    pub command_timeout: Duration,
    pub graph: Arc<dyn GraphTools>,
}

/// Executes one tool call. Capability denials and bad arguments come back
/// as tool errors.
pub async fn execute(env: &ToolEnv, call: &ToolCall) -> ToolResult {
    if env.capabilities.delegate_only && !is_agent_tool(&call.name) {
        return ToolResult::failure(format!(
            "node is delegate-only; tool '{}' is not available",
            call.name
        ));
    }
    match call.name.as_str() {
        TOOL_READ_FILE => workspace::read_file(env, &call.args).await,
        TOOL_WRITE_FILE => workspace::write_file(env, &call.args).await,
        TOOL_LIST_FILES => workspace::list_files(env, &call.args).await,
        TOOL_DELETE_FILE => workspace::delete_file(env, &call.args).await,
        TOOL_COMMAND => workspace::command(env, &call.args).await,
        TOOL_SPAWN_NODE => graph::spawn_node(env, &call.args).await,
        TOOL_CREATE_EDGE => graph::create_edge(env, &call.args).await,
        TOOL_SEND_HANDOFF => graph::send_handoff(env, &call.args).await,
        other => ToolResult::failure(format!("unknown tool: {}", other)),
    }
}
