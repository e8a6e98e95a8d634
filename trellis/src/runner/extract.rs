//! In-message tool-call extraction for CLI transports speaking
//! stream-json: providers that cannot attach structured tool calls wrap
//! them in strict fenced blocks inside the assistant text.
//!
//! Wrapper format, one call per fence:
//!
//! ````text
//! ```tool_call
//! {"id": "optional", "name": "write_file", "args": {"path": "x", "content": "y"}}
//! ```
//! ````
//!
//! Only allowlisted engine tool names are accepted; anything else in a
//! fence is left alone.

use run_event::ToolCall;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::ENGINE_TOOL_NAMES;

const FENCE_OPEN: &str = "```tool_call";
const FENCE_CLOSE: &str = "```";

#[derive(Deserialize)]
struct FencedCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

/// Extracts allowlisted tool calls from fenced blocks in assistant text.
pub fn extract_tool_calls(content: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut block: Option<Vec<&str>> = None;
    for line in content.lines() {
        let trimmed = line.trim();
        match &mut block {
            None => {
                if trimmed == FENCE_OPEN {
                    block = Some(Vec::new());
                }
            }
            Some(lines) => {
                if trimmed == FENCE_CLOSE {
                    if let Some(call) = parse_block(lines) {
                        calls.push(call);
                    }
                    block = None;
                } else {
                    lines.push(line);
                }
            }
        }
    }
    calls
}

fn parse_block(lines: &[&str]) -> Option<ToolCall> {
    let body = lines.join("\n");
    let parsed: FencedCall = match serde_json::from_str(body.trim()) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring malformed tool_call fence");
            return None;
        }
    };
    if !ENGINE_TOOL_NAMES.contains(&parsed.name.as_str()) {
        tracing::debug!(name = %parsed.name, "ignoring non-engine tool in fence");
        return None;
    }
    Some(ToolCall {
        id: parsed
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        name: parsed.name,
        args: parsed.args.unwrap_or_else(|| Value::Object(Default::default())),
        provider_handled: false,
    })
}

/// Merges explicit adapter-provided calls with extracted in-message calls:
/// dedup by id, preserving order of first occurrence, explicit first.
pub fn merge_tool_calls(explicit: Vec<ToolCall>, extracted: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for call in explicit.into_iter().chain(extracted) {
        if seen.insert(call.id.clone()) {
            merged.push(call);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_single_fenced_call() {
        let content = "I will write the file now.\n\n```tool_call\n{\"name\": \"write_file\", \"args\": {\"path\": \"x.txt\", \"content\": \"y\"}}\n```\nDone.";
        let calls = extract_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "write_file");
        assert_eq!(calls[0].args["path"], "x.txt");
        assert!(!calls[0].id.is_empty());
    }

    #[test]
    fn extracts_multiple_blocks_in_order() {
        let content = "```tool_call\n{\"id\":\"a\",\"name\":\"read_file\",\"args\":{\"path\":\"a\"}}\n```\ntext\n```tool_call\n{\"id\":\"b\",\"name\":\"command\",\"args\":{\"command\":\"ls\"}}\n```";
        let calls = extract_tool_calls(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[1].id, "b");
    }

    #[test]
    fn rejects_unknown_tool_names() {
        let content = "```tool_call\n{\"name\":\"rm_rf_root\",\"args\":{}}\n```";
        assert!(extract_tool_calls(content).is_empty());
    }

    #[test]
    fn rejects_malformed_json_and_plain_fences() {
        let content = "```tool_call\nnot json\n```\n```rust\nlet x = 1;\n```";
        assert!(extract_tool_calls(content).is_empty());
    }

    #[test]
    fn multiline_args_survive() {
        let content = "```tool_call\n{\n  \"name\": \"write_file\",\n  \"args\": {\n    \"path\": \"a.txt\",\n    \"content\": \"line\"\n  }\n}\n```";
        let calls = extract_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args["content"], "line");
    }

    #[test]
    fn merge_dedups_by_id_preferring_explicit() {
        let explicit = vec![ToolCall {
            id: "t1".to_string(),
            name: "write_file".to_string(),
            args: json!({"path": "explicit"}),
            provider_handled: false,
        }];
        let extracted = vec![
            ToolCall {
                id: "t1".to_string(),
                name: "write_file".to_string(),
                args: json!({"path": "extracted"}),
                provider_handled: false,
            },
            ToolCall {
                id: "t2".to_string(),
                name: "command".to_string(),
                args: json!({"command": "ls"}),
                provider_handled: false,
            },
        ];
        let merged = merge_tool_calls(explicit, extracted);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].args["path"], "explicit");
        assert_eq!(merged[1].id, "t2");
    }
}
