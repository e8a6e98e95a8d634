//! Prompt composition: system, role, mode, and task blocks.
//!
//! The concatenated `system + role` header is hashed; the per-session
//! state machine compares header hashes to decide between full and delta
//! prompts (delta = mode + task only).

use run_event::{Envelope, GlobalMode, NodeState, ResponseExpectation, RunState, UserMessage};

use crate::safety::sample_hash;

/// Global context and the tool protocol, sent at the head of every full
/// prompt.
pub const SYSTEM_BLOCK: &str = "\
You are one node in a graph of collaborating coding agents. You receive \
user messages and handoff envelopes from other nodes, and you reply with \
one assistant message per turn.

To call an engine tool, emit a fenced block:

```tool_call
{\"name\": \"<tool>\", \"args\": { … }}
```

Available tools: read_file, write_file, list_files, delete_file, command, \
spawn_node, create_edge, send_handoff. File paths are relative to the \
working folder. Handoffs to other nodes go through send_handoff.";

const PLANNING_BLOCK: &str = "\
MODE: PLANNING. The workspace is read-only apart from docs writes. Survey, \
design, and record plans; do not modify code or run commands.";

const IMPLEMENTATION_BLOCK: &str = "\
MODE: IMPLEMENTATION. Full capabilities apply, subject to this node's \
flags. Make the changes the task calls for and verify them.";

/// A composed prompt split at the header boundary.
#[derive(Clone, Debug)]
pub struct ComposedPrompt {
    header: String,
    body: String,
    pub header_hash: String,
}

impl ComposedPrompt {
    pub fn full(&self) -> String {
        format!("{}\n\n{}", self.header, self.body)
    }

    pub fn delta(&self) -> String {
        self.body.clone()
    }
}

/// Everything the task block renders.
pub struct PromptInput<'a> {
    pub run: &'a RunState,
    pub node: &'a NodeState,
    pub role_text: &'a str,
    pub envelopes: &'a [Envelope],
    pub messages: &'a [UserMessage],
    /// Nodes this node sent a response-required handoff to and has not
    /// heard back from (advisory marker only).
    pub awaiting_response_from: &'a [String],
}

/// Builds the four prompt blocks and the header hash.
pub fn compose(input: &PromptInput<'_>) -> ComposedPrompt {
    let header = format!("{}\n\n## Role\n\n{}", SYSTEM_BLOCK, input.role_text.trim());
    let mode_block = match input.run.global_mode {
        GlobalMode::Planning => PLANNING_BLOCK,
        GlobalMode::Implementation => IMPLEMENTATION_BLOCK,
    };
    let body = format!("{}\n\n{}", mode_block, render_task(input));
    let header_hash = sample_hash(&header);
    ComposedPrompt {
        header,
        body,
        header_hash,
    }
}

fn render_task(input: &PromptInput<'_>) -> String {
    let mut task = format!(
        "## Task\n\nRun {} · node {} ({}) · working folder: {}\n",
        input.run.id,
        input.node.label,
        input.node.id,
        if input.run.cwd.is_empty() {
            "."
        } else {
            &input.run.cwd
        },
    );

    if !input.messages.is_empty() {
        task.push_str("\n### User messages\n\n");
        for message in input.messages {
            task.push_str(&format!("- {}\n", message.content));
        }
    }

    if !input.envelopes.is_empty() {
        task.push_str("\n### Incoming handoffs\n\n");
        for envelope in input.envelopes {
            task.push_str(&format!("From {}: {}\n", envelope.from, envelope.payload.message));
            if let Some(structured) = &envelope.payload.structured {
                task.push_str(&format!("  structured: {}\n", structured));
            }
            if let Some(status) = &envelope.payload.status {
                task.push_str(&format!(
                    "  status: {}{}\n",
                    if status.ok { "ok" } else { "failed" },
                    status
                        .reason
                        .as_deref()
                        .map(|r| format!(" ({})", r))
                        .unwrap_or_default()
                ));
            }
            if let Some(response) = &envelope.payload.response {
                if response.expectation == ResponseExpectation::Required {
                    task.push_str(&format!(
                        "  a response back to {} is required (send_handoff)\n",
                        envelope.from
                    ));
                }
            }
        }
    }

    for node in input.awaiting_response_from {
        task.push_str(&format!("\nAwaiting response from {}.\n", node));
    }

    if input.messages.is_empty() && input.envelopes.is_empty() {
        task.push_str("\nContinue with your role.\n");
    }

    task
}
