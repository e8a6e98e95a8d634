//! The turn loop: one send/receive round with a provider session,
//! including tool-queue processing and suspension for approvals.
//!
//! The scheduler treats this module as total: every internal failure
//! surfaces as a `Failed` outcome, never an error.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use run_event::{
    Approval, ApprovalResolution, ConnectionState, ConnectionStatus, EdgeManagement, Event,
    NodePatch, NodeState, PermissionsMode, RunState, SessionDescriptor, TodoItem, ToolCall,
};
use serde_json::Value;

use crate::approval::{ApprovalOrigin, ApprovalQueue};
use crate::provider::{AdapterEvent, PromptKind, Transport, TurnRequest, WireProtocol};
use crate::store::{LogError, RunHandle};
use crate::tools::{self, GraphTools, ToolEnv, TOOL_CREATE_EDGE, TOOL_SPAWN_NODE, TOOL_TODO_WRITE};

use super::extract::{extract_tool_calls, merge_tool_calls};
use super::prompt::{compose, PromptInput};
use super::session::{NodeSession, PendingTurn};

/// Input to one turn: what the scheduler drained from the node's inbox.
#[derive(Debug, Default)]
pub struct TurnInput {
    pub envelopes: Vec<run_event::Envelope>,
    pub messages: Vec<run_event::UserMessage>,
    /// Resume a turn suspended on an approval; inbox was not consumed.
    pub resume: bool,
}

/// Outcome of one turn.
#[derive(Clone, Debug)]
pub enum TurnOutcome {
    Completed { message: String, summary: String },
    Blocked { approval: Approval, summary: String },
    Interrupted { message: String, summary: String },
    Failed { error: String, summary: String },
}

/// Everything a turn needs, snapshotted at dispatch.
pub struct TurnContext {
    pub handle: Arc<RunHandle>,
    pub session: Arc<NodeSession>,
    pub run: RunState,
    pub node: NodeState,
    pub graph: Arc<dyn GraphTools>,
    pub approvals: Arc<ApprovalQueue>,
    pub role_text: String,
    /// Advisory "awaiting response from …" markers for the task block.
    pub awaiting_response_from: Vec<String>,
    /// Run-level cancel handle; cancellation lands the turn as interrupted.
    pub cancel: tokio_util::sync::CancellationToken,
    pub turn_timeout: Duration,
    pub command_timeout: Duration,
}

/// Drives one turn to completion. Total: all errors become `Failed`.
pub async fn run_turn(ctx: &TurnContext, input: TurnInput) -> TurnOutcome {
    match run_turn_inner(ctx, input).await {
        Ok(outcome) => outcome,
        Err(e) => TurnOutcome::Failed {
            error: format!("event log: {}", e),
            summary: "turn failed".to_string(),
        },
    }
}

async fn run_turn_inner(ctx: &TurnContext, input: TurnInput) -> Result<TurnOutcome, LogError> {
    if input.resume {
        let pending = ctx.session.state.lock().await.pending.take();
        if let Some(pending) = pending {
            if pending.queue.is_empty() {
                // Adapter-originated approval: the provider continues the
                // turn on its side; keep waiting for its final outcome.
                return wait_for_signals(ctx, pending.message, pending.turn_id).await;
            }
            return process_tool_queue(ctx, pending).await;
        }
        tracing::warn!(node_id = %ctx.node.id, "resume without pending turn, starting fresh");
    }

    let prompt = compose(&PromptInput {
        run: &ctx.run,
        node: &ctx.node,
        role_text: &ctx.role_text,
        envelopes: &input.envelopes,
        messages: &input.messages,
        awaiting_response_from: &ctx.awaiting_response_from,
    });
    let turn_id = uuid::Uuid::new_v4().to_string();
    let kind = {
        let state = ctx.session.state.lock().await;
        state.prompts.decide(&prompt.header_hash, ctx.session.spec.stateful)
    };
    let text = match kind {
        PromptKind::Full => prompt.full(),
        PromptKind::Delta => prompt.delta(),
    };
    if let Err(e) = ctx
        .session
        .adapter
        .send(TurnRequest {
            prompt: text,
            prompt_kind: kind,
            turn_id: turn_id.clone(),
        })
        .await
    {
        return Ok(TurnOutcome::Failed {
            error: e.to_string(),
            summary: "provider send failed".to_string(),
        });
    }
    ctx.session
        .state
        .lock()
        .await
        .prompts
        .note_sent(&prompt.header_hash);

    wait_for_signals(ctx, String::new(), turn_id).await
}

/// Reads the signal queue until a terminal signal arrives.
async fn wait_for_signals(
    ctx: &TurnContext,
    mut buffer: String,
    turn_id: String,
) -> Result<TurnOutcome, LogError> {
    loop {
        let signal = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Ok(TurnOutcome::Interrupted {
                    message: buffer,
                    summary: "interrupted".to_string(),
                });
            }
            signal = ctx.session.recv_signal(ctx.turn_timeout) => signal,
        };
        let Some(signal) = signal else {
            return Ok(TurnOutcome::Failed {
                error: format!("provider produced no signal within {}s", ctx.turn_timeout.as_secs()),
                summary: "provider timed out".to_string(),
            });
        };
        match signal {
            AdapterEvent::AssistantDelta { delta } => {
                buffer.push_str(&delta);
                ctx.handle
                    .publish(Event::AssistantDelta {
                        node_id: ctx.node.id.clone(),
                        delta,
                    })
                    .await?;
            }
            AdapterEvent::ThinkingDelta { delta } => {
                ctx.handle
                    .publish(Event::ThinkingDelta {
                        node_id: ctx.node.id.clone(),
                        delta,
                    })
                    .await?;
            }
            AdapterEvent::ThinkingFinal { content } => {
                ctx.handle
                    .publish(Event::ThinkingFinal {
                        node_id: ctx.node.id.clone(),
                        content,
                    })
                    .await?;
            }
            AdapterEvent::Reasoning { content } => {
                ctx.handle
                    .publish(Event::Reasoning {
                        node_id: ctx.node.id.clone(),
                        content,
                    })
                    .await?;
            }
            AdapterEvent::Usage(usage) => {
                ctx.handle
                    .publish(Event::TelemetryUsage {
                        node_id: Some(ctx.node.id.clone()),
                        usage,
                    })
                    .await?;
            }
            AdapterEvent::SessionId(session_id) => {
                ctx.handle
                    .publish(Event::NodePatch {
                        node_id: ctx.node.id.clone(),
                        patch: NodePatch {
                            session: Some(SessionDescriptor {
                                session_id: Some(session_id),
                                reset_commands: ctx.node.session.reset_commands.clone(),
                            }),
                            connection: Some(ConnectionState {
                                status: ConnectionStatus::Connected,
                                streaming: true,
                                heartbeat_at: Some(Utc::now()),
                            }),
                            ..Default::default()
                        },
                    })
                    .await?;
            }
            AdapterEvent::Disconnected => {
                ctx.session.state.lock().await.prompts.mark_disconnected();
                ctx.handle
                    .publish(Event::NodePatch {
                        node_id: ctx.node.id.clone(),
                        patch: NodePatch {
                            connection: Some(ConnectionState {
                                status: ConnectionStatus::Disconnected,
                                streaming: false,
                                heartbeat_at: None,
                            }),
                            ..Default::default()
                        },
                    })
                    .await?;
                return Ok(TurnOutcome::Failed {
                    error: "provider disconnected".to_string(),
                    summary: "provider disconnected".to_string(),
                });
            }
            AdapterEvent::Interrupted => {
                return Ok(TurnOutcome::Interrupted {
                    message: buffer,
                    summary: "interrupted".to_string(),
                });
            }
            AdapterEvent::Error(error) => {
                return Ok(TurnOutcome::Failed {
                    summary: summarize(&error),
                    error,
                });
            }
            AdapterEvent::ApprovalRequested(request) => {
                if ctx.node.permissions.permissions_mode == PermissionsMode::Gated {
                    let approval = Approval {
                        id: request.id,
                        run_id: ctx.run.id.clone(),
                        node_id: ctx.node.id.clone(),
                        tool: request.tool,
                        context: request.context,
                        timeout_ms: None,
                    };
                    ctx.approvals
                        .insert(approval.clone(), ApprovalOrigin::Adapter);
                    ctx.handle
                        .publish(Event::ApprovalRequested {
                            approval: approval.clone(),
                        })
                        .await?;
                    ctx.session.state.lock().await.pending = Some(PendingTurn {
                        turn_id,
                        message: buffer,
                        queue: VecDeque::new(),
                        errors: Vec::new(),
                        proposed: HashSet::new(),
                    });
                    return Ok(TurnOutcome::Blocked {
                        approval,
                        summary: "awaiting approval".to_string(),
                    });
                }
                // Permissions are skipped: answer the provider directly.
                if let Err(e) = ctx
                    .session
                    .adapter
                    .resolve_approval(&request.id, &ApprovalResolution::Approved)
                    .await
                {
                    tracing::warn!(error = %e, "auto-approve failed");
                }
            }
            AdapterEvent::AssistantFinal {
                content,
                tool_calls,
            } => {
                let message = if content.is_empty() { buffer } else { content };
                let extracted = if ctx.session.spec.transport == Transport::Cli
                    && ctx.session.spec.protocol == WireProtocol::StreamJson
                {
                    extract_tool_calls(&message)
                } else {
                    Vec::new()
                };
                let merged = merge_tool_calls(tool_calls, extracted);
                ctx.handle
                    .publish(Event::AssistantFinal {
                        node_id: ctx.node.id.clone(),
                        content: message.clone(),
                        tool_calls: merged.clone(),
                    })
                    .await?;
                if merged.is_empty() {
                    return Ok(TurnOutcome::Completed {
                        summary: summarize(&message),
                        message,
                    });
                }
                let pending = PendingTurn {
                    turn_id,
                    message,
                    queue: merged.into(),
                    errors: Vec::new(),
                    proposed: HashSet::new(),
                };
                return process_tool_queue(ctx, pending).await;
            }
        }
    }
}

/// Processes the tool queue in order, suspending on approvals.
async fn process_tool_queue(
    ctx: &TurnContext,
    mut pending: PendingTurn,
) -> Result<TurnOutcome, LogError> {
    while let Some(call) = pending.queue.pop_front() {
        if pending.proposed.insert(call.id.clone()) {
            ctx.handle
                .publish(Event::ToolProposed {
                    node_id: ctx.node.id.clone(),
                    call: call.clone(),
                })
                .await?;
        }

        // The provider already executed this call; never re-run it, but
        // still surface side-effects like a todo-list patch.
        if call.provider_handled {
            if call.name == TOOL_TODO_WRITE {
                publish_todos(ctx, &call.args).await?;
            }
            complete_tool(
                ctx,
                &call,
                false,
                None,
                Some("executed natively by provider; not re-run".to_string()),
                0,
            )
            .await?;
            continue;
        }

        // Agent-management capability guards.
        let capability_error = match call.name.as_str() {
            TOOL_SPAWN_NODE if ctx.node.capabilities.edge_management != EdgeManagement::All => {
                Some("spawn_node requires edge management: all".to_string())
            }
            TOOL_CREATE_EDGE
                if ctx.node.capabilities.edge_management == EdgeManagement::None =>
            {
                Some("create_edge requires edge management: self or all".to_string())
            }
            _ => None,
        };
        if let Some(error) = capability_error {
            pending.errors.push(format!("{}: {}", call.name, error));
            complete_tool(ctx, &call, false, None, Some(error), 0).await?;
            continue;
        }

        // Approval gate.
        let needs_approval = ctx.node.permissions.permissions_mode == PermissionsMode::Gated
            || (tools::is_agent_tool(&call.name)
                && ctx.node.permissions.agent_management_requires_approval);
        let cached = ctx.session.state.lock().await.resolutions.remove(&call.id);
        if needs_approval && cached.is_none() {
            let approval = Approval {
                id: call.id.clone(),
                run_id: ctx.run.id.clone(),
                node_id: ctx.node.id.clone(),
                context: Some(describe_call(&call)),
                tool: call.clone(),
                timeout_ms: None,
            };
            ctx.approvals
                .insert(approval.clone(), ApprovalOrigin::ToolQueue);
            ctx.handle
                .publish(Event::ApprovalRequested {
                    approval: approval.clone(),
                })
                .await?;
            pending.queue.push_front(call);
            ctx.session.state.lock().await.pending = Some(pending);
            return Ok(TurnOutcome::Blocked {
                approval,
                summary: "awaiting approval".to_string(),
            });
        }

        let mut call = call;
        if let Some(resolution) = cached {
            match resolution {
                ApprovalResolution::Approved => {}
                ApprovalResolution::Denied => {
                    let error = "denied by operator".to_string();
                    pending.errors.push(format!("{}: {}", call.name, error));
                    complete_tool(ctx, &call, false, None, Some(error), 0).await?;
                    break;
                }
                ApprovalResolution::Modified { args } => {
                    if args.is_object() {
                        call.args = args;
                    } else {
                        let error =
                            "modified arguments must be a JSON object; treated as denied"
                                .to_string();
                        pending.errors.push(format!("{}: {}", call.name, error));
                        complete_tool(ctx, &call, false, None, Some(error), 0).await?;
                        break;
                    }
                }
            }
        }

        // Direct TodoWrite is satisfied by the node.patch emission.
        if call.name == TOOL_TODO_WRITE {
            publish_todos(ctx, &call.args).await?;
            complete_tool(ctx, &call, true, Some(Value::from("todos updated")), None, 0).await?;
            continue;
        }

        ctx.handle
            .publish(Event::ToolStarted {
                node_id: ctx.node.id.clone(),
                call_id: call.id.clone(),
                name: call.name.clone(),
            })
            .await?;
        let started = Instant::now();
        let env = ToolEnv {
            run_id: ctx.run.id.clone(),
            node_id: ctx.node.id.clone(),
            cwd: std::path::PathBuf::from(if ctx.run.cwd.is_empty() {
                ".".to_string()
            } else {
                ctx.run.cwd.clone()
            }),
            capabilities: ctx.node.capabilities,
            global_mode: ctx.run.global_mode,
            command_timeout: ctx.command_timeout,
            graph: Arc::clone(&ctx.graph),
        };
        let result = tools::execute(&env, &call).await;
        if let Some(error) = &result.error {
            pending.errors.push(format!("{}: {}", call.name, error));
        }
        complete_tool(
            ctx,
            &call,
            result.ok,
            result.output,
            result.error,
            started.elapsed().as_millis() as u64,
        )
        .await?;
    }

    ctx.session.state.lock().await.pending = None;
    let message = render_completed_message(&pending.message, &pending.errors);
    Ok(TurnOutcome::Completed {
        summary: summarize(&message),
        message,
    })
}

async fn complete_tool(
    ctx: &TurnContext,
    call: &ToolCall,
    ok: bool,
    result: Option<Value>,
    error: Option<String>,
    duration_ms: u64,
) -> Result<(), LogError> {
    ctx.handle
        .publish(Event::ToolCompleted {
            node_id: ctx.node.id.clone(),
            call_id: call.id.clone(),
            name: call.name.clone(),
            ok,
            result,
            error,
            duration_ms,
        })
        .await?;
    Ok(())
}

async fn publish_todos(ctx: &TurnContext, args: &Value) -> Result<(), LogError> {
    let todos: Vec<TodoItem> = args
        .get("todos")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    ctx.handle
        .publish(Event::NodePatch {
            node_id: ctx.node.id.clone(),
            patch: NodePatch {
                todos: Some(todos),
                ..Default::default()
            },
        })
        .await?;
    Ok(())
}

fn describe_call(call: &ToolCall) -> String {
    let args = serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".to_string());
    let args = if args.chars().count() > 200 {
        let truncated: String = args.chars().take(200).collect();
        format!("{}…", truncated)
    } else {
        args
    };
    format!("{} {}", call.name, args)
}

/// The turn's message body plus any tool errors as a bullet list.
fn render_completed_message(message: &str, errors: &[String]) -> String {
    if errors.is_empty() {
        return message.to_string();
    }
    let mut rendered = String::from(message);
    if !rendered.is_empty() {
        rendered.push_str("\n\n");
    }
    rendered.push_str("Tool errors:\n");
    for error in errors {
        rendered.push_str(&format!("- {}\n", error));
    }
    rendered
}

/// First line of the message, truncated; "completed" for empty output.
pub fn summarize(message: &str) -> String {
    let first_line = message.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    if first_line.is_empty() {
        return "completed".to_string();
    }
    let mut summary: String = first_line.trim().chars().take(80).collect();
    if first_line.trim().chars().count() > 80 {
        summary.push('…');
    }
    summary
}
