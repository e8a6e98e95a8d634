//! The scheduler: a single cooperative tick that selects runnable nodes
//! across all running runs and advances each by one turn.
//!
//! The tick itself is serialized; concurrency comes from turns being their
//! own tasks that yield at adapter reads. A node's `running` status forbids
//! re-entry, so turns on one node are strictly serialized while turns on
//! different nodes overlap freely.

use std::sync::Arc;

use run_event::{
    ConnectionStatus, Event, NodePatch, NodeState, NodeStatus, OrchestrationMode, RunPatch,
    RunState, RunStatus,
};
use tokio::task::JoinHandle;

use crate::engine::{EngineInner, ORCHESTRATOR_ROLE};
use crate::runner::{run_turn, TurnContext, TurnInput, TurnOutcome};
use crate::safety::{sample_hash, update_stall_state, TurnObservation};
use crate::store::RunHandle;

/// Spawns the periodic tick loop; cancelled via the engine's shutdown
/// token.
pub(crate) fn spawn(engine: Arc<EngineInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(engine.settings.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = engine.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            tick(&engine).await;
        }
    })
}

/// One tick: enumerate running runs in stable order, dispatch every
/// runnable node.
pub(crate) async fn tick(engine: &Arc<EngineInner>) {
    let mut handles = engine.store.handles();
    handles.sort_by(|a, b| a.run_id().cmp(b.run_id()));
    for handle in handles {
        let runnable = handle
            .with_state(|projection, runtime| {
                if projection.run.status != RunStatus::Running {
                    return Vec::new();
                }
                projection
                    .nodes
                    .values()
                    .filter(|node| {
                        node.status == NodeStatus::Idle
                            && node.connection.status != ConnectionStatus::Disconnected
                            && (projection.queue_len(&node.id) > 0
                                || runtime
                                    .get(&node.id)
                                    .map(|rt| rt.pending_turn || rt.auto_prompt_queued)
                                    .unwrap_or(false))
                    })
                    .map(|node| node.id.clone())
                    .collect()
            })
            .await;
        for node_id in runnable {
            dispatch(engine, &handle, &node_id).await;
        }
    }
}

/// Claims one node for a turn and spawns the turn task.
async fn dispatch(engine: &Arc<EngineInner>, handle: &Arc<RunHandle>, node_id: &str) {
    // Re-check under the lock: a pause or an earlier dispatch this tick may
    // have changed things.
    let claim = handle
        .with_state(|projection, runtime| {
            if projection.run.status != RunStatus::Running {
                return None;
            }
            let node = projection.nodes.get(node_id)?;
            if node.status != NodeStatus::Idle {
                return None;
            }
            let rt = runtime.entry(node_id.to_string()).or_default();
            let resume = rt.pending_turn;
            rt.pending_turn = false;
            rt.auto_prompt_queued = false;
            Some((
                projection.run.clone(),
                node.clone(),
                resume,
                rt.awaiting_response_from.clone(),
            ))
        })
        .await;
    let Some((run, node, resume, awaiting)) = claim else {
        return;
    };

    if let Err(e) = publish_status(handle, node_id, NodeStatus::Running, None).await {
        tracing::warn!(node_id = %node_id, error = %e, "marking node running failed");
        return;
    }

    let input = if resume {
        TurnInput {
            resume: true,
            ..Default::default()
        }
    } else {
        match handle.drain_inbox(node_id).await {
            Ok((envelopes, messages)) => {
                // A drained envelope answers any pending response marker
                // from its sender.
                if !envelopes.is_empty() {
                    let senders: Vec<String> =
                        envelopes.iter().map(|e| e.from.clone()).collect();
                    handle
                        .with_runtime(node_id, |rt| {
                            rt.awaiting_response_from
                                .retain(|from| !senders.contains(from));
                        })
                        .await;
                }
                TurnInput {
                    envelopes,
                    messages,
                    resume: false,
                }
            }
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "inbox drain failed");
                let _ = publish_status(handle, node_id, NodeStatus::Failed, Some("inbox drain failed")).await;
                return;
            }
        }
    };

    let session = match engine
        .sessions
        .get_or_create(
            engine.factory.as_ref(),
            &run,
            &node,
            engine.settings.close_grace,
        )
        .await
    {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(node_id = %node_id, error = %e, "session start failed");
            let _ = publish_status(
                handle,
                node_id,
                NodeStatus::Failed,
                Some(&format!("provider start failed: {}", e)),
            )
            .await;
            return;
        }
    };

    let cwd = if run.cwd.is_empty() {
        std::path::PathBuf::from(".")
    } else {
        std::path::PathBuf::from(&run.cwd)
    };
    let role_text = engine.templates.load(&cwd, &node.role_template);

    let ctx = TurnContext {
        handle: Arc::clone(handle),
        session,
        run: run.clone(),
        node: node.clone(),
        graph: engine.graph_tools(),
        approvals: Arc::clone(&engine.approvals),
        role_text,
        awaiting_response_from: awaiting,
        cancel: handle.cancel_token(),
        turn_timeout: engine.settings.turn_timeout,
        command_timeout: engine.settings.command_timeout,
    };

    let engine = Arc::clone(engine);
    let handle = Arc::clone(handle);
    tokio::spawn(async move {
        // The runner is total, but a panic inside the turn task must still
        // come back as a synthetic failed turn.
        let turn = tokio::spawn(async move { run_turn(&ctx, input).await });
        let outcome = match turn.await {
            Ok(outcome) => outcome,
            Err(e) => TurnOutcome::Failed {
                error: format!("turn task aborted: {}", e),
                summary: "turn failed".to_string(),
            },
        };
        apply_outcome(&engine, &handle, &run, &node, outcome).await;
    });
}

/// Writes a turn's outcome back into node and run state, applies the
/// loop-safety policy, and queues AUTO-mode orchestrator self-continuation.
async fn apply_outcome(
    engine: &Arc<EngineInner>,
    handle: &Arc<RunHandle>,
    run: &RunState,
    node: &NodeState,
    outcome: TurnOutcome,
) {
    let node_id = node.id.as_str();
    let result = match outcome {
        TurnOutcome::Completed { message, summary } => {
            apply_completed(engine, handle, run, node, message, summary).await
        }
        TurnOutcome::Blocked { summary, .. } => {
            publish_status(handle, node_id, NodeStatus::Blocked, Some(&summary)).await
        }
        TurnOutcome::Interrupted { summary, .. } => {
            publish_status(handle, node_id, NodeStatus::Idle, Some(&summary)).await
        }
        TurnOutcome::Failed { error, summary } => {
            tracing::warn!(node_id = %node_id, error = %error, "turn failed");
            publish_status(handle, node_id, NodeStatus::Failed, Some(&summary)).await
        }
    };
    if let Err(e) = result {
        tracing::warn!(node_id = %node_id, error = %e, "applying turn outcome failed");
    }
}

async fn apply_completed(
    engine: &Arc<EngineInner>,
    handle: &Arc<RunHandle>,
    run: &RunState,
    node: &NodeState,
    message: String,
    summary: String,
) -> Result<(), crate::store::LogError> {
    let observation = TurnObservation {
        output_hash: Some(sample_hash(&message)),
        diff_hash: None,
        verification_failure: None,
    };
    let threshold = engine.settings.stall_threshold;
    let node_id = node.id.clone();
    let evidence = handle
        .with_runtime(&node_id, |rt| {
            update_stall_state(&mut rt.stall, &node_id, &observation, threshold)
        })
        .await;

    if let Some(evidence) = evidence {
        handle
            .publish_all(vec![
                Event::RunPatch {
                    patch: RunPatch {
                        status: Some(RunStatus::Paused),
                        ..Default::default()
                    },
                },
                Event::RunStalled { evidence },
            ])
            .await?;
        publish_status(handle, &node_id, NodeStatus::Blocked, Some("stalled")).await?;
        return Ok(());
    }

    publish_status(handle, &node_id, NodeStatus::Idle, Some(&summary)).await?;

    // Think-again: an AUTO-mode orchestrator with an empty inbox re-runs
    // next tick.
    if run.mode == OrchestrationMode::Auto && node.role_template == ORCHESTRATOR_ROLE {
        let inbox_empty = handle
            .with_state(|p, _| p.queue_len(&node_id) == 0)
            .await;
        if inbox_empty {
            handle
                .with_runtime(&node_id, |rt| rt.auto_prompt_queued = true)
                .await;
        }
    }
    Ok(())
}

/// node.patch is authoritative; node.progress is the advisory twin with
/// the same payload.
async fn publish_status(
    handle: &Arc<RunHandle>,
    node_id: &str,
    status: NodeStatus,
    summary: Option<&str>,
) -> Result<(), crate::store::LogError> {
    handle
        .publish_all(vec![
            Event::NodePatch {
                node_id: node_id.to_string(),
                patch: NodePatch {
                    status: Some(status),
                    summary: summary.map(str::to_string),
                    ..Default::default()
                },
            },
            Event::NodeProgress {
                node_id: node_id.to_string(),
                status,
                summary: summary.map(str::to_string),
            },
        ])
        .await?;
    Ok(())
}
