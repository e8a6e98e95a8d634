//! End-to-end scenarios against a full engine with mock providers, driven
//! by manual scheduler ticks.

use std::sync::Arc;
use std::time::Duration;

use run_event::{
    ApprovalResolution, ArtifactKind, EnvelopePayload, Event, NodeCapabilities, NodePermissions,
    NodeStatus, PermissionsMode, ResponseExpectation, RunStatus, StallKind,
    ToolCall,
};
use serde_json::json;
use trellis::provider::{MockProviderFactory, MockTurn};
use trellis::store::RunProjection;
use trellis::{
    CreateNode, CreateRun, DeliverEnvelope, Engine, EngineSettings, PostMessage, RecordArtifact,
};

struct Harness {
    engine: Engine,
    factory: Arc<MockProviderFactory>,
    workspace: tempfile::TempDir,
    _data_dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let data_dir = tempfile::tempdir().expect("data dir");
    let workspace = tempfile::tempdir().expect("workspace");
    let settings = EngineSettings {
        data_dir: data_dir.path().to_path_buf(),
        tick_interval: Duration::from_millis(20),
        turn_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let factory = Arc::new(MockProviderFactory::new());
    let engine = Engine::with_factory(settings, Box::new(Arc::clone(&factory)));
    Harness {
        engine,
        factory,
        workspace,
        _data_dir: data_dir,
    }
}

impl Harness {
    async fn create_run(&self) -> String {
        self.engine
            .create_run(CreateRun {
                cwd: Some(self.workspace.path().to_string_lossy().into_owned()),
                ..Default::default()
            })
            .await
            .expect("create run")
            .id
    }

    async fn create_node(&self, run_id: &str, label: &str) -> String {
        self.create_node_with(run_id, label, |req| req).await
    }

    async fn create_node_with(
        &self,
        run_id: &str,
        label: &str,
        configure: impl FnOnce(CreateNode) -> CreateNode,
    ) -> String {
        let req = configure(CreateNode {
            label: label.to_string(),
            role_template: None,
            provider: Some("mock".to_string()),
            capabilities: None,
            permissions: None,
        });
        self.engine
            .create_node(run_id, req)
            .await
            .expect("create node")
            .id
    }

    async fn post(&self, run_id: &str, node_id: &str, content: &str) {
        self.engine
            .post_message(
                run_id,
                PostMessage {
                    node_id: Some(node_id.to_string()),
                    content: content.to_string(),
                    interrupt: false,
                },
            )
            .await
            .expect("post message");
    }

    /// Ticks until the predicate holds on the projection, or panics after
    /// the deadline.
    async fn wait_for(
        &self,
        run_id: &str,
        what: &str,
        predicate: impl Fn(&RunProjection) -> bool,
    ) -> RunProjection {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            self.engine.tick().await;
            let projection = self.engine.get_run(run_id).await.expect("get run");
            if predicate(&projection) {
                return projection;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn event_kinds(&self, run_id: &str) -> Vec<String> {
        self.engine
            .read_events(run_id)
            .await
            .expect("read events")
            .iter()
            .map(|e| e.event.kind().to_string())
            .collect()
    }
}

/// Asserts `needles` appear in order (not necessarily adjacent).
fn assert_subsequence(haystack: &[String], needles: &[&str]) {
    let mut iter = haystack.iter();
    for needle in needles {
        assert!(
            iter.any(|k| k == needle),
            "expected '{}' in order within {:?}",
            needle,
            haystack
        );
    }
}

// -- (a) hello world turn ----------------------------------------------------

#[tokio::test]
async fn hello_world_turn() {
    let h = harness();
    let run_id = h.create_run().await;
    let node_id = h.create_node(&run_id, "impl").await;
    h.factory.push_turn(
        &node_id,
        MockTurn {
            deltas: vec!["hel".to_string(), "lo".to_string()],
            content: "hello".to_string(),
            ..Default::default()
        },
    );
    h.post(&run_id, &node_id, "say hi").await;

    let projection = h
        .wait_for(&run_id, "node idle with summary", |p| {
            p.nodes[&node_id].status == NodeStatus::Idle && p.nodes[&node_id].summary == "hello"
        })
        .await;
    assert_eq!(projection.nodes[&node_id].inbox_count, 0);

    let kinds = h.event_kinds(&run_id).await;
    assert_subsequence(
        &kinds,
        &[
            "run.patch",
            "run.mode",
            "node.patch",
            "message.user",
            "node.progress",
            "message.assistant.delta",
            "message.assistant.delta",
            "message.assistant.final",
            "node.progress",
        ],
    );
}

// -- (b) gated tool with approval --------------------------------------------

#[tokio::test]
async fn gated_tool_approval_roundtrip() {
    let h = harness();
    let run_id = h.create_run().await;
    let node_id = h
        .create_node_with(&run_id, "impl", |mut req| {
            req.capabilities = Some(NodeCapabilities {
                write_code: true,
                ..Default::default()
            });
            req.permissions = Some(NodePermissions {
                permissions_mode: PermissionsMode::Gated,
                agent_management_requires_approval: false,
            });
            req
        })
        .await;
    h.factory.push_turn(
        &node_id,
        MockTurn::text("writing the file").with_tool_calls(vec![ToolCall {
            id: "call-1".to_string(),
            name: "write_file".to_string(),
            args: json!({"path": "x.txt", "content": "y"}),
            provider_handled: false,
        }]),
    );
    h.post(&run_id, &node_id, "write x.txt").await;

    let projection = h
        .wait_for(&run_id, "node blocked on approval", |p| {
            p.nodes[&node_id].status == NodeStatus::Blocked
        })
        .await;
    assert_eq!(projection.approvals.len(), 1);
    let approval = h.engine.list_approvals(&run_id).await.expect("approvals");
    assert_eq!(approval[0].id, "call-1");
    assert_eq!(approval[0].tool.name, "write_file");
    assert!(!h.workspace.path().join("x.txt").exists());

    h.engine
        .resolve_approval("call-1", ApprovalResolution::Approved)
        .await
        .expect("resolve");

    // The node flips idle at resolution time; the completed summary marks
    // the resumed queue actually finishing.
    h.wait_for(&run_id, "turn resumed and completed", |p| {
        p.nodes[&node_id].status == NodeStatus::Idle
            && p.nodes[&node_id].summary == "writing the file"
            && p.approvals.is_empty()
    })
    .await;

    assert_eq!(
        std::fs::read_to_string(h.workspace.path().join("x.txt")).expect("x.txt"),
        "y"
    );
    let kinds = h.event_kinds(&run_id).await;
    assert_subsequence(
        &kinds,
        &[
            "tool.proposed",
            "approval.requested",
            "approval.resolved",
            "tool.started",
            "tool.completed",
        ],
    );
}

#[tokio::test]
async fn double_resolution_is_single_shot() {
    let h = harness();
    let run_id = h.create_run().await;
    let node_id = h
        .create_node_with(&run_id, "impl", |mut req| {
            req.capabilities = Some(NodeCapabilities {
                write_code: true,
                ..Default::default()
            });
            req.permissions = Some(NodePermissions {
                permissions_mode: PermissionsMode::Gated,
                agent_management_requires_approval: false,
            });
            req
        })
        .await;
    h.factory.push_turn(
        &node_id,
        MockTurn::text("ok").with_tool_calls(vec![ToolCall {
            id: "only".to_string(),
            name: "write_file".to_string(),
            args: json!({"path": "a.txt", "content": "a"}),
            provider_handled: false,
        }]),
    );
    h.post(&run_id, &node_id, "go").await;
    h.wait_for(&run_id, "blocked", |p| {
        p.nodes[&node_id].status == NodeStatus::Blocked
    })
    .await;

    h.engine
        .resolve_approval("only", ApprovalResolution::Approved)
        .await
        .expect("first resolve");
    h.engine
        .resolve_approval("only", ApprovalResolution::Approved)
        .await
        .expect("second resolve is a warn-noop");

    h.wait_for(&run_id, "idle", |p| {
        p.nodes[&node_id].status == NodeStatus::Idle
    })
    .await;
    let kinds = h.event_kinds(&run_id).await;
    assert_eq!(
        kinds.iter().filter(|k| *k == "approval.resolved").count(),
        1
    );
}

#[tokio::test]
async fn denied_approval_stops_queue_and_reports_error() {
    let h = harness();
    let run_id = h.create_run().await;
    let node_id = h
        .create_node_with(&run_id, "impl", |mut req| {
            req.capabilities = Some(NodeCapabilities {
                write_code: true,
                ..Default::default()
            });
            req.permissions = Some(NodePermissions {
                permissions_mode: PermissionsMode::Gated,
                agent_management_requires_approval: false,
            });
            req
        })
        .await;
    h.factory.push_turn(
        &node_id,
        MockTurn::text("two writes").with_tool_calls(vec![
            ToolCall {
                id: "first".to_string(),
                name: "write_file".to_string(),
                args: json!({"path": "one.txt", "content": "1"}),
                provider_handled: false,
            },
            ToolCall {
                id: "second".to_string(),
                name: "write_file".to_string(),
                args: json!({"path": "two.txt", "content": "2"}),
                provider_handled: false,
            },
        ]),
    );
    h.post(&run_id, &node_id, "go").await;
    h.wait_for(&run_id, "blocked", |p| {
        p.nodes[&node_id].status == NodeStatus::Blocked
    })
    .await;
    h.engine
        .resolve_approval("first", ApprovalResolution::Denied)
        .await
        .expect("deny");
    let projection = h
        .wait_for(&run_id, "completed after denial", |p| {
            p.nodes[&node_id].status == NodeStatus::Idle
                && p.nodes[&node_id].summary == "two writes"
        })
        .await;
    // The denial stopped the queue: neither file exists, and the second
    // call never requested approval.
    assert!(!h.workspace.path().join("one.txt").exists());
    assert!(!h.workspace.path().join("two.txt").exists());
    assert!(projection.approvals.is_empty());
    let events = h.engine.read_events(&run_id).await.expect("events");
    let denials: Vec<_> = events
        .iter()
        .filter(|e| {
            matches!(
                &e.event,
                Event::ToolCompleted { call_id, ok: false, error: Some(err), .. }
                    if call_id == "first" && err.contains("denied by operator")
            )
        })
        .collect();
    assert_eq!(denials.len(), 1);
    // The second call was dropped with the queue: no started event for it.
    assert!(!events.iter().any(|e| matches!(
        &e.event,
        Event::ToolStarted { call_id, .. } if call_id == "second"
    )));
}

// -- (c) stall ----------------------------------------------------------------

#[tokio::test]
async fn three_identical_turns_stall_the_run() {
    let h = harness();
    let run_id = h.create_run().await;
    let node_id = h.create_node(&run_id, "loops").await;
    h.factory.set_fallback(MockTurn::text("same response"));

    for i in 0..3 {
        h.post(&run_id, &node_id, "again").await;
        if i < 2 {
            h.wait_for(&run_id, "turn completed", |p| {
                p.nodes[&node_id].status == NodeStatus::Idle && p.queue_len(&node_id) == 0
            })
            .await;
        }
    }

    let projection = h
        .wait_for(&run_id, "stall pause", |p| {
            p.run.status == RunStatus::Paused
        })
        .await;
    assert_eq!(projection.nodes[&node_id].status, NodeStatus::Blocked);
    assert_eq!(projection.nodes[&node_id].summary, "stalled");

    let events = h.engine.read_events(&run_id).await.expect("events");
    let stalls: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.event {
            Event::RunStalled { evidence } => Some(evidence.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(stalls.len(), 1);
    assert_eq!(stalls[0].kind, StallKind::OutputRepeat);
    assert_eq!(stalls[0].count, 3);
    assert_eq!(stalls[0].node_id, node_id);
}

#[tokio::test]
async fn stalled_run_resumes_after_user_direction() {
    let h = harness();
    let run_id = h.create_run().await;
    let node_id = h.create_node(&run_id, "loops").await;
    h.factory.set_fallback(MockTurn::text("stuck"));
    for _ in 0..3 {
        h.post(&run_id, &node_id, "again").await;
        h.wait_for(&run_id, "turn or stall", |p| {
            p.run.status == RunStatus::Paused
                || (p.nodes[&node_id].status == NodeStatus::Idle && p.queue_len(&node_id) == 0)
        })
        .await;
    }
    h.wait_for(&run_id, "stall", |p| p.run.status == RunStatus::Paused)
        .await;

    // New direction plus an explicit resume clears the stall.
    h.factory
        .push_turn(&node_id, MockTurn::text("new direction taken"));
    h.post(&run_id, &node_id, "try a different approach").await;
    h.engine
        .update_run(
            &run_id,
            trellis::UpdateRun {
                status: Some(RunStatus::Running),
                ..Default::default()
            },
        )
        .await
        .expect("resume");

    let projection = h
        .wait_for(&run_id, "recovered", |p| {
            p.nodes[&node_id].status == NodeStatus::Idle
                && p.nodes[&node_id].summary == "new direction taken"
        })
        .await;
    assert_eq!(projection.run.status, RunStatus::Running);
}

// -- (d) handoff between nodes ------------------------------------------------

#[tokio::test]
async fn handoff_routes_to_target_inbox_and_next_turn() {
    let h = harness();
    let run_id = h.create_run().await;
    let a = h
        .create_node_with(&run_id, "planner", |mut req| {
            req.role_template = Some("orchestrator".to_string());
            req
        })
        .await;
    let b = h.create_node(&run_id, "builder").await;
    h.engine
        .create_edge(
            &run_id,
            trellis::CreateEdge {
                from: a.clone(),
                to: b.clone(),
                bidirectional: false,
                edge_type: None,
                label: None,
            },
        )
        .await
        .expect("edge");

    h.factory.push_turn(
        &a,
        MockTurn::text("delegating").with_tool_calls(vec![ToolCall {
            id: "h1".to_string(),
            name: "send_handoff".to_string(),
            args: json!({
                "to": b,
                "message": "do X",
                "response": {"expectation": "required"}
            }),
            provider_handled: false,
        }]),
    );
    h.factory.push_turn(&b, MockTurn::text("done with X"));
    h.post(&run_id, &a, "delegate the work").await;

    let projection = h
        .wait_for(&run_id, "handoff delivered", |p| {
            p.nodes[&b].inbox_count == 1 && p.nodes[&a].status == NodeStatus::Idle
        })
        .await;
    assert_eq!(projection.queues[&b].envelopes[0].payload.message, "do X");
    assert_eq!(
        projection.queues[&b].envelopes[0]
            .payload
            .response
            .as_ref()
            .map(|r| r.expectation),
        Some(ResponseExpectation::Required)
    );

    // B's next runnable tick consumes the envelope.
    h.wait_for(&run_id, "B consumed handoff", |p| {
        p.nodes[&b].status == NodeStatus::Idle
            && p.nodes[&b].summary == "done with X"
            && p.nodes[&b].inbox_count == 0
    })
    .await;

    let kinds = h.event_kinds(&run_id).await;
    assert_subsequence(&kinds, &["tool.completed", "handoff.sent"]);
}

// -- (e) delete cascade --------------------------------------------------------

#[tokio::test]
async fn delete_node_cascades_everywhere() {
    let h = harness();
    let run_id = h.create_run().await;
    let a = h.create_node(&run_id, "a").await;
    let b = h.create_node(&run_id, "b").await;
    let c = h.create_node(&run_id, "c").await;
    for (from, to) in [(&a, &b), (&b, &c)] {
        h.engine
            .create_edge(
                &run_id,
                trellis::CreateEdge {
                    from: from.clone(),
                    to: to.clone(),
                    bidirectional: false,
                    edge_type: None,
                    label: None,
                },
            )
            .await
            .expect("edge");
    }
    for name in ["one.diff", "two.diff"] {
        h.engine
            .record_artifact(
                &run_id,
                RecordArtifact {
                    node_id: b.clone(),
                    kind: ArtifactKind::Diff,
                    name: name.to_string(),
                    content: "diff".to_string(),
                    metadata: None,
                },
            )
            .await
            .expect("artifact");
    }

    h.engine.delete_node(&run_id, &b).await.expect("delete");

    let projection = h.engine.get_run(&run_id).await.expect("get");
    assert!(!projection.nodes.contains_key(&b));
    assert!(projection.edges.is_empty());
    assert!(projection.artifacts.is_empty());
    assert!(projection.queues.get(&b).is_none());
    let serialized = serde_json::to_string(&projection).expect("serialize");
    assert!(!serialized.contains(&b), "no references to the deleted node");

    let kinds = h.event_kinds(&run_id).await;
    assert_subsequence(&kinds, &["node.deleted", "edge.deleted", "edge.deleted"]);
}

// -- (f) restart replay --------------------------------------------------------

#[tokio::test]
async fn cold_start_replay_restores_inboxes() {
    let data_dir = tempfile::tempdir().expect("data dir");
    let settings = EngineSettings {
        data_dir: data_dir.path().to_path_buf(),
        ..Default::default()
    };
    let (run_id, b) = {
        let engine = Engine::new(settings.clone());
        let run = engine
            .create_run(CreateRun::default())
            .await
            .expect("run");
        let a = engine
            .create_node(
                &run.id,
                CreateNode {
                    label: "a".to_string(),
                    role_template: None,
                    provider: Some("mock".to_string()),
                    capabilities: None,
                    permissions: None,
                },
            )
            .await
            .expect("node a");
        let b = engine
            .create_node(
                &run.id,
                CreateNode {
                    label: "b".to_string(),
                    role_template: None,
                    provider: Some("mock".to_string()),
                    capabilities: None,
                    permissions: None,
                },
            )
            .await
            .expect("node b");
        engine
            .deliver_envelope(
                &run.id,
                DeliverEnvelope {
                    from: a.id.clone(),
                    to: b.id.clone(),
                    payload: EnvelopePayload {
                        message: "do X".to_string(),
                        ..Default::default()
                    },
                },
            )
            .await
            .expect("deliver");
        (run.id, b.id)
    };

    // Cold start with the snapshot deleted: replay only.
    std::fs::remove_file(
        data_dir
            .path()
            .join("runs")
            .join(&run_id)
            .join("run.json"),
    )
    .expect("drop snapshot");

    let engine = Engine::new(settings);
    assert_eq!(engine.open_existing(), 1);
    let projection = engine.get_run(&run_id).await.expect("get");
    assert_eq!(projection.nodes[&b].inbox_count, 1);
    assert_eq!(projection.queues[&b].envelopes[0].payload.message, "do X");
    assert!(projection
        .nodes
        .values()
        .all(|n| n.status == NodeStatus::Idle));
}

// -- boundary properties -------------------------------------------------------

#[tokio::test]
async fn empty_final_message_completes_with_completed_summary() {
    let h = harness();
    let run_id = h.create_run().await;
    let node_id = h.create_node(&run_id, "quiet").await;
    h.factory.push_turn(
        &node_id,
        MockTurn {
            content: String::new(),
            ..Default::default()
        },
    );
    h.post(&run_id, &node_id, "anything").await;
    let projection = h
        .wait_for(&run_id, "idle", |p| {
            p.nodes[&node_id].status == NodeStatus::Idle && !p.nodes[&node_id].summary.is_empty()
        })
        .await;
    assert_eq!(projection.nodes[&node_id].summary, "completed");
}

#[tokio::test]
async fn paused_run_schedules_no_turns() {
    let h = harness();
    let run_id = h.create_run().await;
    let node_id = h.create_node(&run_id, "idle").await;
    h.engine
        .update_run(
            &run_id,
            trellis::UpdateRun {
                status: Some(RunStatus::Paused),
                ..Default::default()
            },
        )
        .await
        .expect("pause");
    h.post(&run_id, &node_id, "should wait").await;

    for _ in 0..5 {
        h.engine.tick().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let projection = h.engine.get_run(&run_id).await.expect("get");
    assert_eq!(projection.nodes[&node_id].status, NodeStatus::Idle);
    assert_eq!(projection.nodes[&node_id].inbox_count, 1);

    // Resume: the queued message is consumed.
    h.engine
        .update_run(
            &run_id,
            trellis::UpdateRun {
                status: Some(RunStatus::Running),
                ..Default::default()
            },
        )
        .await
        .expect("resume");
    h.wait_for(&run_id, "message consumed after resume", |p| {
        p.nodes[&node_id].inbox_count == 0 && p.nodes[&node_id].status == NodeStatus::Idle
    })
    .await;
}

#[tokio::test]
async fn auto_orchestrator_thinks_again_until_stalled() {
    let h = harness();
    let run_id = h
        .engine
        .create_run(CreateRun {
            mode: Some(run_event::OrchestrationMode::Auto),
            cwd: Some(h.workspace.path().to_string_lossy().into_owned()),
            ..Default::default()
        })
        .await
        .expect("run")
        .id;
    let node_id = h
        .create_node_with(&run_id, "orch", |mut req| {
            req.role_template = Some("orchestrator".to_string());
            req
        })
        .await;
    h.factory.set_fallback(MockTurn::text("nothing new to do"));
    h.post(&run_id, &node_id, "coordinate").await;

    // One user message; the orchestrator self-continues until the
    // repeated output pauses the run.
    let projection = h
        .wait_for(&run_id, "auto loop stalls", |p| {
            p.run.status == RunStatus::Paused
        })
        .await;
    assert_eq!(projection.nodes[&node_id].summary, "stalled");

    let events = h.engine.read_events(&run_id).await.expect("events");
    let finals = events
        .iter()
        .filter(|e| matches!(&e.event, Event::AssistantFinal { .. }))
        .count();
    assert_eq!(finals, 3, "three identical turns before the stall");
    let user_messages = events
        .iter()
        .filter(|e| matches!(&e.event, Event::MessageUser { .. }))
        .count();
    assert_eq!(user_messages, 1, "self-continuation is not a user message");
}

#[tokio::test]
async fn interactive_node_does_not_self_continue() {
    let h = harness();
    let run_id = h.create_run().await;
    let node_id = h.create_node(&run_id, "impl").await;
    h.factory.push_turn(&node_id, MockTurn::text("done"));
    h.post(&run_id, &node_id, "one task").await;
    h.wait_for(&run_id, "turn done", |p| {
        p.nodes[&node_id].status == NodeStatus::Idle && p.nodes[&node_id].summary == "done"
    })
    .await;

    for _ in 0..5 {
        h.engine.tick().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let events = h.engine.read_events(&run_id).await.expect("events");
    let finals = events
        .iter()
        .filter(|e| matches!(&e.event, Event::AssistantFinal { .. }))
        .count();
    assert_eq!(finals, 1);
}

#[tokio::test]
async fn stopped_run_closes_and_schedules_nothing() {
    let h = harness();
    let run_id = h.create_run().await;
    let node_id = h.create_node(&run_id, "n").await;
    h.factory.push_turn(&node_id, MockTurn::text("first"));
    h.post(&run_id, &node_id, "go").await;
    h.wait_for(&run_id, "first turn", |p| {
        p.nodes[&node_id].summary == "first"
    })
    .await;

    h.engine
        .update_run(
            &run_id,
            trellis::UpdateRun {
                status: Some(RunStatus::Stopped),
                ..Default::default()
            },
        )
        .await
        .expect("stop");
    h.post(&run_id, &node_id, "after stop").await;
    for _ in 0..5 {
        h.engine.tick().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let projection = h.engine.get_run(&run_id).await.expect("get");
    assert_eq!(projection.run.status, RunStatus::Stopped);
    assert_eq!(projection.nodes[&node_id].inbox_count, 1);
}

#[tokio::test]
async fn awaiting_response_marker_clears_on_reply() {
    let h = harness();
    let run_id = h.create_run().await;
    let a = h.create_node(&run_id, "sender").await;
    let b = h.create_node(&run_id, "worker").await;

    h.factory.push_turn(
        &a,
        MockTurn::text("asked").with_tool_calls(vec![ToolCall {
            id: "ask".to_string(),
            name: "send_handoff".to_string(),
            args: json!({
                "to": b,
                "message": "need this back",
                "response": {"expectation": "required"}
            }),
            provider_handled: false,
        }]),
    );
    // B reports back with a status payload.
    h.factory.push_turn(
        &b,
        MockTurn::text("replying").with_tool_calls(vec![ToolCall {
            id: "reply".to_string(),
            name: "send_handoff".to_string(),
            args: json!({
                "to": a,
                "message": "here you go",
                "status": {"ok": true}
            }),
            provider_handled: false,
        }]),
    );
    h.factory.push_turn(&a, MockTurn::text("received"));

    h.post(&run_id, &a, "delegate").await;
    h.wait_for(&run_id, "A received the reply", |p| {
        p.nodes[&a].summary == "received"
    })
    .await;

    let events = h.engine.read_events(&run_id).await.expect("events");
    // The report flows back as handoff.reported because of its status
    // payload.
    assert!(events
        .iter()
        .any(|e| e.event.kind() == "handoff.reported"));
}

#[tokio::test]
async fn inbox_count_matches_queue_lengths_every_step() {
    let h = harness();
    let run_id = h.create_run().await;
    let node_id = h.create_node(&run_id, "n").await;
    for content in ["one", "two", "three"] {
        h.post(&run_id, &node_id, content).await;
        let projection = h.engine.get_run(&run_id).await.expect("get");
        assert_eq!(
            projection.nodes[&node_id].inbox_count as usize,
            projection.queue_len(&node_id)
        );
    }
    h.wait_for(&run_id, "drained", |p| p.queue_len(&node_id) == 0)
        .await;
    let projection = h.engine.get_run(&run_id).await.expect("get");
    assert_eq!(projection.nodes[&node_id].inbox_count, 0);
}
