//! Drives a full turn through the CLI subprocess adapter against a real
//! shell script speaking the line-delimited JSON protocol.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use run_event::{Event, NodeStatus, SessionDescriptor};
use trellis::{CreateNode, CreateRun, Engine, EngineSettings, PostMessage};

const FAKE_AGENT: &str = r#"#!/bin/sh
echo '{"type":"session","session_id":"sh-session-1"}'
while read -r line; do
  case "$line" in
    *'"type":"close"'*)
      exit 0
      ;;
    *'"type":"prompt"'*)
      echo '{"type":"delta","text":"working… "}'
      echo '{"type":"usage","input_tokens":12,"output_tokens":4}'
      echo '{"type":"final","text":"script reply"}'
      ;;
  esac
done
"#;

#[tokio::test]
async fn full_turn_through_a_subprocess_provider() {
    let data_dir = tempfile::tempdir().expect("data dir");
    let workspace = tempfile::tempdir().expect("workspace");
    let script = workspace.path().join("fake-agent.sh");
    std::fs::write(&script, FAKE_AGENT).expect("write script");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");

    let settings = EngineSettings {
        data_dir: data_dir.path().to_path_buf(),
        turn_timeout: Duration::from_secs(10),
        ..Default::default()
    };
    let engine = Engine::new(settings);
    let run = engine
        .create_run(CreateRun {
            cwd: Some(workspace.path().to_string_lossy().into_owned()),
            ..Default::default()
        })
        .await
        .expect("run");
    let node = engine
        .create_node(
            &run.id,
            CreateNode {
                label: "shell".to_string(),
                role_template: None,
                provider: Some("./fake-agent.sh".to_string()),
                capabilities: None,
                permissions: None,
            },
        )
        .await
        .expect("node");

    engine
        .post_message(
            &run.id,
            PostMessage {
                node_id: Some(node.id.clone()),
                content: "do the thing".to_string(),
                interrupt: false,
            },
        )
        .await
        .expect("post");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let projection = loop {
        engine.tick().await;
        let p = engine.get_run(&run.id).await.expect("get");
        if p.nodes[&node.id].status == NodeStatus::Idle
            && p.nodes[&node.id].summary == "script reply"
        {
            break p;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "subprocess turn never completed; node: {:?}",
            p.nodes[&node.id]
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    // Session id announced on stdout landed in the node state, and the
    // usage record accumulated into node and run totals.
    assert_eq!(
        projection.nodes[&node.id].session,
        SessionDescriptor {
            session_id: Some("sh-session-1".to_string()),
            reset_commands: Vec::new(),
        }
    );
    assert_eq!(projection.nodes[&node.id].usage.input_tokens, 12);
    assert_eq!(projection.run.usage.output_tokens, 4);

    let events = engine.read_events(&run.id).await.expect("events");
    assert!(events.iter().any(|e| matches!(
        &e.event,
        Event::AssistantDelta { delta, .. } if delta == "working… "
    )));
    assert!(events.iter().any(|e| matches!(
        &e.event,
        Event::AssistantFinal { content, .. } if content == "script reply"
    )));

    engine.shutdown().await;
}
