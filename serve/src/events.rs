//! WebSocket event tail: replay the run's log, then forward the live
//! stream. One JSON envelope per text message.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use tokio::sync::broadcast::error::RecvError;

use super::app::AppState;
use super::error::ApiError;

pub async fn events_ws(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    // Subscribe before replay so nothing published in between is lost.
    let rx = state.engine.subscribe(&run_id).await?;
    let log = state.engine.read_events(&run_id).await?;
    Ok(ws.on_upgrade(move |socket| stream_events(socket, log, rx)))
}

async fn stream_events(
    mut socket: WebSocket,
    log: Vec<run_event::EventEnvelope>,
    mut rx: tokio::sync::broadcast::Receiver<run_event::EventEnvelope>,
) {
    let mut sent: HashSet<String> = HashSet::with_capacity(log.len());
    for envelope in &log {
        sent.insert(envelope.id.clone());
        if send_envelope(&mut socket, envelope).await.is_err() {
            return;
        }
    }
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                // Drop events that raced into the replayed log; each id can
                // arrive at most once more, so the set only shrinks here.
                if sent.remove(&envelope.id) {
                    continue;
                }
                if send_envelope(&mut socket, &envelope).await.is_err() {
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event subscriber lagged");
            }
            Err(RecvError::Closed) => {
                let _ = socket.close().await;
                return;
            }
        }
    }
}

async fn send_envelope(
    socket: &mut WebSocket,
    envelope: &run_event::EventEnvelope,
) -> Result<(), axum::Error> {
    let json = match envelope.to_json_line() {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "event encode failed, skipping");
            return Ok(());
        }
    };
    socket.send(Message::Text(json)).await
}
