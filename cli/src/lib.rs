//! Client helpers for the `trellis` binary: a thin HTTP client over the
//! control plane plus a WebSocket event tail.

use futures_util::StreamExt;
use run_event::{EventEnvelope, NodeState, RunState, UserMessage};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
}

/// HTTP client for one control-plane server.
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, ClientError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_string))
                .unwrap_or_else(|| status.to_string());
            return Err(ClientError::Server {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn create_run(&self, cwd: Option<&str>) -> Result<RunState, ClientError> {
        let mut body = json!({});
        if let Some(cwd) = cwd {
            body["cwd"] = json!(cwd);
        }
        self.post("/runs", body).await
    }

    pub async fn create_node(
        &self,
        run_id: &str,
        label: &str,
        role_template: &str,
        provider: &str,
    ) -> Result<NodeState, ClientError> {
        self.post(
            &format!("/runs/{}/nodes", run_id),
            json!({
                "label": label,
                "roleTemplate": role_template,
                "provider": provider,
            }),
        )
        .await
    }

    pub async fn post_message(
        &self,
        run_id: &str,
        node_id: &str,
        content: &str,
    ) -> Result<UserMessage, ClientError> {
        self.post(
            &format!("/runs/{}/messages", run_id),
            json!({ "nodeId": node_id, "content": content }),
        )
        .await
    }

    /// ws:// URL for a run's event tail.
    pub fn events_url(&self, run_id: &str) -> String {
        let ws_base = self
            .base_url
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);
        format!("{}/runs/{}/events", ws_base, run_id)
    }

    /// Tails a run's events, invoking `on_event` per envelope, until the
    /// callback returns `false` or the stream closes.
    pub async fn tail_events(
        &self,
        run_id: &str,
        mut on_event: impl FnMut(EventEnvelope) -> bool,
    ) -> Result<(), ClientError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.events_url(run_id)).await?;
        while let Some(frame) = ws.next().await {
            let frame = frame?;
            if !frame.is_text() {
                continue;
            }
            let envelope = EventEnvelope::from_json_line(frame.to_text().unwrap_or_default())?;
            if !on_event(envelope) {
                break;
            }
        }
        Ok(())
    }
}
