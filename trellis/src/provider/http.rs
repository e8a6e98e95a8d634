//! HTTP chat provider adapter: stateless request/response against a chat
//! endpoint. Every turn posts the full prompt; the reply arrives as one
//! final message (no streaming).

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use run_event::{ApprovalResolution, TokenUsage};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::spec::ProviderSpec;
use super::{AdapterEvent, AdapterSink, ProviderAdapter, ProviderError, TurnRequest};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    turn_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

pub struct HttpAdapter {
    spec: ProviderSpec,
    client: reqwest::Client,
    sink: AdapterSink,
    session_id: Arc<StdMutex<Option<String>>>,
    inflight: Mutex<Option<JoinHandle<()>>>,
}

impl HttpAdapter {
    pub fn new(spec: ProviderSpec, sink: AdapterSink) -> Self {
        Self {
            spec,
            client: reqwest::Client::new(),
            sink,
            session_id: Arc::new(StdMutex::new(None)),
            inflight: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    async fn start(&self) -> Result<(), ProviderError> {
        if self.spec.url.is_none() {
            return Err(ProviderError::Other(
                "api provider without endpoint url".to_string(),
            ));
        }
        Ok(())
    }

    async fn send(&self, turn: TurnRequest) -> Result<(), ProviderError> {
        let url = self
            .spec
            .url
            .clone()
            .ok_or_else(|| ProviderError::Other("api provider without endpoint url".to_string()))?;
        let client = self.client.clone();
        let sink = self.sink.clone();
        let session = Arc::clone(&self.session_id);
        let handle = tokio::spawn(async move {
            let session_id = session.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let request = ChatRequest {
                prompt: &turn.prompt,
                session_id,
                turn_id: &turn.turn_id,
            };
            let response = client.post(&url).json(&request).send().await;
            let response = match response.and_then(|r| r.error_for_status()) {
                Ok(r) => r,
                Err(e) => {
                    sink.emit(AdapterEvent::Error(format!("chat request: {}", e)));
                    return;
                }
            };
            let chat: ChatResponse = match response.json().await {
                Ok(c) => c,
                Err(e) => {
                    sink.emit(AdapterEvent::Error(format!("chat response: {}", e)));
                    return;
                }
            };
            if let Some(session_id) = chat.session_id {
                *session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session_id.clone());
                sink.emit(AdapterEvent::SessionId(session_id));
            }
            if let Some(usage) = chat.usage {
                sink.emit(AdapterEvent::Usage(usage));
            }
            sink.emit(AdapterEvent::AssistantFinal {
                content: chat.content,
                tool_calls: Vec::new(),
            });
        });
        *self.inflight.lock().await = Some(handle);
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), ProviderError> {
        if let Some(handle) = self.inflight.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn resolve_approval(
        &self,
        _approval_id: &str,
        _resolution: &ApprovalResolution,
    ) -> Result<(), ProviderError> {
        // The chat API has no approval surface; gating happens entirely in
        // the engine's tool queue.
        Ok(())
    }

    async fn reset_session(&self) -> Result<(), ProviderError> {
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        if let Some(handle) = self.inflight.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::spec::ProviderSpec;

    #[test]
    fn chat_request_wire_shape() {
        let request = ChatRequest {
            prompt: "hello",
            session_id: Some("s1".to_string()),
            turn_id: "t1",
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"sessionId\":\"s1\""));
        assert!(json.contains("\"turnId\":\"t1\""));
    }

    #[test]
    fn chat_response_tolerates_minimal_body() {
        let chat: ChatResponse = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert_eq!(chat.content, "hi");
        assert!(chat.session_id.is_none());
        assert!(chat.usage.is_none());
    }

    #[tokio::test]
    async fn start_without_url_fails() {
        let (sink, _rx) = AdapterSink::channel();
        let mut spec = ProviderSpec::resolve("api:http://x");
        spec.url = None;
        let adapter = HttpAdapter::new(spec, sink);
        assert!(adapter.start().await.is_err());
    }
}
