//! Provider spec resolution: provider name → transport, wire protocol,
//! command line, statefulness.
//!
//! Names accepted:
//! - `mock`: in-process mock adapter (tests, demos).
//! - `api:<url>`: HTTP chat API; stateless, full prompt every turn.
//! - `<command and args>`: CLI subprocess speaking line-delimited JSON.
//!   Optional protocol prefix: `raw:` (plain text lines) or
//!   `stream-json:` (JSON lines with in-message fenced tool calls).

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Cli,
    Api,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireProtocol {
    Jsonl,
    Raw,
    StreamJson,
}

/// Resolved provider description for one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    pub name: String,
    pub transport: Transport,
    pub protocol: WireProtocol,
    /// Executable for CLI transports; `None` selects the mock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Endpoint for API transports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Whether the provider keeps conversation state across sends, making
    /// delta prompts possible.
    pub stateful: bool,
}

impl ProviderSpec {
    pub fn resolve(name: &str) -> ProviderSpec {
        if name == "mock" {
            return ProviderSpec {
                name: name.to_string(),
                transport: Transport::Cli,
                protocol: WireProtocol::Jsonl,
                command: None,
                args: Vec::new(),
                url: None,
                stateful: true,
            };
        }
        if let Some(url) = name.strip_prefix("api:") {
            return ProviderSpec {
                name: name.to_string(),
                transport: Transport::Api,
                protocol: WireProtocol::Jsonl,
                command: None,
                args: Vec::new(),
                url: Some(url.to_string()),
                stateful: false,
            };
        }
        let (protocol, rest) = if let Some(rest) = name.strip_prefix("raw:") {
            (WireProtocol::Raw, rest)
        } else if let Some(rest) = name.strip_prefix("stream-json:") {
            (WireProtocol::StreamJson, rest)
        } else {
            (WireProtocol::Jsonl, name)
        };
        let mut parts = rest.split_whitespace().map(str::to_string);
        let command = parts.next();
        ProviderSpec {
            name: name.to_string(),
            transport: Transport::Cli,
            protocol,
            command,
            args: parts.collect(),
            url: None,
            stateful: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_resolves_to_commandless_cli() {
        let spec = ProviderSpec::resolve("mock");
        assert_eq!(spec.transport, Transport::Cli);
        assert!(spec.command.is_none());
        assert!(spec.stateful);
    }

    #[test]
    fn api_prefix_resolves_stateless_http() {
        let spec = ProviderSpec::resolve("api:http://127.0.0.1:9000/chat");
        assert_eq!(spec.transport, Transport::Api);
        assert_eq!(spec.url.as_deref(), Some("http://127.0.0.1:9000/chat"));
        assert!(!spec.stateful);
    }

    #[test]
    fn command_line_splits_into_command_and_args() {
        let spec = ProviderSpec::resolve("agent --session persist");
        assert_eq!(spec.command.as_deref(), Some("agent"));
        assert_eq!(spec.args, vec!["--session", "persist"]);
        assert_eq!(spec.protocol, WireProtocol::Jsonl);
    }

    #[test]
    fn protocol_prefixes_are_stripped() {
        let raw = ProviderSpec::resolve("raw:cat");
        assert_eq!(raw.protocol, WireProtocol::Raw);
        assert_eq!(raw.command.as_deref(), Some("cat"));

        let sj = ProviderSpec::resolve("stream-json:agent --verbose");
        assert_eq!(sj.protocol, WireProtocol::StreamJson);
        assert_eq!(sj.command.as_deref(), Some("agent"));
        assert_eq!(sj.args, vec!["--verbose"]);
    }
}
