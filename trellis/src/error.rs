//! Engine-level error type. Errors from the runner never cross the
//! scheduler boundary; everything else surfaces through [`EngineError`].

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("edge not found: {0}")]
    EdgeNotFound(String),

    #[error("event log: {0}")]
    Log(#[from] crate::store::LogError),

    #[error("provider: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}
