use std::time::Duration;

use crate::model::ProviderId;

/// Terminal stream failure. Produced by vendor adapters, normalized into
/// `StreamEvent::Error` by the stream queue, and carried unchanged to the
/// caller when a turn cannot recover.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum StreamError {
    /// Provider returned an application-level failure (HTTP status, auth, etc.).
    #[error("provider failure ({provider}): {message}")]
    Provider {
        provider: String,
        message: String,
        status_code: Option<u16>,
    },
    /// Network/stream transport failed.
    #[error("transport failure ({provider}): {message}")]
    Transport { provider: String, message: String },
    /// Event sequencing or an engine invariant was violated.
    #[error("protocol failure: {message}")]
    Protocol { message: String },
    /// No event arrived within the configured inactivity window.
    #[error("no stream activity for {waited_ms} ms")]
    Timeout { waited_ms: u64 },
    /// The turn was cancelled by the caller.
    #[error("stream cancelled")]
    Cancelled,
    /// A sequence was pushed into a queue that was already closed.
    #[error("stream queue already closed")]
    QueueClosed,
}

impl StreamError {
    /// Creates a provider-level failure.
    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
        }
    }

    /// Creates a transport-level failure.
    pub fn transport(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates a protocol/invariant failure.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an inactivity-timeout failure for the given window.
    pub fn timeout(waited: Duration) -> Self {
        Self::Timeout {
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Returns the HTTP status code when the failure carries one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Provider { status_code, .. } => *status_code,
            _ => None,
        }
    }

    /// Returns true for caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Top-level error type for the public orchestrator API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    /// Invalid orchestrator/adapter configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid user input to the builder API.
    #[error("validation error: {0}")]
    Validation(String),
    /// Requested provider is not registered in the orchestrator.
    #[error("provider not found: {provider}")]
    ProviderNotFound { provider: ProviderId },
    /// Terminal failure surfaced from a started turn.
    #[error(transparent)]
    TurnFailed(StreamError),
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl OrchestratorError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<StreamError> for OrchestratorError {
    fn from(value: StreamError) -> Self {
        OrchestratorError::TurnFailed(value)
    }
}
