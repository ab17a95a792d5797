//! Error types for the Codeward domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`Error`] folds them together.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all Codeward operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Extension errors ---
    #[error("Extension error: {0}")]
    Extension(#[from] ExtensionError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Control flow ---
    #[error("Run cancelled")]
    Cancelled,

    #[error("Session {0} already has a run in progress")]
    SessionBusy(String),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Cancellation is an expected outcome, not a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Error::Cancelled)
    }

    /// Short machine-readable kind used in events and envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Provider(_) => "provider_error",
            Error::Tool(e) => e.kind(),
            Error::Extension(_) => "extension_transport_error",
            Error::Session(_) => "session_error",
            Error::Config { .. } => "config_error",
            Error::Serialization(_) => "serialization_error",
            Error::Cancelled => "cancelled",
            Error::SessionBusy(_) => "session_busy",
            Error::Internal(_) => "internal_error",
        }
    }

    /// The structured form handed across the presentation boundary.
    pub fn envelope(&self) -> ErrorEnvelope {
        let (message, recoverable) = match self {
            Error::Provider(e) => (e.to_string(), e.is_retryable()),
            Error::Tool(e) => (e.to_string(), e.is_recoverable()),
            Error::Extension(e) => (e.to_string(), true),
            Error::Session(e) => (e.to_string(), false),
            Error::Config { message } => (format!("Invalid configuration: {message}"), false),
            Error::Serialization(_) => ("Failed to encode or decode data".to_string(), false),
            Error::Cancelled => ("The run was cancelled".to_string(), true),
            Error::SessionBusy(id) => (
                format!("Session {id} is busy; wait for the current run to finish"),
                true,
            ),
            Error::Internal(_) => ("An internal error occurred".to_string(), false),
        };
        ErrorEnvelope {
            kind: self.kind().to_string(),
            message,
            recoverable,
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Uniform error shape surfaced to events and front ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: String,
    pub message: String,
    pub recoverable: bool,
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Missing credential for {provider}: set the {env_var} environment variable")]
    MissingCredential { provider: String, env_var: String },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout(_)
                | ProviderError::Network(_)
                | ProviderError::StreamInterrupted(_)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments for {tool_name}: {reason}")]
    InvalidArguments { tool_name: String, reason: String },

    #[error("{tool_name} is not permitted in {mode} mode")]
    NotPermitted { tool_name: String, mode: String },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed {
        tool_name: String,
        reason: String,
        recoverable: bool,
    },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },
}

impl ToolError {
    /// Convenience constructor for the common recoverable failure.
    pub fn failed(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::ExecutionFailed {
            tool_name: tool_name.into(),
            reason: reason.into(),
            recoverable: true,
        }
    }

    /// Whether the model can reasonably try again (different arguments, other tool).
    pub fn is_recoverable(&self) -> bool {
        match self {
            ToolError::ExecutionFailed { recoverable, .. } => *recoverable,
            ToolError::PermissionDenied { .. } => false,
            _ => true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "unknown_tool",
            ToolError::InvalidArguments { .. } => "invalid_arguments",
            ToolError::NotPermitted { .. } => "not_permitted",
            ToolError::ExecutionFailed { .. } => "tool_execution_error",
            ToolError::Timeout { .. } => "tool_timeout",
            ToolError::PermissionDenied { .. } => "permission_denied",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ExtensionError {
    #[error("Unknown extension server: {0}")]
    UnknownServer(String),

    #[error("Extension server {server} is {state}")]
    InvalidState { server: String, state: String },

    #[error("Failed to start extension server {server}: {reason}")]
    Spawn { server: String, reason: String },

    #[error("Handshake with {server} failed: {reason}")]
    Handshake { server: String, reason: String },

    #[error("Protocol error from {server}: {reason}")]
    Protocol { server: String, reason: String },

    #[error("Transport to {server} failed: {reason}")]
    Transport { server: String, reason: String },

    #[error("Call to {server} timed out after {timeout_ms}ms")]
    Timeout { server: String, timeout_ms: u64 },

    #[error("Extension server {0} is closed")]
    Closed(String),
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Session {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn missing_credential_names_the_variable() {
        let err = Error::from(ProviderError::MissingCredential {
            provider: "anthropic".into(),
            env_var: "ANTHROPIC_API_KEY".into(),
        });
        let envelope = err.envelope();
        assert_eq!(envelope.kind, "provider_error");
        assert!(envelope.message.contains("ANTHROPIC_API_KEY"));
        assert!(!envelope.recoverable);
    }

    #[test]
    fn cancelled_is_not_a_failure() {
        assert!(!Error::Cancelled.is_failure());
        assert!(Error::Internal("boom".into()).is_failure());
    }

    #[test]
    fn internal_detail_is_not_leaked() {
        let envelope = Error::Internal("mutex poisoned at 0xdeadbeef".into()).envelope();
        assert!(!envelope.message.contains("0xdeadbeef"));
    }

    #[test]
    fn tool_error_recoverability() {
        assert!(ToolError::failed("shell", "exit 1").is_recoverable());
        assert!(
            !ToolError::PermissionDenied {
                tool_name: "read_file".into(),
                reason: "outside workspace".into(),
            }
            .is_recoverable()
        );
        let err = Error::Tool(ToolError::NotPermitted {
            tool_name: "write_file".into(),
            mode: "plan".into(),
        });
        assert_eq!(err.kind(), "not_permitted");
        assert!(err.to_string().contains("plan"));
    }
}
