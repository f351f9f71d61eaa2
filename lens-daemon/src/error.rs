//! Error taxonomy shared by the session, search and daemon layers.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the core. The daemon maps each variant to a stable code.
#[derive(Debug, Error)]
pub enum LensError {
    #[error("No workspace found at {}", path.display())]
    WorkspaceNotFound { path: PathBuf },

    #[error("Failed to launch sourcekit-lsp: {message}")]
    ProcessLaunchFailed { message: String },

    #[error("sourcekit-lsp initialization failed: {message}")]
    InitializationFailed { message: String },

    #[error("Symbol not found: {message}")]
    SymbolNotFound { message: String },

    #[error("I/O error for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {}ms", budget.as_millis())]
    Timeout {
        operation: &'static str,
        budget: Duration,
    },

    #[error("Unsupported workspace kind: {kind}")]
    UnsupportedWorkspaceKind { kind: String },

    /// Connection-level failure talking to the external process.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Error response returned by sourcekit-lsp.
    #[error("sourcekit-lsp error {code}: {message}")]
    Lsp { code: i64, message: String },

    #[error("Malformed response: {message}")]
    Protocol { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Session for {} has been shut down", root.display())]
    SessionClosed { root: PathBuf },
}

pub type LensResult<T> = Result<T, LensError>;

impl LensError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LensError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        LensError::Transport {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        LensError::Protocol {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        LensError::SymbolNotFound {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        LensError::InvalidRequest {
            message: message.into(),
        }
    }

    /// Stable numeric code used in the daemon error envelope.
    pub fn code(&self) -> i64 {
        match self {
            LensError::WorkspaceNotFound { .. } => 1001,
            LensError::ProcessLaunchFailed { .. } => 1002,
            LensError::InitializationFailed { .. } => 1003,
            LensError::SymbolNotFound { .. } => 1004,
            LensError::Io { .. } => 1005,
            LensError::Timeout { .. } => 1006,
            LensError::UnsupportedWorkspaceKind { .. } => 1007,
            LensError::Transport { .. } | LensError::Lsp { .. } | LensError::Protocol { .. } => {
                1008
            }
            LensError::SessionClosed { .. } => 1009,
            LensError::InvalidRequest { .. } => crate::protocol::INVALID_PARAMS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_reports_budget() {
        let err = LensError::Timeout {
            operation: "textDocument/definition",
            budget: Duration::from_millis(1500),
        };
        assert_eq!(
            err.to_string(),
            "textDocument/definition timed out after 1500ms"
        );
        assert_eq!(err.code(), 1006);
    }

    #[test]
    fn test_codes_are_distinct_for_taxonomy() {
        let errors = [
            LensError::WorkspaceNotFound {
                path: PathBuf::from("/tmp/x"),
            },
            LensError::ProcessLaunchFailed {
                message: "x".into(),
            },
            LensError::InitializationFailed {
                message: "x".into(),
            },
            LensError::not_found("x"),
            LensError::io("/tmp/x", std::io::Error::other("boom")),
            LensError::UnsupportedWorkspaceKind { kind: "x".into() },
        ];
        let mut codes: Vec<i64> = errors.iter().map(LensError::code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
