//! Failure classification and the per-request restart budget.

use crate::error::LensError;

/// Message fragments that mean the sourcekit-lsp process (or the sourcekitd
/// service behind it) is no longer usable.
const SEVERE_MARKERS: &[&str] = &[
    "stream closed",
    "connection reset",
    "broken pipe",
    "service invalid",
    "fatal error",
    "sourcekitd crashed",
    "connection interrupted",
    "connection closed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The process must be replaced; the request may be retried once.
    TransientSevere,
    /// Surface to the caller as is.
    Permanent,
}

pub fn classify_failure(error: &LensError) -> FailureClass {
    let message = match error {
        LensError::Timeout { .. } => return FailureClass::TransientSevere,
        LensError::Transport { message }
        | LensError::Lsp { message, .. }
        | LensError::InitializationFailed { message } => message,
        _ => return FailureClass::Permanent,
    };

    let lowered = message.to_ascii_lowercase();
    if SEVERE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        FailureClass::TransientSevere
    } else {
        FailureClass::Permanent
    }
}

pub fn is_transient_severe(error: &LensError) -> bool {
    classify_failure(error) == FailureClass::TransientSevere
}

/// One restart per logical request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestartBudget {
    used: bool,
}

impl RestartBudget {
    /// Consume the restart if it is still available.
    pub fn try_consume(&mut self) -> bool {
        !std::mem::replace(&mut self.used, true)
    }

    pub fn is_spent(&self) -> bool {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transport_markers_are_severe() {
        for message in [
            "stream closed",
            "Connection reset by peer (os error 104)",
            "Broken pipe (os error 32)",
            "sourcekitd service invalid",
            "SourceKit fatal error",
            "sourcekitd crashed",
        ] {
            assert_eq!(
                classify_failure(&LensError::transport(message)),
                FailureClass::TransientSevere,
                "{message}"
            );
        }
    }

    #[test]
    fn test_timeout_is_severe() {
        let err = LensError::Timeout {
            operation: "workspace/symbol",
            budget: Duration::from_secs(30),
        };
        assert!(is_transient_severe(&err));
    }

    #[test]
    fn test_ordinary_errors_are_permanent() {
        assert_eq!(
            classify_failure(&LensError::Lsp {
                code: -32602,
                message: "invalid position".into()
            }),
            FailureClass::Permanent
        );
        assert_eq!(
            classify_failure(&LensError::not_found("stream closed")),
            FailureClass::Permanent
        );
        assert_eq!(
            classify_failure(&LensError::ProcessLaunchFailed {
                message: "connection reset".into()
            }),
            FailureClass::Permanent
        );
    }

    #[test]
    fn test_restart_budget_is_single_use() {
        let mut budget = RestartBudget::default();
        assert!(!budget.is_spent());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert!(budget.is_spent());
    }
}
