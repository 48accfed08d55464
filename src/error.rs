use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

/// Coarse failure class recorded in audit events and record write-backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientUi,
    StructuralUi,
    AuthRequired,
    LoopDetected,
    VerificationFailed,
    Timeout,
    CollaboratorError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::TransientUi => "TransientUI",
            ErrorKind::StructuralUi => "StructuralUI",
            ErrorKind::AuthRequired => "AuthRequired",
            ErrorKind::LoopDetected => "LoopDetected",
            ErrorKind::VerificationFailed => "VerificationFailed",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::CollaboratorError => "CollaboratorError",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("page not ready: {0}")]
    NotReady(String),

    #[error("driver call failed: {0}")]
    Driver(String),

    #[error("stale element reference {0}")]
    StaleReference(String),

    #[error("browser already running: {0}")]
    AlreadyRunning(String),

    #[error("browser session degraded: {0}")]
    SessionDegraded(String),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("ambiguous target {target}: {candidates} candidates")]
    AmbiguousTarget { target: String, candidates: usize },

    #[error("routine `{routine}` post-condition not met: {detail}")]
    PostconditionTimeout { routine: String, detail: String },

    #[error("decision maker gave up: {0}")]
    DecisionFailed(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("loop detected: {signature} attempted {attempts} times without progress")]
    LoopDetected { signature: String, attempts: u32 },

    #[error("verification failed for {stage}: {detail}")]
    VerificationFailed { stage: String, detail: String },

    #[error("turn budget of {0} exhausted")]
    TurnBudgetExceeded(u32),

    #[error("wall-clock budget of {0:?} exceeded")]
    WallClockExceeded(Duration),

    #[error("{collaborator} failed: {detail}")]
    Collaborator {
        collaborator: &'static str,
        detail: String,
    },
}

impl AgentError {
    pub fn collaborator(collaborator: &'static str, detail: impl Into<String>) -> Self {
        AgentError::Collaborator {
            collaborator,
            detail: detail.into(),
        }
    }

    pub fn verification(stage: impl std::fmt::Display, detail: impl Into<String>) -> Self {
        AgentError::VerificationFailed {
            stage: stage.to_string(),
            detail: detail.into(),
        }
    }

    /// Retryable in place with backoff; never surfaces past the session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::NotReady(_)
                | AgentError::Driver(_)
                | AgentError::StaleReference(_)
                | AgentError::AlreadyRunning(_)
        )
    }

    /// Failures a deterministic fallback or the decision loop may recover from.
    pub fn is_structural(&self) -> bool {
        self.kind() == ErrorKind::StructuralUi
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::NotReady(_)
            | AgentError::Driver(_)
            | AgentError::StaleReference(_)
            | AgentError::AlreadyRunning(_) => ErrorKind::TransientUi,
            AgentError::SessionDegraded(_)
            | AgentError::TargetNotFound(_)
            | AgentError::AmbiguousTarget { .. }
            | AgentError::PostconditionTimeout { .. }
            | AgentError::DecisionFailed(_) => ErrorKind::StructuralUi,
            AgentError::AuthRequired(_) => ErrorKind::AuthRequired,
            AgentError::LoopDetected { .. } => ErrorKind::LoopDetected,
            AgentError::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            AgentError::TurnBudgetExceeded(_) | AgentError::WallClockExceeded(_) => {
                ErrorKind::Timeout
            }
            AgentError::Collaborator { .. } => ErrorKind::CollaboratorError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_the_only_retryable_ones() {
        assert!(AgentError::NotReady("spinner".into()).is_transient());
        assert!(AgentError::StaleReference("e4".into()).is_transient());
        assert!(!AgentError::TargetNotFound("button \"Continue\"".into()).is_transient());
        assert!(!AgentError::AuthRequired("login wall".into()).is_transient());
    }

    #[test]
    fn structural_variants_share_a_kind() {
        let ambiguous = AgentError::AmbiguousTarget {
            target: "button \"Save\"".into(),
            candidates: 2,
        };
        assert_eq!(ambiguous.kind(), ErrorKind::StructuralUi);
        assert!(AgentError::SessionDegraded("timeouts".into()).is_structural());
        assert_eq!(
            AgentError::TurnBudgetExceeded(40).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(ErrorKind::StructuralUi.to_string(), "StructuralUI");
    }
}
