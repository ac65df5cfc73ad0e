// src/error.rs

use thiserror::Error;

/// Unified error type for agent operations.
///
/// Each variant maps to a distinct result code on the wire so the panel can
/// tell "nothing happened" apart from "something was attempted". Multi-step
/// rollback is not an error variant: the engine reports it as a terminal
/// `RolledBack` outcome carrying per-step detail.
#[derive(Debug, Error)]
pub enum AgentError {
    /// User input rejected by a configured validation rule. The message is
    /// the configured, human-readable one, returned verbatim.
    #[error("{0}")]
    Validation(String),

    /// A policy-gated action was refused before any privileged call.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Remote host unreachable after bounded retries, or the session died.
    #[error("connection error: {0}")]
    Connection(String),

    /// The remote command ran and returned a non-zero exit. Never retried;
    /// the side effects may be non-idempotent.
    #[error("command failed with exit code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    /// Lock contention on a managed resource exceeded the configured wait.
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// A write or verify failure; the original file is intact.
    #[error("edit error: {0}")]
    Edit(String),

    /// An operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The operation was cancelled mid-flight.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Malformed request frame on the socket.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invariant breach inside the agent itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Stable numeric code exposed to the panel. 0 is reserved for a
    /// committed operation and 5 for a rolled-back one; both are produced
    /// by the engine report, not by an error value.
    pub fn result_code(&self) -> u8 {
        match self {
            AgentError::Validation(_) => 1,
            AgentError::PermissionDenied(_) => 2,
            AgentError::ResourceBusy(_) => 3,
            AgentError::Timeout(_) => 4,
            AgentError::Connection(_) => 6,
            AgentError::CommandFailed { .. } => 7,
            AgentError::Edit(_) => 8,
            AgentError::Protocol(_) => 9,
            AgentError::Internal(_) => 9,
            AgentError::Cancelled(_) => 10,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Edit(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_are_distinct_per_signal() {
        let errors = [
            AgentError::Validation("v".into()),
            AgentError::PermissionDenied("p".into()),
            AgentError::ResourceBusy("b".into()),
            AgentError::Timeout("t".into()),
            AgentError::Connection("c".into()),
            AgentError::CommandFailed { exit_code: 1, stderr: "e".into() },
            AgentError::Edit("w".into()),
            AgentError::Cancelled("x".into()),
        ];
        let mut codes: Vec<u8> = errors.iter().map(|e| e.result_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn validation_message_is_verbatim() {
        let err = AgentError::Validation("The password must contain 1 to 24 characters.".into());
        assert_eq!(err.to_string(), "The password must contain 1 to 24 characters.");
    }
}
