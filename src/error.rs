use crate::llm::LlmError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Rule that caused a candidate statement to be rejected by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnsafeOperation,
    UnknownIdentifier,
    OutOfScopeReference,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::UnsafeOperation => "unsafe_operation",
            RejectReason::UnknownIdentifier => "unknown_identifier",
            RejectReason::OutOfScopeReference => "out_of_scope_reference",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the question-answering core.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("schema unavailable: {0}")]
    SchemaUnavailable(String),

    #[error("no SQL statement could be extracted from the model output")]
    GenerationUnparseable,

    #[error("validation rejected ({reason}): {detail}")]
    ValidationRejected { reason: RejectReason, detail: String },

    #[error("query timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("query execution failed: {0}")]
    ExecutionError(String),

    #[error("general model unavailable: {0}")]
    GeneralLlmUnavailable(String),

    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted { attempts: u32, last_error: String },

    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl AgentError {
    /// One-line summary safe to echo to callers and into the history logs.
    /// Database driver errors can span multiple lines; only the first one
    /// carries the message.
    pub fn summary(&self) -> String {
        let text = self.to_string();
        text.lines().next().unwrap_or_default().to_string()
    }
}

/// Truncates a raw error message to its first line.
pub fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_names_match_wire_format() {
        assert_eq!(RejectReason::UnsafeOperation.as_str(), "unsafe_operation");
        assert_eq!(RejectReason::UnknownIdentifier.as_str(), "unknown_identifier");
        assert_eq!(
            RejectReason::OutOfScopeReference.as_str(),
            "out_of_scope_reference"
        );
    }

    #[test]
    fn summary_keeps_first_line_only() {
        let err = AgentError::ExecutionError("Binder Error: bad column\nLINE 1: ...".to_string());
        assert_eq!(err.summary(), "query execution failed: Binder Error: bad column");
    }

    #[test]
    fn first_line_trims_noise() {
        assert_eq!(first_line("boom\ndetail\nmore"), "boom");
        assert_eq!(first_line(""), "");
    }
}
