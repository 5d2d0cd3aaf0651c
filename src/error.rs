// SPDX-License-Identifier: MIT
//! Error taxonomy shared by the engine, orchestrator, and wire adapters.
//!
//! Every failure that crosses a component boundary is a [`SwarmError`]: an
//! [`ErrorKind`] plus a human-readable message. The kind decides retry
//! behavior inside the engine and the exit code at the CLI boundary; the
//! message travels verbatim to clients.

use serde::{Deserialize, Serialize};

/// Closed set of error kinds surfaced by the engine and orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Schema violation, dangling dependency, cyclic plan, missing option.
    Invalid,
    /// Unknown task, agent, or capability.
    NotFound,
    /// Missing/invalid stream token; agent not authorized for a capability.
    PermissionDenied,
    /// Rate limiter rejected a call after exhausting its retries.
    RateLimited,
    /// Step, connection, or query deadline expired.
    Timeout,
    /// Network or provider error the classifier deems retriable.
    Transient,
    /// Non-retriable agent error.
    Fatal,
    /// Task/step cancellation or shutdown.
    Cancelled,
    /// Planner produced a plan below the caller's `min_confidence`.
    LowConfidence,
    /// Queue full or worker pool exhausted past the caller's deadline.
    Overloaded,
}

impl ErrorKind {
    /// Kinds the engine re-schedules instead of failing the step outright.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::RateLimited
        )
    }

    /// Stable wire name, e.g. `"Timeout"`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Invalid => "Invalid",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Transient => "Transient",
            ErrorKind::Fatal => "Fatal",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::LowConfidence => "LowConfidence",
            ErrorKind::Overloaded => "Overloaded",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type crossing every component boundary in this crate.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct SwarmError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SwarmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn low_confidence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LowConfidence, message)
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overloaded, message)
    }

    /// `true` when the engine should re-schedule rather than apply
    /// the step's `on_failure` policy immediately.
    pub fn is_retriable(&self) -> bool {
        if self.kind.is_retriable() {
            return true;
        }
        // Heuristic for errors produced by opaque agents: a provider
        // "response" envelope or a timeout mention in the message marks
        // the failure as worth retrying even when the agent reported it
        // as Fatal.
        self.kind == ErrorKind::Fatal
            && (self.message.contains("\"response\"")
                || self.message.to_ascii_lowercase().contains("timeout"))
    }
}

/// Process exit code for a terminal task outcome.
///
/// `0` completed (even with skipped steps), `1` failed, `2` cancelled,
/// `3` invalid input or permission failure.
pub fn exit_code_for(kind: Option<ErrorKind>) -> i32 {
    match kind {
        None => 0,
        Some(ErrorKind::Cancelled) => 2,
        Some(ErrorKind::Invalid) | Some(ErrorKind::PermissionDenied) => 3,
        Some(_) => 1,
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(ErrorKind::Transient.is_retriable());
        assert!(ErrorKind::Timeout.is_retriable());
        assert!(ErrorKind::RateLimited.is_retriable());
        assert!(!ErrorKind::Fatal.is_retriable());
        assert!(!ErrorKind::Invalid.is_retriable());
        assert!(!ErrorKind::Cancelled.is_retriable());
    }

    #[test]
    fn fatal_with_timeout_message_is_retriable() {
        let err = SwarmError::fatal("upstream request timeout after 30s");
        assert!(err.is_retriable());
        let err = SwarmError::fatal("schema mismatch");
        assert!(!err.is_retriable());
    }

    #[test]
    fn exit_codes_match_outcomes() {
        assert_eq!(exit_code_for(None), 0);
        assert_eq!(exit_code_for(Some(ErrorKind::Fatal)), 1);
        assert_eq!(exit_code_for(Some(ErrorKind::Transient)), 1);
        assert_eq!(exit_code_for(Some(ErrorKind::Cancelled)), 2);
        assert_eq!(exit_code_for(Some(ErrorKind::Invalid)), 3);
        assert_eq!(exit_code_for(Some(ErrorKind::PermissionDenied)), 3);
    }

    #[test]
    fn kind_serializes_to_wire_name() {
        let json = serde_json::to_string(&ErrorKind::LowConfidence).unwrap();
        assert_eq!(json, "\"LowConfidence\"");
        let round: ErrorKind = serde_json::from_str("\"RateLimited\"").unwrap();
        assert_eq!(round, ErrorKind::RateLimited);
    }

    #[test]
    fn error_displays_kind_and_message() {
        let err = SwarmError::not_found("unknown agent \"mailer\"");
        assert_eq!(err.to_string(), "NotFound: unknown agent \"mailer\"");
    }
}
