//! Shared types, errors, and configuration for the drover orchestration engine.
//!
//! This crate provides the foundational types used across all other drover crates:
//! - `DroverError` — unified error taxonomy
//! - `Stage` — the closed pipeline stage enumeration
//! - `Ticket` / `TicketId` — the unit of work moving through the pipeline
//! - `StageOutcome` — result of handling a ticket at one stage
//! - `DroverConfig` — environment-driven configuration

pub mod config;
pub mod outcome;
pub mod stage;
pub mod ticket;

pub use config::DroverConfig;
pub use outcome::{Artifact, OutcomeKind, StageOutcome};
pub use stage::{Stage, StageOwner};
pub use ticket::{Ticket, TicketId};

/// Unified error type for all drover subsystems.
#[derive(Debug, thiserror::Error)]
pub enum DroverError {
    // === Tracker errors ===
    #[error("Tracker returned HTTP {status}: {message}")]
    TrackerError {
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Rate limited by tracker/provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("Marker '{marker}' not present on {ticket} (stale read)")]
    MarkerConflict { ticket: String, marker: String },

    // === Agent errors ===
    #[error("Agent '{agent}' failed: {message}")]
    AgentError { agent: String, message: String },

    #[error("External call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // === Pipeline errors ===
    #[error("No handler bound to stage '{stage}'")]
    NoHandler { stage: String },

    #[error("Ticket {ticket} is mis-labeled: {message}")]
    BadMarkerState { ticket: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl DroverError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DroverError::RateLimited { .. }
                | DroverError::Timeout { .. }
                | DroverError::TrackerError { retryable: true, .. }
        )
    }

    /// Returns `true` for errors that must terminate the scheduler loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DroverError::AuthFailed { .. })
    }

    /// Returns `true` for provider-wide rate-limit signals.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, DroverError::RateLimited { .. })
    }
}

/// A convenience alias for `Result<T, DroverError>`.
pub type Result<T> = std::result::Result<T, DroverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_tracker_error() {
        let err = DroverError::TrackerError {
            status: 502,
            message: "bad gateway".into(),
            retryable: true,
        };
        assert_eq!(err.to_string(), "Tracker returned HTTP 502: bad gateway");
    }

    #[test]
    fn error_display_rate_limited() {
        let err = DroverError::RateLimited {
            retry_after_secs: 60,
        };
        assert_eq!(
            err.to_string(),
            "Rate limited by tracker/provider, retry after 60s"
        );
    }

    #[test]
    fn error_display_marker_conflict() {
        let err = DroverError::MarkerConflict {
            ticket: "acme/api#7".into(),
            marker: "agentPlanReview".into(),
        };
        assert_eq!(
            err.to_string(),
            "Marker 'agentPlanReview' not present on acme/api#7 (stale read)"
        );
    }

    #[test]
    fn retryable_rate_limited_and_timeout() {
        assert!(DroverError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(DroverError::Timeout { timeout_secs: 30 }.is_retryable());
    }

    #[test]
    fn retryable_tracker_error_respects_flag() {
        let transient = DroverError::TrackerError {
            status: 503,
            message: "unavailable".into(),
            retryable: true,
        };
        let permanent = DroverError::TrackerError {
            status: 422,
            message: "validation".into(),
            retryable: false,
        };
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn auth_failed_is_fatal_not_retryable() {
        let err = DroverError::AuthFailed {
            message: "bad token".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limit_predicate() {
        assert!(DroverError::RateLimited { retry_after_secs: 0 }.is_rate_limit());
        assert!(!DroverError::Timeout { timeout_secs: 5 }.is_rate_limit());
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: DroverError = io_err.into();
        assert!(matches!(err, DroverError::Io(_)));
    }
}
