//! Transcribe Relay - orchestration layer for an external transcription and
//! risk-analysis worker.
//!
//! The relay submits long-running jobs to the worker backend, tracks their
//! progress through two independent observation channels (active status
//! polling and a push-based event stream), reconciles whichever channel
//! reports completion first into a durable record, and recovers cleanly from
//! partial failure at every step. It features:
//!
//! - Adaptive wait budgets computed from untrusted client-supplied metadata
//! - A bounded polling loop that absorbs transient network failures
//! - A self-healing push channel with exponential reconnect backoff
//! - First-observation-wins promotion guarded by a storage compare-and-set
//! - An ordered heuristic chain for classifying free-form model output

pub mod classify;
pub mod client;
pub mod config;
pub mod estimate;
pub mod events;
pub mod orchestrator;
pub mod poller;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod store;

// Re-export commonly used types for convenience
pub use classify::{classify_response, Classification, Verdict};
pub use client::WorkerClient;
pub use config::Config;
pub use estimate::{estimate, JobDimensions, PollBudget};
pub use events::{ChannelState, EventChannel};
pub use orchestrator::Orchestrator;
pub use protocol::{JobKind, JobState, JobStatus, PushEvent};
pub use reconcile::{Applied, Observation, Reconciler};
pub use store::Database;

use thiserror::Error;

/// Errors that can occur in the relay.
///
/// Transient polling failures are absorbed inside the polling loop and never
/// surface individually; everything else propagates as one of these variants
/// and lands in the tracking record's error detail.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Missing or malformed input, rejected before any side effect.
    #[error("validation error: {0}")]
    Validation(String),

    /// Worker unreachable or non-2xx at submission time.
    #[error("submission failed{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    SubmissionTransport {
        status: Option<u16>,
        message: String,
    },

    /// The worker explicitly reported a failed lifecycle. Surfaced verbatim.
    #[error("worker reported failure: {0}")]
    WorkerFailure(String),

    /// The polling attempt budget ran out with no terminal state.
    #[error("{0}")]
    TimeoutExceeded(String),

    /// The local transient-retry budget for one polling loop ran out.
    #[error("transport errors exhausted retry budget: {0}")]
    TransientExhausted(String),

    /// Local observation stopped at the caller's request. The worker may
    /// still finish the job.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Short machine-readable tag used in API responses and error rows.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "validation",
            RelayError::SubmissionTransport { .. } => "submission_transport",
            RelayError::WorkerFailure(_) => "worker_failure",
            RelayError::TimeoutExceeded(_) => "timeout",
            RelayError::TransientExhausted(_) => "transient_exhausted",
            RelayError::Cancelled(_) => "cancelled",
            RelayError::NotFound(_) => "not_found",
            RelayError::Storage(_) => "storage",
            RelayError::Http(_) => "http",
            RelayError::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constants() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "transcribe-relay");
    }

    #[test]
    fn submission_error_names_http_status() {
        let err = RelayError::SubmissionTransport {
            status: Some(500),
            message: "internal server error".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("500"), "got: {text}");
        assert_eq!(err.kind(), "submission_transport");
    }

    #[test]
    fn submission_error_without_status() {
        let err = RelayError::SubmissionTransport {
            status: None,
            message: "connection refused".to_string(),
        };
        assert!(!err.to_string().contains("HTTP"));
    }
}
