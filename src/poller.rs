//! Active observation channel: bounded status polling against the worker.
//!
//! The loop runs on a fixed cadence for at most the attempt budget computed
//! by [`crate::estimate`]. Transport errors are absorbed up to a small
//! consecutive-failure budget; a worker-reported failure or the exhaustion
//! of either budget ends the loop with a typed error.

use crate::estimate::JobDimensions;
use crate::protocol::{JobState, JobStatus};
use crate::store::Database;
use crate::{RelayError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Seam for the status endpoint, so the loop is testable without a worker.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn status(&self, handle: &str) -> Result<JobStatus>;
}

#[async_trait]
impl StatusSource for crate::client::WorkerClient {
    async fn status(&self, handle: &str) -> Result<JobStatus> {
        self.task_status(handle).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Consecutive transport failures tolerated before giving up.
    pub retry_budget: u32,
}

impl PollSettings {
    pub fn from_budget(budget: crate::estimate::PollBudget, retry_budget: u32) -> Self {
        Self {
            interval: budget.poll_interval(),
            max_attempts: budget.max_attempts,
            retry_budget,
        }
    }
}

/// Poll until the worker reports a terminal state. Returns the raw result
/// payload on completion. Progress observed along the way is persisted to
/// the tracking record, normalized from the worker's 0-100 scale to [0,1].
pub async fn poll_until_terminal(
    source: &dyn StatusSource,
    db: &Database,
    handle: &str,
    dims: JobDimensions,
    settings: &PollSettings,
) -> Result<Option<serde_json::Value>> {
    let started = Instant::now();
    let mut transient_left = settings.retry_budget;

    for attempt in 0..settings.max_attempts {
        if attempt > 0 {
            tokio::time::sleep(settings.interval).await;
        }

        match source.status(handle).await {
            Ok(status) => {
                transient_left = settings.retry_budget;

                if let Some(progress) = status.progress {
                    db.record_progress(handle, f64::from(progress) / 100.0)
                        .await?;
                }

                match status.status {
                    JobState::Completed => {
                        debug!(handle, attempt, "poll observed completion");
                        return Ok(status.result);
                    }
                    JobState::Failed => {
                        let detail = status
                            .error
                            .unwrap_or_else(|| "no error detail provided".to_string());
                        return Err(RelayError::WorkerFailure(detail));
                    }
                    JobState::Cancelled => {
                        return Err(RelayError::WorkerFailure(
                            "job cancelled on the worker".to_string(),
                        ));
                    }
                    JobState::Pending | JobState::Processing => {
                        debug!(handle, attempt, progress = ?status.progress, "still running");
                    }
                }
            }
            Err(err) if is_transient(&err) => {
                if transient_left == 0 {
                    return Err(RelayError::TransientExhausted(err.to_string()));
                }
                transient_left -= 1;
                warn!(handle, attempt, remaining = transient_left, "status check failed: {err}");
            }
            Err(err) => return Err(err),
        }
    }

    Err(RelayError::TimeoutExceeded(timeout_message(
        handle,
        dims,
        started.elapsed(),
        settings,
    )))
}

/// Transport-level trouble is retried; anything else is a real answer.
fn is_transient(err: &RelayError) -> bool {
    matches!(
        err,
        RelayError::Http(_) | RelayError::SubmissionTransport { .. }
    )
}

fn timeout_message(
    handle: &str,
    dims: JobDimensions,
    elapsed: Duration,
    settings: &PollSettings,
) -> String {
    let minutes = elapsed.as_secs_f64() / 60.0;
    let mut msg = format!(
        "job {handle} did not finish within the {} polling attempts allotted \
         ({minutes:.1} minutes elapsed; declared {:.1} MB, {:.1} minutes of audio)",
        settings.max_attempts,
        dims.size_mb(),
        dims.duration_minutes(),
    );
    if dims.is_oversized() {
        msg.push_str("; consider splitting the file into smaller chunks");
    }
    msg
}
