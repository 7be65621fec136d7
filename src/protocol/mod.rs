use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two kinds of work the external worker accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Transcription,
    RiskAnalysis,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Transcription => "transcription",
            JobKind::RiskAnalysis => "risk_analysis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transcription" => Some(JobKind::Transcription),
            "risk_analysis" => Some(JobKind::RiskAnalysis),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job, as reported by the worker and persisted locally.
///
/// The worker serializes these capitalized (`"Completed"`) while older
/// payloads use lowercase, so deserialization is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(JobState::Pending),
            "processing" => Some(JobState::Processing),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never advance again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        JobState::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown job state: {s}")))
    }
}

/// Response from the worker's submission endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: String,
    pub status: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Response from `GET /api/task/{id}/status`.
///
/// `progress` is on the worker's 0-100 scale; callers normalize to [0,1]
/// before persisting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub task_id: String,
    pub status: JobState,
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Aggregate counts from `GET /api/queue/stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: usize,
    pub processing_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub total_tasks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    pub queue_stats: QueueStats,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHistoryResponse {
    pub tasks: Vec<serde_json::Value>,
    #[serde(default)]
    pub count: usize,
}

/// Envelope for messages arriving on the worker's push stream.
///
/// Unknown `type` tags fail to deserialize; the dispatch loop logs and drops
/// them rather than crashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    NewTask {
        task_id: String,
        #[serde(default)]
        task_type: Option<String>,
        #[serde(default)]
        status: Option<JobState>,
    },
    TaskStatusUpdate {
        task_id: String,
        status: JobState,
        #[serde(default)]
        progress: Option<f32>,
        #[serde(default)]
        error: Option<String>,
    },
    TaskProgress {
        task_id: String,
        progress: f32,
    },
    TaskCompleted {
        task_id: String,
        #[serde(default)]
        status: Option<JobState>,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
    },
    QueueStats {
        #[serde(default)]
        stats: Option<QueueStats>,
    },
}

impl PushEvent {
    /// Handle of the job this event refers to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            PushEvent::NewTask { task_id, .. }
            | PushEvent::TaskStatusUpdate { task_id, .. }
            | PushEvent::TaskProgress { task_id, .. }
            | PushEvent::TaskCompleted { task_id, .. } => Some(task_id),
            PushEvent::QueueStats { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_parses_any_case() {
        assert_eq!(JobState::parse("Completed"), Some(JobState::Completed));
        assert_eq!(JobState::parse("completed"), Some(JobState::Completed));
        assert_eq!(JobState::parse("FAILED"), Some(JobState::Failed));
        assert_eq!(JobState::parse("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Processing.is_terminal());
    }

    #[test]
    fn status_deserializes_worker_shape() {
        let raw = r#"{
            "task_id": "abc",
            "status": "Processing",
            "progress": 42.5,
            "created_at": "2024-01-01T00:00:00Z",
            "result": null,
            "error": null
        }"#;
        let status: JobStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(status.status, JobState::Processing);
        assert_eq!(status.progress, Some(42.5));
        assert!(status.result.is_none());
    }

    #[test]
    fn push_event_tagged_dispatch() {
        let raw = r#"{"type":"task_progress","task_id":"t1","progress":55.0}"#;
        let event: PushEvent = serde_json::from_str(raw).unwrap();
        match event {
            PushEvent::TaskProgress { task_id, progress } => {
                assert_eq!(task_id, "t1");
                assert_eq!(progress, 55.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn push_event_completed_with_result() {
        let raw = r#"{
            "type": "task_completed",
            "task_id": "t2",
            "status": "Completed",
            "result": {"text": "hello"},
            "error": null
        }"#;
        let event: PushEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.task_id(), Some("t2"));
        match event {
            PushEvent::TaskCompleted { status, result, .. } => {
                assert_eq!(status, Some(JobState::Completed));
                assert_eq!(result.unwrap()["text"], "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_push_type_is_rejected() {
        let raw = r#"{"type":"mystery","task_id":"t3"}"#;
        assert!(serde_json::from_str::<PushEvent>(raw).is_err());
    }
}
