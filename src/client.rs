//! HTTP client for the worker backend's queue API.

use crate::protocol::{
    JobStatus, QueueHistoryResponse, QueueStats, QueueStatsResponse, SubmitResponse,
};
use crate::{RelayError, Result};
use reqwest::multipart;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Kind-specific options forwarded with a transcription submission.
#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    pub language: Option<String>,
    pub backend: Option<String>,
    /// Ask the worker to run risk analysis on the transcript inline.
    pub risk_analysis: bool,
    pub priority: Option<i32>,
}

/// Client for the worker's HTTP surface.
///
/// Cheap to clone; the underlying `reqwest::Client` is an Arc internally.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    base_url: String,
}

impl WorkerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .user_agent(format!("transcribe-relay/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Upload an audio payload for transcription. Returns the worker-issued
    /// handle. Exactly one outbound call; classification of failures into
    /// the submission-transport taxonomy happens here.
    pub async fn submit_audio(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        opts: &TranscribeOptions,
    ) -> Result<SubmitResponse> {
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| RelayError::SubmissionTransport {
                status: None,
                message: e.to_string(),
            })?;
        let form = multipart::Form::new().part("audio", part);

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(language) = &opts.language {
            query.push(("language", language.clone()));
        }
        if let Some(backend) = &opts.backend {
            query.push(("backend", backend.clone()));
        }
        if opts.risk_analysis {
            query.push(("risk_analysis", "true".to_string()));
        }
        if let Some(priority) = opts.priority {
            query.push(("priority", priority.to_string()));
        }

        let response = self
            .http
            .post(self.url("/api/transcribe"))
            .query(&query)
            .multipart(form)
            .send()
            .await
            .map_err(submission_error)?;

        Self::read_submit_response(response).await
    }

    /// Submit text for risk analysis. Returns the worker-issued handle.
    pub async fn submit_risk_analysis(
        &self,
        text: &str,
        priority: Option<i32>,
    ) -> Result<SubmitResponse> {
        let response = self
            .http
            .post(self.url("/api/risk-analysis"))
            .json(&json!({ "text": text, "priority": priority }))
            .send()
            .await
            .map_err(submission_error)?;

        Self::read_submit_response(response).await
    }

    async fn read_submit_response(response: reqwest::Response) -> Result<SubmitResponse> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::SubmissionTransport {
                status: Some(status.as_u16()),
                message: if body.is_empty() {
                    status.to_string()
                } else {
                    body
                },
            });
        }
        let parsed: SubmitResponse =
            response
                .json()
                .await
                .map_err(|e| RelayError::SubmissionTransport {
                    status: Some(status.as_u16()),
                    message: format!("malformed submission response: {e}"),
                })?;
        debug!(handle = %parsed.task_id, "job submitted to worker");
        Ok(parsed)
    }

    /// Fetch the current status for a handle. Errors here are transient from
    /// the polling loop's point of view.
    pub async fn task_status(&self, handle: &str) -> Result<JobStatus> {
        let response = self
            .http
            .get(self.url(&format!("/api/task/{handle}/status")))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let response: QueueStatsResponse = self
            .http
            .get(self.url("/api/queue/stats"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.queue_stats)
    }

    pub async fn queue_history(
        &self,
        limit: Option<usize>,
        status: Option<&str>,
    ) -> Result<QueueHistoryResponse> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(status) = status {
            query.push(("status", status.to_string()));
        }
        let response = self
            .http
            .get(self.url("/api/queue/history"))
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Ask the worker to purge stale queue entries.
    pub async fn queue_cleanup(&self) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(self.url("/api/queue/cleanup"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

fn submission_error(err: reqwest::Error) -> RelayError {
    RelayError::SubmissionTransport {
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = WorkerClient::new("http://localhost:8000/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000");
        assert_eq!(
            client.url("/api/task/abc/status"),
            "http://localhost:8000/api/task/abc/status"
        );
    }

    #[test]
    fn options_default_to_empty() {
        let opts = TranscribeOptions::default();
        assert!(opts.language.is_none());
        assert!(!opts.risk_analysis);
    }

    /// One-shot responder that answers any request with a fixed status.
    async fn canned_responder(
        status_line: &'static str,
        body: &'static str,
    ) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = vec![0u8; 64 * 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn non_2xx_submission_carries_the_http_status() {
        let addr = canned_responder("500 Internal Server Error", "queue backend down").await;
        let client = WorkerClient::new(format!("http://{addr}")).unwrap();

        let err = client
            .submit_audio("clip.wav", vec![1, 2, 3], &TranscribeOptions::default())
            .await
            .unwrap_err();
        match err {
            RelayError::SubmissionTransport { status, message } => {
                assert_eq!(status, Some(500));
                assert!(message.contains("queue backend down"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn non_2xx_risk_submission_carries_the_http_status() {
        let addr = canned_responder("503 Service Unavailable", "overloaded").await;
        let client = WorkerClient::new(format!("http://{addr}")).unwrap();

        let err = client
            .submit_risk_analysis("ข้อความ", None)
            .await
            .unwrap_err();
        match err {
            RelayError::SubmissionTransport { status, message } => {
                assert_eq!(status, Some(503));
                assert!(message.contains("overloaded"));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
