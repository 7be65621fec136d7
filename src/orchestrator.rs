//! Job orchestration: submission, dual-channel observation, and settlement.
//!
//! One orchestrator owns the whole job lifecycle. Submission writes the
//! tracking record before the first network call, races the polling loop
//! against the push feed for the terminal observation, and feeds whichever
//! wins into the reconciler. A standing settler task applies terminal push
//! events for handles with no live watcher, so late completions still
//! promote after cancellation, budget exhaustion, or a restart.

use crate::client::{TranscribeOptions, WorkerClient};
use crate::config::Config;
use crate::estimate::{estimate, JobDimensions};
use crate::events::{is_terminal_for, wait_for_terminal, EventChannel};
use crate::poller::{poll_until_terminal, PollSettings, StatusSource};
use crate::protocol::{JobKind, JobState, PushEvent};
use crate::reconcile::{Applied, Observation, Reconciler};
use crate::store::{Database, TrackingRecord, TranscriptRecord};
use crate::{RelayError, Result};
use futures_util::future::{abortable, AbortHandle, Aborted};
use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything a transcription submission needs, already read into memory.
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub language: Option<String>,
    /// Client-declared media duration in seconds; untrusted, used only to
    /// size the wait budget.
    pub duration_secs: f64,
    /// Also run risk analysis on the transcript inside the worker.
    pub risk_analysis: bool,
}

pub struct Orchestrator {
    db: Database,
    client: WorkerClient,
    events: Arc<EventChannel>,
    reconciler: Reconciler,
    config: Config,
    watchers: Mutex<HashMap<String, AbortHandle>>,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        client: WorkerClient,
        events: Arc<EventChannel>,
        config: Config,
    ) -> Self {
        let reconciler = Reconciler::new(db.clone());
        Self {
            db,
            client,
            events,
            reconciler,
            config,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Submit a transcription and return once the worker has accepted it.
    /// Observation and settlement continue in a background watcher.
    pub async fn submit_transcription(&self, request: TranscribeRequest) -> Result<TrackingRecord> {
        let (tracking, dims) = self.submit_transcription_inner(request).await?;
        if let Some(handle) = tracking.handle.clone() {
            self.spawn_watcher(handle, dims);
        }
        Ok(tracking)
    }

    /// Submit a transcription and block until it settles. Returns the
    /// promoted record, or the typed error that failed the job.
    pub async fn submit_transcription_sync(
        &self,
        request: TranscribeRequest,
    ) -> Result<TranscriptRecord> {
        let (tracking, dims) = self.submit_transcription_inner(request).await?;
        let handle = tracking
            .handle
            .clone()
            .ok_or_else(|| RelayError::NotFound("worker handle".to_string()))?;

        self.watch_registered(&handle, dims).await?;

        match self.db.get_transcript_by_handle(&handle).await? {
            Some(record) => Ok(record),
            None => {
                // Settled as failed by the other channel between our watch
                // ending and the lookup.
                let detail = self
                    .db
                    .get_tracking_by_handle(&handle)
                    .await?
                    .and_then(|t| t.error)
                    .unwrap_or_else(|| "job did not complete".to_string());
                Err(RelayError::WorkerFailure(detail))
            }
        }
    }

    async fn submit_transcription_inner(
        &self,
        request: TranscribeRequest,
    ) -> Result<(TrackingRecord, JobDimensions)> {
        if request.bytes.is_empty() {
            return Err(RelayError::Validation("empty audio payload".to_string()));
        }
        if request.file_name.trim().is_empty() {
            return Err(RelayError::Validation("missing file name".to_string()));
        }

        let dims = JobDimensions::new(request.bytes.len() as u64, request.duration_secs.max(0.0));
        let tracking = self
            .db
            .create_tracking(
                JobKind::Transcription,
                Some(&request.file_name),
                dims,
                None,
            )
            .await?;

        let opts = TranscribeOptions {
            language: request.language.clone(),
            backend: None,
            risk_analysis: request.risk_analysis,
            priority: None,
        };

        let submit = self
            .client
            .submit_audio(&request.file_name, request.bytes, &opts);
        let accepted = match tokio::time::timeout(self.config.submit_timeout, submit).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                self.db
                    .mark_tracking_failed(&tracking.id, &err.to_string())
                    .await?;
                return Err(err);
            }
            Err(_) => {
                let err = RelayError::SubmissionTransport {
                    status: None,
                    message: format!(
                        "submission did not complete within {:?}",
                        self.config.submit_timeout
                    ),
                };
                self.db
                    .mark_tracking_failed(&tracking.id, &err.to_string())
                    .await?;
                return Err(err);
            }
        };

        self.db.attach_handle(&tracking.id, &accepted.task_id).await?;
        info!(
            tracking_id = %tracking.id,
            handle = %accepted.task_id,
            file = %request.file_name,
            size_mb = format!("{:.1}", dims.size_mb()),
            "transcription accepted by worker"
        );

        let tracking = self
            .db
            .get_tracking(&tracking.id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("tracking record {}", tracking.id)))?;
        Ok((tracking, dims))
    }

    /// Submit the text of an existing record for standalone risk analysis.
    pub async fn submit_risk_analysis(&self, record_id: &str) -> Result<TrackingRecord> {
        let record = self
            .db
            .get_transcript(record_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("transcript {record_id}")))?;
        if record.text.trim().is_empty() {
            return Err(RelayError::Validation(
                "record has no text to analyze".to_string(),
            ));
        }

        self.db.set_risk_analyzing(record_id).await?;

        let dims = JobDimensions::default();
        let tracking = self
            .db
            .create_tracking(JobKind::RiskAnalysis, None, dims, Some(record_id))
            .await?;

        let submit = self.client.submit_risk_analysis(&record.text, None);
        let accepted = match tokio::time::timeout(self.config.submit_timeout, submit).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                self.fail_risk_submission(&tracking.id, record_id, &err.to_string())
                    .await?;
                return Err(err);
            }
            Err(_) => {
                let err = RelayError::SubmissionTransport {
                    status: None,
                    message: format!(
                        "risk submission did not complete within {:?}",
                        self.config.submit_timeout
                    ),
                };
                self.fail_risk_submission(&tracking.id, record_id, &err.to_string())
                    .await?;
                return Err(err);
            }
        };

        self.db.attach_handle(&tracking.id, &accepted.task_id).await?;
        info!(handle = %accepted.task_id, record_id, "risk analysis accepted by worker");

        self.spawn_watcher(accepted.task_id.clone(), dims);

        self.db
            .get_tracking(&tracking.id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("tracking record {}", tracking.id)))
    }

    async fn fail_risk_submission(
        &self,
        tracking_id: &str,
        record_id: &str,
        detail: &str,
    ) -> Result<()> {
        self.db.mark_tracking_failed(tracking_id, detail).await?;
        self.db.set_risk_failed(record_id, detail).await?;
        Ok(())
    }

    /// Stop observing a job. The worker keeps running it; a late completion
    /// seen on the push feed still promotes through the settler task.
    pub async fn cancel(&self, handle: &str) -> Result<bool> {
        let aborted = {
            let mut watchers = self
                .watchers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            watchers.remove(handle)
        };
        if let Some(watcher) = aborted {
            watcher.abort();
        }
        self.db.cancel_tracking(handle).await
    }

    /// Standing settlement path for push events aimed at handles with no
    /// live watcher: cancelled jobs, watchers that exhausted their budget,
    /// and jobs inherited from a previous process. Duplicate applications
    /// are no-ops in storage, so racing a live watcher is harmless.
    pub fn spawn_event_settler(&self) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        let db = self.db.clone();
        let client = self.client.clone();
        let reconciler = self.reconciler.clone();

        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event settler lagged behind the push feed");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(handle) = event.task_id().map(str::to_string) else {
                    continue;
                };
                if !is_terminal_for(&event, &handle) {
                    continue;
                }
                match db.get_tracking_by_handle(&handle).await {
                    Ok(Some(_)) => {
                        let observation = observation_from_event(&client, &handle, event).await;
                        if let Err(err) = reconciler.apply(observation).await {
                            error!(handle, "late settlement failed: {err}");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => error!(handle, "tracking lookup failed: {err}"),
                }
            }
        })
    }

    /// Respawn watchers for rows still in `processing`, typically after a
    /// restart. Returns how many were resumed.
    pub async fn resume_tracking(&self) -> Result<usize> {
        let mut resumed = 0;
        for row in self.db.list_tracking().await? {
            if row.lifecycle_state() != JobState::Processing {
                continue;
            }
            let Some(handle) = row.handle.clone() else {
                continue;
            };
            info!(handle = %handle, "resuming watcher for in-flight job");
            self.spawn_watcher(handle, row.dimensions());
            resumed += 1;
        }
        Ok(resumed)
    }

    fn spawn_watcher(&self, handle: String, dims: JobDimensions) {
        let db = self.db.clone();
        let client = self.client.clone();
        let events = self.events.clone();
        let reconciler = self.reconciler.clone();
        let settings = PollSettings::from_budget(estimate(dims), self.config.poll_retry_budget);

        let watcher_handle = handle.clone();
        let (watch, abort) = abortable(async move {
            match watch_job(
                &db,
                &client,
                &events,
                &reconciler,
                &watcher_handle,
                dims,
                settings,
            )
            .await
            {
                Ok(_) => {}
                Err(err) => {
                    warn!(handle = %watcher_handle, kind = err.kind(), "job settled as failed: {err}")
                }
            }
        });
        tokio::spawn(watch);

        let mut watchers = self
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        watchers.insert(handle, abort);
    }

    /// Watch inline (for sync submissions) while staying visible to
    /// `cancel`. An abort while awaited surfaces as `Cancelled`.
    async fn watch_registered(&self, handle: &str, dims: JobDimensions) -> Result<Applied> {
        let settings = PollSettings::from_budget(estimate(dims), self.config.poll_retry_budget);
        let (watch, abort) = abortable(watch_job(
            &self.db,
            &self.client,
            &self.events,
            &self.reconciler,
            handle,
            dims,
            settings,
        ));
        {
            let mut watchers = self
                .watchers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            watchers.insert(handle.to_string(), abort);
        }

        let outcome = watch.await;

        {
            let mut watchers = self
                .watchers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            watchers.remove(handle);
        }

        match outcome {
            Ok(applied) => applied,
            Err(Aborted) => Err(RelayError::Cancelled(format!(
                "observation of job {handle} stopped"
            ))),
        }
    }

    /// Abort outstanding watchers. Called on shutdown; unsettled jobs are
    /// picked up again on the next start by `resume_tracking`.
    pub fn abort_watchers(&self) {
        let mut watchers = self
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (handle, watcher) in watchers.drain() {
            warn!(handle, "aborting watcher on shutdown");
            watcher.abort();
        }
    }
}

/// Race the polling loop against the push feed and settle on whichever
/// produces the first terminal observation. Failures settle the tracking
/// row, then propagate with their original type intact.
async fn watch_job<S: StatusSource>(
    db: &Database,
    source: &S,
    events: &EventChannel,
    reconciler: &Reconciler,
    handle: &str,
    dims: JobDimensions,
    settings: PollSettings,
) -> Result<Applied> {
    let mut rx = events.subscribe();

    enum First {
        Polled(Result<Option<serde_json::Value>>),
        Pushed(Option<PushEvent>),
    }

    let mut poll = pin!(poll_until_terminal(source, db, handle, dims, &settings));
    let first = {
        let mut push = pin!(wait_for_terminal(&mut rx, handle));
        tokio::select! {
            polled = &mut poll => First::Polled(polled),
            event = &mut push => First::Pushed(event),
        }
    };

    match first {
        First::Polled(polled) => settle_poll(reconciler, handle, polled).await,
        First::Pushed(Some(event)) => {
            let observation = observation_from_event(source, handle, event).await;
            settle_push(reconciler, observation).await
        }
        // Push feed closed; the polling loop remains authoritative.
        First::Pushed(None) => settle_poll(reconciler, handle, poll.await).await,
    }
}

async fn settle_poll(
    reconciler: &Reconciler,
    handle: &str,
    polled: Result<Option<serde_json::Value>>,
) -> Result<Applied> {
    match polled {
        Ok(result) => {
            reconciler
                .apply(Observation::Completed {
                    handle: handle.to_string(),
                    result,
                })
                .await
        }
        Err(err) => {
            reconciler
                .apply(Observation::Failed {
                    handle: handle.to_string(),
                    error: err.to_string(),
                })
                .await?;
            Err(err)
        }
    }
}

async fn settle_push(reconciler: &Reconciler, observation: Observation) -> Result<Applied> {
    match observation {
        Observation::Completed { .. } => reconciler.apply(observation).await,
        Observation::Failed { handle, error } => {
            reconciler
                .apply(Observation::Failed {
                    handle,
                    error: error.clone(),
                })
                .await?;
            Err(RelayError::WorkerFailure(error))
        }
    }
}

/// A terminal push event carries its payload inline when it is a
/// completion envelope; a bare terminal status update does not, so the
/// result is fetched once before settling.
async fn observation_from_event<S: StatusSource>(
    source: &S,
    handle: &str,
    event: PushEvent,
) -> Observation {
    match event {
        PushEvent::TaskCompleted { status, result, error, .. } => {
            let failed = matches!(status, Some(JobState::Failed)) || error.is_some();
            if failed {
                Observation::Failed {
                    handle: handle.to_string(),
                    error: error.unwrap_or_else(|| "no error detail provided".to_string()),
                }
            } else {
                Observation::Completed {
                    handle: handle.to_string(),
                    result,
                }
            }
        }
        PushEvent::TaskStatusUpdate { status, error, .. } => match status {
            JobState::Completed => {
                let result = match source.status(handle).await {
                    Ok(full) => full.result,
                    Err(err) => {
                        warn!(handle, "could not fetch result after push completion: {err}");
                        None
                    }
                };
                Observation::Completed {
                    handle: handle.to_string(),
                    result,
                }
            }
            _ => Observation::Failed {
                handle: handle.to_string(),
                error: error.unwrap_or_else(|| format!("worker reported state {status:?}")),
            },
        },
        other => Observation::Failed {
            handle: handle.to_string(),
            error: format!("unexpected terminal event {other:?}"),
        },
    }
}
