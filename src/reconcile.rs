//! Reconciliation of terminal observations into durable records.
//!
//! Both observation channels funnel their terminal sightings here. The
//! first one to arrive for a handle wins; the storage compare-and-set
//! makes every later sighting a no-op, so duplicates across channels are
//! harmless by construction.

use crate::classify::classify_response;
use crate::protocol::JobKind;
use crate::store::{Database, NewTranscript, Settlement, TranscriptRecord};
use crate::Result;
use serde_json::Value;
use tracing::{info, warn};

/// A terminal sighting from either observation channel.
#[derive(Debug, Clone)]
pub enum Observation {
    Completed {
        handle: String,
        result: Option<Value>,
    },
    Failed {
        handle: String,
        error: String,
    },
}

/// What applying an observation actually did.
#[derive(Debug)]
pub enum Applied {
    Promoted(TranscriptRecord),
    VerdictRecorded(TranscriptRecord),
    MarkedFailed,
    /// Another channel settled this handle first; nothing changed.
    AlreadySettled,
}

#[derive(Clone)]
pub struct Reconciler {
    db: Database,
}

impl Reconciler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn apply(&self, observation: Observation) -> Result<Applied> {
        match observation {
            Observation::Completed { handle, result } => self.apply_completed(&handle, result).await,
            Observation::Failed { handle, error } => self.apply_failed(&handle, &error).await,
        }
    }

    async fn apply_completed(&self, handle: &str, result: Option<Value>) -> Result<Applied> {
        let Some(tracking) = self.db.get_tracking_by_handle(handle).await? else {
            return Ok(Applied::AlreadySettled);
        };

        match tracking.job_kind() {
            JobKind::Transcription => {
                let settlement = self
                    .db
                    .promote_completed(handle, transcript_from_result(result))
                    .await?;
                Ok(match settlement {
                    Settlement::Promoted(record) => {
                        info!(handle, record_id = %record.id, "transcription promoted");
                        Applied::Promoted(record)
                    }
                    _ => Applied::AlreadySettled,
                })
            }
            JobKind::RiskAnalysis => {
                let raw = raw_response_from_result(result.as_ref());
                let classification = classify_response(&raw);
                let settlement = self
                    .db
                    .promote_risk_verdict(
                        handle,
                        classification.verdict.as_str(),
                        classification.confidence,
                        &raw,
                    )
                    .await?;
                Ok(match settlement {
                    Settlement::VerdictRecorded(record) => {
                        info!(
                            handle,
                            record_id = %record.id,
                            verdict = classification.verdict.as_str(),
                            stage = classification.stage,
                            "risk verdict recorded"
                        );
                        Applied::VerdictRecorded(record)
                    }
                    _ => Applied::AlreadySettled,
                })
            }
        }
    }

    async fn apply_failed(&self, handle: &str, error: &str) -> Result<Applied> {
        match self.db.settle_failed(handle, error).await? {
            Settlement::MarkedFailed(record) => {
                warn!(handle, error, "job settled as failed");
                // A failed analysis must not leave its target stuck in
                // `analyzing`.
                if record.job_kind() == JobKind::RiskAnalysis {
                    if let Some(target) = &record.target_record_id {
                        self.db.set_risk_failed(target, error).await?;
                    }
                }
                Ok(Applied::MarkedFailed)
            }
            _ => Ok(Applied::AlreadySettled),
        }
    }
}

/// Pull the transcript fields out of the worker's result payload. Unknown
/// shapes degrade to storing the raw JSON with an empty text.
fn transcript_from_result(result: Option<Value>) -> NewTranscript {
    let Some(value) = result else {
        return NewTranscript::default();
    };
    NewTranscript {
        text: value
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        language: value
            .get("language")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        result_json: serde_json::to_string(&value).ok(),
    }
}

/// The model's free-form answer lives at `risk_analysis.raw_response`;
/// older worker builds returned a bare string instead.
fn raw_response_from_result(result: Option<&Value>) -> String {
    let Some(value) = result else {
        return String::new();
    };
    if let Some(raw) = value
        .pointer("/risk_analysis/raw_response")
        .and_then(Value::as_str)
    {
        return raw.to_string();
    }
    if let Some(raw) = value.as_str() {
        return raw.to_string();
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::JobDimensions;
    use serde_json::json;

    async fn tracked(db: &Database, kind: JobKind, handle: &str, target: Option<&str>) {
        let record = db
            .create_tracking(kind, None, JobDimensions::default(), target)
            .await
            .unwrap();
        db.attach_handle(&record.id, handle).await.unwrap();
    }

    #[tokio::test]
    async fn completion_promotes_and_second_observation_is_noop() {
        let db = Database::open_in_memory().await.unwrap();
        tracked(&db, JobKind::Transcription, "h-1", None).await;
        let reconciler = Reconciler::new(db.clone());

        let first = reconciler
            .apply(Observation::Completed {
                handle: "h-1".to_string(),
                result: Some(json!({"text": "สวัสดีครับ", "language": "th"})),
            })
            .await
            .unwrap();
        let record = match first {
            Applied::Promoted(r) => r,
            other => panic!("expected promotion, got {other:?}"),
        };
        assert_eq!(record.text, "สวัสดีครับ");
        assert_eq!(record.language.as_deref(), Some("th"));

        // The losing channel reports the same completion moments later.
        let second = reconciler
            .apply(Observation::Completed {
                handle: "h-1".to_string(),
                result: Some(json!({"text": "duplicate"})),
            })
            .await
            .unwrap();
        assert!(matches!(second, Applied::AlreadySettled));
        assert_eq!(db.list_transcripts(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failure_after_completion_does_not_unsettle() {
        let db = Database::open_in_memory().await.unwrap();
        tracked(&db, JobKind::Transcription, "h-2", None).await;
        let reconciler = Reconciler::new(db.clone());

        reconciler
            .apply(Observation::Completed {
                handle: "h-2".to_string(),
                result: Some(json!({"text": "ok"})),
            })
            .await
            .unwrap();

        let late = reconciler
            .apply(Observation::Failed {
                handle: "h-2".to_string(),
                error: "spurious".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(late, Applied::AlreadySettled));
        assert!(db.get_transcript_by_handle("h-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn risk_completion_classifies_and_attaches() {
        let db = Database::open_in_memory().await.unwrap();
        tracked(&db, JobKind::Transcription, "h-3", None).await;
        let reconciler = Reconciler::new(db.clone());

        let promoted = match reconciler
            .apply(Observation::Completed {
                handle: "h-3".to_string(),
                result: Some(json!({"text": "โอนเงินมาเลย"})),
            })
            .await
            .unwrap()
        {
            Applied::Promoted(r) => r,
            other => panic!("expected promotion, got {other:?}"),
        };

        db.set_risk_analyzing(&promoted.id).await.unwrap();
        tracked(&db, JobKind::RiskAnalysis, "h-4", Some(&promoted.id)).await;

        let applied = reconciler
            .apply(Observation::Completed {
                handle: "h-4".to_string(),
                result: Some(json!({
                    "text": "โอนเงินมาเลย",
                    "risk_analysis": {
                        "is_risky": true,
                        "raw_response": "ข้อความนี้เข้าข่ายผิด",
                        "confidence": 0.9
                    }
                })),
            })
            .await
            .unwrap();
        let updated = match applied {
            Applied::VerdictRecorded(r) => r,
            other => panic!("expected verdict, got {other:?}"),
        };
        assert_eq!(updated.risk_verdict.as_deref(), Some("risky"));
        assert_eq!(updated.risk_status, "completed");
    }

    #[tokio::test]
    async fn risk_failure_marks_target_record() {
        let db = Database::open_in_memory().await.unwrap();
        tracked(&db, JobKind::Transcription, "h-5", None).await;
        let reconciler = Reconciler::new(db.clone());

        let promoted = match reconciler
            .apply(Observation::Completed {
                handle: "h-5".to_string(),
                result: Some(json!({"text": "ok"})),
            })
            .await
            .unwrap()
        {
            Applied::Promoted(r) => r,
            other => panic!("expected promotion, got {other:?}"),
        };
        db.set_risk_analyzing(&promoted.id).await.unwrap();
        tracked(&db, JobKind::RiskAnalysis, "h-6", Some(&promoted.id)).await;

        reconciler
            .apply(Observation::Failed {
                handle: "h-6".to_string(),
                error: "model crashed".to_string(),
            })
            .await
            .unwrap();

        let record = db.get_transcript(&promoted.id).await.unwrap().unwrap();
        assert_eq!(record.risk_status, "failed");
    }

    #[test]
    fn raw_response_falls_back_through_shapes() {
        assert_eq!(
            raw_response_from_result(Some(&json!({
                "risk_analysis": {"raw_response": "ไม่ผิด"}
            }))),
            "ไม่ผิด"
        );
        assert_eq!(raw_response_from_result(Some(&json!("RISKY"))), "RISKY");
        assert_eq!(
            raw_response_from_result(Some(&json!({"odd": true}))),
            r#"{"odd":true}"#
        );
        assert_eq!(raw_response_from_result(None), "");
    }
}
