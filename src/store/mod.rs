//! SQLite-backed storage for tracking and permanent records.
//!
//! The `Database` handle is injected explicitly wherever storage is needed
//! (opened once at process start, closed at shutdown); it is cheap to clone
//! because the underlying pool is shared.

use crate::estimate::JobDimensions;
use crate::protocol::{JobKind, JobState};
use crate::{RelayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{migrate::MigrateDatabase, Pool, Sqlite};
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

/// Provisional bookkeeping row for a job, created before any network call.
/// At most one exists per outstanding handle; promotion deletes it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrackingRecord {
    pub id: String,
    pub handle: Option<String>,
    pub kind: String,
    pub state: String,
    /// Fractional progress in [0,1], non-decreasing while processing.
    pub progress: f64,
    pub file_name: Option<String>,
    pub size_bytes: i64,
    pub duration_secs: f64,
    /// For risk-analysis jobs: the permanent record the verdict attaches to.
    pub target_record_id: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl TrackingRecord {
    pub fn lifecycle_state(&self) -> JobState {
        JobState::parse(&self.state).unwrap_or(JobState::Pending)
    }

    pub fn job_kind(&self) -> JobKind {
        JobKind::parse(&self.kind).unwrap_or(JobKind::Transcription)
    }

    pub fn dimensions(&self) -> JobDimensions {
        JobDimensions::new(self.size_bytes.max(0) as u64, self.duration_secs)
    }
}

/// Durable result row, created only on successful completion.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TranscriptRecord {
    pub id: String,
    pub handle: String,
    pub kind: String,
    pub text: String,
    pub language: Option<String>,
    pub result_json: Option<String>,
    pub file_name: Option<String>,
    pub size_bytes: i64,
    pub duration_secs: f64,
    pub elapsed_secs: f64,
    pub created_at: String,
    pub completed_at: String,
    /// Risk verdict lifecycle, independent of the job lifecycle:
    /// not_analyzed | analyzing | completed | failed.
    pub risk_status: String,
    pub risk_verdict: Option<String>,
    pub risk_confidence: Option<f64>,
    pub risk_raw_response: Option<String>,
    pub risk_analyzed_at: Option<String>,
}

/// Payload for promoting a completed transcription.
#[derive(Debug, Clone, Default)]
pub struct NewTranscript {
    pub text: String,
    pub language: Option<String>,
    pub result_json: Option<String>,
}

/// Outcome of a terminal-settlement attempt. `AlreadySettled` means another
/// observation channel got there first and this write was a no-op.
#[derive(Debug)]
pub enum Settlement {
    Promoted(TranscriptRecord),
    MarkedFailed(TrackingRecord),
    VerdictRecorded(TranscriptRecord),
    AlreadySettled,
}

pub struct Database {
    pool: Pool<Sqlite>,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl Database {
    pub async fn open(db_path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}", db_path.display());

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            Sqlite::create_database(&db_url).await?;
        }

        let pool = SqlitePoolOptions::new().connect(&db_url).await?;
        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    /// In-memory database for tests. One connection, or each checkout would
    /// see a different empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracking_records (
                id TEXT PRIMARY KEY,
                handle TEXT UNIQUE,
                kind TEXT NOT NULL,
                state TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0.0,
                file_name TEXT,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                duration_secs REAL NOT NULL DEFAULT 0.0,
                target_record_id TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tracking_handle ON tracking_records(handle);
            CREATE INDEX IF NOT EXISTS idx_tracking_state ON tracking_records(state);

            CREATE TABLE IF NOT EXISTS transcripts (
                id TEXT PRIMARY KEY,
                handle TEXT UNIQUE NOT NULL,
                kind TEXT NOT NULL,
                text TEXT NOT NULL,
                language TEXT,
                result_json TEXT,
                file_name TEXT,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                duration_secs REAL NOT NULL DEFAULT 0.0,
                elapsed_secs REAL NOT NULL DEFAULT 0.0,
                created_at TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                risk_status TEXT NOT NULL DEFAULT 'not_analyzed',
                risk_verdict TEXT,
                risk_confidence REAL,
                risk_raw_response TEXT,
                risk_analyzed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_transcripts_created_at ON transcripts(created_at);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Tracking records
    // -------------------------------------------------------------------

    /// Create a Pending tracking row. Called before any network side effect
    /// so a crash mid-submission still leaves a recoverable trace.
    pub async fn create_tracking(
        &self,
        kind: JobKind,
        file_name: Option<&str>,
        dims: JobDimensions,
        target_record_id: Option<&str>,
    ) -> Result<TrackingRecord> {
        let record = TrackingRecord {
            id: Uuid::new_v4().to_string(),
            handle: None,
            kind: kind.as_str().to_string(),
            state: JobState::Pending.as_str().to_string(),
            progress: 0.0,
            file_name: file_name.map(|s| s.to_string()),
            size_bytes: dims.size_bytes as i64,
            duration_secs: dims.duration_secs,
            target_record_id: target_record_id.map(|s| s.to_string()),
            error: None,
            created_at: Utc::now().to_rfc3339(),
            started_at: None,
            completed_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO tracking_records
                (id, handle, kind, state, progress, file_name, size_bytes,
                 duration_secs, target_record_id, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.handle)
        .bind(&record.kind)
        .bind(&record.state)
        .bind(record.progress)
        .bind(&record.file_name)
        .bind(record.size_bytes)
        .bind(record.duration_secs)
        .bind(&record.target_record_id)
        .bind(&record.error)
        .bind(&record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    /// Attach the worker-issued handle and advance Pending -> Processing.
    pub async fn attach_handle(&self, id: &str, handle: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tracking_records SET handle = ?, state = 'processing', started_at = ? \
             WHERE id = ? AND state = 'pending'",
        )
        .bind(handle)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("tracking record {id}")));
        }
        Ok(())
    }

    /// Mark a submission failure. The row keeps no handle and stays queryable.
    pub async fn mark_tracking_failed(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tracking_records SET state = 'failed', error = ?, completed_at = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancellation stops local observation only; a late completion may
    /// still promote, so `cancelled` is not treated as settled by the
    /// terminal compare-and-set.
    pub async fn cancel_tracking(&self, handle: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tracking_records SET state = 'cancelled' \
             WHERE handle = ? AND state IN ('pending', 'processing')",
        )
        .bind(handle)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Persist incremental progress (fraction in [0,1]). Last-write-wins is
    /// fine: both observation channels are monotonic by construction.
    pub async fn record_progress(&self, handle: &str, progress: f64) -> Result<()> {
        sqlx::query(
            "UPDATE tracking_records SET progress = ? \
             WHERE handle = ? AND state = 'processing'",
        )
        .bind(progress.clamp(0.0, 1.0))
        .bind(handle)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_tracking(&self, id: &str) -> Result<Option<TrackingRecord>> {
        Ok(
            sqlx::query_as::<_, TrackingRecord>("SELECT * FROM tracking_records WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn get_tracking_by_handle(&self, handle: &str) -> Result<Option<TrackingRecord>> {
        Ok(sqlx::query_as::<_, TrackingRecord>(
            "SELECT * FROM tracking_records WHERE handle = ?",
        )
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn list_tracking(&self) -> Result<Vec<TrackingRecord>> {
        Ok(sqlx::query_as::<_, TrackingRecord>(
            "SELECT * FROM tracking_records ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    // -------------------------------------------------------------------
    // Terminal settlement (the per-handle compare-and-set)
    // -------------------------------------------------------------------

    /// Promote a completed transcription: settle the tracking row, insert
    /// the permanent row, and delete the tracking row in one transaction.
    /// Returns `AlreadySettled` when another channel won the race.
    pub async fn promote_completed(
        &self,
        handle: &str,
        transcript: NewTranscript,
    ) -> Result<Settlement> {
        let mut tx = self.pool.begin().await?;

        let Some(tracking) = sqlx::query_as::<_, TrackingRecord>(
            "SELECT * FROM tracking_records WHERE handle = ?",
        )
        .bind(handle)
        .fetch_optional(&mut *tx)
        .await?
        else {
            // Row already promoted and deleted by the other channel.
            return Ok(Settlement::AlreadySettled);
        };

        let settled = sqlx::query(
            "UPDATE tracking_records SET state = 'completed', completed_at = ? \
             WHERE handle = ? AND state NOT IN ('completed', 'failed')",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(handle)
        .execute(&mut *tx)
        .await?;
        if settled.rows_affected() == 0 {
            return Ok(Settlement::AlreadySettled);
        }

        let now = Utc::now();
        let record = TranscriptRecord {
            id: Uuid::new_v4().to_string(),
            handle: handle.to_string(),
            kind: tracking.kind.clone(),
            text: transcript.text,
            language: transcript.language,
            result_json: transcript.result_json,
            file_name: tracking.file_name.clone(),
            size_bytes: tracking.size_bytes,
            duration_secs: tracking.duration_secs,
            elapsed_secs: elapsed_since(&tracking.created_at, now),
            created_at: tracking.created_at.clone(),
            completed_at: now.to_rfc3339(),
            risk_status: "not_analyzed".to_string(),
            risk_verdict: None,
            risk_confidence: None,
            risk_raw_response: None,
            risk_analyzed_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO transcripts
                (id, handle, kind, text, language, result_json, file_name,
                 size_bytes, duration_secs, elapsed_secs, created_at,
                 completed_at, risk_status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.handle)
        .bind(&record.kind)
        .bind(&record.text)
        .bind(&record.language)
        .bind(&record.result_json)
        .bind(&record.file_name)
        .bind(record.size_bytes)
        .bind(record.duration_secs)
        .bind(record.elapsed_secs)
        .bind(&record.created_at)
        .bind(&record.completed_at)
        .bind(&record.risk_status)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tracking_records WHERE handle = ?")
            .bind(handle)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Settlement::Promoted(record))
    }

    /// Settle a completed risk-analysis job by writing the verdict onto its
    /// target permanent record and removing the tracking row.
    pub async fn promote_risk_verdict(
        &self,
        handle: &str,
        verdict: &str,
        confidence: f64,
        raw_response: &str,
    ) -> Result<Settlement> {
        let mut tx = self.pool.begin().await?;

        let Some(tracking) = sqlx::query_as::<_, TrackingRecord>(
            "SELECT * FROM tracking_records WHERE handle = ?",
        )
        .bind(handle)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(Settlement::AlreadySettled);
        };

        let settled = sqlx::query(
            "UPDATE tracking_records SET state = 'completed', completed_at = ? \
             WHERE handle = ? AND state NOT IN ('completed', 'failed')",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(handle)
        .execute(&mut *tx)
        .await?;
        if settled.rows_affected() == 0 {
            return Ok(Settlement::AlreadySettled);
        }

        let Some(target_id) = tracking.target_record_id.clone() else {
            warn!(handle, "risk job has no target record; dropping verdict");
            sqlx::query("DELETE FROM tracking_records WHERE handle = ?")
                .bind(handle)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(Settlement::AlreadySettled);
        };

        sqlx::query(
            "UPDATE transcripts SET risk_status = 'completed', risk_verdict = ?, \
             risk_confidence = ?, risk_raw_response = ?, risk_analyzed_at = ? \
             WHERE id = ?",
        )
        .bind(verdict)
        .bind(confidence)
        .bind(raw_response)
        .bind(Utc::now().to_rfc3339())
        .bind(&target_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tracking_records WHERE handle = ?")
            .bind(handle)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        match self.get_transcript(&target_id).await? {
            Some(record) => Ok(Settlement::VerdictRecorded(record)),
            None => Ok(Settlement::AlreadySettled),
        }
    }

    /// Settle a failed job. The tracking row is kept for operator
    /// inspection; only the state and error change.
    pub async fn settle_failed(&self, handle: &str, error: &str) -> Result<Settlement> {
        let result = sqlx::query(
            "UPDATE tracking_records SET state = 'failed', error = ?, completed_at = ? \
             WHERE handle = ? AND state NOT IN ('completed', 'failed')",
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(Settlement::AlreadySettled);
        }
        match self.get_tracking_by_handle(handle).await? {
            Some(record) => Ok(Settlement::MarkedFailed(record)),
            None => Ok(Settlement::AlreadySettled),
        }
    }

    // -------------------------------------------------------------------
    // Permanent records
    // -------------------------------------------------------------------

    pub async fn get_transcript(&self, id: &str) -> Result<Option<TranscriptRecord>> {
        Ok(
            sqlx::query_as::<_, TranscriptRecord>("SELECT * FROM transcripts WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn get_transcript_by_handle(&self, handle: &str) -> Result<Option<TranscriptRecord>> {
        Ok(
            sqlx::query_as::<_, TranscriptRecord>("SELECT * FROM transcripts WHERE handle = ?")
                .bind(handle)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_transcripts(&self, limit: i64) -> Result<Vec<TranscriptRecord>> {
        Ok(sqlx::query_as::<_, TranscriptRecord>(
            "SELECT * FROM transcripts ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn delete_transcript(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM transcripts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reset the verdict lifecycle for (re-)analysis: status goes back to
    /// analyzing and the analysis timestamp is cleared.
    pub async fn set_risk_analyzing(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE transcripts SET risk_status = 'analyzing', risk_analyzed_at = NULL \
             WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("transcript {id}")));
        }
        Ok(())
    }

    /// A failed analysis submission is never left silently in `analyzing`.
    pub async fn set_risk_failed(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE transcripts SET risk_status = 'failed', risk_raw_response = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn elapsed_since(created_at: &str, now: DateTime<Utc>) -> f64 {
    DateTime::parse_from_rfc3339(created_at)
        .map(|created| (now - created.with_timezone(&Utc)).num_milliseconds() as f64 / 1000.0)
        .unwrap_or(0.0)
        .max(0.0)
}
