//! Job store.
//!
//! Persistence for counting jobs. The core reads the zone list, class
//! filter, confidence, and source descriptor, and writes progress, terminal
//! status, error message, and the final count. Batch jobs move
//! pending -> processing -> completed | failed; live jobs move
//! active -> stopped.

use crate::source::DetectorOptions;
use crate::zones::Zone;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors from the job store.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    #[error("Malformed zone list: {0}")]
    MalformedZones(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Active,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Active => "active",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Result<Self, JobError> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "active" => Ok(JobStatus::Active),
            "stopped" => Ok(JobStatus::Stopped),
            other => Err(JobError::InvalidStatus(other.to_string())),
        }
    }
}

/// A stored job row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRecord {
    /// Job identifier (UUID)
    pub id: String,
    /// Display name
    pub name: String,
    /// Source descriptor payload: file path, stream URL, or device index
    pub source: String,
    /// Source kind: file, rtsp, or webcam
    pub source_type: String,
    /// Only count this class (None = all classes)
    pub target_class: Option<String>,
    /// Minimum confidence for counting
    pub confidence: f64,
    /// Zone list as JSON
    pub zones: String,
    /// Lifecycle status
    pub status: String,
    /// Progress percentage (0-100)
    pub progress: i64,
    /// Error message for failed jobs
    pub error: Option<String>,
    /// Final total count across zones
    pub final_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Deserialize the zone list.
    pub fn zone_list(&self) -> Result<Vec<Zone>, JobError> {
        Ok(serde_json::from_str(&self.zones)?)
    }

    /// Parse the stored status.
    pub fn job_status(&self) -> Result<JobStatus, JobError> {
        JobStatus::parse(&self.status)
    }

    /// Oracle options derived from this job's configuration.
    pub fn detector_options(&self) -> DetectorOptions {
        DetectorOptions {
            target_class: self.target_class.clone(),
            min_confidence: self.confidence,
            tracker_config: None,
        }
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub source: String,
    pub source_type: String,
    pub target_class: Option<String>,
    pub confidence: f64,
    pub zones: Vec<Zone>,
}

/// Job store backed by SQLite.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a job. Live sources start `active`-eligible but are stored as
    /// `pending` until a session or batch run picks them up.
    #[instrument(skip(self, new), fields(name = %new.name, source_type = %new.source_type))]
    pub async fn create(&self, new: NewJob) -> Result<JobRecord, JobError> {
        let id = Uuid::new_v4();
        let zones = serde_json::to_string(&new.zones)?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, source, source_type, target_class, confidence,
                zones, status, progress, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&new.name)
        .bind(&new.source)
        .bind(&new.source_type)
        .bind(&new.target_class)
        .bind(new.confidence)
        .bind(&zones)
        .bind(JobStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(job_id = %id, "Job created");

        self.get(id).await?.ok_or(JobError::NotFound(id))
    }

    /// Get a job by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, JobError> {
        let job = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, name, source, source_type, target_class, confidence,
                   zones, status, progress, error, final_count,
                   created_at, updated_at
            FROM jobs
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// List all jobs, newest first.
    pub async fn list(&self) -> Result<Vec<JobRecord>, JobError> {
        let jobs = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, name, source, source_type, target_class, confidence,
                   zones, status, progress, error, final_count,
                   created_at, updated_at
            FROM jobs
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Set the lifecycle status.
    pub async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<(), JobError> {
        let result = sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(id));
        }
        debug!(job_id = %id, status = status.as_str(), "Job status updated");
        Ok(())
    }

    /// Write a progress percentage. Callers throttle; this writes through.
    pub async fn set_progress(&self, id: Uuid, progress: u8) -> Result<(), JobError> {
        sqlx::query("UPDATE jobs SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(progress.min(100) as i64)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal success: completed, full progress, final count recorded.
    pub async fn mark_completed(&self, id: Uuid, final_count: i64) -> Result<(), JobError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, progress = 100, final_count = ?, error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(JobStatus::Completed.as_str())
        .bind(final_count)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(id));
        }
        info!(job_id = %id, final_count, "Job completed");
        Ok(())
    }

    /// Terminal failure with a stored error string.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(id));
        }
        info!(job_id = %id, error, "Job failed");
        Ok(())
    }

    /// Rename a job.
    pub async fn rename(&self, id: Uuid, name: &str) -> Result<(), JobError> {
        let result = sqlx::query("UPDATE jobs SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(id));
        }
        Ok(())
    }

    /// Delete a job row.
    pub async fn delete(&self, id: Uuid) -> Result<bool, JobError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> JobStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        JobStore::new(pool)
    }

    fn new_job(source_type: &str) -> NewJob {
        NewJob {
            name: "Loading dock cam".to_string(),
            source: "demo.jsonl".to_string(),
            source_type: source_type.to_string(),
            target_class: Some("truck".to_string()),
            confidence: 0.4,
            zones: vec![Zone::rectangle(0.0, 0.0, 0.5, 0.5)],
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = test_store().await;
        let job = store.create(new_job("file")).await.unwrap();

        assert_eq!(job.status, "pending");
        assert_eq!(job.progress, 0);
        assert_eq!(job.target_class.as_deref(), Some("truck"));

        let id = Uuid::parse_str(&job.id).unwrap();
        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Loading dock cam");
        assert_eq!(fetched.zone_list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_lifecycle() {
        let store = test_store().await;
        let job = store.create(new_job("file")).await.unwrap();
        let id = Uuid::parse_str(&job.id).unwrap();

        store.set_status(id, JobStatus::Processing).await.unwrap();
        store.set_progress(id, 40).await.unwrap();
        let mid = store.get(id).await.unwrap().unwrap();
        assert_eq!(mid.job_status().unwrap(), JobStatus::Processing);
        assert_eq!(mid.progress, 40);

        store.mark_completed(id, 17).await.unwrap();
        let done = store.get(id).await.unwrap().unwrap();
        assert_eq!(done.job_status().unwrap(), JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.final_count, Some(17));
    }

    #[tokio::test]
    async fn test_failure_stores_error() {
        let store = test_store().await;
        let job = store.create(new_job("file")).await.unwrap();
        let id = Uuid::parse_str(&job.id).unwrap();

        store.mark_failed(id, "decode failure").await.unwrap();
        let failed = store.get(id).await.unwrap().unwrap();
        assert_eq!(failed.job_status().unwrap(), JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("decode failure"));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let store = test_store().await;
        let missing = Uuid::new_v4();

        assert!(store.get(missing).await.unwrap().is_none());
        assert!(matches!(
            store.set_status(missing, JobStatus::Stopped).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let store = test_store().await;
        let job = store.create(new_job("rtsp")).await.unwrap();
        let id = Uuid::parse_str(&job.id).unwrap();

        store.rename(id, "North gate").await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().name, "North gate");

        assert!(store.delete(id).await.unwrap());
        assert!(store.get(id).await.unwrap().is_none());
        assert!(!store.delete(id).await.unwrap());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Active,
            JobStatus::Stopped,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("paused").is_err());
    }
}
