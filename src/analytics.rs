//! Analytics store.
//!
//! Append-only ingestion of counting events plus the aggregation queries
//! behind the dashboard: grid heatmap, per-class totals, and the cumulative
//! count timeline that backs CSV export. Reads are plain SQL aggregations
//! and are safe to run concurrently with ingestion for other jobs.

use crate::zones::CountingEvent;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Centers are clamped into [0, CENTER_MAX] at ingestion so grid bucketing
/// always lands in 0..grid_size.
const CENTER_MAX: f64 = 1.0 - 1e-9;

/// One non-empty heatmap grid cell
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct HeatmapBucket {
    pub x: i64,
    pub y: i64,
    pub value: i64,
}

/// Total detections per class for one job
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct ClassCount {
    #[serde(rename = "class")]
    pub class_name: String,
    pub count: i64,
}

/// One counting moment with the cumulative tally at that point
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimelinePoint {
    pub timestamp: f64,
    pub count: u64,
}

/// Analytics store over the append-only detections table
#[derive(Clone)]
pub struct AnalyticsStore {
    pool: SqlitePool,
}

impl AnalyticsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Bulk-append counting events for a job.
    ///
    /// Callers submit once per job after processing completes, so no dedup
    /// is needed. Centers are the bbox centroids, clamped into [0, 1).
    #[instrument(skip(self, events), fields(job_id = %job_id, events = events.len()))]
    pub async fn insert_batch(&self, job_id: Uuid, events: &[CountingEvent]) -> Result<u64> {
        if events.is_empty() {
            return Ok(0);
        }

        let job_key = job_id.to_string();
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        for event in events {
            let [x1, y1, x2, y2] = event.bbox;
            let cx = ((x1 + x2) / 2.0).clamp(0.0, CENTER_MAX);
            let cy = ((y1 + y2) / 2.0).clamp(0.0, CENTER_MAX);

            sqlx::query(
                r#"
                INSERT INTO detections (
                    job_id, track_id, timestamp, zone_index, class_name,
                    confidence, bbox_x1, bbox_y1, bbox_x2, bbox_y2,
                    center_x, center_y, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job_key)
            .bind(event.track_id)
            .bind(event.timestamp)
            .bind(event.zone_index as i64)
            .bind(&event.class_label)
            .bind(event.confidence)
            .bind(x1)
            .bind(y1)
            .bind(x2)
            .bind(y2)
            .bind(cx)
            .bind(cy)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert detection record")?;
        }

        tx.commit().await.context("Failed to commit transaction")?;

        debug!(inserted = events.len(), "Detection events ingested");
        metrics::counter!("zonewatch.analytics.events_ingested").increment(events.len() as u64);

        Ok(events.len() as u64)
    }

    /// Bucket detection centers into a grid_size x grid_size histogram.
    ///
    /// CAST truncates toward zero, which equals floor for the clamped
    /// non-negative centers, so every record lands in 0..grid_size.
    #[instrument(skip(self))]
    pub async fn heatmap(&self, job_id: Uuid, grid_size: u32) -> Result<Vec<HeatmapBucket>> {
        let buckets = sqlx::query_as::<_, HeatmapBucket>(
            r#"
            SELECT x, y, COUNT(*) AS value FROM (
                SELECT CAST(center_x * ? AS INTEGER) AS x,
                       CAST(center_y * ? AS INTEGER) AS y
                FROM detections
                WHERE job_id = ?
            )
            GROUP BY x, y
            ORDER BY x, y
            "#,
        )
        .bind(grid_size as i64)
        .bind(grid_size as i64)
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to aggregate heatmap")?;

        Ok(buckets)
    }

    /// Total detections per class observed in this job's records.
    #[instrument(skip(self))]
    pub async fn class_counts(&self, job_id: Uuid) -> Result<Vec<ClassCount>> {
        let counts = sqlx::query_as::<_, ClassCount>(
            r#"
            SELECT class_name, COUNT(*) AS count
            FROM detections
            WHERE job_id = ?
            GROUP BY class_name
            ORDER BY count DESC, class_name ASC
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to aggregate class counts")?;

        Ok(counts)
    }

    /// Counting moments in event order with the cumulative count at each.
    pub async fn count_timeline(&self, job_id: Uuid) -> Result<Vec<TimelinePoint>> {
        let timestamps: Vec<(f64,)> = sqlx::query_as(
            r#"
            SELECT timestamp FROM detections
            WHERE job_id = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to load count timeline")?;

        Ok(timestamps
            .into_iter()
            .enumerate()
            .map(|(i, (timestamp,))| TimelinePoint {
                timestamp,
                count: i as u64 + 1,
            })
            .collect())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
