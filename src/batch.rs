//! Batch job runner.
//!
//! Processes an uploaded file end to end: marks the job processing, drives
//! the blocking detection/counting loop on the blocking pool, persists
//! throttled progress, and on completion records the final count and hands
//! the event log to the analytics store. An analytics ingestion failure is
//! a warning, not a job failure; the detection results remain valid.

use crate::analytics::AnalyticsStore;
use crate::jobs::{JobRecord, JobStatus, JobStore};
use crate::source::{DetectionSource, SourceDescriptor, SourceError, SourceFactory};
use crate::zones::{CountingEvent, ZoneCounter};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of a completed batch run.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub final_count: u64,
    pub frames_processed: u64,
    pub events: u64,
}

/// Run one batch job to completion.
///
/// Terminal status is always written: `completed` with the final count on
/// success, `failed` with the error string on a source failure.
pub async fn run_batch_job(
    jobs: JobStore,
    analytics: AnalyticsStore,
    factory: Arc<dyn SourceFactory>,
    job: JobRecord,
    track_grace_frames: u64,
    progress_interval: Duration,
) -> Result<BatchOutcome> {
    let job_id = Uuid::parse_str(&job.id).context("Invalid job id")?;

    let zones = job.zone_list().context("Malformed zone list")?;
    let counter = ZoneCounter::new(
        zones,
        job.target_class.clone(),
        job.confidence,
        track_grace_frames,
    )
    .context("Invalid zone configuration")?;

    let descriptor = SourceDescriptor::from_job(&job.source_type, &job.source)
        .context("Invalid source descriptor")?;
    let mut source = factory
        .open(&descriptor, &job.detector_options())
        .context("Failed to open detection source")?;

    jobs.set_status(job_id, JobStatus::Processing).await?;
    info!(job_id = %job_id, source = %job.source, "Batch processing started");

    let total_frames = source.frame_count_hint();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u8>();

    let worker = tokio::task::spawn_blocking(move || {
        run_counting_loop(
            &mut *source,
            counter,
            total_frames,
            progress_tx,
            progress_interval,
        )
    });

    // Drain throttled progress updates while the worker runs; the channel
    // closes when the worker drops its sender.
    while let Some(progress) = progress_rx.recv().await {
        if let Err(e) = jobs.set_progress(job_id, progress).await {
            warn!(job_id = %job_id, error = %e, "Failed to persist progress");
        }
    }

    let result = worker.await.context("Batch worker panicked")?;

    match result {
        Ok(loop_result) => {
            let final_count = loop_result.counter.total_count();
            jobs.mark_completed(job_id, final_count as i64).await?;

            if let Err(e) = analytics.insert_batch(job_id, &loop_result.events).await {
                warn!(
                    job_id = %job_id,
                    error = %e,
                    "Analytics ingestion failed; detection results remain valid"
                );
            }

            metrics::counter!("zonewatch.batch.jobs_completed").increment(1);
            Ok(BatchOutcome {
                final_count,
                frames_processed: loop_result.frames,
                events: loop_result.events.len() as u64,
            })
        }
        Err(e) => {
            jobs.mark_failed(job_id, &e.to_string()).await?;
            metrics::counter!("zonewatch.batch.jobs_failed").increment(1);
            Err(e).context("Batch processing failed")
        }
    }
}

struct LoopResult {
    counter: ZoneCounter,
    events: Vec<CountingEvent>,
    frames: u64,
}

/// The blocking half: read every frame, feed the engine, report progress at
/// most once per interval. The source is released on every exit path.
fn run_counting_loop(
    source: &mut dyn DetectionSource,
    mut counter: ZoneCounter,
    total_frames: Option<u64>,
    progress_tx: mpsc::UnboundedSender<u8>,
    progress_interval: Duration,
) -> Result<LoopResult, SourceError> {
    let mut events = Vec::new();
    let mut frames = 0u64;
    let mut last_report: Option<Instant> = None;

    loop {
        match source.next_frame() {
            Ok(Some(frame)) => {
                frames += 1;
                let update = counter.update(frame.timestamp, &frame.detections);
                events.extend(update.events);

                if let Some(total) = total_frames.filter(|&t| t > 0) {
                    let due = last_report
                        .map(|at| at.elapsed() >= progress_interval)
                        .unwrap_or(true);
                    if due {
                        let progress = ((frames * 100) / total).min(99) as u8;
                        let _ = progress_tx.send(progress);
                        last_report = Some(Instant::now());
                    }
                }
            }
            Ok(None) => {
                source.close();
                return Ok(LoopResult {
                    counter,
                    events,
                    frames,
                });
            }
            Err(e) => {
                source.close();
                return Err(e);
            }
        }
    }
}
