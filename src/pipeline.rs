//! Frame pipeline bridge.
//!
//! Decouples the blocking detection/counting loop from async delivery. The
//! two contexts communicate only through a bounded, drop-oldest
//! [`FrameQueue`]: when a new frame arrives and the queue is full, the oldest
//! queued frame is discarded. Counts travel with every frame as cumulative
//! snapshots, so dropping an intermediate frame loses image delivery but
//! never counting information.

use crate::source::DetectionSource;
use crate::zones::ZoneCounter;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One processed frame ready for delivery.
#[derive(Debug, Clone)]
pub struct FrameMessage {
    /// Media timestamp in seconds
    pub timestamp: f64,
    /// Encoded (JPEG) frame data
    pub image: Bytes,
    /// Cumulative per-zone tallies at this frame
    pub counts: BTreeMap<usize, u64>,
}

#[derive(Debug, Default)]
struct QueueInner {
    frames: VecDeque<FrameMessage>,
    closed: bool,
    error: Option<String>,
}

/// Bounded single-consumer queue with drop-oldest overflow.
///
/// The producer side is synchronous (called from the blocking pipeline
/// loop); the consumer side is async. Closing the queue wakes the consumer,
/// which drains remaining frames and then observes `None`.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        })
    }

    /// Push a frame, discarding the oldest queued frame on overflow.
    /// Returns true if an older frame was displaced. Pushes after close are
    /// ignored.
    pub fn push(&self, frame: FrameMessage) -> bool {
        let displaced = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            let mut displaced = false;
            if inner.frames.len() >= self.capacity {
                inner.frames.pop_front();
                displaced = true;
            }
            inner.frames.push_back(frame);
            displaced
        };
        self.notify.notify_one();
        displaced
    }

    /// Close the queue normally (end of stream).
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    /// Close the queue carrying a terminal pipeline error for the consumer.
    pub fn close_with_error(&self, error: impl Into<String>) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            if inner.error.is_none() {
                inner.error = Some(error.into());
            }
        }
        self.notify.notify_one();
    }

    /// Receive the next frame; `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<FrameMessage> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Terminal error recorded at close, if any.
    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Statistics for one pipeline run.
#[derive(Debug, Default, Clone)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub events_emitted: u64,
}

/// Spawn the blocking detection/counting loop on the blocking thread pool.
///
/// The loop checks the cancellation token at each iteration boundary, so
/// teardown latency is bounded by one frame's processing time. On end of
/// stream the queue closes normally; on a source error it closes carrying
/// the error message. The source is released on every exit path before the
/// task returns.
pub fn spawn_pipeline(
    mut source: Box<dyn DetectionSource>,
    mut counter: ZoneCounter,
    queue: Arc<FrameQueue>,
    token: CancellationToken,
) -> JoinHandle<PipelineStats> {
    tokio::task::spawn_blocking(move || {
        let mut stats = PipelineStats::default();

        loop {
            if token.is_cancelled() {
                debug!("Pipeline stop signal observed");
                break;
            }

            match source.next_frame() {
                Ok(Some(frame)) => {
                    let update = counter.update(frame.timestamp, &frame.detections);
                    stats.frames_processed += 1;
                    stats.events_emitted += update.events.len() as u64;

                    let displaced = queue.push(FrameMessage {
                        timestamp: frame.timestamp,
                        image: frame.image,
                        counts: update.counts,
                    });
                    if displaced {
                        stats.frames_dropped += 1;
                        metrics::counter!("zonewatch.pipeline.frames_dropped").increment(1);
                    }
                    metrics::counter!("zonewatch.pipeline.frames_processed").increment(1);
                }
                Ok(None) => {
                    info!(
                        frames = stats.frames_processed,
                        "Detection source reached end of stream"
                    );
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Detection source failed");
                    queue.close_with_error(e.to_string());
                    break;
                }
            }
        }

        source.close();
        queue.close();
        stats
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceError, SourceFrame, TrackedDetection};
    use crate::zones::Zone;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn frame_message(timestamp: f64) -> FrameMessage {
        FrameMessage {
            timestamp,
            image: Bytes::from_static(b"jpeg"),
            counts: BTreeMap::new(),
        }
    }

    fn test_counter() -> ZoneCounter {
        ZoneCounter::new(vec![Zone::rectangle(0.0, 0.0, 0.5, 0.5)], None, 0.4, 30).unwrap()
    }

    /// Scripted source: yields queued frames, then an optional terminal
    /// error, then end of stream. Records whether close() ran.
    struct ScriptedSource {
        frames: VecDeque<SourceFrame>,
        fail_at_end: Option<String>,
        released: Arc<AtomicBool>,
        block_forever: bool,
    }

    impl ScriptedSource {
        fn new(frames: Vec<SourceFrame>) -> (Self, Arc<AtomicBool>) {
            let released = Arc::new(AtomicBool::new(false));
            (
                Self {
                    frames: frames.into(),
                    fail_at_end: None,
                    released: released.clone(),
                    block_forever: false,
                },
                released,
            )
        }

        fn frame(timestamp: f64) -> SourceFrame {
            SourceFrame {
                timestamp,
                image: Bytes::from_static(b"jpeg"),
                detections: vec![TrackedDetection {
                    track_id: 1,
                    class_label: "car".to_string(),
                    confidence: 0.9,
                    bbox: [0.2, 0.2, 0.3, 0.3],
                }],
            }
        }
    }

    impl DetectionSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<SourceFrame>, SourceError> {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(Some(frame));
            }
            if let Some(message) = self.fail_at_end.take() {
                return Err(SourceError::Read(message));
            }
            if self.block_forever {
                // Live sources pace themselves by capture rate
                std::thread::sleep(std::time::Duration::from_millis(2));
                return Ok(Some(Self::frame(0.0)));
            }
            Ok(None)
        }

        fn close(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_on_overflow() {
        let queue = FrameQueue::new(2);

        queue.push(frame_message(1.0));
        queue.push(frame_message(2.0));
        let displaced = queue.push(frame_message(3.0));
        assert!(displaced);
        assert_eq!(queue.len(), 2);

        // Draining yields exactly the 2nd and 3rd frames, in order
        queue.close();
        assert_eq!(queue.recv().await.unwrap().timestamp, 2.0);
        assert_eq!(queue.recv().await.unwrap().timestamp, 3.0);
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = FrameQueue::new(2);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };

        tokio::task::yield_now().await;
        queue.push(frame_message(1.0));

        let received = consumer.await.unwrap().unwrap();
        assert_eq!(received.timestamp, 1.0);
    }

    #[tokio::test]
    async fn test_close_with_error_carries_message() {
        let queue = FrameQueue::new(2);
        queue.close_with_error("camera disconnected");

        assert!(queue.recv().await.is_none());
        assert_eq!(queue.error().as_deref(), Some("camera disconnected"));

        // Pushes after close are ignored
        queue.push(frame_message(1.0));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_end_of_stream() {
        let (source, released) = ScriptedSource::new(vec![
            ScriptedSource::frame(0.0),
            ScriptedSource::frame(0.033),
        ]);
        let queue = FrameQueue::new(4);
        let token = CancellationToken::new();

        let handle = spawn_pipeline(Box::new(source), test_counter(), queue.clone(), token);
        let stats = handle.await.unwrap();

        assert_eq!(stats.frames_processed, 2);
        assert!(released.load(Ordering::SeqCst));
        assert!(queue.is_closed());
        assert!(queue.error().is_none());

        // Both frames delivered with cumulative counts
        let first = queue.recv().await.unwrap();
        assert_eq!(first.counts[&0], 1);
        let second = queue.recv().await.unwrap();
        assert_eq!(second.counts[&0], 1);
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pipeline_source_error_reaches_queue() {
        let (mut source, released) = ScriptedSource::new(vec![ScriptedSource::frame(0.0)]);
        source.fail_at_end = Some("device disconnect".to_string());
        let queue = FrameQueue::new(4);
        let token = CancellationToken::new();

        let handle = spawn_pipeline(Box::new(source), test_counter(), queue.clone(), token);
        let stats = handle.await.unwrap();

        assert_eq!(stats.frames_processed, 1);
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(
            queue.error().as_deref(),
            Some("Failed to read frame: device disconnect")
        );
    }

    #[tokio::test]
    async fn test_cancellation_releases_source() {
        let (mut source, released) = ScriptedSource::new(vec![]);
        source.block_forever = true;
        let queue = FrameQueue::new(2);
        let token = CancellationToken::new();

        let handle = spawn_pipeline(
            Box::new(source),
            test_counter(),
            queue.clone(),
            token.clone(),
        );

        // Let the loop produce a few frames, then signal stop
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel();

        let stats = handle.await.unwrap();
        assert!(stats.frames_processed > 0);
        assert!(released.load(Ordering::SeqCst));
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_overflow_keeps_latest_counts() {
        let frames = vec![
            ScriptedSource::frame(0.0),
            ScriptedSource::frame(0.033),
            ScriptedSource::frame(0.066),
        ];
        let (source, _released) = ScriptedSource::new(frames);
        let queue = FrameQueue::new(2);
        let token = CancellationToken::new();

        let stats = spawn_pipeline(Box::new(source), test_counter(), queue.clone(), token)
            .await
            .unwrap();

        assert_eq!(stats.frames_processed, 3);
        assert_eq!(stats.frames_dropped, 1);

        // The newest frame still carries the full cumulative tally
        let mut last = None;
        while let Some(frame) = queue.recv().await {
            last = Some(frame);
        }
        assert_eq!(last.unwrap().counts[&0], 1);
    }
}
