//! Zonewatch - zone-crossing video analytics
//!
//! This library implements the counting core of the zonewatch service:
//!
//! - A detection oracle boundary that treats the tracking model as an
//!   opaque frame-in, detections-out source
//! - A zone-crossing engine that turns tracked detections into monotonic
//!   per-zone counts with at-most-once entry semantics
//! - A frame pipeline bridging the blocking detection loop to async
//!   delivery through a bounded drop-oldest queue
//! - A streaming session speaking the frame/ping/error wire protocol
//! - Job and analytics stores backed by SQLite
//!
//! # Example
//!
//! ```rust,no_run
//! use zonewatch::source::{
//!     DetectionSource, DetectorOptions, ReplaySourceFactory, SourceDescriptor, SourceFactory,
//! };
//! use zonewatch::zones::{Zone, ZoneCounter};
//!
//! fn main() -> anyhow::Result<()> {
//!     let factory = ReplaySourceFactory::new();
//!     let descriptor = SourceDescriptor::from_job("file", "demo.jsonl")?;
//!     let mut source = factory.open(&descriptor, &DetectorOptions::default())?;
//!
//!     let zone = Zone::rectangle(0.0, 0.0, 0.5, 0.5);
//!     let mut counter = ZoneCounter::new(vec![zone], None, 0.4, 30)?;
//!
//!     while let Some(frame) = source.next_frame()? {
//!         let update = counter.update(frame.timestamp, &frame.detections);
//!         println!("counts: {:?}", update.counts);
//!     }
//!     Ok(())
//! }
//! ```

pub mod analytics;
pub mod api;
pub mod batch;
pub mod config;
pub mod jobs;
pub mod pipeline;
pub mod session;
pub mod source;
pub mod zones;

// Re-export main types
pub use analytics::{AnalyticsStore, ClassCount, HeatmapBucket, TimelinePoint};
pub use api::{create_router, AppState, LiveSessions};
pub use config::Config;
pub use jobs::{JobRecord, JobStatus, JobStore, NewJob};
pub use pipeline::{spawn_pipeline, FrameMessage, FrameQueue, PipelineStats};
pub use session::{run_session, FrameSink, SessionEnd, WireMessage};
pub use source::{
    DetectionSource, DetectorOptions, SourceDescriptor, SourceError, SourceFactory,
    SourceFrame, TrackedDetection,
};
pub use zones::{CountingEvent, FrameUpdate, Zone, ZoneCounter, ZoneError};
