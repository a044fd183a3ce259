//! Detection oracle boundary.
//!
//! The detection/tracking model is consumed purely through the
//! [`DetectionSource`] capability: frames in, tracked detections out. Any
//! concrete runtime (an ONNX session, a sidecar process, a replay file) can
//! sit behind it without touching the counting logic. Sources are blocking
//! and expected to be driven from a dedicated worker context.

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur at the detection source boundary.
///
/// A `Read` or `Decode` error is fatal for the job: the oracle contract is
/// non-resumable, so callers tear the pipeline down instead of retrying.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Detection source unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to open source: {0}")]
    Open(String),

    #[error("Failed to read frame: {0}")]
    Read(String),

    #[error("Malformed frame record: {0}")]
    Decode(String),

    #[error("Unsupported source descriptor: {0}")]
    UnsupportedDescriptor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single tracked detection produced by the oracle for one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedDetection {
    /// Stable track identifier across frames
    pub track_id: i64,
    /// Detected class label
    pub class_label: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f64,
    /// Bounding box [x1, y1, x2, y2] in normalized 0-1 frame coordinates
    pub bbox: [f64; 4],
}

impl TrackedDetection {
    /// Bounding-box centroid, the reference point for zone containment.
    pub fn center(&self) -> (f64, f64) {
        let [x1, y1, x2, y2] = self.bbox;
        ((x1 + x2) / 2.0, (y1 + y2) / 2.0)
    }
}

/// One frame worth of oracle output.
#[derive(Debug, Clone)]
pub struct SourceFrame {
    /// Media timestamp in seconds, derived from frame order by the oracle
    pub timestamp: f64,
    /// Encoded (JPEG) frame with detection overlays already rendered
    pub image: Bytes,
    /// Tracked detections for this frame
    pub detections: Vec<TrackedDetection>,
}

/// Where a job reads its video from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// An uploaded file on local disk
    File(PathBuf),
    /// An RTSP stream URL
    Rtsp(String),
    /// A local capture device index
    Webcam(u32),
}

impl SourceDescriptor {
    /// Parse a descriptor from the job row's `source_type` + `source` fields.
    pub fn from_job(source_type: &str, source: &str) -> Result<Self, SourceError> {
        match source_type {
            "file" => Ok(SourceDescriptor::File(PathBuf::from(source))),
            "rtsp" => Ok(SourceDescriptor::Rtsp(source.to_string())),
            "webcam" => source
                .parse::<u32>()
                .map(SourceDescriptor::Webcam)
                .map_err(|_| {
                    SourceError::UnsupportedDescriptor(format!(
                        "webcam index must be numeric, got {source:?}"
                    ))
                }),
            other => Err(SourceError::UnsupportedDescriptor(format!(
                "unknown source type {other:?}"
            ))),
        }
    }

    /// Live sources stream indefinitely; file sources have a finite length.
    pub fn is_live(&self) -> bool {
        !matches!(self, SourceDescriptor::File(_))
    }
}

/// Oracle configuration handed through `open`. Opaque to the core except for
/// the filter fields the counting engine shares.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorOptions {
    /// Only count detections of this class (None = all classes)
    pub target_class: Option<String>,
    /// Minimum confidence for a detection to count
    pub min_confidence: f64,
    /// Opaque tracker configuration token forwarded to the oracle
    pub tracker_config: Option<String>,
}

/// Blocking per-frame detection source.
///
/// `next_frame` returns `Ok(None)` at end of stream and `Err` on a fatal
/// source failure. `close` releases the underlying capture resource and must
/// be idempotent; callers invoke it on every exit path.
pub trait DetectionSource: Send {
    fn next_frame(&mut self) -> Result<Option<SourceFrame>, SourceError>;

    /// Total frame count when known up front (file sources), for progress.
    fn frame_count_hint(&self) -> Option<u64> {
        None
    }

    fn close(&mut self);
}

/// Opens detection sources for job descriptors.
pub trait SourceFactory: Send + Sync {
    fn open(
        &self,
        descriptor: &SourceDescriptor,
        options: &DetectorOptions,
    ) -> Result<Box<dyn DetectionSource>, SourceError>;
}

/// One line of a replay manifest: the oracle's output for a single frame,
/// with the encoded frame carried inline as base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRecord {
    /// Media timestamp in seconds
    pub timestamp: f64,
    /// Encoded frame data
    #[serde(with = "base64_serde")]
    pub image: Vec<u8>,
    /// Tracked detections for this frame
    #[serde(default)]
    pub detections: Vec<TrackedDetection>,
}

/// Base64 serialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Replay source: drives the pipeline from a JSONL manifest of pre-computed
/// oracle output. Used for development and integration tests; a production
/// deployment substitutes its own [`SourceFactory`].
pub struct ReplaySource {
    path: PathBuf,
    lines: std::vec::IntoIter<String>,
    total: u64,
    closed: bool,
}

impl ReplaySource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| SourceError::Open(format!("{}: {e}", path.display())))?;

        let lines: Vec<String> = contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();

        info!(path = %path.display(), frames = lines.len(), "Opened replay source");

        Ok(Self {
            path: path.to_path_buf(),
            total: lines.len() as u64,
            lines: lines.into_iter(),
            closed: false,
        })
    }
}

impl DetectionSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<SourceFrame>, SourceError> {
        if self.closed {
            return Ok(None);
        }

        let Some(line) = self.lines.next() else {
            return Ok(None);
        };

        let record: ReplayRecord = serde_json::from_str(&line)
            .map_err(|e| SourceError::Decode(format!("{}: {e}", self.path.display())))?;

        Ok(Some(SourceFrame {
            timestamp: record.timestamp,
            image: Bytes::from(record.image),
            detections: record.detections,
        }))
    }

    fn frame_count_hint(&self) -> Option<u64> {
        Some(self.total)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!(path = %self.path.display(), "Replay source closed");
        }
    }
}

/// Factory for [`ReplaySource`]. Only file descriptors are supported; live
/// descriptors need a real capture-backed oracle.
#[derive(Debug, Default)]
pub struct ReplaySourceFactory;

impl ReplaySourceFactory {
    pub fn new() -> Self {
        Self
    }
}

impl SourceFactory for ReplaySourceFactory {
    fn open(
        &self,
        descriptor: &SourceDescriptor,
        _options: &DetectorOptions,
    ) -> Result<Box<dyn DetectionSource>, SourceError> {
        match descriptor {
            SourceDescriptor::File(path) => {
                Ok(Box::new(ReplaySource::open(path)?) as Box<dyn DetectionSource>)
            }
            other => Err(SourceError::Unavailable(format!(
                "replay factory cannot open live source {other:?}"
            ))),
        }
    }
}

/// Encode frame bytes for the wire.
pub fn encode_frame(image: &[u8]) -> String {
    STANDARD.encode(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_manifest(records: &[ReplayRecord]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("zonewatch-replay-{}.jsonl", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&path).unwrap();
        for record in records {
            writeln!(file, "{}", serde_json::to_string(record).unwrap()).unwrap();
        }
        path
    }

    fn record(timestamp: f64, track_id: i64) -> ReplayRecord {
        ReplayRecord {
            timestamp,
            image: vec![0xFF, 0xD8, 0xFF],
            detections: vec![TrackedDetection {
                track_id,
                class_label: "car".to_string(),
                confidence: 0.9,
                bbox: [0.1, 0.1, 0.3, 0.3],
            }],
        }
    }

    #[test]
    fn test_descriptor_parsing() {
        assert_eq!(
            SourceDescriptor::from_job("file", "a.jsonl").unwrap(),
            SourceDescriptor::File(PathBuf::from("a.jsonl"))
        );
        assert_eq!(
            SourceDescriptor::from_job("rtsp", "rtsp://cam/1").unwrap(),
            SourceDescriptor::Rtsp("rtsp://cam/1".to_string())
        );
        assert_eq!(
            SourceDescriptor::from_job("webcam", "0").unwrap(),
            SourceDescriptor::Webcam(0)
        );
        assert!(SourceDescriptor::from_job("webcam", "front").is_err());
        assert!(SourceDescriptor::from_job("dvd", "x").is_err());
    }

    #[test]
    fn test_descriptor_liveness() {
        assert!(!SourceDescriptor::from_job("file", "a.jsonl").unwrap().is_live());
        assert!(SourceDescriptor::from_job("rtsp", "rtsp://cam/1").unwrap().is_live());
        assert!(SourceDescriptor::from_job("webcam", "1").unwrap().is_live());
    }

    #[test]
    fn test_replay_round_trip() {
        let path = write_manifest(&[record(0.0, 1), record(0.033, 1)]);
        let mut source = ReplaySource::open(&path).unwrap();

        assert_eq!(source.frame_count_hint(), Some(2));

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.timestamp, 0.0);
        assert_eq!(first.detections.len(), 1);
        assert_eq!(first.detections[0].class_label, "car");
        assert_eq!(&first.image[..], &[0xFF, 0xD8, 0xFF]);

        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.timestamp, 0.033);

        // End of stream
        assert!(source.next_frame().unwrap().is_none());

        fs::remove_file(path).ok();
    }

    #[test]
    fn test_replay_close_is_idempotent() {
        let path = write_manifest(&[record(0.0, 1)]);
        let mut source = ReplaySource::open(&path).unwrap();

        source.close();
        source.close();
        assert!(source.next_frame().unwrap().is_none());

        fs::remove_file(path).ok();
    }

    #[test]
    fn test_replay_decode_error() {
        let path = std::env::temp_dir().join(format!("zonewatch-bad-{}.jsonl", uuid::Uuid::new_v4()));
        fs::write(&path, "not json\n").unwrap();

        let mut source = ReplaySource::open(&path).unwrap();
        assert!(matches!(
            source.next_frame(),
            Err(SourceError::Decode(_))
        ));

        fs::remove_file(path).ok();
    }

    #[test]
    fn test_factory_rejects_live_descriptors() {
        let factory = ReplaySourceFactory::new();
        let result = factory.open(
            &SourceDescriptor::Rtsp("rtsp://cam/1".to_string()),
            &DetectorOptions::default(),
        );
        assert!(matches!(result, Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn test_detection_center() {
        let det = TrackedDetection {
            track_id: 7,
            class_label: "person".to_string(),
            confidence: 0.8,
            bbox: [0.2, 0.4, 0.4, 0.8],
        };
        let (cx, cy) = det.center();
        assert!((cx - 0.3).abs() < 1e-9);
        assert!((cy - 0.6).abs() < 1e-9);
    }
}
