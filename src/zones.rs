//! Zone-crossing counting engine.
//!
//! Consumes tracked detections one frame at a time and maintains monotonic
//! per-zone entry counts. A zone counts a track at most once per entry: a
//! track inside a zone stays counted while it remains inside, counts again
//! only after leaving and re-entering, and is treated as a fresh presence if
//! its state was evicted by the grace window.
//!
//! Counting is deterministic: it depends only on the order of frames and the
//! detections within them, never on wall-clock time.

use crate::source::TrackedDetection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::trace;

/// Errors from zone validation.
#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("Zone {index} has {got} points; a polygon needs at least 3")]
    TooFewPoints { index: usize, got: usize },
}

/// A user-defined polygonal counting region in normalized 0-1 frame
/// coordinates. Immutable once a job starts processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    /// Polygon vertices [x, y], in drawing order
    pub points: Vec<[f64; 2]>,
    /// Display color (hex string), chosen by the user
    #[serde(default)]
    pub color: Option<String>,
}

impl Zone {
    /// Axis-aligned rectangular zone, handy for tests and demos.
    pub fn rectangle(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            points: vec![[x1, y1], [x2, y1], [x2, y2], [x1, y2]],
            color: None,
        }
    }

    /// Even-odd ray-cast containment test.
    ///
    /// Edges are compared half-open, so a point exactly on a boundary lands
    /// on a deterministic side but no inclusive/exclusive guarantee is made.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let points = &self.points;
        let n = points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;

        for i in 0..n {
            let [xi, yi] = points[i];
            let [xj, yj] = points[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }

        inside
    }
}

/// A zone-entry moment: produced exactly once per qualifying transition of a
/// track's reference point from outside to inside a zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountingEvent {
    /// Media timestamp in seconds of the frame that observed the entry
    pub timestamp: f64,
    pub track_id: i64,
    pub zone_index: usize,
    pub class_label: String,
    pub confidence: f64,
    /// Bounding box [x1, y1, x2, y2] at the entry frame
    pub bbox: [f64; 4],
}

/// Result of feeding one frame into the engine.
#[derive(Debug, Clone)]
pub struct FrameUpdate {
    /// Cumulative per-zone tallies after this frame, keyed by zone index.
    /// Always contains every zone, including zero-count ones.
    pub counts: BTreeMap<usize, u64>,
    /// Entry events observed in this frame
    pub events: Vec<CountingEvent>,
}

/// Per-track membership state. Owned exclusively by the detection/counting
/// context; never shared across the delivery boundary.
#[derive(Debug)]
struct TrackState {
    /// Zone indices whose polygon contains the track's reference point
    zones: BTreeSet<usize>,
    /// Frame index at which the track was last seen
    last_seen_frame: u64,
}

/// Stateful per-job counting engine.
///
/// The reference point for containment is the bounding-box centroid, the
/// same anchor the analytics layer aggregates, so crossing timing and
/// heatmap density stay consistent.
pub struct ZoneCounter {
    zones: Vec<Zone>,
    target_class: Option<String>,
    min_confidence: f64,
    grace_frames: u64,
    tracks: HashMap<i64, TrackState>,
    counts: Vec<u64>,
    frame_index: u64,
}

impl ZoneCounter {
    pub fn new(
        zones: Vec<Zone>,
        target_class: Option<String>,
        min_confidence: f64,
        grace_frames: u64,
    ) -> Result<Self, ZoneError> {
        for (index, zone) in zones.iter().enumerate() {
            if zone.points.len() < 3 {
                return Err(ZoneError::TooFewPoints {
                    index,
                    got: zone.points.len(),
                });
            }
        }

        let counts = vec![0; zones.len()];
        Ok(Self {
            zones,
            target_class,
            min_confidence,
            grace_frames,
            tracks: HashMap::new(),
            counts,
            frame_index: 0,
        })
    }

    /// Number of configured zones.
    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Sum of all zone tallies.
    pub fn total_count(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Number of tracks currently holding state.
    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Cumulative per-zone tallies keyed by zone index.
    pub fn counts(&self) -> BTreeMap<usize, u64> {
        self.counts.iter().copied().enumerate().collect()
    }

    /// Feed one frame of tracked detections into the engine.
    ///
    /// Detections below the confidence threshold or failing the class filter
    /// are ignored. Entries (zones present now but not in the track's
    /// previous membership) emit one event each; exits are silent.
    pub fn update(&mut self, timestamp: f64, detections: &[TrackedDetection]) -> FrameUpdate {
        self.frame_index += 1;
        let frame = self.frame_index;

        // Evict tracks unseen for longer than the grace window so a long
        // stream cannot grow state without bound.
        let grace = self.grace_frames;
        self.tracks
            .retain(|_, state| frame - state.last_seen_frame <= grace);

        let mut events = Vec::new();

        for det in detections {
            if det.confidence < self.min_confidence {
                continue;
            }
            if let Some(target) = &self.target_class {
                if det.class_label != *target {
                    continue;
                }
            }

            let (cx, cy) = det.center();
            let membership: BTreeSet<usize> = self
                .zones
                .iter()
                .enumerate()
                .filter(|(_, zone)| zone.contains(cx, cy))
                .map(|(index, _)| index)
                .collect();

            let state = self
                .tracks
                .entry(det.track_id)
                .or_insert_with(|| TrackState {
                    zones: BTreeSet::new(),
                    last_seen_frame: frame,
                });

            for &zone_index in membership.difference(&state.zones) {
                self.counts[zone_index] += 1;
                trace!(
                    track_id = det.track_id,
                    zone_index,
                    count = self.counts[zone_index],
                    "Zone entry"
                );
                events.push(CountingEvent {
                    timestamp,
                    track_id: det.track_id,
                    zone_index,
                    class_label: det.class_label.clone(),
                    confidence: det.confidence,
                    bbox: det.bbox,
                });
            }

            state.zones = membership;
            state.last_seen_frame = frame;
        }

        FrameUpdate {
            counts: self.counts(),
            events,
        }
    }
}
