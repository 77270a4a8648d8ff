use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Pixel-space axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Intersection-over-union against another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// Immutable-after-creation stream configuration (spec §3 "Stream Source").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSource {
    pub id: String,
    pub url: String,
    pub protocol: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub enabled: bool,
    pub mjpeg_port: u16,
    pub detection_enabled: bool,
    /// Reserved: the Detector Pool (spec §4.3) is one process-wide shared
    /// pool, not sized per camera, so this currently has no sizing effect.
    /// Persisted and round-tripped through the REST surface for a future
    /// per-camera accelerator-context budget (spec §4.7 `K_ctx`).
    pub detection_threads: u32,
    /// Whether the Person Attribute Analyzer (spec §4, "Person Attribute
    /// Analyzer ... optional") runs for this camera's person-class tracks.
    /// Takes effect the next time the camera's pipeline is (re)started;
    /// see `PipelineConfig::person_stats_enabled`.
    #[serde(default)]
    pub person_stats_enabled: bool,
}

impl StreamSource {
    /// Validation applied at the API boundary (Validation error kind, §7).
    /// Never reaches the pipeline if it fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("source id must not be empty".into());
        }
        if !(self.url.starts_with("rtsp://") || self.url.starts_with("rtsps://")) {
            return Err(format!("unsupported stream URL scheme: {}", self.url));
        }
        if self.width == 0 || self.height == 0 {
            return Err("declared width/height must be positive".into());
        }
        if self.fps == 0 || self.fps > 240 {
            return Err("fps out of range".into());
        }
        if self.mjpeg_port == 0 {
            return Err("mjpeg_port must be nonzero".into());
        }
        Ok(())
    }
}

/// Lifecycle of a per-stream pipeline (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Created,
    Initializing,
    Running,
    Degraded,
    Stopped,
}

/// A captured image plus monotonic capture metadata. Lifetime spans one
/// pipeline cycle; dropped if downstream queues are full.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub source_id: String,
    pub capture_ts: DateTime<Utc>,
    pub sequence_number: u64,
    pub width: u32,
    pub height: u32,
    pub data: std::sync::Arc<Vec<u8>>,
}

/// A unit-normalized float embedding of fixed dimension D (typically
/// 128-2048). Stored boxed-slice so cloning a `Detection`/`Track` is cheap
/// to reason about without generic dimension parameters.
pub type ReidVector = Vec<f32>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BBox,
    #[serde(default)]
    pub reid: Option<ReidVector>,
}

/// `(pipeline_id, local_track_id)` identity assigned by a single pipeline's
/// tracker (spec §3 "Local Track", §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTrack {
    pub pipeline_id: String,
    pub local_track_id: u64,
    pub bbox: BBox,
    pub class_id: u32,
    pub confidence: f32,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub reid: Option<ReidVector>,
}

/// Cross-camera identity formed by ReID matching (spec §3 "Global Track",
/// §4.5). Owned exclusively by the Cross-Camera ReID Registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalTrack {
    pub global_id: u64,
    /// `source_id -> local_track_id`. A `BTreeMap` keeps iteration order
    /// deterministic for tests and for the "at most one local track per
    /// source id" invariant check.
    pub members: BTreeMap<String, u64>,
    pub canonical_reid: ReidVector,
    pub bbox: BBox,
    pub class_id: u32,
    pub confidence: f32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Immutable-after-creation Event (spec §3 "Event"). Persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub source_id: String,
    pub event_type: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub bbox: Option<BBox>,
    #[serde(default)]
    pub local_track_id: Option<u64>,
    #[serde(default)]
    pub global_track_id: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A copy of an Event enriched with routing priority, flowing through the
/// Alarm Router only; not persisted by the router itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmPayload {
    pub alarm_id: Uuid,
    pub event: Event,
    pub priority: u8,
    pub test_mode: bool,
}

impl AlarmPayload {
    pub fn from_event(event: Event, priority: u8) -> Self {
        Self {
            alarm_id: Uuid::new_v4(),
            event,
            priority: priority.clamp(1, 5),
            test_mode: false,
        }
    }
}

/// Delivery method for an Alarm Channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmMethod {
    HttpPost,
    WebSocket,
    Mqtt,
}

/// Mutable-at-runtime alarm channel configuration (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmChannelConfig {
    pub id: String,
    pub method: AlarmMethod,
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub qos: u8,
    pub enabled: bool,
    pub priority_floor: u8,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}

/// Named closed polygon ROI bound to a source id (spec §3 "ROI").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roi {
    pub id: String,
    pub source_id: String,
    pub name: String,
    pub polygon: Vec<(f32, f32)>,
    pub enabled: bool,
    pub rule: RoiRule,
    /// Time-of-day validity window, both in minutes-since-midnight.
    #[serde(default)]
    pub start_minute: Option<u16>,
    #[serde(default)]
    pub end_minute: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoiRule {
    Intrusion,
    Loitering { dwell_seconds: u32 },
}

/// Record of one alarm channel delivery attempt, for the router's ring
/// buffer of observability results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub config_id: String,
    pub method: AlarmMethod,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}
