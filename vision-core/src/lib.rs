//! The engine: every component from spec §4 and §5 — Task Manager, Video
//! Pipeline, Detector Pool, Tracker, Cross-Camera ReID Registry, Alarm
//! Router, Port/Resource Allocator — wired together, plus the lock
//! hierarchy guard that enforces their acquisition order. No I/O adapter
//! (REST, Postgres, MQTT broker connection) lives here; those belong to
//! `vision-server`, which depends on this crate.

pub mod alarm_router;
pub mod allocator;
pub mod annotator;
pub mod attributes;
pub mod behavior;
pub mod category_filter;
pub mod decoder;
pub mod detector;
pub mod encoder;
pub mod locking;
pub mod pipeline;
pub mod recorder;
pub mod reid_extractor;
pub mod reid_registry;
pub mod task_manager;
pub mod thread_pool;
pub mod tracker;

pub use alarm_router::{AlarmChannel, AlarmRouter, HttpChannel, MqttChannel, RegisteredChannel, WebSocketChannel};
pub use allocator::ResourceAllocator;
pub use attributes::{AttributeAnalyzer, PersonAttributes};
pub use behavior::{BehaviorAnalyzer, BehaviorEvent};
pub use category_filter::CategoryFilter;
pub use decoder::{Decoder, DecoderConfig, DecoderOutcome};
pub use encoder::FrameBroadcaster;
pub use locking::{LockLevel, LevelGuard};
pub use pipeline::{CrossCameraReporter, EventSink, NoopEventSink, Pipeline, PipelineConfig, PipelineDeps, PipelineHandle, PipelineStatsSnapshot};
pub use recorder::{FrameData, PreEventRing, Recorder, Recording};
pub use reid_extractor::{PixelStatsExtractor, ReidExtractor};
pub use reid_registry::{CrossCameraRegistry, RegistryConfig, ReportOutcome};
pub use task_manager::{RegistryReporter, SystemStats, TaskManager, TaskManagerConfig};
pub use thread_pool::ThreadPool;
pub use tracker::{Tracker, TrackerConfig, TrackerRegistry};
