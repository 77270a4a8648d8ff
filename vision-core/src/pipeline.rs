//! Video Pipeline (spec §4.2): the per-stream state machine that owns one
//! `StreamSource`'s decode → detect → track → analyze → annotate →
//! stream/record/alert cycle. Generalizes the single hardcoded camera loop
//! in `retail-surveillance/src/main_phase6.rs` into one instance per
//! source, driven entirely by the Task Manager.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use image::{DynamicImage, RgbImage};
use tracing::{error, warn};

use vision_common::types::{
    AlarmPayload, BBox, Event, PipelineState, Roi, Severity, StreamSource,
};
use vision_common::{Result, VisionError};

use crate::alarm_router::AlarmRouter;
use crate::allocator::ResourceAllocator;
use crate::annotator;
use crate::attributes::{AttributeAnalyzer, PersonAttributes};
use crate::behavior::BehaviorAnalyzer;
use crate::decoder::{Decoder, DecoderConfig, DecoderOutcome};
use crate::detector::pool::DetectorPool;
use crate::encoder::FrameBroadcaster;
use crate::locking::{self, LockLevel};
use crate::recorder::{FrameData, Recorder};
use crate::reid_extractor::ReidExtractor;
use crate::tracker::{Tracker, TrackerConfig};

/// Narrow non-owning interface a Pipeline uses to report ReID observations
/// and look up cross-camera identities. Pipelines depend only on this, not
/// on the full Task Manager, so the ownership back-edge never keeps the
/// manager alive through a pipeline reference (spec §9).
pub trait CrossCameraReporter: Send + Sync {
    fn report(
        &self,
        source_id: &str,
        local_id: u64,
        features: Vec<f32>,
        bbox: BBox,
        class_id: u32,
        confidence: f32,
    ) -> u64;

    fn global_id_for(&self, source_id: &str, local_id: u64) -> Option<u64>;
}

/// Persistence hook for Events, implemented by `vision-server` so
/// `vision-core` never takes a direct `sqlx` dependency (spec §6 "single-
/// file embedded relational store" lives entirely outside the engine).
pub trait EventSink: Send + Sync {
    fn persist(&self, event: &Event);
}

pub struct NoopEventSink;
impl EventSink for NoopEventSink {
    fn persist(&self, _event: &Event) {}
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub rtsp_latency_ms: u32,
    pub max_queue_size: u32,
    pub max_decoder_retries: u32,
    pub init_timeout: Duration,
    pub detect_submit_deadline: Duration,
    pub reid_interval: Duration,
    pub person_stats_enabled: bool,
    pub person_class_id: u32,
    pub attribute_model_path: Option<String>,
    pub tracker: TrackerConfig,
    pub rois: Vec<Roi>,
    pub alarm_cooldown: chrono::Duration,
    pub recorder_output_dir: PathBuf,
    pub pre_event_seconds: i64,
    pub post_event_seconds: i64,
    pub jpeg_quality: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rtsp_latency_ms: 200,
            max_queue_size: 4,
            max_decoder_retries: 10,
            init_timeout: Duration::from_secs(10),
            detect_submit_deadline: Duration::from_millis(300),
            reid_interval: Duration::from_millis(500),
            person_stats_enabled: false,
            person_class_id: 0,
            attribute_model_path: None,
            tracker: TrackerConfig::default(),
            rois: Vec::new(),
            alarm_cooldown: chrono::Duration::seconds(30),
            recorder_output_dir: std::env::temp_dir().join("vision-recordings"),
            pre_event_seconds: 5,
            post_event_seconds: 10,
            jpeg_quality: 80,
        }
    }
}

/// Collaborators a Pipeline needs but does not own: the shared Detector
/// Pool, Alarm Router, Port/Resource Allocator, Cross-Camera reporter
/// handle, and persistence sink. All are injected by the Task Manager.
pub struct PipelineDeps {
    pub detector_pool: Arc<DetectorPool>,
    pub alarm_router: Arc<AlarmRouter>,
    pub allocator: Arc<ResourceAllocator>,
    pub reporter: Arc<dyn CrossCameraReporter>,
    pub event_sink: Arc<dyn EventSink>,
    pub class_names: Arc<dyn Fn(u32) -> String + Send + Sync>,
}

#[derive(Default)]
pub struct PipelineStats {
    pub frames_processed: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub detections_total: AtomicU64,
    pub events_total: AtomicU64,
    pub reconnect_count: AtomicU64,
    healthy: AtomicBool,
    last_frame_epoch_ms: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineStatsSnapshot {
    pub source_id: String,
    pub state: PipelineState,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub detections_total: u64,
    pub events_total: u64,
    pub reconnect_count: u64,
    pub healthy: bool,
    /// Lifetime-average frames/second, `frames_processed / uptime_seconds`
    /// (spec §4.1 "per-pipeline frame rate"). Grounded on the teacher's own
    /// `Metrics::get_stats` (`main.rs`: `frames as f64 / elapsed`).
    pub frame_rate_fps: f64,
    pub uptime_seconds: i64,
}

/// One per-stream pipeline, exclusively owned by the Task Manager. Holds
/// its own decoder, analyzers, encoder, recorder, and tracker state; the
/// only cross-pipeline collaborators it touches are the shared Detector
/// Pool, Alarm Router, and the narrow `CrossCameraReporter` handle.
pub struct Pipeline {
    source: StreamSource,
    state: Arc<Mutex<PipelineState>>,
    stop_flag: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    mjpeg_server: Mutex<Option<JoinHandle<()>>>,
    mjpeg_shutdown: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    broadcaster: FrameBroadcaster,
    recorder: Arc<Recorder>,
    stats: Arc<PipelineStats>,
    person_attrs: Arc<Mutex<VecDeque<PersonAttributes>>>,
    allocator: Arc<ResourceAllocator>,
    created_at: std::time::Instant,
}

/// A shared, read-only handle to a Pipeline. Returned by
/// `TaskManager::get_pipeline`; never exposes ownership or mutation of the
/// pipeline's internal state directly (spec §4.1 "never exposes
/// ownership").
#[derive(Clone)]
pub struct PipelineHandle(pub(crate) Arc<Pipeline>);

impl PipelineHandle {
    pub fn source(&self) -> &StreamSource {
        &self.0.source
    }

    pub fn state(&self) -> PipelineState {
        self.0.state()
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.0.stats_snapshot()
    }

    pub fn recent_person_attributes(&self) -> Vec<PersonAttributes> {
        self.0
            .person_attrs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

const PERSON_ATTR_HISTORY: usize = 50;

impl Pipeline {
    /// Start a new pipeline for `source`. Blocks until the decoder has
    /// either delivered its first frame (`Running`) or failed fatally
    /// (`Stopped`) within `config.init_timeout`, so `TaskManager::add_source`
    /// returns only once initialization has genuinely completed or failed
    /// (spec §4.1: "synchronous, no partially-registered state").
    pub fn start(source: StreamSource, config: PipelineConfig, deps: PipelineDeps) -> Result<Self> {
        let state = Arc::new(Mutex::new(PipelineState::Created));
        let allocator_ref = Arc::clone(&deps.allocator);
        allocator_ref.reserve_port(source.mjpeg_port).map_err(|e| {
            VisionError::Resource(format!("port reservation failed for {}: {e}", source.id))
        })?;

        let _ctx_reserved = allocator_ref.try_acquire_context();

        set_state(&state, PipelineState::Initializing);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PipelineStats::default());
        stats.healthy.store(true, Ordering::SeqCst);

        let recorder = Arc::new(Recorder::new(
            source.id.clone(),
            config.recorder_output_dir.clone(),
            config.pre_event_seconds,
        ));
        let broadcaster = FrameBroadcaster::new();
        let person_attrs = Arc::new(Mutex::new(VecDeque::with_capacity(PERSON_ATTR_HISTORY)));

        let (init_tx, init_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

        let worker = {
            let source = source.clone();
            let config = config.clone();
            let state = Arc::clone(&state);
            let stop_flag = Arc::clone(&stop_flag);
            let stats = Arc::clone(&stats);
            let recorder = Arc::clone(&recorder);
            let broadcaster = broadcaster.clone();
            let person_attrs = Arc::clone(&person_attrs);

            std::thread::Builder::new()
                .name(format!("vision-pipeline-{}", source.id))
                .spawn(move || {
                    run_worker(
                        source, config, deps, state, stop_flag, stats, recorder, broadcaster, person_attrs, init_tx,
                    )
                })
                .map_err(|e| VisionError::Fatal(format!("failed to spawn pipeline worker: {e}")))?
        };

        match init_rx.recv_timeout(config.init_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                stop_flag.store(true, Ordering::SeqCst);
                let _ = worker.join();
                allocator_ref.release_port(source.mjpeg_port);
                return Err(VisionError::Fatal(format!("pipeline {} failed to initialize: {e}", source.id)));
            }
            Err(_) => {
                // initialization is still in flight (slow RTSP handshake);
                // the worker keeps retrying in the background and will
                // eventually report Running or Stopped via `stats`/`state`
                // rather than this channel, which nobody reads from again.
                warn!(source_id = %source.id, "pipeline initialization exceeded init_timeout, continuing in background");
            }
        }

        let (mjpeg_shutdown_tx, mjpeg_shutdown_rx) = tokio::sync::oneshot::channel();
        let mjpeg_server = spawn_mjpeg_server(source.mjpeg_port, broadcaster.clone(), mjpeg_shutdown_rx);

        Ok(Self {
            source,
            state,
            stop_flag,
            worker: Mutex::new(Some(worker)),
            mjpeg_server: Mutex::new(Some(mjpeg_server)),
            mjpeg_shutdown: Mutex::new(Some(mjpeg_shutdown_tx)),
            broadcaster,
            recorder,
            stats,
            person_attrs,
            allocator: allocator_ref,
            created_at: std::time::Instant::now(),
        })
    }

    pub fn source(&self) -> &StreamSource {
        &self.source
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_healthy(&self) -> bool {
        self.stats.healthy.load(Ordering::SeqCst)
    }

    pub fn broadcaster(&self) -> FrameBroadcaster {
        self.broadcaster.clone()
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        Arc::clone(&self.recorder)
    }

    pub fn uptime_seconds(&self) -> i64 {
        self.created_at.elapsed().as_secs() as i64
    }

    pub fn stats_snapshot(&self) -> PipelineStatsSnapshot {
        let uptime = self.created_at.elapsed().as_secs_f64();
        let frames_processed = self.stats.frames_processed.load(Ordering::SeqCst);
        let frame_rate_fps = if uptime > 0.0 { frames_processed as f64 / uptime } else { 0.0 };
        PipelineStatsSnapshot {
            source_id: self.source.id.clone(),
            state: self.state(),
            frames_processed,
            frames_dropped: self.stats.frames_dropped.load(Ordering::SeqCst),
            detections_total: self.stats.detections_total.load(Ordering::SeqCst),
            events_total: self.stats.events_total.load(Ordering::SeqCst),
            reconnect_count: self.stats.reconnect_count.load(Ordering::SeqCst),
            healthy: self.is_healthy(),
            frame_rate_fps,
            uptime_seconds: uptime as i64,
        }
    }

    /// Stop the pipeline: signal the decoder first (unblocking its read),
    /// then join the worker thread. Idempotent.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = worker.join();
        }
        if let Some(shutdown_tx) = self.mjpeg_shutdown.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(server) = self.mjpeg_server.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = server.join();
        }
        set_state(&self.state, PipelineState::Stopped);
        self.allocator.release_port(self.source.mjpeg_port);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs one source's MJPEG listener on its own thread with a dedicated
/// current-thread runtime, independent of the pipeline worker's own
/// detection-submission runtime, so a stalled decode never blocks viewers
/// and a slow viewer never blocks decode.
/// Mutate the pipeline's published state. The `VideoPipeline` lock level is
/// entered only for the duration of this assignment, never across the
/// decode/detect/report cycle — holding it any longer would let the worker
/// reach down into the Cross-Camera Registry's level-2 mutex (via
/// `process_frame` → `CrossCameraReporter::report`) while still holding
/// level 4, a descending acquire the hierarchy in `locking` forbids.
fn set_state(state: &Mutex<PipelineState>, new: PipelineState) {
    let _guard = locking::enter(LockLevel::VideoPipeline);
    *state.lock().unwrap_or_else(|e| e.into_inner()) = new;
}

fn spawn_mjpeg_server(port: u16, broadcaster: FrameBroadcaster, shutdown_rx: tokio::sync::oneshot::Receiver<()>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("vision-mjpeg-{port}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(port, error = %e, "mjpeg server failed to start its runtime");
                    return;
                }
            };
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = runtime.block_on(crate::encoder::serve(port, broadcaster, shutdown)) {
                error!(port, error = %e, "mjpeg server exited with an error");
            }
        })
        .expect("failed to spawn mjpeg server thread")
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    source: StreamSource,
    config: PipelineConfig,
    deps: PipelineDeps,
    state: Arc<Mutex<PipelineState>>,
    stop_flag: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    recorder: Arc<Recorder>,
    broadcaster: FrameBroadcaster,
    person_attrs: Arc<Mutex<VecDeque<PersonAttributes>>>,
    init_tx: std::sync::mpsc::Sender<std::result::Result<(), String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = init_tx.send(Err(format!("failed to start pipeline runtime: {e}")));
            return;
        }
    };

    let mut tracker = Tracker::new(source.id.clone(), config.tracker.clone());
    let mut behavior = BehaviorAnalyzer::new(
        config.rois.iter().filter(|r| r.source_id == source.id).cloned().collect(),
        config.alarm_cooldown,
    );
    let mut attribute_analyzer = if config.person_stats_enabled {
        match AttributeAnalyzer::new(config.attribute_model_path.as_deref()) {
            Ok(analyzer) => Some(analyzer),
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "failed to initialize attribute analyzer, person stats disabled for this pipeline");
                None
            }
        }
    } else {
        None
    };
    let reid_extractor = crate::reid_extractor::PixelStatsExtractor::new();
    let mut last_reid: HashMap<u64, std::time::Instant> = HashMap::new();
    let font = None; // label font is an optional deployment asset; boxes-only otherwise.

    let mut init_tx = Some(init_tx);

    let decoder_config = DecoderConfig {
        source_id: source.id.clone(),
        url: source.url.clone(),
        width: source.width,
        height: source.height,
        max_queue_size: config.max_queue_size,
        rtsp_latency_ms: config.rtsp_latency_ms,
    };
    let mut decoder = Decoder::new(decoder_config);

    let on_retry = {
        let state = Arc::clone(&state);
        let stats = Arc::clone(&stats);
        move |_attempt: u32| {
            set_state(&state, PipelineState::Degraded);
            stats.reconnect_count.fetch_add(1, Ordering::SeqCst);
        }
    };

    let outcome = decoder.run(
        |frame| {
            if stop_flag.load(Ordering::SeqCst) {
                return false;
            }

            if let Some(tx) = init_tx.take() {
                set_state(&state, PipelineState::Running);
                let _ = tx.send(Ok(()));
            } else if *state.lock().unwrap_or_else(|e| e.into_inner()) == PipelineState::Degraded {
                set_state(&state, PipelineState::Running);
            }

            let Ok(rgb) = image::RgbImage::from_raw(frame.width, frame.height, (*frame.data).clone()) else {
                return true;
            };
            let image = DynamicImage::ImageRgb8(rgb);
            process_frame(
                &source,
                &config,
                &deps,
                &runtime,
                &mut tracker,
                &mut behavior,
                attribute_analyzer.as_mut(),
                &reid_extractor,
                &mut last_reid,
                &stats,
                &recorder,
                &broadcaster,
                &person_attrs,
                font.as_ref(),
                image,
                frame.capture_ts,
            );

            stats.frames_processed.fetch_add(1, Ordering::SeqCst);
            stats
                .last_frame_epoch_ms
                .store(frame.capture_ts.timestamp_millis().max(0) as u64, Ordering::SeqCst);
            !stop_flag.load(Ordering::SeqCst)
        },
        on_retry,
        config.max_decoder_retries,
    );

    match outcome {
        DecoderOutcome::Stopped => {
            set_state(&state, PipelineState::Stopped);
        }
        DecoderOutcome::ExhaustedRetries => {
            error!(source_id = %source.id, "pipeline stopped: stream unreadable after exhausting retries");
            stats.healthy.store(false, Ordering::SeqCst);
            set_state(&state, PipelineState::Stopped);
            if let Some(tx) = init_tx.take() {
                let _ = tx.send(Err("stream unreadable after exhausting retries".into()));
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn process_frame(
    source: &StreamSource,
    config: &PipelineConfig,
    deps: &PipelineDeps,
    runtime: &tokio::runtime::Runtime,
    tracker: &mut Tracker,
    behavior: &mut BehaviorAnalyzer,
    attribute_analyzer: Option<&mut AttributeAnalyzer>,
    reid_extractor: &dyn ReidExtractor,
    last_reid: &mut HashMap<u64, std::time::Instant>,
    stats: &Arc<PipelineStats>,
    recorder: &Arc<Recorder>,
    broadcaster: &FrameBroadcaster,
    person_attrs: &Arc<Mutex<VecDeque<PersonAttributes>>>,
    font: Option<&ab_glyph::FontArc>,
    image: DynamicImage,
    capture_ts: chrono::DateTime<Utc>,
) {
    let detections = if source.detection_enabled {
        let rx = deps.detector_pool.submit(image.clone(), source.id.clone());
        match runtime.block_on(async { tokio::time::timeout(config.detect_submit_deadline, rx).await }) {
            Ok(Ok(detections)) => detections,
            _ => {
                stats.frames_dropped.fetch_add(1, Ordering::SeqCst);
                return;
            }
        }
    } else {
        Vec::new()
    };
    stats.detections_total.fetch_add(detections.len() as u64, Ordering::SeqCst);

    let mut local_tracks = tracker.update(detections, capture_ts);
    behavior.retain_objects(&tracker.active_track_ids());

    for track in &mut local_tracks {
        if track.class_id == config.person_class_id && config.person_stats_enabled {
            if let Some(analyzer) = attribute_analyzer_ref(attribute_analyzer) {
                if let Ok(attrs) = analyzer.analyze(&image, &track.bbox) {
                    let mut history = person_attrs.lock().unwrap_or_else(|e| e.into_inner());
                    if history.len() >= PERSON_ATTR_HISTORY {
                        history.pop_front();
                    }
                    history.push_back(attrs);
                }
            }
        }

        let due = last_reid
            .get(&track.local_track_id)
            .map(|t| t.elapsed() >= config.reid_interval)
            .unwrap_or(true);
        if due {
            let features = reid_extractor.extract(&image, &track.bbox);
            last_reid.insert(track.local_track_id, std::time::Instant::now());
            track.reid = Some(features.clone());
            deps.reporter.report(
                &source.id,
                track.local_track_id,
                features,
                track.bbox,
                track.class_id,
                track.confidence,
            );
        }
    }

    let mut events = Vec::new();
    for track in &local_tracks {
        let center = track.bbox.center();
        for behavior_event in behavior.evaluate(&source.id, track.local_track_id, center, capture_ts) {
            let global_id = deps.reporter.global_id_for(&source.id, track.local_track_id);
            events.push(Event {
                id: uuid::Uuid::new_v4(),
                source_id: source.id.clone(),
                event_type: roi_rule_event_type(&behavior_event.rule),
                severity: Severity::Warning,
                timestamp: behavior_event.triggered_at,
                bbox: Some(track.bbox),
                local_track_id: Some(track.local_track_id),
                global_track_id: global_id,
                metadata: serde_json::json!({ "roi_id": behavior_event.roi_id }),
            });
        }
    }
    stats.events_total.fetch_add(events.len() as u64, Ordering::SeqCst);

    let mut rgb = image.to_rgb8();
    annotate_frame(&mut rgb, &local_tracks, deps, source, font);

    broadcaster.push(&rgb, config.jpeg_quality);
    recorder.push_frame(FrameData {
        timestamp: capture_ts,
        data: rgb.into_raw(),
        width: source.width,
        height: source.height,
    });

    for event in events {
        let priority = severity_to_priority(event.severity);
        deps.alarm_router.enqueue(AlarmPayload::from_event(event.clone(), priority));
        deps.event_sink.persist(&event);
    }
}

fn attribute_analyzer_ref<'a>(a: Option<&'a mut AttributeAnalyzer>) -> Option<&'a mut AttributeAnalyzer> {
    a
}

fn annotate_frame(
    rgb: &mut RgbImage,
    tracks: &[vision_common::types::LocalTrack],
    deps: &PipelineDeps,
    source: &StreamSource,
    font: Option<&ab_glyph::FontArc>,
) {
    let class_names = Arc::clone(&deps.class_names);
    let reporter = Arc::clone(&deps.reporter);
    let source_id = source.id.clone();
    annotator::annotate(
        rgb,
        tracks,
        &|class_id| (class_names)(class_id),
        &|local_id| reporter.global_id_for(&source_id, local_id),
        font,
    );
}

fn severity_to_priority(severity: Severity) -> u8 {
    match severity {
        Severity::Info => 1,
        Severity::Warning => 3,
        Severity::Critical => 5,
    }
}

fn roi_rule_event_type(rule: &vision_common::types::RoiRule) -> String {
    match rule {
        vision_common::types::RoiRule::Intrusion => "roi_intrusion".to_string(),
        vision_common::types::RoiRule::Loitering { .. } => "roi_loitering".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_maps_to_expected_priority_band() {
        assert_eq!(severity_to_priority(Severity::Info), 1);
        assert_eq!(severity_to_priority(Severity::Warning), 3);
        assert_eq!(severity_to_priority(Severity::Critical), 5);
    }

    #[test]
    fn roi_rule_event_types_are_distinct() {
        assert_ne!(
            roi_rule_event_type(&vision_common::types::RoiRule::Intrusion),
            roi_rule_event_type(&vision_common::types::RoiRule::Loitering { dwell_seconds: 5 })
        );
    }

    /// `set_state` must release the `VideoPipeline` level guard before
    /// returning, so a worker that just transitioned state can still report
    /// to the (lower) Cross-Camera Registry level without tripping the
    /// hierarchy's descending-acquire check (spec §5, §8 property 2).
    #[test]
    fn set_state_does_not_hold_its_guard_across_a_lower_level_acquire() {
        locking::reset_violation_flag();
        let state = Mutex::new(PipelineState::Created);
        set_state(&state, PipelineState::Running);
        let _lower = locking::enter(LockLevel::CrossCameraRegistry);
        assert!(!locking::violation_detected());
        locking::reset_violation_flag();
    }
}
