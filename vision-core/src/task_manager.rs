//! Task Manager (spec §4.1). Hierarchy level 3 — the top-level owner of
//! every `Pipeline`. Sits above the Cross-Camera Registry and Port
//! Allocator in the lock hierarchy and is the only component the
//! `vision-server` control plane talks to directly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use vision_common::types::StreamSource;
use vision_common::{Result, VisionError};

use crate::alarm_router::AlarmRouter;
use crate::allocator::ResourceAllocator;
use crate::detector::pool::DetectorPool;
use crate::locking::{self, LockLevel};
use crate::pipeline::{CrossCameraReporter, EventSink, Pipeline, PipelineConfig, PipelineDeps, PipelineHandle, PipelineStatsSnapshot};
use crate::reid_registry::CrossCameraRegistry;
use crate::thread_pool::ThreadPool;

/// Forwards ReID observations straight to the shared registry. The only
/// thing a `Pipeline` ever sees of the Task Manager's world (spec §9:
/// "model that back-edge as a non-owning handle to a narrow interface").
pub struct RegistryReporter(Arc<CrossCameraRegistry>);

impl RegistryReporter {
    pub fn new(registry: Arc<CrossCameraRegistry>) -> Self {
        Self(registry)
    }
}

impl CrossCameraReporter for RegistryReporter {
    fn report(
        &self,
        source_id: &str,
        local_id: u64,
        features: Vec<f32>,
        bbox: vision_common::types::BBox,
        class_id: u32,
        confidence: f32,
    ) -> u64 {
        let (global_id, _outcome) = self.0.report(source_id, local_id, features, bbox, class_id, confidence, Utc::now());
        global_id
    }

    fn global_id_for(&self, source_id: &str, local_id: u64) -> Option<u64> {
        self.0.global_id_for(source_id, local_id)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemStats {
    pub active_pipelines: usize,
    pub max_pipelines: usize,
    pub cross_camera_tracks: usize,
    pub cross_camera_matches: u64,
    pub alarm_queue_depth: usize,
    pub alarms_delivered: u64,
    pub alarms_failed: u64,
    pub contexts_in_use: u32,
    /// Process CPU%, monitor uptime, and monitor self-health, carried
    /// straight from the most recent monitor tick (spec §4.1).
    pub cpu_percent: f32,
    pub accelerator_percent: Option<f32>,
    pub accelerator_memory_mb: Option<f32>,
    pub accelerator_temperature_c: Option<f32>,
    pub uptime_seconds: i64,
    pub monitor_healthy: bool,
}

/// One per-pipeline entry in a `MonitorSnapshot` (spec §4.1: "per-pipeline
/// frame rate, dropped frames, healthy flag, uptime").
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PipelineMonitorEntry {
    pub frame_rate_fps: f64,
    pub dropped_frames: u64,
    pub healthy: bool,
    pub uptime_seconds: i64,
}

/// Published once per monitor tick and read wait-free through an
/// `ArcSwap` — the same "atomic snapshot, replace on update" shape already
/// used by `CategoryFilter` and the Detector Pool's postprocess config
/// (spec §4.1's "publishes CPU%, ... per-pipeline frame rate, dropped
/// frames, healthy flag, uptime").
#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub cpu_percent: f32,
    /// No accelerator telemetry API is specified (spec §1 non-goal: "we do
    /// not mandate a particular accelerator API"), so these stay `None`
    /// until a concrete backend is wired in.
    pub accelerator_percent: Option<f32>,
    pub accelerator_memory_mb: Option<f32>,
    pub accelerator_temperature_c: Option<f32>,
    pub uptime_seconds: i64,
    /// `false` once a monitor cycle has taken longer than 80% of
    /// `monitor_interval` (spec §4.1).
    pub monitor_healthy: bool,
    pub pipelines: HashMap<String, PipelineMonitorEntry>,
}

impl Default for MonitorSnapshot {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            accelerator_percent: None,
            accelerator_memory_mb: None,
            accelerator_temperature_c: None,
            uptime_seconds: 0,
            monitor_healthy: true,
            pipelines: HashMap::new(),
        }
    }
}

struct Inner {
    pipelines: HashMap<String, Arc<Pipeline>>,
    /// Source ids reserved for an in-flight `add_source` call, released on
    /// success or failure. Lets the lock be dropped for the duration of
    /// `Pipeline::start`'s blocking initialization without permitting a
    /// second concurrent `add_source` for the same id (spec §4.1, E6).
    in_flight: HashSet<String>,
}

/// Fixed collaborators the Task Manager constructs once at startup and
/// hands to every pipeline it starts.
pub struct TaskManagerConfig {
    pub max_pipelines: usize,
    pub monitor_interval: Duration,
    pub pipeline: PipelineConfig,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_pipelines: 64,
            monitor_interval: Duration::from_secs(1),
            pipeline: PipelineConfig::default(),
        }
    }
}

pub struct TaskManager {
    inner: Mutex<Inner>,
    config: TaskManagerConfig,
    detector_pool: Arc<DetectorPool>,
    alarm_router: Arc<AlarmRouter>,
    allocator: Arc<ResourceAllocator>,
    registry: Arc<CrossCameraRegistry>,
    event_sink: Arc<dyn EventSink>,
    class_names: Arc<dyn Fn(u32) -> String + Send + Sync>,
    admin_pool: Mutex<ThreadPool>,
    monitor_stop: Arc<AtomicBool>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    monitor_snapshot: arc_swap::ArcSwap<MonitorSnapshot>,
    started_at: Instant,
}

impl TaskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TaskManagerConfig,
        detector_pool: Arc<DetectorPool>,
        alarm_router: Arc<AlarmRouter>,
        allocator: Arc<ResourceAllocator>,
        registry: Arc<CrossCameraRegistry>,
        event_sink: Arc<dyn EventSink>,
        class_names: Arc<dyn Fn(u32) -> String + Send + Sync>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            inner: Mutex::new(Inner {
                pipelines: HashMap::new(),
                in_flight: HashSet::new(),
            }),
            config,
            detector_pool,
            alarm_router,
            allocator,
            registry,
            event_sink,
            class_names,
            admin_pool: Mutex::new(ThreadPool::new(2)),
            monitor_stop: Arc::new(AtomicBool::new(false)),
            monitor_handle: Mutex::new(None),
            monitor_snapshot: arc_swap::ArcSwap::from_pointee(MonitorSnapshot::default()),
            started_at: Instant::now(),
        });

        let handle = spawn_monitor(Arc::clone(&manager));
        *manager.monitor_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        manager
    }

    /// Validate, reserve, and synchronously start a new pipeline. Returns
    /// only after initialization completes or fails — no partially
    /// registered state is ever visible to a concurrent caller (spec §4.1).
    pub fn add_source(&self, source: StreamSource) -> Result<PipelineHandle> {
        source.validate().map_err(VisionError::Validation)?;

        {
            let _guard = locking::enter(LockLevel::TaskManager);
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.pipelines.contains_key(&source.id) || inner.in_flight.contains(&source.id) {
                return Err(VisionError::AlreadyExists(format!("source {} already registered", source.id)));
            }
            if inner.pipelines.len() + inner.in_flight.len() >= self.config.max_pipelines {
                return Err(VisionError::CapacityExceeded(format!(
                    "active pipeline count at configured maximum ({})",
                    self.config.max_pipelines
                )));
            }
            inner.in_flight.insert(source.id.clone());
        }

        let deps = PipelineDeps {
            detector_pool: Arc::clone(&self.detector_pool),
            alarm_router: Arc::clone(&self.alarm_router),
            allocator: Arc::clone(&self.allocator),
            reporter: Arc::new(RegistryReporter::new(Arc::clone(&self.registry))),
            event_sink: Arc::clone(&self.event_sink),
            class_names: Arc::clone(&self.class_names),
        };

        let pipeline_config = PipelineConfig {
            person_stats_enabled: source.person_stats_enabled,
            ..self.config.pipeline.clone()
        };
        let start_result = Pipeline::start(source.clone(), pipeline_config, deps);

        let _guard = locking::enter(LockLevel::TaskManager);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.in_flight.remove(&source.id);

        match start_result {
            Ok(pipeline) => {
                let pipeline = Arc::new(pipeline);
                inner.pipelines.insert(source.id.clone(), Arc::clone(&pipeline));
                info!(source_id = %source.id, "pipeline added");
                Ok(PipelineHandle(pipeline))
            }
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "failed to start pipeline");
                Err(e)
            }
        }
    }

    /// Stop and remove a pipeline. Idempotent: removing an unknown id is a
    /// `NotFound` error, not a panic.
    pub fn remove_source(&self, source_id: &str) -> Result<()> {
        let pipeline = {
            let _guard = locking::enter(LockLevel::TaskManager);
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .pipelines
                .remove(source_id)
                .ok_or_else(|| VisionError::NotFound(format!("no pipeline registered for source {source_id}")))?
        };
        pipeline.stop();
        info!(source_id, "pipeline removed");
        Ok(())
    }

    pub fn get_pipeline(&self, source_id: &str) -> Option<PipelineHandle> {
        let _guard = locking::enter(LockLevel::TaskManager);
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pipelines.get(source_id).cloned().map(PipelineHandle)
    }

    pub fn list_active(&self) -> Vec<PipelineHandle> {
        let _guard = locking::enter(LockLevel::TaskManager);
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pipelines.values().cloned().map(PipelineHandle).collect()
    }

    pub fn pipeline_stats(&self, source_id: &str) -> Option<PipelineStatsSnapshot> {
        self.get_pipeline(source_id).map(|h| h.stats())
    }

    pub fn system_stats(&self) -> SystemStats {
        let active = {
            let _guard = locking::enter(LockLevel::TaskManager);
            self.inner.lock().unwrap_or_else(|e| e.into_inner()).pipelines.len()
        };
        let (delivered, failed) = self.alarm_router.totals();
        let monitor = self.monitor_snapshot();
        SystemStats {
            active_pipelines: active,
            max_pipelines: self.config.max_pipelines,
            cross_camera_tracks: self.registry.track_count(),
            cross_camera_matches: self.registry.cross_camera_matches(),
            alarm_queue_depth: self.alarm_router.queue_depth(),
            alarms_delivered: delivered,
            alarms_failed: failed,
            contexts_in_use: self.allocator.contexts_in_use(),
            cpu_percent: monitor.cpu_percent,
            accelerator_percent: monitor.accelerator_percent,
            accelerator_memory_mb: monitor.accelerator_memory_mb,
            accelerator_temperature_c: monitor.accelerator_temperature_c,
            uptime_seconds: monitor.uptime_seconds,
            monitor_healthy: monitor.monitor_healthy,
        }
    }

    /// Most recent published monitor tick (spec §4.1): CPU%, optional
    /// accelerator telemetry, per-pipeline frame rate/dropped frames, and
    /// the monitor's own cycle-overrun health. Wait-free read.
    pub fn monitor_snapshot(&self) -> Arc<MonitorSnapshot> {
        self.monitor_snapshot.load_full()
    }

    pub fn pipeline_monitor_entry(&self, source_id: &str) -> Option<PipelineMonitorEntry> {
        self.monitor_snapshot().pipelines.get(source_id).copied()
    }

    /// Submit short-lived administrative work (config reloads, ad-hoc
    /// maintenance) to the manager's own small thread pool rather than
    /// blocking a caller or spinning a one-off thread (spec §9).
    pub fn run_admin_task<F: FnOnce() + Send + 'static>(&self, job: F) {
        self.admin_pool.lock().unwrap_or_else(|e| e.into_inner()).execute(job);
    }

    /// Graceful shutdown (spec §5): stop accepting new sources implicitly
    /// by stopping the monitor thread, then stop every pipeline, then the
    /// shared Detector Pool and Alarm Router so in-flight work drains
    /// before the process exits.
    pub fn shutdown(&self) {
        self.monitor_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }

        let pipelines: Vec<Arc<Pipeline>> = {
            let _guard = locking::enter(LockLevel::TaskManager);
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.pipelines.drain().map(|(_, p)| p).collect()
        };
        for pipeline in pipelines {
            pipeline.stop();
        }

        self.admin_pool.lock().unwrap_or_else(|e| e.into_inner()).shutdown();
    }
}

fn spawn_monitor(manager: Arc<TaskManager>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("vision-task-monitor".to_string())
        .spawn(move || {
            let interval = manager.config.monitor_interval;
            let overrun_threshold = interval.mul_f64(0.8);
            let mut sys = sysinfo::System::new();
            // precise next-tick scheduling (spec §4.1): sleep to a fixed
            // anchor rather than `interval` after each cycle, so the time
            // spent doing the cycle's own work never accumulates as drift.
            let mut next_tick = Instant::now() + interval;

            loop {
                if manager.monitor_stop.load(Ordering::SeqCst) {
                    return;
                }
                let now = Instant::now();
                if next_tick > now {
                    std::thread::sleep(next_tick - now);
                }
                next_tick += interval;
                if manager.monitor_stop.load(Ordering::SeqCst) {
                    return;
                }

                let cycle_start = Instant::now();

                manager.registry.expire(Utc::now());

                sys.refresh_cpu_usage();
                let cpu_percent = sys.global_cpu_usage();

                let (unhealthy, pipelines): (Vec<String>, HashMap<String, PipelineMonitorEntry>) = {
                    let _guard = locking::enter(LockLevel::TaskManager);
                    let inner = manager.inner.lock().unwrap_or_else(|e| e.into_inner());
                    let mut unhealthy = Vec::new();
                    let mut entries = HashMap::with_capacity(inner.pipelines.len());
                    for (source_id, pipeline) in inner.pipelines.iter() {
                        let stats = pipeline.stats_snapshot();
                        if !stats.healthy {
                            unhealthy.push(source_id.clone());
                        }
                        entries.insert(
                            source_id.clone(),
                            PipelineMonitorEntry {
                                frame_rate_fps: stats.frame_rate_fps,
                                dropped_frames: stats.frames_dropped,
                                healthy: stats.healthy,
                                uptime_seconds: stats.uptime_seconds,
                            },
                        );
                    }
                    (unhealthy, entries)
                };

                for source_id in unhealthy {
                    warn!(source_id = %source_id, "monitor removing unhealthy pipeline");
                    let _ = manager.remove_source(&source_id);
                }

                let cycle_elapsed = cycle_start.elapsed();
                let monitor_healthy = cycle_elapsed <= overrun_threshold;
                if !monitor_healthy {
                    warn!(
                        cycle_ms = cycle_elapsed.as_millis() as u64,
                        interval_ms = interval.as_millis() as u64,
                        "monitor cycle exceeded 80% of its interval, marking monitor unhealthy"
                    );
                }

                manager.monitor_snapshot.store(Arc::new(MonitorSnapshot {
                    cpu_percent,
                    accelerator_percent: None,
                    accelerator_memory_mb: None,
                    accelerator_temperature_c: None,
                    uptime_seconds: manager.started_at.elapsed().as_secs() as i64,
                    monitor_healthy,
                    pipelines,
                }));
            }
        })
        .expect("failed to spawn task manager monitor thread")
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_source_before_any_reservation() {
        // validated entirely independent of any running manager state;
        // exercised here purely at the `StreamSource::validate` boundary
        // the Task Manager calls first.
        let source = StreamSource {
            id: "".into(),
            url: "rtsp://example/stream".into(),
            protocol: "rtsp".into(),
            width: 640,
            height: 480,
            fps: 30,
            username: None,
            password: None,
            enabled: true,
            mjpeg_port: 9000,
            detection_enabled: false,
            detection_threads: 1,
            person_stats_enabled: false,
        };
        assert!(source.validate().is_err());
    }
}
