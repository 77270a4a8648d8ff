//! Process entry point: loads configuration, wires every engine
//! collaborator (Detector Pool, Port/Resource Allocator, Cross-Camera ReID
//! Registry, Alarm Router, Task Manager), restores persisted cameras and
//! alarm channels, and serves the REST control plane until a shutdown
//! signal arrives.

mod alarms;
mod api;
mod config;
mod database;
mod event_sink;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use vision_common::types::StreamSource;
use vision_core::detector::{ChannelOrder, ContextFactory, DetectorPool, DetectorPoolConfig, ExecutionProvider, OrtInferenceContext, PostprocessConfig, TensorElementKind};
use vision_core::{AlarmRouter, CategoryFilter, CrossCameraRegistry, RegistryConfig, ResourceAllocator, TaskManager, TaskManagerConfig};

use crate::alarms::rebuild_alarm_channels;
use crate::api::AppState;
use crate::config::ServerConfig;
use crate::database::Database;
use crate::event_sink::DbEventSink;

const ALARM_RESULTS_CAPACITY: usize = 256;
const WS_BROADCAST_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("vision_server=info".parse()?))
        .init();

    let config = ServerConfig::load().context("failed to load configuration")?;
    info!(?config.bind_addr, "starting vision-server");

    gstreamer::init().context("failed to initialize gstreamer")?;

    let db = Database::new(&config.database_path).await.context("failed to open database")?;
    db.run_migrations().await.context("failed to run database migrations")?;

    let (ws_sender, _ws_rx) = tokio::sync::broadcast::channel(WS_BROADCAST_CAPACITY);

    let mqtt_client = match &config.mqtt_broker {
        Some(broker) => Some(spawn_mqtt_client(broker)?),
        None => {
            info!("no mqtt_broker configured, mqtt alarm channels will be skipped");
            None
        }
    };

    let category_filter = Arc::new(CategoryFilter::allow_all());
    let detector_pool = Arc::new(build_detector_pool(&config.detector, Arc::clone(&category_filter)));
    let allocator = Arc::new(ResourceAllocator::new(config.mjpeg_port_range(), config.accelerator_context_budget));
    let registry = Arc::new(CrossCameraRegistry::new(RegistryConfig::default()));
    let alarm_router = Arc::new(AlarmRouter::new(ALARM_RESULTS_CAPACITY));

    let persisted_alarm_configs = db.list_alarm_configs().await.context("failed to load alarm configs")?;
    let alarm_configs: Vec<vision_common::types::AlarmChannelConfig> = persisted_alarm_configs
        .into_iter()
        .filter_map(|record| serde_json::from_str(&record.json).ok())
        .collect();
    alarm_router.set_channels(rebuild_alarm_channels(alarm_configs, ws_sender.clone(), mqtt_client.clone()));

    let event_sink = Arc::new(DbEventSink::new(db.clone()));
    let class_names: Arc<dyn Fn(u32) -> String + Send + Sync> = Arc::new(|class_id: u32| format!("class_{class_id}"));

    let task_manager = TaskManager::new(
        TaskManagerConfig {
            max_pipelines: config.max_pipelines,
            ..TaskManagerConfig::default()
        },
        Arc::clone(&detector_pool),
        Arc::clone(&alarm_router),
        Arc::clone(&allocator),
        Arc::clone(&registry),
        event_sink,
        class_names,
    );

    restore_persisted_cameras(&db, &task_manager).await;

    let state = AppState {
        task_manager: Arc::clone(&task_manager),
        db: Arc::new(db),
        detector_pool,
        alarm_router: Arc::clone(&alarm_router),
        recordings_dir: std::path::PathBuf::from(&config.recordings_dir),
        ws_sender,
        mqtt_client,
        started_at: chrono::Utc::now(),
    };

    let router = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "REST control plane listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("REST server terminated unexpectedly")?;

    info!("shutting down task manager");
    task_manager.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}

/// Restores cameras persisted from a previous run. Errors on an individual
/// camera are logged and skipped rather than aborting startup.
async fn restore_persisted_cameras(db: &Database, task_manager: &Arc<TaskManager>) {
    let records = match db.list_camera_configs().await {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "failed to load persisted camera configs");
            return;
        }
    };

    for record in records {
        match serde_json::from_str::<StreamSource>(&record.config_json) {
            Ok(source) if source.enabled => {
                if let Err(e) = task_manager.add_source(source) {
                    warn!(source_id = %record.source_id, error = %e, "failed to restore camera");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(source_id = %record.source_id, error = %e, "failed to decode persisted camera config"),
        }
    }
}

fn build_detector_pool(detector: &config::DetectorConfig, category_filter: Arc<CategoryFilter>) -> DetectorPool {
    let model_path = detector.model_path.clone();
    let provider = if detector.use_cuda { ExecutionProvider::Cuda } else { ExecutionProvider::Cpu };
    let num_classes = detector.num_classes;

    let make_context: Arc<ContextFactory> = Arc::new(move |worker_id: usize| {
        info!(worker_id, model = %model_path, "loading inference context");
        let ctx = OrtInferenceContext::load(&model_path, provider, num_classes)?;
        Ok(Box::new(ctx) as Box<dyn vision_core::detector::InferenceContext>)
    });

    DetectorPool::new(
        DetectorPoolConfig {
            num_workers: detector.num_workers,
            max_queue_len: 64,
            model_input_size: (detector.model_input_width, detector.model_input_height),
            channel_order: ChannelOrder::Rgb,
            element_kind: TensorElementKind::Float32,
            postprocess_config: PostprocessConfig {
                confidence_threshold: detector.confidence_threshold,
                iou_threshold: detector.iou_threshold,
                nms_mode: vision_core::detector::NmsMode::ClassAgnostic,
                max_detections: detector.max_detections,
            },
            category_filter,
        },
        make_context,
    )
}

fn spawn_mqtt_client(broker: &str) -> Result<rumqttc::AsyncClient> {
    let (host, port) = broker
        .rsplit_once(':')
        .context("mqtt_broker must be host:port")
        .and_then(|(host, port)| Ok((host.to_string(), port.parse::<u16>().context("invalid mqtt broker port")?)))?;

    let mut options = rumqttc::MqttOptions::new("vision-server", host, port);
    options.set_keep_alive(std::time::Duration::from_secs(10));

    let (client, mut event_loop) = rumqttc::AsyncClient::new(options, 64);
    tokio::spawn(async move {
        loop {
            match event_loop.poll().await {
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt event loop error, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    });

    Ok(client)
}
