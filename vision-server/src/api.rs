//! REST control plane (spec §6). Generalizes
//! `retail-surveillance/src/api.rs::create_router`'s axum + permissive-CORS
//! shape from the POS/video-clip-specific route set into the full camera /
//! detection / alarm / recordings surface this server exposes.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, warn};
use vision_common::types::{AlarmChannelConfig, AlarmMethod, AlarmPayload, Event, Severity, StreamSource};
use vision_common::VisionError;
use vision_core::detector::PostprocessConfig;
use vision_core::TaskManager;

use crate::alarms::rebuild_alarm_channels;
use crate::database::Database;

#[derive(Clone)]
pub struct AppState {
    pub task_manager: Arc<TaskManager>,
    pub db: Arc<Database>,
    pub detector_pool: Arc<vision_core::detector::DetectorPool>,
    pub alarm_router: Arc<vision_core::AlarmRouter>,
    pub recordings_dir: PathBuf,
    pub ws_sender: tokio::sync::broadcast::Sender<String>,
    pub mqtt_client: Option<rumqttc::AsyncClient>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/system/status", get(system_status))
        .route("/api/cameras", get(list_cameras).post(add_camera))
        .route(
            "/api/cameras/:id",
            get(get_camera).put(update_camera).delete(remove_camera),
        )
        .route("/api/cameras/test-connection", post(test_connection))
        .route("/api/detection/config", get(get_detection_config).put(put_detection_config))
        .route("/api/detection/categories", get(get_categories).post(post_categories))
        .route("/api/cameras/:id/person-stats", get(get_person_stats).post(enable_person_stats))
        .route("/api/cameras/:id/person-stats/enable", post(enable_person_stats))
        .route("/api/cameras/:id/person-stats/disable", post(disable_person_stats))
        .route("/api/cameras/:id/person-stats/config", get(get_person_stats).post(enable_person_stats))
        .route("/api/alarms/config", get(list_alarm_configs).post(create_alarm_config))
        .route(
            "/api/alarms/config/:id",
            get(get_alarm_config).put(update_alarm_config).delete(delete_alarm_config),
        )
        .route("/api/alarms/test", post(test_alarm))
        .route("/api/alarms/status", get(alarm_status))
        .route("/api/alerts", get(list_alerts))
        .route("/api/recordings", get(list_recordings))
        .route("/api/recordings/:id", get(get_recording))
        .route("/api/recordings/:id/download", get(download_recording))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

/// Maps the engine's error taxonomy (spec §7) onto HTTP status codes for
/// the control plane boundary.
fn vision_error_response(err: VisionError) -> Response {
    let (status, tag) = match &err {
        VisionError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        VisionError::Resource(_) => (StatusCode::SERVICE_UNAVAILABLE, "resource"),
        VisionError::CapacityExceeded(_) => (StatusCode::TOO_MANY_REQUESTS, "capacity_exceeded"),
        VisionError::TransientIo(_) => (StatusCode::SERVICE_UNAVAILABLE, "transient_io"),
        VisionError::Inference(_) => (StatusCode::INTERNAL_SERVER_ERROR, "inference"),
        VisionError::Fatal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "fatal"),
        VisionError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        VisionError::AlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
    };
    (
        status,
        Json(ErrorBody {
            error: tag.to_string(),
            message: err.to_string(),
        }),
    )
        .into_response()
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> Response {
    error!(context, error = %err, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: "internal".to_string(),
            message: format!("{context}: {err}"),
        }),
    )
        .into_response()
}

async fn system_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.task_manager.system_stats();
    Json(serde_json::json!({
        "status": "operational",
        "uptime_seconds": (chrono::Utc::now() - state.started_at).num_seconds(),
        "active_pipelines": stats.active_pipelines,
        "max_pipelines": stats.max_pipelines,
        "cross_camera_tracks": stats.cross_camera_tracks,
        "cross_camera_matches": stats.cross_camera_matches,
        "alarm_queue_depth": stats.alarm_queue_depth,
        "alarms_delivered": stats.alarms_delivered,
        "alarms_failed": stats.alarms_failed,
        "contexts_in_use": stats.contexts_in_use,
        "cpu_percent": stats.cpu_percent,
        "accelerator_percent": stats.accelerator_percent,
        "accelerator_memory_mb": stats.accelerator_memory_mb,
        "accelerator_temperature_c": stats.accelerator_temperature_c,
        "monitor_uptime_seconds": stats.uptime_seconds,
        "monitor_healthy": stats.monitor_healthy,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Serialize)]
struct CameraView {
    #[serde(flatten)]
    source: StreamSource,
    state: vision_common::types::PipelineState,
    healthy: bool,
    frame_rate_fps: f64,
    frames_dropped: u64,
    uptime_seconds: i64,
}

impl CameraView {
    fn from_handle(handle: &vision_core::pipeline::PipelineHandle) -> Self {
        let stats = handle.stats();
        Self {
            source: handle.source().clone(),
            state: handle.state(),
            healthy: stats.healthy,
            frame_rate_fps: stats.frame_rate_fps,
            frames_dropped: stats.frames_dropped,
            uptime_seconds: stats.uptime_seconds,
        }
    }
}

async fn list_cameras(State(state): State<AppState>) -> Json<Vec<CameraView>> {
    let views = state
        .task_manager
        .list_active()
        .into_iter()
        .map(|handle| CameraView::from_handle(&handle))
        .collect();
    Json(views)
}

async fn add_camera(State(state): State<AppState>, Json(source): Json<StreamSource>) -> Response {
    let config_json = match serde_json::to_string(&source) {
        Ok(json) => json,
        Err(e) => return internal_error("serializing camera config", e),
    };

    match state.task_manager.add_source(source.clone()) {
        Ok(_handle) => {
            if let Err(e) = state.db.upsert_camera_config(&source.id, &config_json).await {
                warn!(source_id = %source.id, error = %e, "failed to persist camera config");
            }
            (StatusCode::CREATED, Json(serde_json::json!({ "id": source.id }))).into_response()
        }
        Err(e) => vision_error_response(e),
    }
}

async fn get_camera(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.task_manager.get_pipeline(&id) {
        Some(handle) => Json(CameraView::from_handle(&handle)).into_response(),
        None => vision_error_response(VisionError::NotFound(format!("no camera {id}"))),
    }
}

async fn update_camera(State(state): State<AppState>, Path(id): Path<String>, Json(source): Json<StreamSource>) -> Response {
    if source.id != id {
        return vision_error_response(VisionError::Validation("path id and body id must match".into()));
    }
    // pipeline parameters are fixed at start; an update is modeled as
    // remove-then-readd, same as a fresh `add_camera` for this id.
    let _ = state.task_manager.remove_source(&id);
    add_camera(State(state), Json(source)).await
}

async fn remove_camera(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.task_manager.remove_source(&id) {
        Ok(()) => {
            let _ = state.db.delete_camera_config(&id).await;
            StatusCode::OK.into_response()
        }
        Err(e) => vision_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct TestConnectionRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct TestConnectionResponse {
    ok: bool,
    error: Option<String>,
}

/// Probes reachability of an RTSP URL's `host:port` with a short TCP
/// connect — not a full RTSP handshake, which is out of scope (spec §2
/// treats ONVIF/protocol negotiation as an external collaborator).
async fn test_connection(Json(req): Json<TestConnectionRequest>) -> Json<TestConnectionResponse> {
    let Some(authority) = req
        .url
        .strip_prefix("rtsp://")
        .or_else(|| req.url.strip_prefix("rtsps://"))
    else {
        return Json(TestConnectionResponse {
            ok: false,
            error: Some("unsupported URL scheme".to_string()),
        });
    };
    let host_port = authority.rsplit_once('@').map(|(_, rest)| rest).unwrap_or(authority);
    let host_port = host_port.split('/').next().unwrap_or(host_port);
    let host_port = if host_port.contains(':') {
        host_port.to_string()
    } else {
        format!("{host_port}:554")
    };

    match tokio::time::timeout(std::time::Duration::from_secs(5), tokio::net::TcpStream::connect(&host_port)).await {
        Ok(Ok(_)) => Json(TestConnectionResponse { ok: true, error: None }),
        Ok(Err(e)) => Json(TestConnectionResponse {
            ok: false,
            error: Some(e.to_string()),
        }),
        Err(_) => Json(TestConnectionResponse {
            ok: false,
            error: Some("connection timed out".to_string()),
        }),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DetectionConfigView {
    confidence_threshold: f32,
    iou_threshold: f32,
    max_detections: usize,
    nms_mode: String,
}

async fn get_detection_config(State(state): State<AppState>) -> Json<DetectionConfigView> {
    let config = state.detector_pool.postprocess_config();
    Json(DetectionConfigView {
        confidence_threshold: config.confidence_threshold,
        iou_threshold: config.iou_threshold,
        max_detections: config.max_detections,
        nms_mode: match config.nms_mode {
            vision_core::detector::NmsMode::ClassAgnostic => "class_agnostic".to_string(),
            vision_core::detector::NmsMode::PerClass => "per_class".to_string(),
        },
    })
}

async fn put_detection_config(State(state): State<AppState>, Json(view): Json<DetectionConfigView>) -> Response {
    if !(0.0..=1.0).contains(&view.confidence_threshold) || !(0.0..=1.0).contains(&view.iou_threshold) {
        return vision_error_response(VisionError::Validation("thresholds must be in [0, 1]".into()));
    }
    let nms_mode = match view.nms_mode.as_str() {
        "class_agnostic" => vision_core::detector::NmsMode::ClassAgnostic,
        "per_class" => vision_core::detector::NmsMode::PerClass,
        other => return vision_error_response(VisionError::Validation(format!("unknown nms_mode {other}"))),
    };
    state.detector_pool.update_postprocess_config(PostprocessConfig {
        confidence_threshold: view.confidence_threshold,
        iou_threshold: view.iou_threshold,
        nms_mode,
        max_detections: view.max_detections,
    });
    StatusCode::OK.into_response()
}

async fn get_categories(State(state): State<AppState>) -> Json<Vec<u32>> {
    let mut ids: Vec<u32> = state.detector_pool.category_filter().snapshot().into_iter().collect();
    ids.sort_unstable();
    Json(ids)
}

async fn post_categories(State(state): State<AppState>, Json(ids): Json<Vec<u32>>) -> StatusCode {
    state.detector_pool.category_filter().replace(ids);
    StatusCode::OK
}

async fn get_person_stats(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.task_manager.get_pipeline(&id) {
        Some(handle) => Json(handle.recent_person_attributes()).into_response(),
        None => vision_error_response(VisionError::NotFound(format!("no camera {id}"))),
    }
}

/// Person-attribute analysis is fixed at pipeline start (spec §4.2); these
/// endpoints persist the desired flag for the next start rather than
/// mutating a running pipeline in place, and report the live pipeline's
/// actual state in the response so callers can tell the two apart.
async fn enable_person_stats(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    set_person_stats_flag(&state, &id, true).await
}

async fn disable_person_stats(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    set_person_stats_flag(&state, &id, false).await
}

async fn set_person_stats_flag(state: &AppState, id: &str, enabled: bool) -> Response {
    let Some(record) = state.db.get_camera_config(id).await.ok().flatten() else {
        return vision_error_response(VisionError::NotFound(format!("no camera {id}")));
    };
    let mut value: serde_json::Value = match serde_json::from_str(&record.config_json) {
        Ok(v) => v,
        Err(e) => return internal_error("parsing stored camera config", e),
    };
    if let serde_json::Value::Object(ref mut map) = value {
        map.insert("person_stats_enabled".into(), serde_json::json!(enabled));
    }
    let updated = value.to_string();
    if let Err(e) = state.db.upsert_camera_config(id, &updated).await {
        return internal_error("persisting camera config", e);
    }
    Json(serde_json::json!({ "id": id, "person_stats_requested": enabled, "takes_effect": "next camera restart" })).into_response()
}

#[derive(Debug, Serialize, Deserialize)]
struct AlarmConfigView {
    id: String,
    method: AlarmMethod,
    endpoint: String,
    #[serde(default)]
    headers: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    qos: u8,
    enabled: bool,
    priority_floor: u8,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn view_to_config(view: AlarmConfigView) -> AlarmChannelConfig {
    AlarmChannelConfig {
        id: view.id,
        method: view.method,
        endpoint: view.endpoint,
        headers: view.headers,
        topic: view.topic,
        qos: view.qos,
        enabled: view.enabled,
        priority_floor: view.priority_floor,
        timeout_ms: view.timeout_ms,
    }
}

async fn list_alarm_configs(State(state): State<AppState>) -> Response {
    match state.db.list_alarm_configs().await {
        Ok(records) => {
            let configs: Vec<AlarmChannelConfig> = records
                .into_iter()
                .filter_map(|r| serde_json::from_str(&r.json).ok())
                .collect();
            Json(configs).into_response()
        }
        Err(e) => internal_error("listing alarm configs", e),
    }
}

async fn create_alarm_config(State(state): State<AppState>, Json(view): Json<AlarmConfigView>) -> Response {
    let config = view_to_config(view);
    if let Err(e) = persist_and_reload_alarm_config(&state, &config).await {
        return internal_error("persisting alarm config", e);
    }
    (StatusCode::CREATED, Json(config)).into_response()
}

async fn get_alarm_config(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.db.get_alarm_config(&id).await {
        Ok(Some(record)) => match serde_json::from_str::<AlarmChannelConfig>(&record.json) {
            Ok(config) => Json(config).into_response(),
            Err(e) => internal_error("decoding stored alarm config", e),
        },
        Ok(None) => vision_error_response(VisionError::NotFound(format!("no alarm config {id}"))),
        Err(e) => internal_error("fetching alarm config", e),
    }
}

async fn update_alarm_config(State(state): State<AppState>, Path(id): Path<String>, Json(mut view): Json<AlarmConfigView>) -> Response {
    view.id = id;
    let config = view_to_config(view);
    if let Err(e) = persist_and_reload_alarm_config(&state, &config).await {
        return internal_error("persisting alarm config", e);
    }
    Json(config).into_response()
}

async fn delete_alarm_config(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.db.delete_alarm_config(&id).await {
        Ok(true) => {
            if let Err(e) = reload_alarm_channels(&state).await {
                return internal_error("reloading alarm channels", e);
            }
            StatusCode::OK.into_response()
        }
        Ok(false) => vision_error_response(VisionError::NotFound(format!("no alarm config {id}"))),
        Err(e) => internal_error("deleting alarm config", e),
    }
}

async fn persist_and_reload_alarm_config(state: &AppState, config: &AlarmChannelConfig) -> anyhow::Result<()> {
    let method = match config.method {
        AlarmMethod::HttpPost => "http_post",
        AlarmMethod::WebSocket => "websocket",
        AlarmMethod::Mqtt => "mqtt",
    };
    let json = serde_json::to_string(config)?;
    state.db.upsert_alarm_config(&config.id, method, &json).await?;
    reload_alarm_channels(state).await
}

async fn reload_alarm_channels(state: &AppState) -> anyhow::Result<()> {
    let records = state.db.list_alarm_configs().await?;
    let configs: Vec<AlarmChannelConfig> = records.into_iter().filter_map(|r| serde_json::from_str(&r.json).ok()).collect();
    let registered = rebuild_alarm_channels(configs, state.ws_sender.clone(), state.mqtt_client.clone());
    state.alarm_router.set_channels(registered);
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TestAlarmRequest {
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default)]
    message: Option<String>,
}

fn default_priority() -> u8 {
    1
}

async fn test_alarm(State(state): State<AppState>, Json(req): Json<TestAlarmRequest>) -> Json<serde_json::Value> {
    let event = Event {
        id: uuid::Uuid::new_v4(),
        source_id: "test".to_string(),
        event_type: "synthetic_test".to_string(),
        severity: Severity::Info,
        timestamp: chrono::Utc::now(),
        bbox: None,
        local_track_id: None,
        global_track_id: None,
        metadata: serde_json::json!({ "message": req.message }),
    };
    let mut payload = AlarmPayload::from_event(event, req.priority);
    payload.test_mode = true;
    let alarm_id = payload.alarm_id;
    state.alarm_router.enqueue(payload);
    Json(serde_json::json!({ "alarm_id": alarm_id, "enqueued": true }))
}

async fn alarm_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (delivered, failed) = state.alarm_router.totals();
    Json(serde_json::json!({
        "queue_depth": state.alarm_router.queue_depth(),
        "delivered": delivered,
        "failed": failed,
        "recent": state.alarm_router.recent_results(),
    }))
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    source_id: Option<String>,
    limit: Option<i64>,
}

async fn list_alerts(State(state): State<AppState>, Query(params): Query<AlertsQuery>) -> Response {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    match state.db.list_events(params.source_id.as_deref(), limit).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => internal_error("listing alerts", e),
    }
}

#[derive(Debug, Serialize)]
struct RecordingEntry {
    id: String,
    path: String,
    size_bytes: u64,
}

fn scan_recordings(dir: &std::path::Path) -> Vec<RecordingEntry> {
    let mut entries = Vec::new();
    let walker = walkdir_lite(dir);
    for path in walker {
        if path.extension().and_then(|e| e.to_str()) == Some("mp4") {
            let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let id = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
            entries.push(RecordingEntry {
                id,
                path: path.to_string_lossy().to_string(),
                size_bytes,
            });
        }
    }
    entries
}

/// Minimal recursive directory walk; recordings are nested
/// `source_id/yyyymmdd/*.mp4` (see `Recorder::clip_path`), shallow enough
/// that pulling in a dedicated crate for this one scan is not warranted.
fn walkdir_lite(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else { return out };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walkdir_lite(&path));
        } else {
            out.push(path);
        }
    }
    out
}

async fn list_recordings(State(state): State<AppState>) -> Json<Vec<RecordingEntry>> {
    Json(scan_recordings(&state.recordings_dir))
}

async fn get_recording(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match scan_recordings(&state.recordings_dir).into_iter().find(|r| r.id == id) {
        Some(entry) => Json(entry).into_response(),
        None => vision_error_response(VisionError::NotFound(format!("no recording {id}"))),
    }
}

async fn download_recording(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(entry) = scan_recordings(&state.recordings_dir).into_iter().find(|r| r.id == id) else {
        return vision_error_response(VisionError::NotFound(format!("no recording {id}")));
    };
    match tokio::fs::read(&entry.path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "video/mp4")],
            bytes,
        )
            .into_response(),
        Err(e) => internal_error("reading recording file", e),
    }
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_alarm_socket(socket, state.ws_sender.subscribe()))
}

async fn handle_alarm_socket(mut socket: axum::extract::ws::WebSocket, mut rx: tokio::sync::broadcast::Receiver<String>) {
    while let Ok(message) = rx.recv().await {
        if socket.send(Message::Text(message)).await.is_err() {
            break;
        }
    }
}
