//! Alarm Router (spec §4.6). A single worker drains a strict-priority queue
//! (FIFO within equal priority) and fans each payload out to every enabled
//! channel whose priority floor admits it, with bounded per-payload
//! concurrency but strictly sequential payloads.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};

use async_trait::async_trait;
use tracing::{error, info, warn};
use vision_common::types::{AlarmChannelConfig, AlarmMethod, AlarmPayload, DeliveryResult};

/// One concrete alarm delivery mechanism. Implementations must not block
/// the worker thread's async runtime; network I/O goes through `async`.
#[async_trait]
pub trait AlarmChannel: Send + Sync {
    async fn deliver(&self, config: &AlarmChannelConfig, payload: &AlarmPayload) -> DeliveryResult;
}

/// HTTP POST delivery: JSON body, configured headers, per-config timeout.
/// Success is any 2xx status.
pub struct HttpChannel {
    client: reqwest::Client,
}

impl Default for HttpChannel {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlarmChannel for HttpChannel {
    async fn deliver(&self, config: &AlarmChannelConfig, payload: &AlarmPayload) -> DeliveryResult {
        let start = std::time::Instant::now();
        let mut request = self
            .client
            .post(&config.endpoint)
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .json(payload);
        for (key, value) in &config.headers {
            request = request.header(key, value);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => DeliveryResult {
                config_id: config.id.clone(),
                method: AlarmMethod::HttpPost,
                success: true,
                duration_ms: start.elapsed().as_millis() as u64,
                error: None,
            },
            Ok(response) => DeliveryResult {
                config_id: config.id.clone(),
                method: AlarmMethod::HttpPost,
                success: false,
                duration_ms: start.elapsed().as_millis() as u64,
                error: Some(format!("unexpected status {}", response.status())),
            },
            Err(e) => DeliveryResult {
                config_id: config.id.clone(),
                method: AlarmMethod::HttpPost,
                success: false,
                duration_ms: start.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
        }
    }
}

/// MQTT publish delivery. Success is broker ack for QoS ≥ 1, local enqueue
/// for QoS 0 — `rumqttc::AsyncClient::publish` returning Ok is sufficient
/// for either case, since the eventloop that actually waits for the ack
/// runs independently of this call.
pub struct MqttChannel {
    client: rumqttc::AsyncClient,
}

impl MqttChannel {
    pub fn new(client: rumqttc::AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AlarmChannel for MqttChannel {
    async fn deliver(&self, config: &AlarmChannelConfig, payload: &AlarmPayload) -> DeliveryResult {
        let start = std::time::Instant::now();
        let topic = config.topic.clone().unwrap_or_else(|| "vision/alarms".to_string());
        let qos = match config.qos {
            0 => rumqttc::QoS::AtMostOnce,
            1 => rumqttc::QoS::AtLeastOnce,
            _ => rumqttc::QoS::ExactlyOnce,
        };

        let body = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => {
                return DeliveryResult {
                    config_id: config.id.clone(),
                    method: AlarmMethod::Mqtt,
                    success: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: Some(format!("serialize failed: {e}")),
                }
            }
        };

        match self.client.publish(topic, qos, false, body).await {
            Ok(()) => DeliveryResult {
                config_id: config.id.clone(),
                method: AlarmMethod::Mqtt,
                success: true,
                duration_ms: start.elapsed().as_millis() as u64,
                error: None,
            },
            Err(e) => DeliveryResult {
                config_id: config.id.clone(),
                method: AlarmMethod::Mqtt,
                success: false,
                duration_ms: start.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
        }
    }
}

/// WebSocket broadcast delivery. A connected-client roster is shared with
/// the REST layer through a `tokio::sync::broadcast` sender; zero
/// subscribers is configurable to count as success (no-op) rather than
/// failure, since nobody is listening is not the channel's fault.
pub struct WebSocketChannel {
    sender: tokio::sync::broadcast::Sender<String>,
    zero_clients_is_success: bool,
}

impl WebSocketChannel {
    pub fn new(sender: tokio::sync::broadcast::Sender<String>, zero_clients_is_success: bool) -> Self {
        Self {
            sender,
            zero_clients_is_success,
        }
    }
}

#[async_trait]
impl AlarmChannel for WebSocketChannel {
    async fn deliver(&self, config: &AlarmChannelConfig, payload: &AlarmPayload) -> DeliveryResult {
        let start = std::time::Instant::now();
        let body = match serde_json::to_string(payload) {
            Ok(b) => b,
            Err(e) => {
                return DeliveryResult {
                    config_id: config.id.clone(),
                    method: AlarmMethod::WebSocket,
                    success: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: Some(format!("serialize failed: {e}")),
                }
            }
        };

        let delivered = self.sender.send(body).unwrap_or(0);
        let success = delivered > 0 || self.zero_clients_is_success;
        DeliveryResult {
            config_id: config.id.clone(),
            method: AlarmMethod::WebSocket,
            success,
            duration_ms: start.elapsed().as_millis() as u64,
            error: if success { None } else { Some("no connected clients".into()) },
        }
    }
}

struct QueueItem {
    payload: AlarmPayload,
    sequence: u64,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.payload.priority == other.payload.priority && self.sequence == other.sequence
    }
}
impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    /// `BinaryHeap` is a max-heap: higher priority sorts first, and within
    /// equal priority the *earlier* sequence number must sort first (FIFO),
    /// so sequence comparison is reversed.
    fn cmp(&self, other: &Self) -> Ordering {
        self.payload
            .priority
            .cmp(&other.payload.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Totals {
    delivered: u64,
    failed: u64,
}

struct SharedState {
    heap: Mutex<BinaryHeap<QueueItem>>,
    not_empty: Condvar,
    shutdown: AtomicBool,
    next_sequence: AtomicU64,
    results: Mutex<VecDeque<DeliveryResult>>,
    results_capacity: usize,
    totals: Mutex<Totals>,
}

/// Channel registration bundled with the config it was built from — the
/// router re-reads `priority_floor`/`enabled` on every dispatch so runtime
/// channel-config edits take effect without restarting the worker.
pub struct RegisteredChannel {
    pub config: AlarmChannelConfig,
    pub channel: Arc<dyn AlarmChannel>,
}

pub struct AlarmRouter {
    shared: Arc<SharedState>,
    channels: Arc<Mutex<Vec<RegisteredChannel>>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl AlarmRouter {
    pub fn new(results_capacity: usize) -> Self {
        let shared = Arc::new(SharedState {
            heap: Mutex::new(BinaryHeap::new()),
            not_empty: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_sequence: AtomicU64::new(0),
            results: Mutex::new(VecDeque::with_capacity(results_capacity)),
            results_capacity: results_capacity.max(1),
            totals: Mutex::new(Totals { delivered: 0, failed: 0 }),
        });
        let channels = Arc::new(Mutex::new(Vec::new()));

        let worker_shared = Arc::clone(&shared);
        let worker_channels = Arc::clone(&channels);
        let worker = std::thread::Builder::new()
            .name("vision-alarm-router".to_string())
            .spawn(move || run_worker(worker_shared, worker_channels))
            .expect("failed to spawn alarm router worker thread");

        Self {
            shared,
            channels,
            worker: Some(worker),
        }
    }

    pub fn set_channels(&self, registered: Vec<RegisteredChannel>) {
        *self.channels.lock().unwrap_or_else(|e| e.into_inner()) = registered;
    }

    /// Enqueue a payload. Ordering: strictly priority-descending, FIFO
    /// within equal priority, by insertion order (spec §8 property 7).
    pub fn enqueue(&self, payload: AlarmPayload) {
        let sequence = self.shared.next_sequence.fetch_add(1, AtomicOrdering::SeqCst);
        let mut heap = self.shared.heap.lock().unwrap_or_else(|e| e.into_inner());
        heap.push(QueueItem { payload, sequence });
        self.shared.not_empty.notify_one();
    }

    pub fn recent_results(&self) -> Vec<DeliveryResult> {
        self.shared.results.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }

    pub fn totals(&self) -> (u64, u64) {
        let totals = self.shared.totals.lock().unwrap_or_else(|e| e.into_inner());
        (totals.delivered, totals.failed)
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.heap.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Completes all in-flight deliveries, drains without starting new
    /// dispatches, then joins the worker thread.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, AtomicOrdering::SeqCst);
        self.shared.not_empty.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for AlarmRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<SharedState>, channels: Arc<Mutex<Vec<RegisteredChannel>>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "alarm router failed to start its runtime");
            return;
        }
    };

    loop {
        let next = {
            let mut heap = shared.heap.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(item) = heap.pop() {
                    break Some(item);
                }
                if shared.shutdown.load(AtomicOrdering::SeqCst) {
                    break None;
                }
                let (guard, _timeout) = shared
                    .not_empty
                    .wait_timeout(heap, std::time::Duration::from_millis(200))
                    .unwrap_or_else(|e| e.into_inner());
                heap = guard;
            }
        };

        let Some(item) = next else {
            return;
        };

        let payload = item.payload;
        let admitted: Vec<Arc<dyn AlarmChannel>> = {
            let registered = channels.lock().unwrap_or_else(|e| e.into_inner());
            registered
                .iter()
                .filter(|r| r.config.enabled && r.config.priority_floor <= payload.priority)
                .map(|r| Arc::clone(&r.channel))
                .collect()
        };
        let configs: Vec<AlarmChannelConfig> = {
            let registered = channels.lock().unwrap_or_else(|e| e.into_inner());
            registered
                .iter()
                .filter(|r| r.config.enabled && r.config.priority_floor <= payload.priority)
                .map(|r| r.config.clone())
                .collect()
        };

        let results = runtime.block_on(dispatch_to_all(admitted, configs, payload));

        let mut totals = shared.totals.lock().unwrap_or_else(|e| e.into_inner());
        let mut ring = shared.results.lock().unwrap_or_else(|e| e.into_inner());
        for result in results {
            if result.success {
                totals.delivered += 1;
            } else {
                totals.failed += 1;
                warn!(config_id = %result.config_id, error = ?result.error, "alarm delivery failed");
            }
            if ring.len() >= shared.results_capacity {
                ring.pop_front();
            }
            ring.push_back(result);
        }
    }
}

async fn dispatch_to_all(
    channels: Vec<Arc<dyn AlarmChannel>>,
    configs: Vec<AlarmChannelConfig>,
    payload: AlarmPayload,
) -> Vec<DeliveryResult> {
    let mut set = tokio::task::JoinSet::new();
    for (channel, config) in channels.into_iter().zip(configs.into_iter()) {
        let payload = payload.clone();
        set.spawn(async move { channel.deliver(&config, &payload).await });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!(error = %e, "alarm delivery task panicked"),
        }
    }
    if results.is_empty() {
        info!(alarm_id = %payload.alarm_id, "no enabled channel admitted this payload");
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vision_common::types::{Event, Severity};

    fn payload_with_priority(priority: u8) -> AlarmPayload {
        AlarmPayload::from_event(
            Event {
                id: uuid::Uuid::new_v4(),
                source_id: "cam-1".into(),
                event_type: "test".into(),
                severity: Severity::Info,
                timestamp: Utc::now(),
                bbox: None,
                local_track_id: None,
                global_track_id: None,
                metadata: serde_json::Value::Null,
            },
            priority,
        )
    }

    struct RecordingChannel {
        order: Arc<Mutex<Vec<u8>>>,
    }

    #[async_trait]
    impl AlarmChannel for RecordingChannel {
        async fn deliver(&self, _config: &AlarmChannelConfig, payload: &AlarmPayload) -> DeliveryResult {
            self.order.lock().unwrap().push(payload.priority);
            DeliveryResult {
                config_id: "rec".into(),
                method: AlarmMethod::HttpPost,
                success: true,
                duration_ms: 0,
                error: None,
            }
        }
    }

    #[test]
    fn priority_then_fifo_ordering() {
        let mut router = AlarmRouter::new(16);
        let order = Arc::new(Mutex::new(Vec::new()));
        router.set_channels(vec![RegisteredChannel {
            config: AlarmChannelConfig {
                id: "rec".into(),
                method: AlarmMethod::HttpPost,
                endpoint: String::new(),
                headers: Default::default(),
                topic: None,
                qos: 0,
                enabled: true,
                priority_floor: 0,
                timeout_ms: 1000,
            },
            channel: Arc::new(RecordingChannel { order: Arc::clone(&order) }),
        }]);

        for priority in [1u8, 5, 3, 5] {
            router.enqueue(payload_with_priority(priority));
        }

        // wait for the worker to process all four payloads.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while order.lock().unwrap().len() < 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        router.shutdown();
        assert_eq!(*order.lock().unwrap(), vec![5, 5, 3, 1]);
    }

    #[test]
    fn shutdown_joins_worker_thread() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut router = AlarmRouter::new(4);
        let _ = Arc::clone(&counter);
        router.enqueue(payload_with_priority(1));
        router.shutdown();
        assert!(router.worker.is_none());
        let _ = Ordering::SeqCst;
    }
}
