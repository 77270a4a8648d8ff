//! Layered configuration: built-in defaults, an optional `config/*.toml`
//! file, then `VISION_`-prefixed environment variables, in that priority
//! order (spec §9 ambient configuration). Kept as a single flat struct
//! rather than per-module config fragments since the server has one
//! process-wide settings surface.

use serde::Deserialize;
use std::ops::RangeInclusive;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub database_path: String,
    pub recordings_dir: String,
    pub mjpeg_port_start: u16,
    pub mjpeg_port_end: u16,
    pub accelerator_context_budget: u32,
    pub max_pipelines: usize,
    /// `host:port` of an MQTT broker to publish alarms through. Absent by
    /// default; MQTT alarm channels are skipped (not failed) until set.
    pub mqtt_broker: Option<String>,
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub model_path: String,
    pub num_workers: usize,
    pub num_classes: usize,
    pub model_input_width: u32,
    pub model_input_height: u32,
    pub use_cuda: bool,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_path: "vision.db".to_string(),
            recordings_dir: "recordings".to_string(),
            mjpeg_port_start: 9000,
            mjpeg_port_end: 9100,
            accelerator_context_budget: 4,
            max_pipelines: 64,
            mqtt_broker: None,
            detector: DetectorConfig::default(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: "models/yolo.onnx".to_string(),
            num_workers: 2,
            num_classes: 80,
            model_input_width: 640,
            model_input_height: 640,
            use_cuda: false,
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            max_detections: 300,
        }
    }
}

impl ServerConfig {
    pub fn mjpeg_port_range(&self) -> RangeInclusive<u16> {
        self.mjpeg_port_start..=self.mjpeg_port_end
    }

    /// Load defaults, then `config/server.toml` if present, then
    /// `VISION_*` environment overrides (e.g. `VISION_BIND_ADDR`,
    /// `VISION_DETECTOR__NUM_WORKERS`).
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&ServerConfig::default())?)
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::Environment::with_prefix("VISION").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_a_valid_port_range() {
        let config = ServerConfig::default();
        assert!(config.mjpeg_port_range().contains(&config.mjpeg_port_start));
    }
}
