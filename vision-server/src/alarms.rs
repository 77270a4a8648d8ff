//! Builds the concrete `AlarmChannel` set an `AlarmRouter` dispatches to,
//! from persisted `AlarmChannelConfig` rows. Separated from `api.rs` and
//! `main.rs` since both need to rebuild the same set (on startup, and on
//! every alarm config mutation).

use std::sync::Arc;

use tracing::warn;
use vision_common::types::{AlarmChannelConfig, AlarmMethod};
use vision_core::{AlarmChannel, HttpChannel, MqttChannel, RegisteredChannel, WebSocketChannel};

pub fn rebuild_alarm_channels(
    configs: Vec<AlarmChannelConfig>,
    ws_sender: tokio::sync::broadcast::Sender<String>,
    mqtt_client: Option<rumqttc::AsyncClient>,
) -> Vec<RegisteredChannel> {
    configs
        .into_iter()
        .filter_map(|config| {
            let channel: Arc<dyn AlarmChannel> = match config.method {
                AlarmMethod::HttpPost => Arc::new(HttpChannel::default()),
                AlarmMethod::WebSocket => Arc::new(WebSocketChannel::new(ws_sender.clone(), true)),
                AlarmMethod::Mqtt => match &mqtt_client {
                    Some(client) => Arc::new(MqttChannel::new(client.clone())),
                    None => {
                        warn!(config_id = %config.id, "mqtt alarm channel configured but no mqtt client available, skipping");
                        return None;
                    }
                },
            };
            Some(RegisteredChannel { config, channel })
        })
        .collect()
}
