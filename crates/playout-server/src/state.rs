/// Shared application state: the authoritative device map, protocol
/// output status, and the WebSocket broadcast channel. All fields are
/// thread-safe; the device map is only mutated from the aggregator task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use playout_protocol::device::{DeviceConfig, DeviceState};

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub start_time: Instant,
    /// Raw configuration, echoed back on getConfig.
    pub config: Config,
    /// Resolved immutable device configs, file order.
    pub devices_config: Vec<DeviceConfig>,
    pub devices: RwLock<BTreeMap<u16, DeviceState>>,
    pub protocols: RwLock<ProtocolStatus>,
    /// Serialised playoutStates frames, one per broadcast tick.
    pub broadcast_tx: broadcast::Sender<String>,
}

impl AppState {
    pub fn new(config: Config, devices_config: Vec<DeviceConfig>) -> Self {
        let devices = devices_config
            .iter()
            .map(|cfg| (cfg.id, DeviceState::from_config(cfg)))
            .collect();
        let protocols = ProtocolStatus {
            ember_plus: EmberStatus {
                enabled: true,
                running: false,
                port: config.settings.ember_plus_port,
            },
            tsl_umd: TslStatus {
                enabled: !config.settings.tsl_umd_destinations.is_empty(),
                running: false,
                destinations: config
                    .settings
                    .tsl_umd_destinations
                    .iter()
                    .map(|d| format!("{}:{}", d.host, d.port))
                    .collect(),
                device_count: devices_config.len(),
            },
        };
        Self {
            inner: Arc::new(AppStateInner {
                start_time: Instant::now(),
                config,
                devices_config,
                devices: RwLock::new(devices),
                protocols: RwLock::new(protocols),
                broadcast_tx: broadcast::channel(16).0,
            }),
        }
    }

    /// Milliseconds since process start, from the monotonic clock.
    pub fn monotonic_ms(&self) -> u64 {
        self.inner.start_time.elapsed().as_millis() as u64
    }

    /// Consistent copy of every device state, id order.
    pub async fn snapshot(&self) -> Vec<DeviceState> {
        self.inner.devices.read().await.values().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolStatus {
    pub ember_plus: EmberStatus,
    pub tsl_umd: TslStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmberStatus {
    pub enabled: bool,
    pub running: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TslStatus {
    pub enabled: bool,
    pub running: bool,
    pub destinations: Vec<String>,
    pub device_count: usize,
}
