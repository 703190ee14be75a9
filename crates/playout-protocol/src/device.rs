/// Normalised device model shared by the protocol clients, the
/// aggregator, and every fan-out surface.

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_CASPARCG_PORT, DEFAULT_HYPERDECK_PORT, DEFAULT_VMIX_PORT};

/// Kind of playout device a protocol client speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Hyperdeck,
    Vmix,
    Casparcg,
}

impl DeviceType {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Hyperdeck => DEFAULT_HYPERDECK_PORT,
            Self::Vmix => DEFAULT_VMIX_PORT,
            Self::Casparcg => DEFAULT_CASPARCG_PORT,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hyperdeck => "hyperdeck",
            Self::Vmix => "vmix",
            Self::Casparcg => "casparcg",
        }
    }
}

/// Transport state every device type is normalised into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Stop,
    Play,
    Rec,
    #[default]
    Offline,
}

impl TransportState {
    /// Ember+ enumeration ordinal. The ordering stop|play|rec|offline is
    /// part of the consumer contract.
    pub fn ordinal(self) -> i64 {
        match self {
            Self::Stop => 0,
            Self::Play => 1,
            Self::Rec => 2,
            Self::Offline => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Play => "play",
            Self::Rec => "rec",
            Self::Offline => "offline",
        }
    }
}

/// One configured device, fully resolved (port and framerate defaults
/// applied). Immutable for the process lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceConfig {
    pub id: u16,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub ip: String,
    pub port: u16,
    pub framerate: f64,
}

/// Live view of one device, owned by the aggregator.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceState {
    pub id: u16,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub ip: String,
    pub port: u16,
    pub framerate: f64,
    pub state: TransportState,
    pub timecode: String,
    pub filename: String,
    /// Monotonic milliseconds since process start, never wall clock.
    pub updated: u64,
    pub connected: bool,
}

impl DeviceState {
    pub fn from_config(cfg: &DeviceConfig) -> Self {
        Self {
            id: cfg.id,
            name: cfg.name.clone(),
            device_type: cfg.device_type,
            ip: cfg.ip.clone(),
            port: cfg.port,
            framerate: cfg.framerate,
            state: TransportState::Offline,
            timecode: "00:00:00:00".to_string(),
            filename: String::new(),
            updated: 0,
            connected: false,
        }
    }
}

/// Transport payload a protocol client emits upward when any of the
/// three fields changed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportUpdate {
    pub state: TransportState,
    pub timecode: String,
    pub filename: String,
}

/// Strip any path prefix (both separators) from a clip name.
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
