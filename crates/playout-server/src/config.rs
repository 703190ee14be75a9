/// JSON configuration: global settings plus the static device fleet.
/// Loaded once at startup; any error here is fatal.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use playout_protocol::device::{DeviceConfig, DeviceType};
use playout_protocol::tsl::DISPLAY_BROADCAST;
use playout_protocol::{
    DEFAULT_EMBER_PORT, DEFAULT_FRAMERATE, DEFAULT_TSL_PORT, DEFAULT_UPDATE_INTERVAL_MS,
    DEFAULT_WEBSOCKET_PORT,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub settings: Settings,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_framerate")]
    pub default_framerate: f64,
    /// WebSocket broadcast period.
    #[serde(default = "default_update_interval")]
    pub update_interval_ms: u64,
    #[serde(default = "default_websocket_port")]
    pub web_socket_port: u16,
    #[serde(default)]
    pub default_ports: DefaultPorts,
    #[serde(default = "default_ember_port")]
    pub ember_plus_port: u16,
    #[serde(default)]
    pub tsl_umd_destinations: Vec<TslDestination>,
    #[serde(default)]
    pub tsl_umd_screen: u16,
    /// Interface the Ember+ listener binds to; all interfaces when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultPorts {
    #[serde(default = "DefaultPorts::hyperdeck_default")]
    pub hyperdeck: u16,
    #[serde(default = "DefaultPorts::vmix_default")]
    pub vmix: u16,
    #[serde(default = "DefaultPorts::casparcg_default")]
    pub casparcg: u16,
}

impl DefaultPorts {
    fn hyperdeck_default() -> u16 {
        DeviceType::Hyperdeck.default_port()
    }
    fn vmix_default() -> u16 {
        DeviceType::Vmix.default_port()
    }
    fn casparcg_default() -> u16 {
        DeviceType::Casparcg.default_port()
    }

    pub fn for_type(&self, device_type: DeviceType) -> u16 {
        match device_type {
            DeviceType::Hyperdeck => self.hyperdeck,
            DeviceType::Vmix => self.vmix,
            DeviceType::Casparcg => self.casparcg,
        }
    }
}

impl Default for DefaultPorts {
    fn default() -> Self {
        Self {
            hyperdeck: Self::hyperdeck_default(),
            vmix: Self::vmix_default(),
            casparcg: Self::casparcg_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TslDestination {
    pub host: String,
    #[serde(default = "default_tsl_port")]
    pub port: u16,
}

/// One device as written in the config file; ports and framerates are
/// resolved against the global settings afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: u16,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<f64>,
    /// CasparCG only: which channel/layer this device watches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<u16>,
}

fn default_framerate() -> f64 {
    DEFAULT_FRAMERATE
}
fn default_update_interval() -> u64 {
    DEFAULT_UPDATE_INTERVAL_MS
}
fn default_websocket_port() -> u16 {
    DEFAULT_WEBSOCKET_PORT
}
fn default_ember_port() -> u16 {
    DEFAULT_EMBER_PORT
}
fn default_tsl_port() -> u16 {
    DEFAULT_TSL_PORT
}

impl Config {
    /// Resolve per-device port/framerate defaults into immutable
    /// DeviceConfigs, in file order.
    pub fn resolve_devices(&self) -> anyhow::Result<Vec<DeviceConfig>> {
        let mut seen = std::collections::HashSet::new();
        let mut devices = Vec::with_capacity(self.servers.len());
        for entry in &self.servers {
            if entry.id == DISPLAY_BROADCAST {
                bail!(
                    "device id {} is reserved for the TSL broadcast display",
                    entry.id
                );
            }
            if !seen.insert(entry.id) {
                bail!("duplicate device id {}", entry.id);
            }
            entry
                .ip
                .parse::<Ipv4Addr>()
                .with_context(|| format!("device {} has invalid ip {:?}", entry.id, entry.ip))?;
            let framerate = entry.framerate.unwrap_or(self.settings.default_framerate);
            if framerate <= 0.0 {
                bail!("device {} has non-positive framerate {framerate}", entry.id);
            }
            devices.push(DeviceConfig {
                id: entry.id,
                name: entry.name.clone(),
                device_type: entry.device_type,
                ip: entry.ip.clone(),
                port: entry
                    .port
                    .unwrap_or_else(|| self.settings.default_ports.for_type(entry.device_type)),
                framerate,
            });
        }
        Ok(devices)
    }
}

/// Load and validate the configuration file. Any failure here is fatal
/// to startup.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config = serde_json::from_str(&contents)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    config.resolve_devices()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(servers: &str) -> String {
        format!(
            r#"{{"settings":{{"defaultFramerate":50,"webSocketPort":9080}},"servers":{servers}}}"#
        )
    }

    #[test]
    fn test_defaults_applied() {
        let config: Config = serde_json::from_str(&minimal("[]")).unwrap();
        assert_eq!(config.settings.default_framerate, 50.0);
        assert_eq!(config.settings.update_interval_ms, 1000);
        assert_eq!(config.settings.ember_plus_port, 9000);
        assert_eq!(config.settings.default_ports.hyperdeck, 9993);
        assert!(config.settings.tsl_umd_destinations.is_empty());
        assert_eq!(config.settings.tsl_umd_screen, 0);
        assert!(config.settings.bind_address.is_none());
    }

    #[test]
    fn test_device_port_and_framerate_resolution() {
        let config: Config = serde_json::from_str(&minimal(
            r#"[
                {"id":1,"name":"DECK","type":"hyperdeck","ip":"10.0.0.1"},
                {"id":2,"name":"MIX","type":"vmix","ip":"10.0.0.2","port":8188,"framerate":25}
            ]"#,
        ))
        .unwrap();
        let devices = config.resolve_devices().unwrap();
        assert_eq!(devices[0].port, 9993);
        assert_eq!(devices[0].framerate, 50.0);
        assert_eq!(devices[1].port, 8188);
        assert_eq!(devices[1].framerate, 25.0);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let config: Config = serde_json::from_str(&minimal(
            r#"[
                {"id":1,"name":"A","type":"vmix","ip":"10.0.0.1"},
                {"id":1,"name":"B","type":"vmix","ip":"10.0.0.2"}
            ]"#,
        ))
        .unwrap();
        assert!(config.resolve_devices().is_err());
    }

    #[test]
    fn test_broadcast_id_rejected() {
        let config: Config = serde_json::from_str(&minimal(
            r#"[{"id":65535,"name":"A","type":"vmix","ip":"10.0.0.1"}]"#,
        ))
        .unwrap();
        assert!(config.resolve_devices().is_err());
    }

    #[test]
    fn test_bad_ip_rejected() {
        let config: Config = serde_json::from_str(&minimal(
            r#"[{"id":1,"name":"A","type":"vmix","ip":"not-an-ip"}]"#,
        ))
        .unwrap();
        assert!(config.resolve_devices().is_err());
    }

    #[test]
    fn test_unknown_device_type_fails_parse() {
        let result: Result<Config, _> = serde_json::from_str(&minimal(
            r#"[{"id":1,"name":"A","type":"atem","ip":"10.0.0.1"}]"#,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_tsl_destinations_parse() {
        let config: Config = serde_json::from_str(
            r#"{
                "settings": {
                    "defaultFramerate": 25,
                    "webSocketPort": 9080,
                    "tslUmdDestinations": [
                        {"host": "10.0.0.255"},
                        {"host": "10.0.0.20", "port": 5727}
                    ],
                    "tslUmdScreen": 1
                },
                "servers": []
            }"#,
        )
        .unwrap();
        let dests = &config.settings.tsl_umd_destinations;
        assert_eq!(dests[0].port, 4003);
        assert_eq!(dests[1].port, 5727);
        assert_eq!(config.settings.tsl_umd_screen, 1);
    }
}
