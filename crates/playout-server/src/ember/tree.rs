/// The static parameter tree a consumer sees:
///
/// SuperDash (1)
/// ├── Info (1.1): Version (1.1.1), DeviceCount (1.1.2)
/// └── Devices (1.2)
///     └── Device<id> (1.2.i): State, Timecode, Filename, Connected, Type
///
/// Device nodes are numbered by configuration order; parameters hold the
/// last pushed values so directory listings and change detection agree.

use playout_protocol::device::{DeviceConfig, DeviceState, DeviceType, TransportState};
use playout_protocol::glow::{self, ParameterSpec, ParameterType, Value};

pub const ROOT_IDENTIFIER: &str = "SuperDash";
pub const VERSION: &str = "1.0.0";
/// Newline-separated, ordinal order; part of the consumer contract.
pub const STATE_ENUMERATION: &str = "stop\nplay\nrec\noffline";

const PARAM_STATE: u32 = 1;
const PARAM_TIMECODE: u32 = 2;
const PARAM_FILENAME: u32 = 3;
const PARAM_CONNECTED: u32 = 4;
const PARAM_TYPE: u32 = 5;

struct DeviceEntry {
    id: u16,
    /// Node number under Devices, 1-based configuration order.
    number: u32,
    identifier: String,
    state: TransportState,
    timecode: String,
    filename: String,
    connected: bool,
    device_type: DeviceType,
}

pub struct Tree {
    device_count: i64,
    devices: Vec<DeviceEntry>,
}

impl Tree {
    pub fn new(devices: &[DeviceConfig]) -> Self {
        let entries: Vec<DeviceEntry> = devices
            .iter()
            .enumerate()
            .map(|(i, cfg)| DeviceEntry {
                id: cfg.id,
                number: i as u32 + 1,
                identifier: format!("Device{}", cfg.id),
                state: TransportState::Offline,
                timecode: "00:00:00:00".to_string(),
                filename: String::new(),
                connected: false,
                device_type: cfg.device_type,
            })
            .collect();
        Self {
            device_count: entries.len() as i64,
            devices: entries,
        }
    }

    /// Encoded elements answering a directory request on `path`. None
    /// means the path does not exist.
    pub fn list(&self, path: &[u32]) -> Option<Vec<Vec<u8>>> {
        match path {
            &[] => Some(vec![glow::qualified_node(&[1], ROOT_IDENTIFIER)]),
            &[1] => Some(vec![
                glow::qualified_node(&[1, 1], "Info"),
                glow::qualified_node(&[1, 2], "Devices"),
            ]),
            &[1, 1] => Some(vec![self.version_param(), self.device_count_param()]),
            &[1, 1, 1] => Some(vec![self.version_param()]),
            &[1, 1, 2] => Some(vec![self.device_count_param()]),
            &[1, 2] => Some(
                self.devices
                    .iter()
                    .map(|entry| glow::qualified_node(&[1, 2, entry.number], &entry.identifier))
                    .collect(),
            ),
            &[1, 2, number] => {
                let entry = self.entry_by_number(number)?;
                Some(
                    (PARAM_STATE..=PARAM_TYPE)
                        .map(|param| encode_param(entry, param))
                        .collect(),
                )
            }
            &[1, 2, number, param] if (PARAM_STATE..=PARAM_TYPE).contains(&param) => {
                let entry = self.entry_by_number(number)?;
                Some(vec![encode_param(entry, param)])
            }
            _ => None,
        }
    }

    /// Encoded value updates for every parameter that actually changed.
    pub fn update_device(&mut self, device: &DeviceState) -> Vec<Vec<u8>> {
        let Some(entry) = self.devices.iter_mut().find(|e| e.id == device.id) else {
            return Vec::new();
        };
        let number = entry.number;
        let mut updates = Vec::new();

        if entry.state != device.state {
            entry.state = device.state;
            updates.push(glow::qualified_parameter_value(
                &[1, 2, number, PARAM_STATE],
                &Value::Int(device.state.ordinal()),
            ));
        }
        if entry.timecode != device.timecode {
            entry.timecode = device.timecode.clone();
            updates.push(glow::qualified_parameter_value(
                &[1, 2, number, PARAM_TIMECODE],
                &Value::Str(device.timecode.clone()),
            ));
        }
        if entry.filename != device.filename {
            entry.filename = device.filename.clone();
            updates.push(glow::qualified_parameter_value(
                &[1, 2, number, PARAM_FILENAME],
                &Value::Str(device.filename.clone()),
            ));
        }
        if entry.connected != device.connected {
            entry.connected = device.connected;
            updates.push(glow::qualified_parameter_value(
                &[1, 2, number, PARAM_CONNECTED],
                &Value::Bool(device.connected),
            ));
        }
        updates
    }

    /// Encoded value update when the count changed, None otherwise.
    pub fn set_device_count(&mut self, count: i64) -> Option<Vec<u8>> {
        if self.device_count == count {
            return None;
        }
        self.device_count = count;
        Some(glow::qualified_parameter_value(
            &[1, 1, 2],
            &Value::Int(count),
        ))
    }

    fn entry_by_number(&self, number: u32) -> Option<&DeviceEntry> {
        self.devices.iter().find(|e| e.number == number)
    }

    fn version_param(&self) -> Vec<u8> {
        glow::qualified_parameter(&ParameterSpec {
            path: &[1, 1, 1],
            identifier: "Version",
            ptype: ParameterType::String,
            value: Value::Str(VERSION.to_string()),
            enumeration: None,
        })
    }

    fn device_count_param(&self) -> Vec<u8> {
        glow::qualified_parameter(&ParameterSpec {
            path: &[1, 1, 2],
            identifier: "DeviceCount",
            ptype: ParameterType::Integer,
            value: Value::Int(self.device_count),
            enumeration: None,
        })
    }
}

fn encode_param(entry: &DeviceEntry, param: u32) -> Vec<u8> {
    let path = [1, 2, entry.number, param];
    let spec = match param {
        PARAM_STATE => ParameterSpec {
            path: &path,
            identifier: "State",
            ptype: ParameterType::Enum,
            value: Value::Int(entry.state.ordinal()),
            enumeration: Some(STATE_ENUMERATION),
        },
        PARAM_TIMECODE => ParameterSpec {
            path: &path,
            identifier: "Timecode",
            ptype: ParameterType::String,
            value: Value::Str(entry.timecode.clone()),
            enumeration: None,
        },
        PARAM_FILENAME => ParameterSpec {
            path: &path,
            identifier: "Filename",
            ptype: ParameterType::String,
            value: Value::Str(entry.filename.clone()),
            enumeration: None,
        },
        PARAM_CONNECTED => ParameterSpec {
            path: &path,
            identifier: "Connected",
            ptype: ParameterType::Boolean,
            value: Value::Bool(entry.connected),
            enumeration: None,
        },
        _ => ParameterSpec {
            path: &path,
            identifier: "Type",
            ptype: ParameterType::String,
            value: Value::Str(entry.device_type.as_str().to_string()),
            enumeration: None,
        },
    };
    glow::qualified_parameter(&spec)
}
