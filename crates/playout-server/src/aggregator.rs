/// The aggregation domain. Protocol clients post events into one
/// channel; this task is the only writer of the device map, so per-device
/// ordering and the offline ⇒ disconnected invariant hold by
/// construction. Ember+ and TSL side effects run after the store
/// mutation and before the next event is taken.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use playout_protocol::device::{DeviceState, TransportState, TransportUpdate};

use crate::ember::EmberProvider;
use crate::state::AppState;
use crate::tsl_sender::UmdSender;

#[derive(Debug, Clone)]
pub enum ClientEventKind {
    Transport(TransportUpdate),
    Connected,
    Disconnected,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub device_id: u16,
    pub kind: ClientEventKind,
}

pub type EventSender = mpsc::UnboundedSender<ClientEvent>;

pub async fn run(
    state: AppState,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    ember: EmberProvider,
    tsl: UmdSender,
) {
    while let Some(event) = events.recv().await {
        if let ClientEventKind::Error(message) = &event.kind {
            warn!(device = event.device_id, %message, "device client error");
            continue;
        }

        let snapshot = {
            let mut devices = state.inner.devices.write().await;
            let Some(device) = devices.get_mut(&event.device_id) else {
                warn!(device = event.device_id, "event for unknown device id");
                continue;
            };
            apply_event(device, &event.kind, state.monotonic_ms());
            device.clone()
        };

        ember.update_device(&snapshot).await;
        tsl.update_device(snapshot.id, &snapshot.name, snapshot.state)
            .await;
    }
    debug!("aggregator channel closed");
}

/// Apply one client event to a device. Timecode and filename survive a
/// disconnect so the operator keeps context; the transport state does
/// not.
fn apply_event(device: &mut DeviceState, kind: &ClientEventKind, now_ms: u64) {
    match kind {
        ClientEventKind::Transport(update) => {
            device.state = update.state;
            device.timecode = update.timecode.clone();
            device.filename = update.filename.clone();
            device.connected = update.state != TransportState::Offline;
        }
        ClientEventKind::Connected => {
            device.connected = true;
            if device.state == TransportState::Offline {
                device.state = TransportState::Stop;
            }
        }
        ClientEventKind::Disconnected => {
            device.connected = false;
            device.state = TransportState::Offline;
        }
        ClientEventKind::Error(_) => {}
    }
    device.updated = device.updated.max(now_ms);
}

#[cfg(test)]
mod tests {
    use super::*;
    use playout_protocol::device::{DeviceConfig, DeviceType};

    fn device() -> DeviceState {
        DeviceState::from_config(&DeviceConfig {
            id: 1,
            name: "DECK 1".into(),
            device_type: DeviceType::Hyperdeck,
            ip: "10.0.0.5".into(),
            port: 9993,
            framerate: 25.0,
        })
    }

    fn transport(state: TransportState) -> ClientEventKind {
        ClientEventKind::Transport(TransportUpdate {
            state,
            timecode: "01:02:03:04".into(),
            filename: "clip.mov".into(),
        })
    }

    #[test]
    fn test_connect_moves_offline_to_stop() {
        let mut d = device();
        apply_event(&mut d, &ClientEventKind::Connected, 10);
        assert!(d.connected);
        assert_eq!(d.state, TransportState::Stop);
        assert_eq!(d.updated, 10);
    }

    #[test]
    fn test_connect_does_not_clobber_transport() {
        let mut d = device();
        apply_event(&mut d, &transport(TransportState::Play), 10);
        apply_event(&mut d, &ClientEventKind::Connected, 20);
        assert_eq!(d.state, TransportState::Play);
    }

    #[test]
    fn test_disconnect_forces_offline_but_keeps_context() {
        let mut d = device();
        apply_event(&mut d, &transport(TransportState::Play), 10);
        apply_event(&mut d, &ClientEventKind::Disconnected, 20);
        assert_eq!(d.state, TransportState::Offline);
        assert!(!d.connected);
        assert_eq!(d.timecode, "01:02:03:04");
        assert_eq!(d.filename, "clip.mov");
    }

    #[test]
    fn test_offline_implies_disconnected() {
        let mut d = device();
        let events = [
            ClientEventKind::Connected,
            transport(TransportState::Rec),
            ClientEventKind::Disconnected,
            ClientEventKind::Connected,
            transport(TransportState::Stop),
            ClientEventKind::Disconnected,
        ];
        for (i, event) in events.iter().enumerate() {
            apply_event(&mut d, event, i as u64);
            if d.state == TransportState::Offline {
                assert!(!d.connected);
            }
        }
    }

    #[test]
    fn test_updated_is_monotonic() {
        let mut d = device();
        apply_event(&mut d, &ClientEventKind::Connected, 100);
        apply_event(&mut d, &transport(TransportState::Play), 100);
        assert_eq!(d.updated, 100);
        apply_event(&mut d, &transport(TransportState::Stop), 250);
        assert_eq!(d.updated, 250);
    }

    #[test]
    fn test_transport_marks_connected() {
        let mut d = device();
        apply_event(&mut d, &transport(TransportState::Play), 5);
        assert!(d.connected);
    }
}
