/// CasparCG OSC client. The server pushes bundles at us; this task
/// caches the fields for its channel/layer, normalises them at bundle
/// end, and emits on change. A 1 Hz checker flags the device stale when
/// no message arrived within the timeout.

use std::net::IpAddr;
use std::time::Duration;

use rosc::{OscMessage, OscPacket, OscType};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use playout_protocol::device::{basename, DeviceConfig, TransportState, TransportUpdate};
use playout_protocol::timecode::frames_to_timecode;

use crate::aggregator::{ClientEvent, ClientEventKind, EventSender};
use crate::clients::osc_listener::{ClientKey, OscEvent, SharedOscListener};

pub const DEFAULT_CHANNEL: u16 = 1;
pub const DEFAULT_LAYER: u16 = 10;

#[derive(Debug, Clone, Copy)]
pub struct CasparCgSettings {
    pub channel: u16,
    pub layer: u16,
    pub stale_timeout: Duration,
}

/// Cached per-layer fields between bundles.
#[derive(Debug, Clone, Default)]
struct LayerView {
    file_path: String,
    time_seconds: f64,
    frame: i64,
    /// 0 until the server reports a plausible rate.
    fps: f64,
    paused: bool,
    foreground_file: String,
}

impl LayerView {
    fn apply(&mut self, suffix: &str, args: &[OscType]) {
        match suffix {
            "/file/path" => {
                if let Some(v) = arg_str(args) {
                    self.file_path = v.to_string();
                }
            }
            "/file/time" => {
                if let Some(v) = arg_f64(args) {
                    self.time_seconds = v;
                }
            }
            "/file/frame" => {
                if let Some(v) = arg_f64(args) {
                    self.frame = v as i64;
                }
            }
            "/file/fps" => {
                if let Some(v) = arg_f64(args) {
                    if v > 0.0 && v < 120.0 {
                        self.fps = v;
                    }
                }
            }
            "/paused" => {
                if let Some(v) = arg_f64(args) {
                    self.paused = v == 1.0;
                }
            }
            "/foreground/file/name" => {
                if let Some(v) = arg_str(args) {
                    self.foreground_file = v.to_string();
                }
            }
            _ => {}
        }
    }

    /// CasparCG never records, so `rec` cannot come out of here.
    fn normalise(&self, default_fps: f64) -> TransportUpdate {
        let has_file = !self.file_path.is_empty() || !self.foreground_file.is_empty();
        let state = if has_file && !self.paused {
            TransportState::Play
        } else {
            TransportState::Stop
        };
        let source = if !self.file_path.is_empty() {
            &self.file_path
        } else {
            &self.foreground_file
        };
        let fps = if self.fps > 0.0 { self.fps } else { default_fps };
        let frames = if self.frame > 0 {
            self.frame
        } else if self.time_seconds > 0.0 {
            (self.time_seconds * fps).floor() as i64
        } else {
            0
        };
        TransportUpdate {
            state,
            timecode: frames_to_timecode(frames, fps),
            filename: basename(source).to_string(),
        }
    }
}

fn arg_f64(args: &[OscType]) -> Option<f64> {
    match args.first()? {
        OscType::Float(v) => Some(*v as f64),
        OscType::Double(v) => Some(*v),
        OscType::Int(v) => Some(*v as f64),
        OscType::Long(v) => Some(*v as f64),
        OscType::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn arg_str(args: &[OscType]) -> Option<&str> {
    match args.first()? {
        OscType::String(v) => Some(v),
        _ => None,
    }
}

pub async fn run(
    device: DeviceConfig,
    settings: CasparCgSettings,
    listener: SharedOscListener,
    events: EventSender,
    cancel: CancellationToken,
) {
    let source: IpAddr = match device.ip.parse() {
        Ok(ip) => ip,
        Err(e) => {
            warn!(device = device.id, ip = %device.ip, "unusable CasparCG address: {e}");
            return;
        }
    };
    let key: ClientKey = (source, settings.channel, settings.layer);
    let prefix = format!(
        "/channel/{}/stage/layer/{}",
        settings.channel, settings.layer
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    listener.register(key, tx).await;
    info!(
        device = device.id,
        ip = %device.ip,
        channel = settings.channel,
        layer = settings.layer,
        "CasparCG client registered"
    );

    let mut view = LayerView::default();
    let mut last_emitted: Option<TransportUpdate> = None;
    let mut connected = false;
    let mut last_message: Option<Instant> = None;
    let mut stale_check = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(OscEvent::ListenerReady) => {
                    debug!(device = device.id, "shared OSC listener ready");
                }
                Some(OscEvent::Packet(packet)) => {
                    last_message = Some(Instant::now());
                    if !connected {
                        connected = true;
                        info!(device = device.id, "CasparCG source alive");
                        let _ = events.send(ClientEvent {
                            device_id: device.id,
                            kind: ClientEventKind::Connected,
                        });
                    }
                    apply_packet(&mut view, &prefix, &packet);
                    let update = view.normalise(device.framerate);
                    if last_emitted.as_ref() != Some(&update) {
                        last_emitted = Some(update.clone());
                        let _ = events.send(ClientEvent {
                            device_id: device.id,
                            kind: ClientEventKind::Transport(update),
                        });
                    }
                }
                None => break,
            },
            _ = stale_check.tick() => {
                let stale = last_message
                    .map(|t| t.elapsed() >= settings.stale_timeout)
                    .unwrap_or(false);
                if connected && stale {
                    connected = false;
                    warn!(device = device.id, "no OSC traffic within stale timeout");
                    let _ = events.send(ClientEvent {
                        device_id: device.id,
                        kind: ClientEventKind::Disconnected,
                    });
                }
            }
        }
    }

    listener.unregister(&key).await;
    debug!(device = device.id, "CasparCG client stopped");
}

/// Bundles nest; apply every message under our prefix.
fn apply_packet(view: &mut LayerView, prefix: &str, packet: &OscPacket) {
    match packet {
        OscPacket::Message(message) => apply_message(view, prefix, message),
        OscPacket::Bundle(bundle) => {
            for item in &bundle.content {
                apply_packet(view, prefix, item);
            }
        }
    }
}

fn apply_message(view: &mut LayerView, prefix: &str, message: &OscMessage) {
    if let Some(suffix) = message.addr.strip_prefix(prefix) {
        view.apply(suffix, &message.args);
    }
}
