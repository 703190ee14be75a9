/// vMix HTTP client. Polls the XML API on a drift-free schedule, pulls
/// the transport fields out with tolerant regexes, and normalises into
/// the shared device model. Three consecutive failures count as a
/// disconnect; below that threshold the last good state is re-emitted so
/// the dashboard does not flap on a single slow poll.

use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use playout_protocol::device::{DeviceConfig, TransportState, TransportUpdate};
use playout_protocol::timecode::milliseconds_to_timecode;

use crate::aggregator::{ClientEvent, ClientEventKind, EventSender};
use crate::timer::DriftFreeTimer;

pub const FAILURE_THRESHOLD: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Fields pulled out of one /api snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VmixSnapshot {
    pub recording: bool,
    pub streaming: bool,
    pub duration_ms: i64,
    pub active_input_title: Option<String>,
    pub active_input_state: Option<String>,
}

/// Compiled extraction patterns; the XML is scraped, not parsed, so
/// attribute order and unknown elements never matter.
pub struct XmlExtractor {
    recording: Regex,
    streaming: Regex,
    duration: Regex,
    input: Regex,
    state_attr: Regex,
    title_attr: Regex,
}

impl XmlExtractor {
    pub fn new() -> Self {
        Self {
            recording: Regex::new(r"(?is)<recording[^>]*>\s*(true|false)\s*</recording>").unwrap(),
            streaming: Regex::new(r"(?is)<streaming[^>]*>\s*(true|false)\s*</streaming>").unwrap(),
            duration: Regex::new(r"(?is)<duration[^>]*>\s*(\d+)\s*</duration>").unwrap(),
            input: Regex::new(r"(?is)<input\b[^>]*>").unwrap(),
            state_attr: Regex::new(r#"(?i)\bstate\s*=\s*"([^"]*)""#).unwrap(),
            title_attr: Regex::new(r#"(?i)\btitle\s*=\s*"([^"]*)""#).unwrap(),
        }
    }

    pub fn parse(&self, body: &str) -> Result<VmixSnapshot, String> {
        if body.trim().is_empty() {
            return Err("empty response body".to_string());
        }
        if !body.contains("<vmix") {
            return Err("response is not a vMix document".to_string());
        }

        let mut snapshot = VmixSnapshot {
            recording: self.bool_field(&self.recording, body),
            streaming: self.bool_field(&self.streaming, body),
            duration_ms: self
                .duration
                .captures(body)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(0),
            ..Default::default()
        };

        // First input that is Running or Paused wins.
        for tag in self.input.find_iter(body) {
            let tag = tag.as_str();
            let Some(state) = self.state_attr.captures(tag).map(|c| c[1].to_string()) else {
                continue;
            };
            if state.eq_ignore_ascii_case("running") || state.eq_ignore_ascii_case("paused") {
                snapshot.active_input_title =
                    self.title_attr.captures(tag).map(|c| c[1].to_string());
                snapshot.active_input_state = Some(state);
                break;
            }
        }
        Ok(snapshot)
    }

    fn bool_field(&self, pattern: &Regex, body: &str) -> bool {
        pattern
            .captures(body)
            .map(|c| c[1].eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

/// Recording wins over a running input; a paused input parks the device
/// at stop.
pub fn normalise(snapshot: &VmixSnapshot, framerate: f64) -> TransportUpdate {
    let timecode = milliseconds_to_timecode(snapshot.duration_ms, framerate);
    let title = snapshot.active_input_title.clone().unwrap_or_default();
    let input_state = snapshot.active_input_state.as_deref().unwrap_or("");

    if snapshot.recording {
        return TransportUpdate {
            state: TransportState::Rec,
            timecode,
            filename: if title.is_empty() {
                "Recording".to_string()
            } else {
                title
            },
        };
    }
    if input_state.eq_ignore_ascii_case("running") {
        return TransportUpdate {
            state: TransportState::Play,
            timecode,
            filename: title,
        };
    }
    if input_state.eq_ignore_ascii_case("paused") {
        return TransportUpdate {
            state: TransportState::Stop,
            timecode,
            filename: title,
        };
    }
    TransportUpdate {
        state: TransportState::Stop,
        timecode,
        filename: String::new(),
    }
}

pub async fn run(
    device: DeviceConfig,
    poll_interval: Duration,
    events: EventSender,
    cancel: CancellationToken,
) {
    let url = format!("http://{}:{}/api", device.ip, device.port);
    let http = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default();
    let extractor = XmlExtractor::new();

    info!(device = device.id, url = %url, "vMix poller starting");

    let timer = DriftFreeTimer::new(poll_interval);
    let mut failures: u32 = 0;
    let mut connected = false;
    let mut last_good: Option<TransportUpdate> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }

        match poll_once(&http, &url, &extractor).await {
            Ok(snapshot) => {
                failures = 0;
                if !connected {
                    connected = true;
                    info!(device = device.id, "vMix reachable");
                    let _ = events.send(ClientEvent {
                        device_id: device.id,
                        kind: ClientEventKind::Connected,
                    });
                }
                let update = normalise(&snapshot, device.framerate);
                last_good = Some(update.clone());
                let _ = events.send(ClientEvent {
                    device_id: device.id,
                    kind: ClientEventKind::Transport(update),
                });
            }
            Err(reason) => {
                failures += 1;
                debug!(device = device.id, failures, "vMix poll failed: {reason}");
                if connected && failures >= FAILURE_THRESHOLD {
                    connected = false;
                    last_good = None;
                    warn!(
                        device = device.id,
                        failures, "vMix unreachable, marking disconnected"
                    );
                    let _ = events.send(ClientEvent {
                        device_id: device.id,
                        kind: ClientEventKind::Disconnected,
                    });
                } else if connected {
                    // Transient: hold the last good state.
                    if let Some(update) = &last_good {
                        let _ = events.send(ClientEvent {
                            device_id: device.id,
                            kind: ClientEventKind::Transport(update.clone()),
                        });
                    }
                }
            }
        }
    }
    debug!(device = device.id, "vMix poller stopped");
}

async fn poll_once(
    http: &reqwest::Client,
    url: &str,
    extractor: &XmlExtractor,
) -> Result<VmixSnapshot, String> {
    let response = http.get(url).send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("status {}", response.status()));
    }
    let body = response.text().await.map_err(|e| e.to_string())?;
    extractor.parse(&body)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDING_BODY: &str = concat!(
        "<vmix><recording>True</recording><streaming>False</streaming>",
        r#"<duration>60000</duration><inputs><input title="News" state="Running"/></inputs></vmix>"#
    );

    #[test]
    fn test_recording_snapshot() {
        let extractor = XmlExtractor::new();
        let snapshot = extractor.parse(RECORDING_BODY).unwrap();
        assert!(snapshot.recording);
        assert!(!snapshot.streaming);
        assert_eq!(snapshot.duration_ms, 60_000);
        assert_eq!(snapshot.active_input_title.as_deref(), Some("News"));
        assert_eq!(snapshot.active_input_state.as_deref(), Some("Running"));
    }

    #[test]
    fn test_recording_normalises_to_rec() {
        let extractor = XmlExtractor::new();
        let snapshot = extractor.parse(RECORDING_BODY).unwrap();
        let update = normalise(&snapshot, 50.0);
        assert_eq!(update.state, TransportState::Rec);
        assert_eq!(update.filename, "News");
        assert_eq!(update.timecode, "00:01:00:00");
    }

    #[test]
    fn test_recording_without_input_uses_placeholder() {
        let extractor = XmlExtractor::new();
        let snapshot = extractor
            .parse("<vmix><recording>true</recording></vmix>")
            .unwrap();
        let update = normalise(&snapshot, 25.0);
        assert_eq!(update.state, TransportState::Rec);
        assert_eq!(update.filename, "Recording");
    }

    #[test]
    fn test_running_input_is_play() {
        let extractor = XmlExtractor::new();
        let body = r#"<vmix><recording>False</recording><duration>1000</duration>
            <inputs><input title="VT 1" state="Running"/></inputs></vmix>"#;
        let update = normalise(&extractor.parse(body).unwrap(), 25.0);
        assert_eq!(update.state, TransportState::Play);
        assert_eq!(update.filename, "VT 1");
        assert_eq!(update.timecode, "00:00:01:00");
    }

    #[test]
    fn test_paused_input_is_stop() {
        let extractor = XmlExtractor::new();
        let body = r#"<vmix><inputs><input title="VT 2" state="Paused"/></inputs></vmix>"#;
        let update = normalise(&extractor.parse(body).unwrap(), 25.0);
        assert_eq!(update.state, TransportState::Stop);
        assert_eq!(update.filename, "VT 2");
    }

    #[test]
    fn test_idle_is_stop_with_no_filename() {
        let extractor = XmlExtractor::new();
        let body = r#"<vmix><inputs><input title="VT 3" state="Completed"/></inputs></vmix>"#;
        let update = normalise(&extractor.parse(body).unwrap(), 25.0);
        assert_eq!(update.state, TransportState::Stop);
        assert_eq!(update.filename, "");
    }

    #[test]
    fn test_first_active_input_wins() {
        let extractor = XmlExtractor::new();
        let body = r#"<vmix><inputs>
            <input title="Idle" state="Completed"/>
            <input title="First" state="Paused"/>
            <input title="Second" state="Running"/>
        </inputs></vmix>"#;
        let snapshot = extractor.parse(body).unwrap();
        assert_eq!(snapshot.active_input_title.as_deref(), Some("First"));
    }

    #[test]
    fn test_attribute_order_does_not_matter() {
        let extractor = XmlExtractor::new();
        let body = r#"<vmix><inputs><input state="Running" number="3" title="Swapped"/></inputs></vmix>"#;
        let snapshot = extractor.parse(body).unwrap();
        assert_eq!(snapshot.active_input_title.as_deref(), Some("Swapped"));
    }

    #[test]
    fn test_non_vmix_body_rejected() {
        let extractor = XmlExtractor::new();
        assert!(extractor.parse("").is_err());
        assert!(extractor.parse("   ").is_err());
        assert!(extractor.parse("<html>502 Bad Gateway</html>").is_err());
    }

    #[test]
    fn test_case_insensitive_booleans() {
        let extractor = XmlExtractor::new();
        let snapshot = extractor
            .parse("<vmix><recording>TRUE</recording><streaming>faLse</streaming></vmix>")
            .unwrap();
        assert!(snapshot.recording);
        assert!(!snapshot.streaming);
    }
}
