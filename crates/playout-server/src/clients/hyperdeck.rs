/// HyperDeck TCP client. Keeps one connection per deck, subscribes to
/// transport and slot notifications, and polls both every two seconds as
/// a safety net against missed notifications. Reconnects with 1 s → 30 s
/// exponential backoff; an intentional disconnect cancels any pending
/// reconnect sleep.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use playout_protocol::device::{DeviceConfig, TransportState, TransportUpdate};
use playout_protocol::{RECONNECT_INITIAL_MS, RECONNECT_MAX_MS};

use crate::aggregator::{ClientEvent, ClientEventKind, EventSender};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Wait for the connection banner to settle before subscribing.
const BANNER_DELAY: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One parsed response: code, name, and the `key: value` fields of a
/// multi-line body. Keys are lowercased with spaces as underscores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBlock {
    pub code: u16,
    pub name: String,
    pub fields: Vec<(String, String)>,
}

impl ResponseBlock {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Accumulates protocol lines into response blocks. A multi-line
/// response is announced by a trailing colon and closed by a blank line;
/// anything else is a single-line response.
#[derive(Debug, Default)]
pub struct ResponseParser {
    current: Option<ResponseBlock>,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) -> Option<ResponseBlock> {
        let line = line.trim_end_matches('\r');
        if let Some(block) = self.current.as_mut() {
            if line.trim().is_empty() {
                return self.current.take();
            }
            if let Some((key, value)) = line.split_once(':') {
                block.fields.push((
                    key.trim().to_ascii_lowercase().replace(' ', "_"),
                    value.trim().to_string(),
                ));
            } else {
                debug!(line, "unparseable field line");
            }
            return None;
        }

        let (code, rest) = parse_code_line(line)?;
        if let Some(name) = rest.strip_suffix(':') {
            self.current = Some(ResponseBlock {
                code,
                name: name.trim().to_string(),
                fields: Vec::new(),
            });
            None
        } else {
            Some(ResponseBlock {
                code,
                name: rest.to_string(),
                fields: Vec::new(),
            })
        }
    }
}

fn parse_code_line(line: &str) -> Option<(u16, &str)> {
    let line = line.trim();
    if line.len() < 3 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = line[..3].parse().ok()?;
    Some((code, line[3..].trim_start()))
}

/// Map a transport status string onto the shared model. Everything that
/// is not playing or recording counts as stopped.
pub fn normalise_status(status: &str) -> TransportState {
    let status = status.to_ascii_lowercase();
    match status.as_str() {
        "play" | "playing" => TransportState::Play,
        "record" | "recording" => TransportState::Rec,
        _ => TransportState::Stop,
    }
}

/// Accept HH:MM:SS:FF, the drop-frame semicolon form, or a bare 8-digit
/// string. Anything else passes through with a log line.
pub fn normalise_timecode(raw: &str) -> String {
    let raw = raw.trim();
    let bytes = raw.as_bytes();
    let separated = bytes.len() == 11
        && bytes
            .iter()
            .enumerate()
            .all(|(i, &b)| match i {
                2 | 5 | 8 => b == b':' || b == b';',
                _ => b.is_ascii_digit(),
            });
    if separated {
        return raw.replace(';', ":");
    }
    if bytes.len() == 8 && bytes.iter().all(u8::is_ascii_digit) {
        return format!(
            "{}:{}:{}:{}",
            &raw[0..2],
            &raw[2..4],
            &raw[4..6],
            &raw[6..8]
        );
    }
    debug!(raw, "unexpected timecode format from deck");
    raw.to_string()
}

/// Live view assembled from transport and slot responses.
#[derive(Debug, Default)]
struct DeckView {
    state: TransportState,
    timecode: String,
    filename: String,
    active_slot: Option<u32>,
    /// A slot query is in flight; hold emission until its answer lands
    /// so a slot change produces one event, not two.
    awaiting_slot: bool,
    last_emitted: Option<TransportUpdate>,
}

impl DeckView {
    /// Apply one block; returns a fresh slot id to query when the active
    /// slot changed.
    fn apply(&mut self, block: &ResponseBlock) -> Option<u32> {
        let mut query_slot = None;
        match block.name.as_str() {
            "transport info" => {
                if let Some(status) = block.field("status") {
                    self.state = normalise_status(status);
                }
                if let Some(tc) = block.field("display_timecode").or_else(|| block.field("timecode"))
                {
                    self.timecode = normalise_timecode(tc);
                }
                if let Some(slot) = block.field("active_slot").and_then(|s| s.parse().ok()) {
                    if self.active_slot != Some(slot) {
                        self.active_slot = Some(slot);
                        self.awaiting_slot = true;
                        query_slot = Some(slot);
                    }
                }
            }
            "slot info" => {
                self.awaiting_slot = false;
                if let Some(name) = block.field("clip_name") {
                    self.filename = name.to_string();
                }
            }
            _ => {
                if (100..200).contains(&block.code) {
                    // A failed slot query must not gag emission for good.
                    self.awaiting_slot = false;
                    warn!(code = block.code, name = %block.name, "deck error response");
                } else {
                    debug!(code = block.code, name = %block.name, "ignored deck response");
                }
            }
        }
        query_slot
    }

    /// The current triple, when it differs from the last one emitted.
    fn take_update(&mut self) -> Option<TransportUpdate> {
        if self.awaiting_slot {
            return None;
        }
        let update = TransportUpdate {
            state: self.state,
            timecode: if self.timecode.is_empty() {
                "00:00:00:00".to_string()
            } else {
                self.timecode.clone()
            },
            filename: self.filename.clone(),
        };
        if self.last_emitted.as_ref() == Some(&update) {
            return None;
        }
        self.last_emitted = Some(update.clone());
        Some(update)
    }
}

pub async fn run(device: DeviceConfig, events: EventSender, cancel: CancellationToken) {
    let addr = format!("{}:{}", device.ip, device.port);
    let mut backoff = Duration::from_millis(RECONNECT_INITIAL_MS);

    info!(device = device.id, addr = %addr, "HyperDeck client starting");

    while !cancel.is_cancelled() {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                backoff = Duration::from_millis(RECONNECT_INITIAL_MS);
                info!(device = device.id, addr = %addr, "deck connected");
                let _ = events.send(ClientEvent {
                    device_id: device.id,
                    kind: ClientEventKind::Connected,
                });

                if let Err(e) = drive_connection(&device, stream, &events, &cancel).await {
                    warn!(device = device.id, "deck connection lost: {e}");
                    let _ = events.send(ClientEvent {
                        device_id: device.id,
                        kind: ClientEventKind::Error(e.to_string()),
                    });
                }
                let _ = events.send(ClientEvent {
                    device_id: device.id,
                    kind: ClientEventKind::Disconnected,
                });
            }
            Ok(Err(e)) => {
                debug!(device = device.id, addr = %addr, "deck connect failed: {e}");
            }
            Err(_) => {
                debug!(device = device.id, addr = %addr, "deck connect timed out");
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(Duration::from_millis(RECONNECT_MAX_MS));
    }
    debug!(device = device.id, "HyperDeck client stopped");
}

/// Owns one live connection until it drops or the client is cancelled.
async fn drive_connection(
    device: &DeviceConfig,
    stream: TcpStream,
    events: &EventSender,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    tokio::time::sleep(BANNER_DELAY).await;
    send_command(&mut write_half, "notify: transport: true").await?;
    send_command(&mut write_half, "notify: slot: true").await?;
    send_command(&mut write_half, "transport info").await?;

    let mut parser = ResponseParser::new();
    let mut view = DeckView::default();
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.reset();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = poll.tick() => {
                send_command(&mut write_half, "transport info").await?;
                if let Some(slot) = view.active_slot {
                    send_command(&mut write_half, &format!("slot info: slot id: {slot}")).await?;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    anyhow::bail!("connection closed by deck");
                };
                if let Some(block) = parser.push_line(&line) {
                    if let Some(slot) = view.apply(&block) {
                        send_command(&mut write_half, &format!("slot info: slot id: {slot}")).await?;
                    }
                    if let Some(update) = view.take_update() {
                        let _ = events.send(ClientEvent {
                            device_id: device.id,
                            kind: ClientEventKind::Transport(update),
                        });
                    }
                }
            }
        }
    }
}

async fn send_command(writer: &mut OwnedWriteHalf, command: &str) -> anyhow::Result<()> {
    writer.write_all(command.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut ResponseParser, lines: &[&str]) -> Vec<ResponseBlock> {
        lines
            .iter()
            .filter_map(|line| parser.push_line(line))
            .collect()
    }

    #[test]
    fn test_multiline_block_terminated_by_blank_line() {
        let mut parser = ResponseParser::new();
        let blocks = feed(
            &mut parser,
            &[
                "208 transport info:",
                "status: play",
                "display timecode: 01:23:45:12",
                "active slot: 1",
                "",
            ],
        );
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.code, 208);
        assert_eq!(block.name, "transport info");
        assert_eq!(block.field("status"), Some("play"));
        assert_eq!(block.field("display_timecode"), Some("01:23:45:12"));
        assert_eq!(block.field("active_slot"), Some("1"));
    }

    #[test]
    fn test_single_line_response() {
        let mut parser = ResponseParser::new();
        let blocks = feed(&mut parser, &["200 ok"]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].code, 200);
        assert_eq!(blocks[0].name, "ok");
        assert!(blocks[0].fields.is_empty());
    }

    #[test]
    fn test_crlf_lines_accepted() {
        let mut parser = ResponseParser::new();
        let blocks = feed(
            &mut parser,
            &["502 slot info:\r", "slot id: 1\r", "clip name: clip.mov\r", "\r"],
        );
        assert_eq!(blocks[0].field("clip_name"), Some("clip.mov"));
    }

    #[test]
    fn test_transport_sequence_emits_one_update() {
        let mut parser = ResponseParser::new();
        let mut view = DeckView::default();
        let mut updates = Vec::new();
        let mut slot_queries = Vec::new();

        for line in [
            "208 transport info:",
            "status: play",
            "display timecode: 01:23:45:12",
            "active slot: 1",
            "",
            "202 slot info:",
            "slot id: 1",
            "clip name: clip.mov",
            "",
        ] {
            if let Some(block) = parser.push_line(line) {
                if let Some(slot) = view.apply(&block) {
                    slot_queries.push(slot);
                }
                if let Some(update) = view.take_update() {
                    updates.push(update);
                }
            }
        }

        assert_eq!(slot_queries, vec![1]);
        // The slot query holds emission, so the whole exchange is one event.
        assert_eq!(updates.len(), 1);
        let last = updates.last().unwrap();
        assert_eq!(last.state, TransportState::Play);
        assert_eq!(last.timecode, "01:23:45:12");
        assert_eq!(last.filename, "clip.mov");

        // The same blocks again change nothing.
        for line in ["508 transport info:", "status: play", ""] {
            if let Some(block) = parser.push_line(line) {
                view.apply(&block);
                assert!(view.take_update().is_none());
            }
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(normalise_status("play"), TransportState::Play);
        assert_eq!(normalise_status("Playing"), TransportState::Play);
        assert_eq!(normalise_status("record"), TransportState::Rec);
        assert_eq!(normalise_status("RECORDING"), TransportState::Rec);
        for other in [
            "stopped",
            "preview",
            "shuttle forward",
            "shuttle reverse",
            "jog",
            "fast forward",
            "rewind",
            "anything",
        ] {
            assert_eq!(normalise_status(other), TransportState::Stop, "{other}");
        }
    }

    #[test]
    fn test_timecode_normalisation() {
        assert_eq!(normalise_timecode("01:23:45:12"), "01:23:45:12");
        assert_eq!(normalise_timecode("01:23:45;12"), "01:23:45:12");
        assert_eq!(normalise_timecode("01234512"), "01:23:45:12");
        assert_eq!(normalise_timecode("garbage"), "garbage");
    }

    #[test]
    fn test_display_timecode_preferred() {
        let block = ResponseBlock {
            code: 208,
            name: "transport info".into(),
            fields: vec![
                ("timecode".into(), "00:00:01:00".into()),
                ("display_timecode".into(), "10:00:00:00".into()),
            ],
        };
        let mut view = DeckView::default();
        view.apply(&block);
        assert_eq!(view.timecode, "10:00:00:00");
    }

    #[test]
    fn test_slot_change_triggers_requery() {
        let mut view = DeckView::default();
        let slot1 = ResponseBlock {
            code: 508,
            name: "transport info".into(),
            fields: vec![("active_slot".into(), "1".into())],
        };
        let slot2 = ResponseBlock {
            code: 508,
            name: "transport info".into(),
            fields: vec![("active_slot".into(), "2".into())],
        };
        assert_eq!(view.apply(&slot1), Some(1));
        assert_eq!(view.apply(&slot1), None);
        assert_eq!(view.apply(&slot2), Some(2));
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Duration::from_millis(RECONNECT_INITIAL_MS);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(backoff.as_secs());
            backoff = (backoff * 2).min(Duration::from_millis(RECONNECT_MAX_MS));
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_garbage_lines_ignored() {
        let mut parser = ResponseParser::new();
        assert!(parser.push_line("not a response").is_none());
        assert!(parser.push_line("12 too short").is_none());
        let blocks = feed(&mut parser, &["500 connection info:", "model: HyperDeck", ""]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].field("model"), Some("HyperDeck"));
    }
}
