/// S101 framing for Ember+ over TCP.
///
/// A frame is BOF, the escaped payload plus CRC, then EOF. Any body byte
/// at or above 0xF8 is sent as CE followed by the byte XOR 0x20. The CRC
/// is CRC-CCITT (reversed polynomial 0x8408, initial 0xFFFF), complemented
/// and appended LSB-first before escaping.

pub const BOF: u8 = 0xFE;
pub const EOF: u8 = 0xFF;
pub const CE: u8 = 0xFD;
pub const ESCAPE_XOR: u8 = 0x20;
/// Bytes at or above this value are escaped inside the frame body.
pub const ESCAPE_THRESHOLD: u8 = 0xF8;

/// Fixed S101 header fields used by the Ember message type.
pub const SLOT: u8 = 0x00;
pub const MSG_EMBER: u8 = 0x0E;
pub const CMD_EMBER: u8 = 0x00;
pub const CMD_KEEPALIVE_REQ: u8 = 0x01;
pub const CMD_KEEPALIVE_RESP: u8 = 0x02;
pub const VERSION: u8 = 0x01;
/// FirstPacket + LastPacket; every payload we emit fits one frame.
pub const FLAGS_SINGLE_PACKET: u8 = 0xC0;
pub const DTD_GLOW: u8 = 0x01;
/// Application bytes advertising the Glow DTD revision.
pub const APP_BYTES: [u8; 2] = [0x02, 0x1F];

/// Residue of a valid CRC run over payload + appended check bytes.
const CRC_RESIDUE: u16 = 0xF0B8;

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn escape_into(out: &mut Vec<u8>, byte: u8) {
    if byte >= ESCAPE_THRESHOLD {
        out.push(CE);
        out.push(byte ^ ESCAPE_XOR);
    } else {
        out.push(byte);
    }
}

/// Wrap a raw S101 payload in BOF/CRC/EOF framing.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.push(BOF);
    for &b in payload {
        escape_into(&mut out, b);
    }
    let crc = !crc16(payload);
    escape_into(&mut out, (crc & 0xFF) as u8);
    escape_into(&mut out, (crc >> 8) as u8);
    out.push(EOF);
    out
}

/// Frame a Glow-encoded payload as an Ember message.
pub fn ember_frame(glow: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(glow.len() + 9);
    payload.extend_from_slice(&[
        SLOT,
        MSG_EMBER,
        CMD_EMBER,
        VERSION,
        FLAGS_SINGLE_PACKET,
        DTD_GLOW,
        APP_BYTES.len() as u8,
    ]);
    payload.extend_from_slice(&APP_BYTES);
    payload.extend_from_slice(glow);
    encode_frame(&payload)
}

pub fn keepalive_request() -> Vec<u8> {
    encode_frame(&[SLOT, MSG_EMBER, CMD_KEEPALIVE_REQ, VERSION])
}

pub fn keepalive_response() -> Vec<u8> {
    encode_frame(&[SLOT, MSG_EMBER, CMD_KEEPALIVE_RESP, VERSION])
}

/// One de-framed S101 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S101Message {
    /// Glow payload of an Ember message (header stripped).
    Ember(Vec<u8>),
    KeepaliveRequest,
    KeepaliveResponse,
    /// Valid frame with a command we do not handle.
    Other(u8),
}

/// Incremental frame splitter for a TCP byte stream. Bytes outside a
/// BOF..EOF pair and frames with a bad CRC are dropped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    frame: Vec<u8>,
    in_frame: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<S101Message> {
        let mut messages = Vec::new();
        for &b in bytes {
            match b {
                BOF => {
                    self.frame.clear();
                    self.in_frame = true;
                }
                EOF => {
                    if self.in_frame {
                        if let Some(msg) = decode_frame_body(&self.frame) {
                            messages.push(msg);
                        }
                        self.in_frame = false;
                    }
                }
                _ if self.in_frame => self.frame.push(b),
                _ => {}
            }
        }
        messages
    }
}

fn decode_frame_body(raw: &[u8]) -> Option<S101Message> {
    // Unescape, then check the CRC residue over payload + check bytes.
    let mut body = Vec::with_capacity(raw.len());
    let mut escaping = false;
    for &b in raw {
        if escaping {
            body.push(b ^ ESCAPE_XOR);
            escaping = false;
        } else if b == CE {
            escaping = true;
        } else {
            body.push(b);
        }
    }
    if escaping || body.len() < 5 {
        return None;
    }
    if crc16(&body) != CRC_RESIDUE {
        return None;
    }
    let payload = &body[..body.len() - 2];
    if payload[1] != MSG_EMBER {
        return None;
    }
    match payload[2] {
        CMD_EMBER => {
            // slot, msg, cmd, version, flags, dtd, app byte count, app bytes
            if payload.len() < 7 {
                return None;
            }
            let app_count = payload[6] as usize;
            let glow_start = 7 + app_count;
            if payload.len() < glow_start {
                return None;
            }
            Some(S101Message::Ember(payload[glow_start..].to_vec()))
        }
        CMD_KEEPALIVE_REQ => Some(S101Message::KeepaliveRequest),
        CMD_KEEPALIVE_RESP => Some(S101Message::KeepaliveResponse),
        other => Some(S101Message::Other(other)),
    }
}
