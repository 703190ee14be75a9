//! Integration tests for the playout-protocol crate.
//!
//! These exercise the public API across module boundaries: device states
//! driving TSL packets, Glow payloads travelling through S101 framing,
//! and timecode arithmetic at the documented boundary values.

use playout_protocol::device::{basename, DeviceConfig, DeviceState, DeviceType, TransportState};
use playout_protocol::glow::{self, ParameterSpec, ParameterType, Request, Value};
use playout_protocol::s101::{self, FrameDecoder, S101Message};
use playout_protocol::timecode::{frames_to_timecode, milliseconds_to_timecode, timecode_to_frames};
use playout_protocol::tsl::{UmdPacket, DISPLAY_BROADCAST};

// ---------------------------------------------------------------------------
// 1. Device state → TSL packet
// ---------------------------------------------------------------------------

#[test]
fn tsl_packet_tracks_transport_state() {
    let mut buf = Vec::new();

    for (state, control) in [
        (TransportState::Play, 0xC5u8),
        (TransportState::Rec, 0xCF),
        (TransportState::Stop, 0xC0),
        (TransportState::Offline, 0x40),
    ] {
        UmdPacket::for_device(0, 3, "CAM 1", state).serialize(&mut buf);
        assert_eq!(buf[8], control, "control byte for {state:?}");
        assert_eq!(buf[9], 0x00);
    }
}

#[test]
fn tsl_play_packet_matches_reference_bytes() {
    let mut buf = Vec::new();
    UmdPacket::for_device(0, 3, "CAM 1", TransportState::Play).serialize(&mut buf);
    assert_eq!(
        buf,
        [
            0x11, 0x00, 0x80, 0x00, 0x00, 0x00, 0x03, 0x00, 0xC5, 0x00, 0x05, 0x00, 0x43, 0x41,
            0x4D, 0x20, 0x31,
        ]
    );
}

#[test]
fn device_id_space_excludes_broadcast_index() {
    // Config validation reserves 0xFFFF; the constant and the packet
    // builder must agree on what that index is.
    assert_eq!(DISPLAY_BROADCAST, 0xFFFF);
}

// ---------------------------------------------------------------------------
// 2. Glow through S101 framing
// ---------------------------------------------------------------------------

#[test]
fn parameter_update_survives_framing() {
    let glow = glow::root(&[glow::qualified_parameter_value(
        &[1, 2, 1, 1],
        &Value::Int(1),
    )]);
    let frame = s101::ember_frame(&glow);

    let mut decoder = FrameDecoder::new();
    let messages = decoder.push(&frame);
    assert_eq!(messages, vec![S101Message::Ember(glow)]);
}

#[test]
fn directory_listing_fits_one_frame() {
    // The widest per-level response is one device's five parameters.
    let elements: Vec<Vec<u8>> = vec![
        glow::qualified_parameter(&ParameterSpec {
            path: &[1, 2, 1, 1],
            identifier: "State",
            ptype: ParameterType::Enum,
            value: Value::Int(3),
            enumeration: Some("stop\nplay\nrec\noffline"),
        }),
        glow::qualified_parameter(&ParameterSpec {
            path: &[1, 2, 1, 2],
            identifier: "Timecode",
            ptype: ParameterType::String,
            value: Value::Str("00:00:00:00".into()),
            enumeration: None,
        }),
        glow::qualified_parameter(&ParameterSpec {
            path: &[1, 2, 1, 3],
            identifier: "Filename",
            ptype: ParameterType::String,
            value: Value::Str("a-reasonably-long-clip-name.mov".into()),
            enumeration: None,
        }),
        glow::qualified_parameter(&ParameterSpec {
            path: &[1, 2, 1, 4],
            identifier: "Connected",
            ptype: ParameterType::Boolean,
            value: Value::Bool(false),
            enumeration: None,
        }),
        glow::qualified_parameter(&ParameterSpec {
            path: &[1, 2, 1, 5],
            identifier: "Type",
            ptype: ParameterType::String,
            value: Value::Str("hyperdeck".into()),
            enumeration: None,
        }),
    ];
    let frame = s101::ember_frame(&glow::root(&elements));
    assert!(
        frame.len() < 1024,
        "directory frame is {} bytes",
        frame.len()
    );
}

#[test]
fn keepalive_request_gets_recognised_in_mixed_stream() {
    let glow = glow::root(&[glow::qualified_node(&[1], "SuperDash")]);
    let mut stream = s101::keepalive_request();
    stream.extend_from_slice(&s101::ember_frame(&glow));

    let mut decoder = FrameDecoder::new();
    let messages = decoder.push(&stream);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], S101Message::KeepaliveRequest);
    match &messages[1] {
        S101Message::Ember(payload) => {
            // A consumer-side parse of our own node sees no requests.
            assert!(glow::parse_requests(payload).is_empty());
        }
        other => panic!("expected ember payload, got {other:?}"),
    }
}

#[test]
fn write_attempt_round_trips_through_framing() {
    let glow = glow::root(&[glow::qualified_parameter_value(
        &[1, 2, 4, 2],
        &Value::Str("12:00:00:00".into()),
    )]);
    let mut decoder = FrameDecoder::new();
    let messages = decoder.push(&s101::ember_frame(&glow));
    let S101Message::Ember(payload) = &messages[0] else {
        panic!("expected ember payload");
    };
    assert_eq!(
        glow::parse_requests(payload),
        vec![Request::SetValue(vec![1, 2, 4, 2])]
    );
}

// ---------------------------------------------------------------------------
// 3. Timecode documented scenarios
// ---------------------------------------------------------------------------

#[test]
fn timecode_reference_values() {
    assert_eq!(frames_to_timecode(3725, 25.0), "00:02:29:00");
    assert_eq!(frames_to_timecode(1800, 29.97), "00:01:00;02");
    assert_eq!(milliseconds_to_timecode(60_000, 50.0), "00:01:00:00");
}

#[test]
fn timecode_round_trip_one_hour_every_rate() {
    for &fps in &[24.0, 25.0, 30.0, 50.0, 60.0] {
        let rate = fps as i64;
        for f in [0, 1, rate - 1, rate * 60, rate * 3599, rate * 3600] {
            let tc = frames_to_timecode(f, fps);
            assert_eq!(timecode_to_frames(&tc, fps), Some(f), "fps={fps}");
        }
    }
}

// ---------------------------------------------------------------------------
// 4. Device model defaults
// ---------------------------------------------------------------------------

#[test]
fn new_device_is_offline_and_disconnected() {
    let cfg = DeviceConfig {
        id: 7,
        name: "SERVER A".into(),
        device_type: DeviceType::Casparcg,
        ip: "192.168.1.50".into(),
        port: DeviceType::Casparcg.default_port(),
        framerate: 50.0,
    };
    let state = DeviceState::from_config(&cfg);
    assert_eq!(state.state, TransportState::Offline);
    assert!(!state.connected);
    assert_eq!(state.port, 6250);

    let json = serde_json::to_value(&state).unwrap();
    assert_eq!(json["type"], "casparcg");
    assert_eq!(json["state"], "offline");
    assert_eq!(json["timecode"], "00:00:00:00");
}

#[test]
fn clip_names_lose_their_path() {
    assert_eq!(basename("media/2024/show.mov"), "show.mov");
    assert_eq!(basename("AMB\\LOOPS\\city.mxf"), "city.mxf");
}
