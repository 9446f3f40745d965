//! Integration tests for the MQTT session
//!
//! A scripted transport stands in for the TCP socket. Tests walk the session
//! through connect, subscribe, periodic publish, keepalive and failure.

mod common;

use common::FakeTransport;
use multitool_core::mqtt::{
    decode, encode_publish, MqttSession, Packet, SessionState, COMMAND_TOPIC, KEEP_ALIVE_S,
    PUBLISH_INTERVAL_MS, RECONNECT_DELAY_MS, SENSOR_TOPIC,
};
use multitool_core::settings::{MqttSettings, Settings, Defaults};

const CONNACK_OK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const CONNACK_REFUSED: [u8; 4] = [0x20, 0x02, 0x00, 0x05];
const PINGRESP: [u8; 2] = [0xD0, 0x00];

fn config() -> MqttSettings {
    Settings::new().mqtt(&Defaults::default())
}

fn command(payload: &str) -> Vec<u8> {
    let mut buf = [0u8; 64];
    let n = encode_publish(&mut buf, COMMAND_TOPIC, payload.as_bytes()).unwrap();
    buf[..n].to_vec()
}

/// Service the session once, collecting commands.
fn service(
    session: &mut MqttSession,
    transport: &mut FakeTransport,
    now: u64,
    sample: Option<u16>,
) -> Vec<bool> {
    let mut commands = Vec::new();
    session.service(transport, &config(), now, || sample, |engage| commands.push(engage));
    commands
}

/// Drive a fresh session to `Connected` at t=0..20.
fn connected() -> (MqttSession, FakeTransport) {
    let mut session = MqttSession::new();
    let mut transport = FakeTransport::default();
    service(&mut session, &mut transport, 0, None);
    service(&mut session, &mut transport, 10, None);
    transport.deliver(&CONNACK_OK);
    service(&mut session, &mut transport, 20, None);
    assert!(session.is_connected());
    (session, transport)
}

// ============================================================================
// Tests for connection setup
// ============================================================================

#[test]
fn test_session_connects_then_subscribes() {
    let mut session = MqttSession::new();
    let mut transport = FakeTransport::default();

    service(&mut session, &mut transport, 0, None);
    assert_eq!(transport.opens, 1);
    assert!(matches!(session.state(), SessionState::Opening { .. }));

    service(&mut session, &mut transport, 10, None);
    assert_eq!(transport.sent_types(), vec![0x10]);
    assert!(matches!(session.state(), SessionState::AwaitingAck { .. }));

    transport.deliver(&CONNACK_OK);
    service(&mut session, &mut transport, 20, Some(1_234));
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(transport.sent_types(), vec![0x10, 0x80, 0x30]);

    let subscribe = &transport.sent[1];
    assert!(subscribe
        .windows(COMMAND_TOPIC.len())
        .any(|w| w == COMMAND_TOPIC.as_bytes()));
}

#[test]
fn test_refused_connection_backs_off() {
    let mut session = MqttSession::new();
    let mut transport = FakeTransport::default();
    service(&mut session, &mut transport, 0, None);
    service(&mut session, &mut transport, 10, None);
    transport.deliver(&CONNACK_REFUSED);
    service(&mut session, &mut transport, 20, None);

    assert_eq!(
        session.state(),
        SessionState::Idle {
            retry_at_ms: 20 + RECONNECT_DELAY_MS
        }
    );
    assert!(!transport.open);

    // Nothing happens until the delay has passed.
    service(&mut session, &mut transport, 20 + RECONNECT_DELAY_MS - 1, None);
    assert_eq!(transport.opens, 1);
    service(&mut session, &mut transport, 20 + RECONNECT_DELAY_MS, None);
    assert_eq!(transport.opens, 2);
}

#[test]
fn test_missing_connack_times_out() {
    let mut session = MqttSession::new();
    let mut transport = FakeTransport::default();
    service(&mut session, &mut transport, 0, None);
    service(&mut session, &mut transport, 10, None);
    service(&mut session, &mut transport, 20_000, None);
    assert!(matches!(session.state(), SessionState::Idle { .. }));
}

// ============================================================================
// Tests for the connected session
// ============================================================================

#[test]
fn test_sensor_published_once_per_interval() {
    let (mut session, mut transport) = connected();
    service(&mut session, &mut transport, 30, Some(2_000));
    service(&mut session, &mut transport, 40, Some(2_001));
    service(&mut session, &mut transport, 30 + PUBLISH_INTERVAL_MS, Some(2_002));

    let published: Vec<String> = transport
        .sent
        .iter()
        .filter_map(|raw| match decode(raw) {
            Ok(Some((Packet::Publish { topic, payload }, _))) if topic == SENSOR_TOPIC => {
                Some(String::from_utf8(payload.to_vec()).unwrap())
            }
            _ => None,
        })
        .collect();
    assert_eq!(published, vec!["2000", "2002"]);
}

#[test]
fn test_busy_sensor_retries_next_pass() {
    let (mut session, mut transport) = connected();
    service(&mut session, &mut transport, 30, None);
    assert_eq!(transport.sent_types(), vec![0x10, 0x80]);
    service(&mut session, &mut transport, 40, Some(5));
    assert_eq!(transport.sent_types(), vec![0x10, 0x80, 0x30]);
}

#[test]
fn test_command_payloads_are_decoded() {
    let (mut session, mut transport) = connected();
    transport.deliver(&command("ON"));
    transport.deliver(&command("bogus"));
    transport.deliver(&command("0"));
    let commands = service(&mut session, &mut transport, 30, None);
    assert_eq!(commands, vec![true, false]);
}

#[test]
fn test_command_split_across_reads_is_reassembled() {
    let (mut session, mut transport) = connected();
    let packet = command("engage");
    let (head, tail) = packet.split_at(5);

    transport.deliver(head);
    assert!(service(&mut session, &mut transport, 30, None).is_empty());
    transport.deliver(tail);
    assert_eq!(service(&mut session, &mut transport, 40, None), vec![true]);
}

// ============================================================================
// Tests for keepalive and loss
// ============================================================================

#[test]
fn test_idle_session_pings_and_accepts_response() {
    let (mut session, mut transport) = connected();
    let half = KEEP_ALIVE_S as u64 * 1000 / 2;

    service(&mut session, &mut transport, 20 + half, None);
    assert_eq!(transport.sent_types().last(), Some(&0xC0));

    transport.deliver(&PINGRESP);
    service(&mut session, &mut transport, 30 + half, None);
    // A second interval later it pings again instead of timing out.
    service(&mut session, &mut transport, 40 + 2 * half, None);
    assert!(session.is_connected());
    assert_eq!(transport.sent_types().iter().filter(|t| **t == 0xC0).count(), 2);
}

#[test]
fn test_unanswered_ping_drops_session() {
    let (mut session, mut transport) = connected();
    let half = KEEP_ALIVE_S as u64 * 1000 / 2;

    service(&mut session, &mut transport, 20 + half, None);
    service(&mut session, &mut transport, 21 + half + KEEP_ALIVE_S as u64 * 1000, None);
    assert!(matches!(session.state(), SessionState::Idle { .. }));
    assert!(!transport.open);
}

#[test]
fn test_peer_close_drops_session() {
    let (mut session, mut transport) = connected();
    transport.closed = true;
    service(&mut session, &mut transport, 30, None);
    assert!(matches!(session.state(), SessionState::Idle { .. }));
}

#[test]
fn test_restart_disconnects_and_reconnects_immediately() {
    let (mut session, mut transport) = connected();
    session.restart(&mut transport);

    assert_eq!(transport.sent_types().last(), Some(&0xE0));
    assert_eq!(session.state(), SessionState::Idle { retry_at_ms: 0 });
    service(&mut session, &mut transport, 30, None);
    assert_eq!(transport.opens, 2);
}
