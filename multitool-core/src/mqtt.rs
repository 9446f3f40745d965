//! MQTT 3.1.1 client: packet codec plus a polled session.
//!
//! Only what the tool needs: CONNECT/CONNACK, SUBSCRIBE/SUBACK, QoS 0
//! PUBLISH, PINGREQ/PINGRESP and DISCONNECT.

use core::fmt::Write as FmtWrite;
use heapless::{String as HString, Vec};

use crate::error::MqttError;
use crate::settings::MqttSettings;

pub const SENSOR_TOPIC: &str = "multitool/sensor";
pub const COMMAND_TOPIC: &str = "multitool/relay/set";

pub const KEEP_ALIVE_S: u16 = 60;
pub const PUBLISH_INTERVAL_MS: u64 = 5_000;
pub const RECONNECT_DELAY_MS: u64 = 5_000;
/// Bound on TCP open plus CONNACK.
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

const PING_INTERVAL_MS: u64 = KEEP_ALIVE_S as u64 * 1000 / 2;

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const SUBSCRIBE: u8 = 0x82;
const SUBACK: u8 = 0x90;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 0xD0;
const DISCONNECT: u8 = 0xE0;

pub const RX_CAPACITY: usize = 512;
pub const TX_CAPACITY: usize = 256;

const ENGAGE: [&str; 5] = ["ON", "on", "1", "true", "engage"];
const DISENGAGE: [&str; 5] = ["OFF", "off", "0", "false", "disengage"];

/// Map a command payload to an actuator target. Unknown payloads are ignored.
pub fn parse_command(payload: &[u8]) -> Option<bool> {
    let text = core::str::from_utf8(payload).ok()?;
    if ENGAGE.contains(&text) {
        Some(true)
    } else if DISENGAGE.contains(&text) {
        Some(false)
    } else {
        None
    }
}

/// Sequential writer over a caller buffer.
struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, data: &[u8]) -> Result<(), MqttError> {
        let end = self.pos + data.len();
        self.buf
            .get_mut(self.pos..end)
            .ok_or(MqttError::BufferTooSmall)?
            .copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    fn u8(&mut self, v: u8) -> Result<(), MqttError> {
        self.bytes(&[v])
    }

    fn u16(&mut self, v: u16) -> Result<(), MqttError> {
        self.bytes(&v.to_be_bytes())
    }

    fn str(&mut self, s: &str) -> Result<(), MqttError> {
        let len = u16::try_from(s.len()).map_err(|_| MqttError::BufferTooSmall)?;
        self.u16(len)?;
        self.bytes(s.as_bytes())
    }

    fn remaining_length(&mut self, mut len: usize) -> Result<(), MqttError> {
        if len > 268_435_455 {
            return Err(MqttError::BadLength);
        }
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            self.u8(byte)?;
            if len == 0 {
                return Ok(());
            }
        }
    }
}

fn str_len(s: &str) -> usize {
    2 + s.len()
}

pub fn encode_connect(
    out: &mut [u8],
    client_id: &str,
    credentials: Option<(&str, &str)>,
    keep_alive_s: u16,
) -> Result<usize, MqttError> {
    let mut flags = 0x02; // clean session
    let mut len = 10 + str_len(client_id);
    if let Some((user, pass)) = credentials {
        flags |= 0x80;
        len += str_len(user);
        if !pass.is_empty() {
            flags |= 0x40;
            len += str_len(pass);
        }
    }

    let mut w = Writer::new(out);
    w.u8(CONNECT)?;
    w.remaining_length(len)?;
    w.str("MQTT")?;
    w.u8(4)?;
    w.u8(flags)?;
    w.u16(keep_alive_s)?;
    w.str(client_id)?;
    if let Some((user, pass)) = credentials {
        w.str(user)?;
        if !pass.is_empty() {
            w.str(pass)?;
        }
    }
    Ok(w.pos)
}

pub fn encode_subscribe(out: &mut [u8], packet_id: u16, topic: &str) -> Result<usize, MqttError> {
    let mut w = Writer::new(out);
    w.u8(SUBSCRIBE)?;
    w.remaining_length(2 + str_len(topic) + 1)?;
    w.u16(packet_id)?;
    w.str(topic)?;
    w.u8(0)?;
    Ok(w.pos)
}

pub fn encode_publish(out: &mut [u8], topic: &str, payload: &[u8]) -> Result<usize, MqttError> {
    let mut w = Writer::new(out);
    w.u8(PUBLISH)?;
    w.remaining_length(str_len(topic) + payload.len())?;
    w.str(topic)?;
    w.bytes(payload)?;
    Ok(w.pos)
}

pub fn encode_pingreq(out: &mut [u8]) -> Result<usize, MqttError> {
    let mut w = Writer::new(out);
    w.bytes(&[PINGREQ, 0])?;
    Ok(w.pos)
}

pub fn encode_disconnect(out: &mut [u8]) -> Result<usize, MqttError> {
    let mut w = Writer::new(out);
    w.bytes(&[DISCONNECT, 0])?;
    Ok(w.pos)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    ConnAck { session_present: bool, code: u8 },
    SubAck { packet_id: u16, granted: u8 },
    Publish { topic: &'a str, payload: &'a [u8] },
    PingResp,
    /// Anything else a broker may send; skipped.
    Other(u8),
}

/// Decode one packet from the front of `buf`.
///
/// `Ok(None)` means more bytes are needed. On success also returns how many
/// bytes the packet used.
pub fn decode(buf: &[u8]) -> Result<Option<(Packet<'_>, usize)>, MqttError> {
    let Some(&header) = buf.first() else {
        return Ok(None);
    };
    let mut len = 0usize;
    let mut shift = 0;
    let mut i = 1;
    loop {
        let Some(&byte) = buf.get(i) else {
            return Ok(None);
        };
        len |= ((byte & 0x7F) as usize) << shift;
        i += 1;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(MqttError::BadLength);
        }
    }
    let total = i + len;
    let Some(body) = buf.get(i..total) else {
        return Ok(None);
    };

    let packet = match header & 0xF0 {
        CONNACK => match body {
            [flags, code] => Packet::ConnAck {
                session_present: flags & 1 != 0,
                code: *code,
            },
            _ => return Err(MqttError::Malformed),
        },
        SUBACK => match body {
            [hi, lo, granted, ..] => Packet::SubAck {
                packet_id: u16::from_be_bytes([*hi, *lo]),
                granted: *granted,
            },
            _ => return Err(MqttError::Malformed),
        },
        PUBLISH => {
            let qos = (header >> 1) & 0x03;
            let [hi, lo, rest @ ..] = body else {
                return Err(MqttError::Malformed);
            };
            let topic_len = u16::from_be_bytes([*hi, *lo]) as usize;
            let topic = rest.get(..topic_len).ok_or(MqttError::Malformed)?;
            let topic = core::str::from_utf8(topic).map_err(|_| MqttError::Malformed)?;
            // QoS 1/2 carry a packet id before the payload.
            let skip = topic_len + if qos > 0 { 2 } else { 0 };
            let payload = rest.get(skip..).ok_or(MqttError::Malformed)?;
            Packet::Publish { topic, payload }
        }
        PINGRESP => Packet::PingResp,
        other => Packet::Other(other),
    };
    Ok(Some((packet, total)))
}

/// A byte-stream connection to the broker.
pub trait Transport {
    /// Start opening a connection. Completion shows up in `is_open`.
    fn open(&mut self, host: &str, port: u16) -> Result<(), MqttError>;
    fn is_open(&mut self) -> bool;
    /// True once the connection has failed or been closed by the peer.
    fn is_closed(&mut self) -> bool;
    fn send(&mut self, data: &[u8]) -> Result<(), MqttError>;
    /// Non-blocking read; returns 0 when nothing is waiting.
    fn recv(&mut self, buf: &mut [u8]) -> usize;
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle { retry_at_ms: u64 },
    Opening { since_ms: u64 },
    AwaitingAck { since_ms: u64 },
    Connected,
}

pub struct MqttSession {
    state: SessionState,
    rx: Vec<u8, RX_CAPACITY>,
    next_packet_id: u16,
    last_tx_ms: u64,
    last_publish_ms: Option<u64>,
    ping_sent_ms: Option<u64>,
}

impl MqttSession {
    pub const fn new() -> Self {
        Self {
            state: SessionState::Idle { retry_at_ms: 0 },
            rx: Vec::new(),
            next_packet_id: 1,
            last_tx_ms: 0,
            last_publish_ms: None,
            ping_sent_ms: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Drop the session and reconnect on the next pass.
    pub fn restart<T: Transport>(&mut self, transport: &mut T) {
        if self.is_connected() {
            let mut buf = [0u8; 2];
            if let Ok(n) = encode_disconnect(&mut buf) {
                let _ = transport.send(&buf[..n]);
            }
        }
        transport.close();
        self.reset(0);
    }

    fn reset(&mut self, retry_at_ms: u64) {
        self.state = SessionState::Idle { retry_at_ms };
        self.rx.clear();
        self.last_publish_ms = None;
        self.ping_sent_ms = None;
    }

    fn fail<T: Transport>(&mut self, transport: &mut T, now_ms: u64, why: MqttError) {
        log::warn!("mqtt: {}, retrying in {} s", why, RECONNECT_DELAY_MS / 1000);
        transport.close();
        self.reset(now_ms + RECONNECT_DELAY_MS);
    }

    fn send<T: Transport>(
        &mut self,
        transport: &mut T,
        data: &[u8],
        now_ms: u64,
    ) -> Result<(), MqttError> {
        transport.send(data)?;
        self.last_tx_ms = now_ms;
        Ok(())
    }

    /// One service pass. `sensor` is asked for a sample only when a publish
    /// is due; `None` (store busy) retries on the next pass. Each recognized
    /// command payload is handed to `on_command`.
    pub fn service<T: Transport>(
        &mut self,
        transport: &mut T,
        config: &MqttSettings,
        now_ms: u64,
        sensor: impl FnOnce() -> Option<u16>,
        on_command: impl FnMut(bool),
    ) {
        if let Err(e) = self.step(transport, config, now_ms, sensor, on_command) {
            self.fail(transport, now_ms, e);
        }
    }

    fn step<T: Transport>(
        &mut self,
        transport: &mut T,
        config: &MqttSettings,
        now_ms: u64,
        sensor: impl FnOnce() -> Option<u16>,
        on_command: impl FnMut(bool),
    ) -> Result<(), MqttError> {
        match self.state {
            SessionState::Idle { retry_at_ms } => {
                if now_ms < retry_at_ms || config.server.is_empty() {
                    return Ok(());
                }
                log::info!("mqtt: connecting to {}:{}", config.server, config.port);
                transport.open(&config.server, config.port)?;
                self.state = SessionState::Opening { since_ms: now_ms };
                Ok(())
            }
            SessionState::Opening { since_ms } => {
                if transport.is_open() {
                    let mut buf = [0u8; TX_CAPACITY];
                    let creds = (!config.user.is_empty())
                        .then(|| (config.user.as_str(), config.password.as_str()));
                    let n = encode_connect(&mut buf, &config.client, creds, KEEP_ALIVE_S)?;
                    self.send(transport, &buf[..n], now_ms)?;
                    self.state = SessionState::AwaitingAck { since_ms: now_ms };
                    Ok(())
                } else if transport.is_closed()
                    || now_ms.saturating_sub(since_ms) > CONNECT_TIMEOUT_MS
                {
                    Err(MqttError::Transport)
                } else {
                    Ok(())
                }
            }
            SessionState::AwaitingAck { since_ms } => {
                self.fill(transport)?;
                match decode(&self.rx)? {
                    Some((Packet::ConnAck { code: 0, .. }, used)) => {
                        self.consume(used);
                        let mut buf = [0u8; TX_CAPACITY];
                        let id = self.packet_id();
                        let n = encode_subscribe(&mut buf, id, COMMAND_TOPIC)?;
                        self.send(transport, &buf[..n], now_ms)?;
                        self.state = SessionState::Connected;
                        log::info!("mqtt: connected, subscribed to {}", COMMAND_TOPIC);
                        self.connected(transport, now_ms, sensor, on_command)
                    }
                    Some((Packet::ConnAck { code, .. }, _)) => Err(MqttError::Refused(code)),
                    Some((_, _)) => Err(MqttError::Malformed),
                    None if now_ms.saturating_sub(since_ms) > CONNECT_TIMEOUT_MS => {
                        Err(MqttError::Timeout)
                    }
                    None => Ok(()),
                }
            }
            SessionState::Connected => self.connected(transport, now_ms, sensor, on_command),
        }
    }

    fn connected<T: Transport>(
        &mut self,
        transport: &mut T,
        now_ms: u64,
        sensor: impl FnOnce() -> Option<u16>,
        mut on_command: impl FnMut(bool),
    ) -> Result<(), MqttError> {
        if transport.is_closed() {
            return Err(MqttError::Transport);
        }
        self.fill(transport)?;
        while let Some((packet, used)) = decode(&self.rx)? {
            match packet {
                Packet::Publish { topic, payload } if topic == COMMAND_TOPIC => {
                    match parse_command(payload) {
                        Some(engage) => on_command(engage),
                        None => log::debug!("mqtt: ignoring payload on {}", topic),
                    }
                }
                Packet::PingResp => self.ping_sent_ms = None,
                Packet::SubAck { granted: 0x80, .. } => log::warn!("mqtt: subscription refused"),
                _ => {}
            }
            self.consume(used);
        }

        let due = self
            .last_publish_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= PUBLISH_INTERVAL_MS);
        if due {
            if let Some(sample) = sensor() {
                let mut text: HString<8> = HString::new();
                let _ = write!(text, "{}", sample);
                let mut buf = [0u8; TX_CAPACITY];
                let n = encode_publish(&mut buf, SENSOR_TOPIC, text.as_bytes())?;
                self.send(transport, &buf[..n], now_ms)?;
                self.last_publish_ms = Some(now_ms);
            }
        }

        match self.ping_sent_ms {
            Some(sent) if now_ms.saturating_sub(sent) > KEEP_ALIVE_S as u64 * 1000 => {
                Err(MqttError::Timeout)
            }
            Some(_) => Ok(()),
            None if now_ms.saturating_sub(self.last_tx_ms) >= PING_INTERVAL_MS => {
                let mut buf = [0u8; 2];
                let n = encode_pingreq(&mut buf)?;
                self.send(transport, &buf[..n], now_ms)?;
                self.ping_sent_ms = Some(now_ms);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn fill<T: Transport>(&mut self, transport: &mut T) -> Result<(), MqttError> {
        let mut chunk = [0u8; 128];
        loop {
            let room = (RX_CAPACITY - self.rx.len()).min(chunk.len());
            if room == 0 {
                // A full buffer with no complete packet can never make progress.
                return match decode(&self.rx)? {
                    Some(_) => Ok(()),
                    None => Err(MqttError::BufferTooSmall),
                };
            }
            let n = transport.recv(&mut chunk[..room]);
            if n == 0 {
                return Ok(());
            }
            let _ = self.rx.extend_from_slice(&chunk[..n]);
        }
    }

    fn consume(&mut self, used: usize) {
        let len = self.rx.len();
        self.rx.copy_within(used..len, 0);
        self.rx.truncate(len - used);
    }

    fn packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }
}

impl Default for MqttSession {
    fn default() -> Self {
        Self::new()
    }
}
