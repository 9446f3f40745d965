//! Scripted fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use multitool_core::api::{FirmwareInfo, SystemInfo};
use multitool_core::board::{Board, Watchdog, LED_COUNT, RGB8};
use multitool_core::bus::PeripheralBus;
use multitool_core::error::{DisplayError, LinkError, MqttError, OtaError, SettingsError};
use multitool_core::flash::FlashGate;
use multitool_core::input::COUNTS_PER_DETENT;
use multitool_core::link::LinkDriver;
use multitool_core::mqtt::Transport;
use multitool_core::ota::StagingArea;
use multitool_core::render::Canvas;
use multitool_core::settings::{Slot, SlotStorage, WifiCredentials};
use multitool_core::Clock;

// ============================================================================
// Clocks
// ============================================================================

/// Manually advanced time. Each spin in a bounded wait costs 1 ms, so a
/// contended lock times out after exactly its bound without real sleeping.
#[derive(Default)]
pub struct FakeClock {
    now: AtomicU64,
}

impl FakeClock {
    pub fn at(ms: u64) -> Self {
        Self { now: AtomicU64::new(ms) }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn relax(&self) {
        self.advance(1);
    }
}

/// Real time, for tests where another thread has to make progress.
pub struct WallClock(Instant);

impl WallClock {
    pub fn new() -> Self {
        Self(Instant::now())
    }
}

impl Clock for WallClock {
    fn now_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }

    fn relax(&self) {
        thread::yield_now();
    }
}

/// Run `body` while a helper thread plays the control core's part of the
/// flash handshake.
pub fn with_parker<R>(gate: &FlashGate, body: impl FnOnce() -> R) -> R {
    let stop = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            let clock = WallClock::new();
            while !stop.load(Ordering::SeqCst) {
                gate.park_if_requested(&clock);
                thread::yield_now();
            }
        });
        let r = body();
        stop.store(true, Ordering::SeqCst);
        r
    })
}

// ============================================================================
// Hardware
// ============================================================================

#[derive(Debug)]
pub struct FakeBoard {
    pub sensor: u16,
    pub actuator: Option<bool>,
    pub actuator_writes: Vec<bool>,
    pub dimmer_duty: Option<u8>,
    pub servo_writes: Vec<Option<u8>>,
    pub tone: Option<u16>,
    pub coils: [bool; 4],
    pub coil_writes: usize,
    pub leds: [RGB8; LED_COUNT],
    pub led_writes: usize,
    pub encoder: i32,
    pub button: bool,
}

impl Default for FakeBoard {
    fn default() -> Self {
        Self {
            sensor: 0,
            actuator: None,
            actuator_writes: Vec::new(),
            dimmer_duty: None,
            servo_writes: Vec::new(),
            tone: None,
            coils: [false; 4],
            coil_writes: 0,
            leds: [RGB8::default(); LED_COUNT],
            led_writes: 0,
            encoder: 0,
            button: false,
        }
    }
}

impl FakeBoard {
    pub fn turn(&mut self, detents: i32) {
        self.encoder += detents * COUNTS_PER_DETENT;
    }

    pub fn servo(&self) -> Option<u8> {
        self.servo_writes.last().copied().flatten()
    }
}

impl Board for FakeBoard {
    fn read_sensor(&mut self) -> u16 {
        self.sensor
    }

    fn set_actuator(&mut self, engaged: bool) {
        self.actuator = Some(engaged);
        self.actuator_writes.push(engaged);
    }

    fn set_dimmer_duty(&mut self, duty: u8) {
        self.dimmer_duty = Some(duty);
    }

    fn set_servo(&mut self, angle: Option<u8>) {
        self.servo_writes.push(angle);
    }

    fn set_tone(&mut self, frequency: Option<u16>) {
        self.tone = frequency;
    }

    fn drive_stepper(&mut self, coils: [bool; 4]) {
        self.coils = coils;
        self.coil_writes += 1;
    }

    fn show_leds(&mut self, frame: &[RGB8; LED_COUNT]) {
        self.leds = *frame;
        self.led_writes += 1;
    }

    fn encoder_count(&mut self) -> i32 {
        self.encoder
    }

    fn set_encoder_count(&mut self, count: i32) {
        self.encoder = count;
    }

    fn button_pressed(&mut self) -> bool {
        self.button
    }
}

#[derive(Debug, Default)]
pub struct FakeWatchdog {
    pub feeds: usize,
}

impl Watchdog for FakeWatchdog {
    fn feed(&mut self) {
        self.feeds += 1;
    }
}

/// Canvas that keeps the text of the last drawn frame.
#[derive(Debug, Default)]
pub struct RecordingCanvas {
    pub lines: Vec<String>,
    pub frames: usize,
}

impl RecordingCanvas {
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.contains(needle))
    }
}

impl Canvas for RecordingCanvas {
    fn clear(&mut self) {
        self.lines.clear();
        self.frames += 1;
    }

    fn text(&mut self, _x: i32, _y: i32, text: &str) {
        self.lines.push(text.to_string());
    }

    fn frame(&mut self, _x: i32, _y: i32, _w: u32, _h: u32) {}

    fn fill(&mut self, _x: i32, _y: i32, _w: u32, _h: u32) {}
}

#[derive(Debug, Default)]
pub struct FakeBus {
    /// `None` models a display that failed to initialise.
    pub canvas: Option<RecordingCanvas>,
    pub present: Vec<u8>,
    pub commits: usize,
}

impl FakeBus {
    pub fn with_display() -> Self {
        Self {
            canvas: Some(RecordingCanvas::default()),
            ..Self::default()
        }
    }

    pub fn headless() -> Self {
        Self::default()
    }
}

impl PeripheralBus for FakeBus {
    type Canvas = RecordingCanvas;

    fn canvas(&mut self) -> Option<&mut RecordingCanvas> {
        self.canvas.as_mut()
    }

    fn commit(&mut self) -> Result<(), DisplayError> {
        self.commits += 1;
        Ok(())
    }

    fn probe(&mut self, address: u8) -> bool {
        self.present.contains(&address)
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Default)]
pub struct MemorySlots {
    pub slots: [Vec<u8>; 2],
    pub writes: Vec<Slot>,
    pub fail_writes: bool,
}

impl SlotStorage for MemorySlots {
    fn read_slot(&mut self, slot: Slot, buf: &mut [u8]) -> Result<(), SettingsError> {
        buf.fill(0xFF);
        let data = &self.slots[slot as usize];
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn write_slot(&mut self, slot: Slot, record: &[u8]) -> Result<(), SettingsError> {
        if self.fail_writes {
            return Err(SettingsError::Flash);
        }
        self.slots[slot as usize] = record.to_vec();
        self.writes.push(slot);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryStaging {
    pub data: Vec<u8>,
    pub capacity: usize,
    pub activated: bool,
    /// Flip a bit at this offset on its way into "flash".
    pub corrupt_at: Option<usize>,
}

impl MemoryStaging {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
            activated: false,
            corrupt_at: None,
        }
    }
}

impl StagingArea for MemoryStaging {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn begin(&mut self, len: usize) -> Result<(), OtaError> {
        self.data = vec![0xFF; len];
        self.activated = false;
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), OtaError> {
        let dst = self.data.get_mut(offset..offset + data.len()).ok_or(OtaError::Flash)?;
        dst.copy_from_slice(data);
        if let Some(at) = self.corrupt_at {
            if (offset..offset + data.len()).contains(&at) {
                self.data[at] ^= 0x01;
            }
        }
        Ok(())
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), OtaError> {
        let src = self.data.get(offset..offset + buf.len()).ok_or(OtaError::Flash)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn activate(&mut self) -> Result<(), OtaError> {
        self.activated = true;
        Ok(())
    }
}

// ============================================================================
// Network collaborators
// ============================================================================

pub fn creds(ssid: &str, password: &str) -> WifiCredentials {
    WifiCredentials {
        ssid: ssid.try_into().unwrap(),
        password: password.try_into().unwrap(),
    }
}

#[derive(Debug, Default)]
pub struct FakeLink {
    pub connected: bool,
    /// Whether `begin_connect` eventually succeeds.
    pub reachable: bool,
    pub connects: Vec<String>,
    pub power_cycles: usize,
    pub portal_open: bool,
    pub portals_opened: usize,
    pub submitted: Option<WifiCredentials>,
}

impl LinkDriver for FakeLink {
    fn begin_connect(&mut self, creds: &WifiCredentials) -> Result<(), LinkError> {
        self.connects.push(creds.ssid.to_string());
        self.connected = self.reachable;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn power_cycle(&mut self) {
        self.connected = false;
        self.power_cycles += 1;
    }

    fn begin_provisioning(&mut self) -> Result<(), LinkError> {
        self.portal_open = true;
        self.portals_opened += 1;
        Ok(())
    }

    fn poll_provisioning(&mut self) -> Option<WifiCredentials> {
        self.submitted.take()
    }

    fn end_provisioning(&mut self) {
        self.portal_open = false;
    }
}

#[derive(Debug, Default)]
pub struct FakeTransport {
    pub open: bool,
    pub closed: bool,
    pub opens: usize,
    pub sent: Vec<Vec<u8>>,
    pub inbox: VecDeque<u8>,
}

impl FakeTransport {
    pub fn deliver(&mut self, bytes: &[u8]) {
        self.inbox.extend(bytes);
    }

    pub fn sent_types(&self) -> Vec<u8> {
        self.sent.iter().map(|p| p[0] & 0xF0).collect()
    }
}

impl Transport for FakeTransport {
    fn open(&mut self, _host: &str, _port: u16) -> Result<(), MqttError> {
        self.opens += 1;
        self.open = true;
        self.closed = false;
        Ok(())
    }

    fn is_open(&mut self) -> bool {
        self.open
    }

    fn is_closed(&mut self) -> bool {
        self.closed
    }

    fn send(&mut self, data: &[u8]) -> Result<(), MqttError> {
        if !self.open {
            return Err(MqttError::Transport);
        }
        self.sent.push(data.to_vec());
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.inbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbox.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn close(&mut self) {
        self.open = false;
        self.inbox.clear();
    }
}

pub struct FakeInfo;

impl SystemInfo for FakeInfo {
    fn free_heap(&self) -> u32 {
        123_456
    }

    fn uptime_ms(&self) -> u64 {
        42_000
    }

    fn rssi(&self) -> i8 {
        -61
    }

    fn ssid(&self) -> &str {
        "bench\"lab"
    }

    fn mac(&self) -> [u8; 6] {
        [0x24, 0x0A, 0xC4, 0x00, 0x12, 0xAB]
    }

    fn channel(&self) -> u8 {
        6
    }

    fn firmware(&self) -> FirmwareInfo {
        FirmwareInfo {
            version: "0.1.0",
            build: "test",
            image_size: 900_000,
            free_space: 1_000_000,
            sdk: "esp-hal",
            cpu_mhz: 240,
        }
    }
}

// ============================================================================
// HTTP helpers
// ============================================================================

pub fn base64(input: &[u8]) -> String {
    const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::new();
    for chunk in input.chunks(3) {
        let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
        let n = (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32;
        for i in 0..4 {
            if i <= chunk.len() {
                out.push(ALPHABET[(n >> (18 - 6 * i) & 0x3F) as usize] as char);
            } else {
                out.push('=');
            }
        }
    }
    out
}

/// Raw request bytes with optional Basic credentials and extra header lines.
pub fn request(
    method: &str,
    path: &str,
    auth: Option<(&str, &str)>,
    extra: &[&str],
    body: &str,
) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\nHost: multitool\r\n", method, path);
    if let Some((user, pass)) = auth {
        let token = base64(format!("{}:{}", user, pass).as_bytes());
        head += &format!("Authorization: Basic {}\r\n", token);
    }
    for line in extra {
        head += line;
        head += "\r\n";
    }
    if !body.is_empty() {
        head += &format!("Content-Type: application/json\r\nContent-Length: {}\r\n", body.len());
    }
    head += "\r\n";
    head += body;
    head.into_bytes()
}
