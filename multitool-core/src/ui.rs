//! Menu and per-peripheral apps.
//!
//! Runs only on the control core. One step per tick: read the encoder and
//! button, move between the menu and the apps, let the active app act on its
//! peripheral, and describe the result as a [`Screen`].

use smart_leds::hsv::{hsv2rgb, Hsv};

use crate::board::{Board, LED_COUNT, RGB8};
use crate::bus::{BusGuard, PeripheralBus, ScanResult, BUS_WAIT_MS};
use crate::error::Busy;
use crate::input::{detents, Debouncer, COUNTS_PER_DETENT};
use crate::lock::Clock;
use crate::render::Screen;
use crate::shared::{StateStore, SERVO_MAX_DEGREES, STATE_WAIT_MS};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppKind {
    Relay,
    Scanner,
    Servo,
    Buzzer,
    Stepper,
    Ultrasonic,
    IrRemote,
    LedRing,
    Sensor,
    Dimmer,
    Network,
}

/// Menu order.
pub const APPS: [AppKind; 11] = [
    AppKind::Relay,
    AppKind::Scanner,
    AppKind::Servo,
    AppKind::Buzzer,
    AppKind::Stepper,
    AppKind::Ultrasonic,
    AppKind::IrRemote,
    AppKind::LedRing,
    AppKind::Sensor,
    AppKind::Dimmer,
    AppKind::Network,
];

pub const APP_COUNT: usize = APPS.len();

impl AppKind {
    pub const fn title(self) -> &'static str {
        match self {
            AppKind::Relay => "Relay",
            AppKind::Scanner => "I2C Scanner",
            AppKind::Servo => "Servo",
            AppKind::Buzzer => "Buzzer",
            AppKind::Stepper => "Stepper",
            AppKind::Ultrasonic => "Ultrasonic",
            AppKind::IrRemote => "IR Remote",
            AppKind::LedRing => "LED Ring",
            AppKind::Sensor => "Sensor",
            AppKind::Dimmer => "Dimmer",
            AppKind::Network => "WiFi Info",
        }
    }
}

pub const SERVO_STEP: u8 = 5;
/// Shown (not driven) until the servo is first positioned.
pub const SERVO_REST: u8 = 90;

pub const TONE_MIN_HZ: u16 = 100;
pub const TONE_MAX_HZ: u16 = 5_000;
pub const TONE_STEP_HZ: u16 = 50;
pub const TONE_START_HZ: u16 = 1_000;

pub const STEPPER_MAX_RATE: i8 = 10;
/// Step interval at rate 1; rate n steps n times faster.
const STEPPER_BASE_INTERVAL_MS: u64 = 200;

/// Half-step coil sequence for a unipolar stepper (28BYJ-48 style).
pub const HALF_STEP: [[bool; 4]; 8] = [
    [true, false, false, false],
    [true, true, false, false],
    [false, true, false, false],
    [false, true, true, false],
    [false, false, true, false],
    [false, false, true, true],
    [false, false, false, true],
    [true, false, false, true],
];

pub const LED_STEP: u8 = 16;
pub const LED_START_BRIGHTNESS: u8 = 64;
const LED_FRAME_MS: u64 = 20;

pub const DIMMER_STEP: u8 = 5;

const RESCAN_MS: u64 = 3_000;

/// Move `value` by `delta` detents of `step`, saturating at `[min, max]`.
pub fn saturate(value: i32, delta: i32, step: i32, min: i32, max: i32) -> i32 {
    value.saturating_add(delta.saturating_mul(step)).clamp(min, max)
}

/// One rainbow frame, rotated by `offset`.
pub fn rainbow(offset: u8, brightness: u8) -> [RGB8; LED_COUNT] {
    let mut frame = [RGB8::default(); LED_COUNT];
    for (i, px) in frame.iter_mut().enumerate() {
        let hue = offset.wrapping_add((i * 256 / LED_COUNT) as u8);
        *px = hsv2rgb(Hsv {
            hue,
            sat: 255,
            val: brightness,
        });
    }
    frame
}

/// The shared resources an app may touch. Never held across ticks.
pub struct Handles<'a, C: ?Sized, B> {
    pub clock: &'a C,
    pub store: &'a StateStore,
    pub bus: &'a BusGuard<B>,
}

impl<C: ?Sized, B> Clone for Handles<'_, C, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: ?Sized, B> Copy for Handles<'_, C, B> {}

/// Live state of the running app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum App {
    Relay,
    Scanner {
        found: ScanResult,
        scanned: bool,
        next_scan_ms: u64,
    },
    Servo {
        /// Whether this visit has driven the stored angle yet.
        attached: bool,
    },
    Buzzer {
        frequency: u16,
    },
    Stepper {
        rate: i8,
        phase: u8,
        position: i32,
        next_step_ms: u64,
    },
    LedRing {
        brightness: u8,
        hue: u8,
        next_frame_ms: u64,
    },
    Sensor,
    Dimmer,
    Network,
    Unavailable(AppKind),
}

impl App {
    fn enter<H: Board>(kind: AppKind, board: &mut H, now: u64) -> Self {
        match kind {
            AppKind::Relay => App::Relay,
            AppKind::Scanner => App::Scanner {
                found: ScanResult::new(),
                scanned: false,
                next_scan_ms: now,
            },
            AppKind::Servo => App::Servo { attached: false },
            AppKind::Buzzer => {
                board.set_tone(Some(TONE_START_HZ));
                App::Buzzer {
                    frequency: TONE_START_HZ,
                }
            }
            AppKind::Stepper => App::Stepper {
                rate: 0,
                phase: 0,
                position: 0,
                next_step_ms: now,
            },
            AppKind::LedRing => App::LedRing {
                brightness: LED_START_BRIGHTNESS,
                hue: 0,
                next_frame_ms: now,
            },
            AppKind::Sensor => App::Sensor,
            AppKind::Dimmer => App::Dimmer,
            AppKind::Network => App::Network,
            AppKind::Ultrasonic | AppKind::IrRemote => App::Unavailable(kind),
        }
    }

    pub fn kind(&self) -> AppKind {
        match self {
            App::Relay => AppKind::Relay,
            App::Scanner { .. } => AppKind::Scanner,
            App::Servo { .. } => AppKind::Servo,
            App::Buzzer { .. } => AppKind::Buzzer,
            App::Stepper { .. } => AppKind::Stepper,
            App::LedRing { .. } => AppKind::LedRing,
            App::Sensor => AppKind::Sensor,
            App::Dimmer => AppKind::Dimmer,
            App::Network => AppKind::Network,
            App::Unavailable(kind) => *kind,
        }
    }

    /// Leave no peripheral active after exit.
    fn teardown<H: Board>(&mut self, board: &mut H) {
        match self {
            App::Servo { .. } => board.set_servo(None),
            App::Buzzer { .. } => board.set_tone(None),
            App::Stepper { rate, .. } => {
                *rate = 0;
                board.drive_stepper([false; 4]);
            }
            App::LedRing { .. } => board.show_leds(&[RGB8::default(); LED_COUNT]),
            _ => {}
        }
    }

    fn step<H, C, B>(
        &mut self,
        delta: i32,
        now: u64,
        board: &mut H,
        links: Handles<'_, C, B>,
    ) -> Result<Screen, Busy>
    where
        H: Board,
        C: Clock + ?Sized,
        B: PeripheralBus,
    {
        match self {
            App::Relay => {
                let store = links.store;
                let engaged = store.write(links.clock, STATE_WAIT_MS, |s| {
                    if delta != 0 {
                        s.actuator_engaged.set(delta > 0, store.stamp());
                    }
                    s.actuator_engaged.get()
                })?;
                Ok(Screen::Relay { engaged })
            }
            App::Scanner {
                found,
                scanned,
                next_scan_ms,
            } => {
                if now >= *next_scan_ms {
                    match links.bus.scan(links.clock, BUS_WAIT_MS) {
                        Ok(result) => {
                            if !*scanned || result != *found {
                                log::info!("i2c: {} device(s) found", result.len());
                            }
                            *found = result;
                            *scanned = true;
                            *next_scan_ms = now + RESCAN_MS;
                        }
                        Err(Busy) => log::debug!("i2c: bus busy, scan deferred"),
                    }
                }
                Ok(Screen::Scanner {
                    found: found.clone(),
                    scanning: !*scanned,
                })
            }
            App::Servo { attached } => {
                let store = links.store;
                let angle = store.write(links.clock, STATE_WAIT_MS, |s| {
                    let stored = s.servo_angle.get();
                    let current = stored.unwrap_or(SERVO_REST);
                    if delta != 0 {
                        let max = SERVO_MAX_DEGREES as i32;
                        let next = saturate(current as i32, delta, SERVO_STEP as i32, 0, max) as u8;
                        s.servo_angle.set(Some(next), store.stamp());
                        return next;
                    }
                    // Re-issue the stored angle so the servo detached by the
                    // last exit is driven again.
                    if !*attached && stored.is_some() {
                        s.servo_angle.set(stored, store.stamp());
                    }
                    current
                })?;
                *attached = true;
                Ok(Screen::Servo { angle })
            }
            App::Buzzer { frequency } => {
                let next = saturate(
                    *frequency as i32,
                    delta,
                    TONE_STEP_HZ as i32,
                    TONE_MIN_HZ as i32,
                    TONE_MAX_HZ as i32,
                ) as u16;
                if next != *frequency {
                    *frequency = next;
                    board.set_tone(Some(next));
                }
                Ok(Screen::Buzzer { frequency: *frequency })
            }
            App::Stepper {
                rate,
                phase,
                position,
                next_step_ms,
            } => {
                if delta != 0 {
                    let max = STEPPER_MAX_RATE as i32;
                    *rate = saturate(*rate as i32, delta, 1, -max, max) as i8;
                    if *rate == 0 {
                        board.drive_stepper([false; 4]);
                    }
                }
                if *rate != 0 && now >= *next_step_ms {
                    let dir = rate.signum();
                    *phase = (*phase as i8 + dir).rem_euclid(HALF_STEP.len() as i8) as u8;
                    *position += dir as i32;
                    board.drive_stepper(HALF_STEP[*phase as usize]);
                    *next_step_ms = now + STEPPER_BASE_INTERVAL_MS / rate.unsigned_abs() as u64;
                }
                Ok(Screen::Stepper {
                    rate: *rate,
                    position: *position,
                })
            }
            App::LedRing {
                brightness,
                hue,
                next_frame_ms,
            } => {
                *brightness = saturate(*brightness as i32, delta, LED_STEP as i32, 0, 255) as u8;
                if now >= *next_frame_ms {
                    *hue = hue.wrapping_add(2);
                    board.show_leds(&rainbow(*hue, *brightness));
                    *next_frame_ms = now + LED_FRAME_MS;
                }
                Ok(Screen::LedRing {
                    brightness: *brightness,
                })
            }
            App::Sensor => {
                let sample = links
                    .store
                    .view(links.clock, STATE_WAIT_MS, |s| s.sensor_sample.get())?;
                Ok(Screen::Sensor { sample })
            }
            App::Dimmer => {
                let store = links.store;
                let level = store.write(links.clock, STATE_WAIT_MS, |s| {
                    if delta != 0 {
                        let current = s.dimmer_level.get() as i32;
                        let next = saturate(current, delta, DIMMER_STEP as i32, 0, 255) as u8;
                        s.dimmer_level.set(next, store.stamp());
                    }
                    s.dimmer_level.get()
                })?;
                Ok(Screen::Dimmer { level })
            }
            App::Network => {
                let (ready, address, clients) = links.store.view(links.clock, STATE_WAIT_MS, |s| {
                    (s.network_ready, s.assigned_address.clone(), s.connected_clients)
                })?;
                Ok(Screen::Network {
                    ready,
                    address,
                    clients,
                })
            }
            App::Unavailable(kind) => Ok(Screen::Unavailable { title: kind.title() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiState {
    Menu,
    Running(App),
}

/// The operator-facing state machine. Starts in the menu, never terminates.
pub struct Ui {
    state: UiState,
    selection: usize,
    debouncer: Debouncer,
    last_detent: i32,
}

impl Ui {
    pub const fn new() -> Self {
        Self {
            state: UiState::Menu,
            selection: 0,
            debouncer: Debouncer::new(),
            last_detent: 0,
        }
    }

    pub fn state(&self) -> &UiState {
        &self.state
    }

    pub fn selection(&self) -> usize {
        self.selection
    }

    /// The running app, `None` while in the menu.
    pub fn current(&self) -> Option<AppKind> {
        match &self.state {
            UiState::Menu => None,
            UiState::Running(app) => Some(app.kind()),
        }
    }

    /// Advance one tick. `Err(Busy)` means the state store could not be read
    /// this tick; the previous frame stays on screen.
    pub fn step<H, C, B>(
        &mut self,
        board: &mut H,
        links: Handles<'_, C, B>,
        now: u64,
    ) -> Result<Screen, Busy>
    where
        H: Board,
        C: Clock + ?Sized,
        B: PeripheralBus,
    {
        let detent = detents(board.encoder_count());
        let delta = detent.saturating_sub(self.last_detent);
        let pressed = self.debouncer.edge(board.button_pressed(), now);

        match &mut self.state {
            UiState::Menu => {
                self.last_detent = detent;
                if pressed {
                    let kind = APPS[self.selection];
                    log::info!("ui: open {}", kind.title());
                    board.set_encoder_count(0);
                    self.last_detent = 0;
                    let mut app = App::enter(kind, board, now);
                    let screen = app.step(0, now, board, links);
                    self.state = UiState::Running(app);
                    return screen;
                }
                if delta != 0 {
                    let next = (self.selection as i32 + delta).rem_euclid(APP_COUNT as i32);
                    self.selection = next as usize;
                }
                Ok(Screen::Menu {
                    selection: self.selection,
                })
            }
            UiState::Running(app) => {
                if pressed {
                    app.teardown(board);
                    log::info!("ui: close {}", app.kind().title());
                    self.state = UiState::Menu;
                    // Encode the highlighted item back into the encoder so the
                    // menu resumes where it was left.
                    board.set_encoder_count(self.selection as i32 * COUNTS_PER_DETENT);
                    self.last_detent = self.selection as i32;
                    return Ok(Screen::Menu {
                        selection: self.selection,
                    });
                }
                // A detent whose store write was refused stays pending and is
                // applied on a later tick.
                let screen = app.step(delta, now, board, links)?;
                self.last_detent = detent;
                Ok(screen)
            }
        }
    }
}

impl Default for Ui {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturate_clamps_instead_of_wrapping() {
        assert_eq!(saturate(175, 3, 5, 0, 180), 180);
        assert_eq!(saturate(5, -3, 5, 0, 180), 0);
        assert_eq!(saturate(0, -1, 1, -10, 10), -1);
        assert_eq!(saturate(0, i32::MAX, 50, 100, 5_000), 5_000);
    }

    #[test]
    fn rainbow_respects_brightness() {
        assert!(rainbow(0, 0).iter().all(|px| *px == RGB8::default()));
        assert!(rainbow(0, 255).iter().any(|px| px.r > 0 || px.g > 0 || px.b > 0));
    }

    #[test]
    fn every_menu_entry_has_a_distinct_title() {
        for (i, a) in APPS.iter().enumerate() {
            for b in &APPS[i + 1..] {
                assert_ne!(a.title(), b.title());
            }
        }
    }
}
