//! Hardware the control core drives directly.
//!
//! Implemented by the firmware for the real pins and by scripted fakes in tests.

use core::sync::atomic::{AtomicU32, Ordering};

pub use smart_leds::RGB8;

/// Number of pixels on the LED ring.
pub const LED_COUNT: usize = 12;

/// Control-core peripherals. Only the control core holds a `Board`.
pub trait Board {
    /// Raw analog reading; may exceed the 12-bit range on noisy inputs.
    fn read_sensor(&mut self) -> u16;

    /// Drive the bistable actuator (relay).
    fn set_actuator(&mut self, engaged: bool);

    /// Gamma-corrected dimmer duty, 0..=255.
    fn set_dimmer_duty(&mut self, duty: u8);

    /// Position the servo, or detach it with `None`.
    fn set_servo(&mut self, angle: Option<u8>);

    /// Start a tone at `frequency` Hz, or silence with `None`.
    fn set_tone(&mut self, frequency: Option<u16>);

    /// Energise the four stepper drive lines.
    fn drive_stepper(&mut self, coils: [bool; 4]);

    fn show_leds(&mut self, frame: &[RGB8; LED_COUNT]);

    /// Accumulated encoder count since the last `set_encoder_count`.
    fn encoder_count(&mut self) -> i32;

    fn set_encoder_count(&mut self, count: i32);

    /// Raw (undebounced) button level, `true` while held.
    fn button_pressed(&mut self) -> bool;
}

/// The "still alive" signal for the hardware watchdog.
pub trait Watchdog {
    fn feed(&mut self);
}

/// Tick counter the control core bumps every time it feeds the watchdog.
pub struct Heartbeat {
    beats: AtomicU32,
}

impl Heartbeat {
    pub const fn new() -> Self {
        Self {
            beats: AtomicU32::new(0),
        }
    }

    pub fn beat(&self) {
        self.beats.fetch_add(1, Ordering::Release);
    }

    pub fn count(&self) -> u32 {
        self.beats.load(Ordering::Acquire)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Lets another core feed the watchdog, but only while the control core is
/// still beating. A control core that stops ticking gets no cover.
pub struct FeedGate {
    seen: u32,
}

impl FeedGate {
    /// Beats already counted at creation do not open the gate.
    pub fn new(heartbeat: &Heartbeat) -> Self {
        Self {
            seen: heartbeat.count(),
        }
    }

    /// True if the heartbeat moved since the last call that returned true.
    pub fn should_feed(&mut self, heartbeat: &Heartbeat) -> bool {
        let now = heartbeat.count();
        if now == self.seen {
            return false;
        }
        self.seen = now;
        true
    }
}

/// Approximate gamma 2.0 so the dimmer looks linear to the eye.
pub const fn gamma_correct(level: u8) -> u8 {
    let l = level as u16;
    ((l * l + 254) / 255) as u8
}
