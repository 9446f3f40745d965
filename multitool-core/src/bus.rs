//! Guard for the shared I2C bus (display plus any bus-addressed sensors).
//!
//! Independent of the state lock. A caller must copy what it needs out of the
//! [`StateStore`](crate::shared::StateStore) before entering `with_bus`, and
//! must never touch the state store from inside it.

use heapless::Vec;

use crate::error::{Busy, DisplayError};
use crate::lock::{BoundedMutex, Clock};
use crate::render::{self, Canvas, Screen};

/// Bound for a display redraw. Pushing a full frame is the slowest routine bus
/// operation, so this is larger than the state-lock bound.
pub const BUS_WAIT_MS: u64 = 100;

/// Bound for a full address sweep requested over the network.
pub const SCAN_WAIT_MS: u64 = 500;

pub const MAX_FOUND: usize = 16;

const FIRST_ADDRESS: u8 = 0x01;
const LAST_ADDRESS: u8 = 0x7E;

/// Everything living on the shared bus.
pub trait PeripheralBus {
    type Canvas: Canvas;

    /// `None` when the display failed to initialise; drawing is then skipped.
    fn canvas(&mut self) -> Option<&mut Self::Canvas>;

    /// Push the drawn frame to the display.
    fn commit(&mut self) -> Result<(), DisplayError>;

    /// Address-only write; `true` when a device acknowledged.
    fn probe(&mut self, address: u8) -> bool;
}

pub type ScanResult = Vec<u8, MAX_FOUND>;

pub struct BusGuard<B> {
    bus: BoundedMutex<B>,
}

impl<B: PeripheralBus> BusGuard<B> {
    pub const fn new(bus: B) -> Self {
        Self {
            bus: BoundedMutex::new(bus),
        }
    }

    /// Run one bus operation to completion under the bus lock.
    pub fn with_bus<C, R>(
        &self,
        clock: &C,
        wait_ms: u64,
        op: impl FnOnce(&mut B) -> R,
    ) -> Result<R, Busy>
    where
        C: Clock + ?Sized,
    {
        self.bus.lock_within(clock, wait_ms, op)
    }

    /// Draw and commit a screen. A missing display makes this a no-op.
    pub fn render<C: Clock + ?Sized>(&self, clock: &C, screen: &Screen) -> Result<(), Busy> {
        self.with_bus(clock, BUS_WAIT_MS, |bus| {
            let Some(canvas) = bus.canvas() else {
                return;
            };
            render::draw(screen, canvas);
            if let Err(e) = bus.commit() {
                log::warn!("display: commit failed: {}", e);
            }
        })
    }

    /// Sweep every 7-bit address and collect the ones that answer.
    pub fn scan<C: Clock + ?Sized>(&self, clock: &C, wait_ms: u64) -> Result<ScanResult, Busy> {
        self.with_bus(clock, wait_ms, |bus| {
            let mut found = ScanResult::new();
            for address in FIRST_ADDRESS..=LAST_ADDRESS {
                if bus.probe(address) && found.push(address).is_err() {
                    log::warn!("i2c: more than {} devices, list truncated", MAX_FOUND);
                    break;
                }
            }
            found
        })
    }

    pub fn into_inner(self) -> B {
        self.bus.into_inner()
    }
}

/// Friendly name for common breakout-board addresses.
pub fn device_name(address: u8) -> &'static str {
    match address {
        0x3C | 0x3D => "OLED",
        0x76 | 0x77 => "BME280",
        0x68 | 0x69 => "MPU6050",
        0x27 | 0x3F => "LCD",
        0x48 => "ADS1115",
        0x57 => "EEPROM",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct Tick(Cell<u64>);

    impl Clock for Tick {
        fn now_ms(&self) -> u64 {
            self.0.get()
        }
        fn relax(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    struct NullCanvas;

    impl Canvas for NullCanvas {
        fn clear(&mut self) {}
        fn text(&mut self, _: i32, _: i32, _: &str) {}
        fn frame(&mut self, _: i32, _: i32, _: u32, _: u32) {}
        fn fill(&mut self, _: i32, _: i32, _: u32, _: u32) {}
    }

    struct Headless {
        present: &'static [u8],
        commits: u32,
    }

    impl PeripheralBus for Headless {
        type Canvas = NullCanvas;

        fn canvas(&mut self) -> Option<&mut NullCanvas> {
            None
        }
        fn commit(&mut self) -> Result<(), DisplayError> {
            self.commits += 1;
            Ok(())
        }
        fn probe(&mut self, address: u8) -> bool {
            self.present.contains(&address)
        }
    }

    #[test]
    fn scan_lists_acknowledging_addresses_in_order() {
        let clock = Tick(Cell::new(0));
        let guard = BusGuard::new(Headless {
            present: &[0x76, 0x3C],
            commits: 0,
        });
        let found = guard.scan(&clock, SCAN_WAIT_MS).unwrap();
        assert_eq!(&found[..], &[0x3C, 0x76]);
    }

    #[test]
    fn render_without_display_is_a_no_op() {
        let clock = Tick(Cell::new(0));
        let guard = BusGuard::new(Headless {
            present: &[],
            commits: 0,
        });
        assert!(guard.render(&clock, &Screen::Menu { selection: 0 }).is_ok());
        assert_eq!(guard.into_inner().commits, 0);
    }
}
