//! Core 0: hardware I/O, the menu and the display.
//!
//! Everything interesting happens in [`ControlContext::tick`]. This loop only
//! paces it at [`TICK_MS`]. The tick parks for flash writes before it touches
//! any lock and feeds the watchdog as its last step, so a tick that never
//! returns ends in a watchdog reset.

use esp_hal::delay::Delay;
use multitool_core::control::{remaining, ControlContext, TICK_MS};
use multitool_core::flash::FlashGate;
use multitool_core::{BusGuard, Clock, StateStore};

use crate::board::EspBoard;
use crate::display::OledBus;
use crate::{EspClock, SharedWatchdog};

/// Core 0 main loop.
pub fn run(
    board: EspBoard,
    clock: &'static EspClock,
    store: &'static StateStore,
    bus: &'static BusGuard<OledBus>,
    flash: &'static FlashGate,
) -> ! {
    log::info!("Core 0 started (control, {} ms tick)", TICK_MS);
    let delay = Delay::new();
    let mut control = ControlContext::new(board, SharedWatchdog, clock, store, bus, flash);

    loop {
        let started = clock.now_ms();
        let report = control.tick();
        if report.parked {
            log::debug!("core0: resumed after flash write");
        }

        let sleep = remaining(started, clock.now_ms());
        if sleep > 0 {
            delay.delay_millis(sleep as u32);
        }
    }
}
