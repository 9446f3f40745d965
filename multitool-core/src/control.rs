//! Control Context: hardware I/O and the UI, one tick at a time.
//!
//! The firmware calls [`ControlContext::tick`] forever on the control core and
//! sleeps for whatever is left of [`TICK_MS`] between calls.

use crate::board::{gamma_correct, Board, Watchdog};
use crate::bus::{BusGuard, PeripheralBus};
use crate::error::Busy;
use crate::flash::FlashGate;
use crate::lock::Clock;
use crate::render::Screen;
use crate::shared::{Sample, Stamp, StateStore, STATE_WAIT_MS};
use crate::ui::{Handles, Ui};

pub const TICK_MS: u64 = 10;

/// Consecutive contended ticks (~1 s) before contention is reported as a warning.
pub const CONTENTION_WARN_STREAK: u32 = 100;

/// Hardware watchdog timeout armed by the firmware.
pub const WATCHDOG_TIMEOUT_MS: u64 = 30_000;

/// Sleep needed to finish a tick that started at `started_ms`.
pub fn remaining(started_ms: u64, now_ms: u64) -> u64 {
    TICK_MS.saturating_sub(now_ms.saturating_sub(started_ms))
}

/// Setpoints as last driven into hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Outputs {
    actuator: bool,
    dimmer: u8,
    servo: Option<u8>,
    /// A fresh servo write re-drives the servo even at the same angle, since
    /// leaving the Servo app detaches it.
    servo_stamp: Stamp,
}

/// What one tick managed to do. Skipped steps are retried next tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub parked: bool,
    pub sampled: bool,
    pub reconciled: bool,
    pub stepped: bool,
    pub rendered: bool,
}

impl TickReport {
    pub fn contended(&self) -> bool {
        !(self.sampled && self.reconciled && self.stepped)
    }
}

pub struct ControlContext<'a, H, W, C: ?Sized, B> {
    board: H,
    watchdog: W,
    clock: &'a C,
    store: &'a StateStore,
    bus: &'a BusGuard<B>,
    flash: &'a FlashGate,
    ui: Ui,
    outputs: Option<Outputs>,
    last_screen: Option<Screen>,
    busy_streak: u32,
}

impl<'a, H, W, C, B> ControlContext<'a, H, W, C, B>
where
    H: Board,
    W: Watchdog,
    C: Clock + ?Sized,
    B: PeripheralBus,
{
    pub fn new(
        board: H,
        watchdog: W,
        clock: &'a C,
        store: &'a StateStore,
        bus: &'a BusGuard<B>,
        flash: &'a FlashGate,
    ) -> Self {
        Self {
            board,
            watchdog,
            clock,
            store,
            bus,
            flash,
            ui: Ui::new(),
            outputs: None,
            last_screen: None,
            busy_streak: 0,
        }
    }

    pub fn board(&self) -> &H {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut H {
        &mut self.board
    }

    pub fn watchdog(&self) -> &W {
        &self.watchdog
    }

    pub fn ui(&self) -> &Ui {
        &self.ui
    }

    pub fn busy_streak(&self) -> u32 {
        self.busy_streak
    }

    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport {
            // Must run before any lock is touched this tick.
            parked: self.flash.park_if_requested(self.clock),
            ..TickReport::default()
        };
        let now = self.clock.now_ms();

        let sample = Sample::new(self.board.read_sensor());
        report.sampled = self
            .store
            .write(self.clock, STATE_WAIT_MS, |s| s.sensor_sample = sample)
            .is_ok();

        let targets = self.store.view(self.clock, STATE_WAIT_MS, |s| Outputs {
            actuator: s.actuator_engaged.get(),
            dimmer: s.dimmer_level.get(),
            servo: s.servo_angle.get(),
            servo_stamp: s.servo_angle.stamp(),
        });
        if let Ok(targets) = targets {
            self.reconcile(targets);
            report.reconciled = true;
        }

        let handles = Handles {
            clock: self.clock,
            store: self.store,
            bus: self.bus,
        };
        match self.ui.step(&mut self.board, handles, now) {
            Ok(screen) => {
                report.stepped = true;
                report.rendered = self.present(screen);
            }
            Err(Busy) => {}
        }

        self.account(report.contended());
        self.watchdog.feed();
        report
    }

    /// Drive every output whose setpoint moved since the last tick.
    fn reconcile(&mut self, targets: Outputs) {
        let prev = self.outputs;
        if prev.map(|p| p.actuator) != Some(targets.actuator) {
            self.board.set_actuator(targets.actuator);
            log::info!("relay: {}", if targets.actuator { "engaged" } else { "disengaged" });
        }
        if prev.map(|p| p.dimmer) != Some(targets.dimmer) {
            self.board.set_dimmer_duty(gamma_correct(targets.dimmer));
            log::info!("dimmer: level {}", targets.dimmer);
        }
        if prev.map(|p| (p.servo, p.servo_stamp)) != Some((targets.servo, targets.servo_stamp)) {
            if let Some(angle) = targets.servo {
                self.board.set_servo(Some(angle));
                log::info!("servo: {} deg", angle);
            }
        }
        self.outputs = Some(targets);
    }

    /// Render only when the screen changed. Returns true if a frame was pushed.
    fn present(&mut self, screen: Screen) -> bool {
        if self.last_screen.as_ref() == Some(&screen) {
            return false;
        }
        match self.bus.render(self.clock, &screen) {
            Ok(()) => {
                self.last_screen = Some(screen);
                true
            }
            Err(Busy) => {
                log::debug!("display: bus busy, frame skipped");
                false
            }
        }
    }

    fn account(&mut self, contended: bool) {
        if contended {
            self.busy_streak = self.busy_streak.saturating_add(1);
            if self.busy_streak == CONTENTION_WARN_STREAK {
                log::warn!("control: state store busy for {} consecutive ticks", self.busy_streak);
            } else {
                log::debug!("control: store busy, tick partly skipped");
            }
        } else if self.busy_streak > 0 {
            log::debug!("control: contention cleared after {} ticks", self.busy_streak);
            self.busy_streak = 0;
        }
    }
}
