//! Square-wave tone output driven by a periodic timer interrupt.
//!
//! The buzzer is passive, so the pin is toggled every half period.

use core::cell::RefCell;
use critical_section::Mutex;
use esp_hal::gpio::{Level, Output, OutputConfig, OutputPin};
use esp_hal::handler;
use esp_hal::interrupt::Priority;
use esp_hal::time::Duration;
use esp_hal::timer::{PeriodicTimer, Timer as TimerTrait};
use esp_hal::Blocking;

static PIN: Mutex<RefCell<Option<Output<'static>>>> = Mutex::new(RefCell::new(None));
static TIMER: Mutex<RefCell<Option<PeriodicTimer<'static, Blocking>>>> =
    Mutex::new(RefCell::new(None));

#[handler(priority = Priority::Priority2)]
fn tone_handler() {
    critical_section::with(|cs| {
        if let Some(ref mut timer) = *TIMER.borrow_ref_mut(cs) {
            timer.clear_interrupt();
        }
        if let Some(ref mut pin) = *PIN.borrow_ref_mut(cs) {
            pin.toggle();
        }
    });
}

/// Passive buzzer on one output pin.
pub struct Tone {
    frequency: Option<u16>,
}

impl Tone {
    pub fn new<P, T>(pin: P, timer: T) -> Self
    where
        P: OutputPin + 'static,
        T: TimerTrait + 'static,
    {
        let pin = Output::new(pin, Level::Low, OutputConfig::default());
        let mut timer = PeriodicTimer::new(timer);
        timer.set_interrupt_handler(tone_handler);
        critical_section::with(|cs| {
            PIN.borrow_ref_mut(cs).replace(pin);
            TIMER.borrow_ref_mut(cs).replace(timer);
        });
        Self { frequency: None }
    }

    pub fn set(&mut self, frequency: Option<u16>) {
        if self.frequency == frequency {
            return;
        }
        self.frequency = frequency;
        critical_section::with(|cs| {
            let mut timer = TIMER.borrow_ref_mut(cs);
            let Some(timer) = timer.as_mut() else {
                return;
            };
            match frequency {
                Some(hz) if hz > 0 => {
                    let half_period_us = 500_000 / hz as u64;
                    timer.unlisten();
                    if let Err(e) = timer.start(Duration::from_micros(half_period_us)) {
                        log::warn!("tone: timer start failed: {:?}", e);
                        return;
                    }
                    timer.listen();
                }
                _ => {
                    timer.unlisten();
                    let _ = timer.cancel();
                    if let Some(ref mut pin) = *PIN.borrow_ref_mut(cs) {
                        pin.set_low();
                    }
                }
            }
        });
    }
}
