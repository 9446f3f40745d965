//! Rotary encoder decoding using GPIO interrupts.
//!
//! Both encoder lines interrupt on any edge. The handler reads the pair,
//! feeds the transition through the quadrature table and accumulates a signed
//! count that the control core reads and rewinds.

use core::cell::RefCell;
use core::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use critical_section::Mutex;
use esp_hal::gpio::{Event, Input, InputConfig, InputPin, Io, Pull};
use esp_hal::handler;
use esp_hal::interrupt::Priority;
use esp_hal::peripherals::IO_MUX;
use multitool_core::input::quadrature_step;

// ISR-accessible state (single instance)
static COUNT: AtomicI32 = AtomicI32::new(0);
static LAST_STATE: AtomicU8 = AtomicU8::new(0);

// Pin storage for interrupt handler access
static PIN_A: Mutex<RefCell<Option<Input<'static>>>> = Mutex::new(RefCell::new(None));
static PIN_B: Mutex<RefCell<Option<Input<'static>>>> = Mutex::new(RefCell::new(None));

/// GPIO interrupt handler for both encoder lines.
#[handler(priority = Priority::Priority3)]
fn gpio_handler() {
    let state = critical_section::with(|cs| {
        let mut a = PIN_A.borrow_ref_mut(cs);
        let mut b = PIN_B.borrow_ref_mut(cs);
        let (Some(a), Some(b)) = (a.as_mut(), b.as_mut()) else {
            return None;
        };
        a.clear_interrupt();
        b.clear_interrupt();
        Some(((a.is_low() as u8) << 1) | b.is_low() as u8)
    });

    if let Some(state) = state {
        let prev = LAST_STATE.swap(state, Ordering::AcqRel);
        let step = quadrature_step(prev, state);
        if step != 0 {
            COUNT.fetch_add(step as i32, Ordering::AcqRel);
        }
    }
}

/// Quadrature encoder on two pulled-up inputs.
pub struct Encoder {
    _initialized: bool,
}

impl Encoder {
    pub fn new<A, B>(a: A, b: B, io_mux: IO_MUX<'static>) -> Self
    where
        A: InputPin + 'static,
        B: InputPin + 'static,
    {
        let config = InputConfig::default().with_pull(Pull::Up);
        let mut a: Input<'static> = Input::new(a, config);
        let mut b: Input<'static> = Input::new(b, config);
        LAST_STATE.store(((a.is_low() as u8) << 1) | b.is_low() as u8, Ordering::Release);

        a.listen(Event::AnyEdge);
        b.listen(Event::AnyEdge);

        critical_section::with(|cs| {
            PIN_A.borrow_ref_mut(cs).replace(a);
            PIN_B.borrow_ref_mut(cs).replace(b);
        });

        let mut io = Io::new(io_mux);
        io.set_interrupt_handler(gpio_handler);

        Self { _initialized: true }
    }

    pub fn count(&self) -> i32 {
        COUNT.load(Ordering::Acquire)
    }

    pub fn set_count(&self, count: i32) {
        COUNT.store(count, Ordering::Release);
    }
}
