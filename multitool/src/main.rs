//! Bench multitool - ESP32 dual-core firmware for a relay, dimmer, servo,
//! stepper, buzzer, LED ring and sensor behind a rotary-encoder menu.
//!
//! Architecture:
//! - Core 0 (`core0`): 10 ms control tick, menu, display and all outputs
//! - Core 1 (`core1`): WiFi link, HTTP API, MQTT, firmware update
//!
//! The cores share state only through `multitool_core`'s bounded-wait locks.

#![no_std]
#![no_main]

use esp_bootloader_esp_idf::esp_app_desc;
esp_app_desc!();

mod board;
mod core0;
mod core1;
mod display;
mod encoder;
mod heap_debug;
mod net;
mod provision;
mod radio;
mod server;
mod storage;
mod tone;
mod transport;

extern crate alloc;

use alloc::boxed::Box;
use core::cell::RefCell;
use core::mem::MaybeUninit;
use critical_section::Mutex;
use esp_alloc as _;
use esp_hal::{
    clock::CpuClock,
    interrupt::software::SoftwareInterruptControl,
    main,
    system::Stack,
    time::Duration,
    timer::timg::{TimerGroup, Wdt},
};
use esp_println::logger::init_logger;
use esp_radio::wifi::{Config as WifiConfig, WifiController, WifiDevice};
use multitool_core::board::{Heartbeat, Watchdog};
use multitool_core::flash::FlashGate;
use multitool_core::settings::Defaults;
use multitool_core::{BusGuard, Clock, StateStore};
use static_cell::StaticCell;

use crate::board::{BoardPeripherals, EspBoard};
use crate::display::OledBus;

// Core 1 stack (needs to be larger for WiFi/smoltcp)
// 32KB covers two smoltcp interfaces, the HTTP router and the OTA chunk buffer.
static mut CORE1_STACK: Stack<32768> = Stack::new();

// WiFi handles passed from Core 0 to Core 1
pub(crate) static WIFI_STA: Mutex<RefCell<Option<WifiDevice<'static>>>> =
    Mutex::new(RefCell::new(None));
pub(crate) static WIFI_AP: Mutex<RefCell<Option<WifiDevice<'static>>>> =
    Mutex::new(RefCell::new(None));
pub(crate) static WIFI_CONTROLLER: Mutex<RefCell<Option<WifiController<'static>>>> =
    Mutex::new(RefCell::new(None));

// Watchdog timer (shared between cores)
pub(crate) static WATCHDOG: Mutex<RefCell<Option<Wdt<esp_hal::peripherals::TIMG1>>>> =
    Mutex::new(RefCell::new(None));

/// Bumped on every control-core feed; core 1 only feeds while it moves.
pub(crate) static HEARTBEAT: Heartbeat = Heartbeat::new();

static STORE: StateStore = StateStore::new();
static FLASH: FlashGate = FlashGate::new();
static CLOCK: EspClock = EspClock;
static BUS: StaticCell<BusGuard<OledBus>> = StaticCell::new();

/// Feed the watchdog timer. Safe to call from any core.
/// This should be called during long-running operations to prevent watchdog reset.
pub fn feed_watchdog() {
    critical_section::with(|cs| {
        if let Some(ref mut wdt) = *WATCHDOG.borrow_ref_mut(cs) {
            wdt.feed();
        }
    });
}

/// Disable the watchdog timer temporarily.
/// SAFETY: Only use this around operations that block both cores (like flash writes).
/// Must be paired with `enable_watchdog()`.
pub fn disable_watchdog() {
    critical_section::with(|cs| {
        if let Some(ref mut wdt) = *WATCHDOG.borrow_ref_mut(cs) {
            wdt.disable();
        }
    });
}

/// Re-enable the watchdog timer after it was disabled.
/// Must be paired with a previous `disable_watchdog()` call.
pub fn enable_watchdog() {
    critical_section::with(|cs| {
        if let Some(ref mut wdt) = *WATCHDOG.borrow_ref_mut(cs) {
            wdt.enable();
        }
    });
}

/// Milliseconds since boot, shared by both cores.
pub struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> u64 {
        net::now_ms()
    }
}

/// The control loop's handle on the shared hardware watchdog.
pub struct SharedWatchdog;

impl Watchdog for SharedWatchdog {
    fn feed(&mut self) {
        HEARTBEAT.beat();
        feed_watchdog();
    }
}

/// Build-time defaults, see build.rs. Saved settings take precedence.
pub(crate) fn defaults() -> Defaults {
    let base = Defaults::default();
    Defaults {
        ssid: option_env!("MULTITOOL_SSID").unwrap_or(base.ssid),
        password: option_env!("MULTITOOL_PASSWORD").unwrap_or(base.password),
        admin_user: option_env!("MULTITOOL_ADMIN_USER").unwrap_or(base.admin_user),
        admin_password: option_env!("MULTITOOL_ADMIN_PASSWORD").unwrap_or(base.admin_password),
        ota_password: option_env!("MULTITOOL_OTA_PASSWORD").unwrap_or(base.ota_password),
        mqtt_host: option_env!("MULTITOOL_MQTT_HOST").unwrap_or(base.mqtt_host),
        mqtt_port: option_env!("MULTITOOL_MQTT_PORT")
            .and_then(|p| p.parse::<u16>().ok())
            .filter(|p| *p != 0)
            .unwrap_or(base.mqtt_port),
    }
}

#[main]
fn main() -> ! {
    // Initialize logging
    init_logger(log::LevelFilter::Info);
    log::info!("Multitool starting...");

    // Initialize heap
    const HEAP_SIZE: usize = 72 * 1024;
    static mut HEAP: MaybeUninit<[u8; HEAP_SIZE]> = MaybeUninit::uninit();
    unsafe {
        esp_alloc::HEAP.add_region(esp_alloc::HeapRegion::new(
            HEAP.as_mut_ptr() as *mut u8,
            HEAP_SIZE,
            esp_alloc::MemoryCapability::Internal.into(),
        ));
    }

    // Hardware init
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    // Initialize timer for esp-rtos scheduler
    let timg0 = TimerGroup::new(peripherals.TIMG0);

    // Start the esp-rtos scheduler (required before esp_radio::init)
    esp_rtos::start(timg0.timer0);

    // Initialize esp-radio
    let esp_radio_ctrl = esp_radio::init().expect("esp-radio init failed");

    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(&esp_radio_ctrl, peripherals.WIFI, WifiConfig::default())
            .expect("wifi init failed");

    // Store WiFi handles in statics for Core 1 access
    // SAFETY: the devices and controller borrow from esp_radio_ctrl, which is
    // leaked to 'static below. Core 1 takes exclusive ownership.
    critical_section::with(|cs| {
        WIFI_STA
            .borrow_ref_mut(cs)
            .replace(unsafe { core::mem::transmute(interfaces.sta) });
        WIFI_AP
            .borrow_ref_mut(cs)
            .replace(unsafe { core::mem::transmute(interfaces.ap) });
        WIFI_CONTROLLER
            .borrow_ref_mut(cs)
            .replace(unsafe { core::mem::transmute(wifi_controller) });
    });

    // Keep esp_radio_ctrl alive (it owns the WiFi state)
    // SAFETY: leaking it to 'static makes the transmuted borrows above valid.
    let _esp_radio_ctrl: &'static _ = Box::leak(Box::new(unsafe {
        core::mem::transmute::<_, esp_radio::Controller<'static>>(esp_radio_ctrl)
    }));

    // Watchdog on TIMG1 (TIMG0 drives the scheduler); timer0 drives the buzzer
    let timg1 = TimerGroup::new(peripherals.TIMG1);
    let mut wdt = timg1.wdt;
    wdt.enable();
    wdt.set_timeout(
        esp_hal::timer::timg::MwdtStage::Stage0,
        Duration::from_millis(multitool_core::control::WATCHDOG_TIMEOUT_MS),
    );
    critical_section::with(|cs| {
        WATCHDOG
            .borrow_ref_mut(cs)
            .replace(unsafe { core::mem::transmute(wdt) });
    });

    // Display and bus scanning share I2C0 (GPIO21=SDA, GPIO22=SCL)
    let oled = OledBus::new(peripherals.I2C0, peripherals.GPIO21, peripherals.GPIO22)
        .expect("I2C0 config rejected");
    let bus: &'static BusGuard<OledBus> = BUS.init(BusGuard::new(oled));

    let board = EspBoard::new(BoardPeripherals {
        relay: peripherals.GPIO26,
        sensor: peripherals.GPIO34,
        adc: peripherals.ADC1,
        dimmer: peripherals.GPIO25,
        servo: peripherals.GPIO13,
        buzzer: peripherals.GPIO27,
        tone_timer: timg1.timer0,
        coils: [
            peripherals.GPIO16.into(),
            peripherals.GPIO17.into(),
            peripherals.GPIO18.into(),
            peripherals.GPIO19.into(),
        ],
        ledc: peripherals.LEDC,
        led_spi: peripherals.SPI2,
        led_data: peripherals.GPIO23,
        encoder_a: peripherals.GPIO32,
        encoder_b: peripherals.GPIO33,
        button: peripherals.GPIO4,
        io_mux: peripherals.IO_MUX,
    });

    heap_debug::log_heap_stats("boot");

    // Software interrupts for esp-rtos multi-core scheduler
    let sw_ints = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);

    // Start Core 1 with esp-rtos scheduler (required for usleep and other RTOS functions)
    esp_rtos::start_second_core(
        peripherals.CPU_CTRL,
        sw_ints.software_interrupt0,
        sw_ints.software_interrupt1,
        unsafe { &mut *core::ptr::addr_of_mut!(CORE1_STACK) },
        move || {
            core1::run(&CLOCK, &STORE, bus, &FLASH);
        },
    );

    // Core 0 main loop: control tick
    core0::run(board, &CLOCK, &STORE, bus, &FLASH);
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    critical_section::with(|_| {
        log::error!("PANIC: {}", info);
    });

    // Spin without feeding watchdog. The timeout will trigger a full system reset.
    loop {
        core::hint::spin_loop();
    }
}
