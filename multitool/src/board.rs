//! Control-core peripherals of the multitool board.
//!
//! Pin map (ESP32 DevKit):
//!   relay GPIO26, sensor GPIO34 (ADC1), dimmer MOSFET GPIO25, servo GPIO13,
//!   buzzer GPIO27, stepper IN1..IN4 GPIO16/17/18/19, LED ring data GPIO23,
//!   encoder A/B GPIO32/33, encoder button GPIO4.
//!
//! An output that fails to initialise is logged once and then ignored, so a
//! missing accessory never stops the control loop.

use esp_hal::analog::adc::{Adc, AdcConfig, AdcPin, Attenuation};
use esp_hal::gpio::{AnyPin, Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::ledc::channel::{self as ledc_channel, ChannelHW, ChannelIFace};
use esp_hal::ledc::timer::{self as ledc_timer, TimerIFace};
use esp_hal::ledc::{LSGlobalClkSource, Ledc, LowSpeed};
use esp_hal::peripherals::{
    ADC1, GPIO13, GPIO23, GPIO25, GPIO26, GPIO27, GPIO32, GPIO33, GPIO34, GPIO4, IO_MUX, LEDC, SPI2,
};
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::spi::Mode;
use esp_hal::time::Rate;
use esp_hal::timer::timg::Timer as TimgTimer;
use esp_hal::Blocking;
use multitool_core::board::{Board, RGB8, LED_COUNT};
use smart_leds::SmartLedsWrite;
use static_cell::StaticCell;
use ws2812_spi::prerendered::Ws2812;

use crate::encoder::Encoder;
use crate::tone::Tone;

const DIMMER_FREQUENCY_KHZ: u32 = 5;
const SERVO_FREQUENCY_HZ: u32 = 50;
const SERVO_PERIOD_US: u32 = 20_000;
const SERVO_MIN_US: u32 = 500;
const SERVO_MAX_US: u32 = 2_500;
/// 14-bit duty resolution on the servo timer.
const SERVO_DUTY_MAX: u32 = 1 << 14;

// WS2812 bit timing: 3.2 MHz SPI, four SPI bits per LED bit.
const LED_SPI_KHZ: u32 = 3_200;
const LED_BUF_LEN: usize = LED_COUNT * 12 + 40;

static LEDC_DRIVER: StaticCell<Ledc<'static>> = StaticCell::new();
static DIMMER_TIMER: StaticCell<ledc_timer::Timer<'static, LowSpeed>> = StaticCell::new();
static SERVO_TIMER: StaticCell<ledc_timer::Timer<'static, LowSpeed>> = StaticCell::new();
static LED_BUF: StaticCell<[u8; LED_BUF_LEN]> = StaticCell::new();

type LedRing = Ws2812<'static, Spi<'static, Blocking>>;
type PwmChannel = ledc_channel::Channel<'static, LowSpeed>;

/// Everything the control core owns, handed over by `main`.
pub struct BoardPeripherals {
    pub relay: GPIO26<'static>,
    pub sensor: GPIO34<'static>,
    pub adc: ADC1<'static>,
    pub dimmer: GPIO25<'static>,
    pub servo: GPIO13<'static>,
    pub buzzer: GPIO27<'static>,
    pub tone_timer: TimgTimer<'static>,
    pub coils: [AnyPin<'static>; 4],
    pub ledc: LEDC<'static>,
    pub led_spi: SPI2<'static>,
    pub led_data: GPIO23<'static>,
    pub encoder_a: GPIO32<'static>,
    pub encoder_b: GPIO33<'static>,
    pub button: GPIO4<'static>,
    pub io_mux: IO_MUX<'static>,
}

pub struct EspBoard {
    relay: Output<'static>,
    adc: Adc<'static, ADC1<'static>, Blocking>,
    sensor: AdcPin<GPIO34<'static>, ADC1<'static>>,
    dimmer: Option<PwmChannel>,
    servo: Option<PwmChannel>,
    tone: Tone,
    coils: [Output<'static>; 4],
    leds: Option<LedRing>,
    encoder: Encoder,
    button: Input<'static>,
}

impl EspBoard {
    pub fn new(p: BoardPeripherals) -> Self {
        let relay = Output::new(p.relay, Level::Low, OutputConfig::default());

        let mut adc_config = AdcConfig::new();
        let sensor = adc_config.enable_pin(p.sensor, Attenuation::_11dB);
        let adc = Adc::new(p.adc, adc_config);

        let mut ledc = Ledc::new(p.ledc);
        ledc.set_global_slow_clock(LSGlobalClkSource::APBClk);
        let ledc: &'static Ledc<'static> = LEDC_DRIVER.init(ledc);

        let dimmer = pwm_channel(
            ledc,
            &DIMMER_TIMER,
            ledc_timer::Number::Timer0,
            ledc_timer::config::Duty::Duty8Bit,
            Rate::from_khz(DIMMER_FREQUENCY_KHZ),
            ledc_channel::Number::Channel0,
            p.dimmer,
        )
        .map_err(|e| log::error!("dimmer: init failed: {}", e))
        .ok();
        let servo = pwm_channel(
            ledc,
            &SERVO_TIMER,
            ledc_timer::Number::Timer1,
            ledc_timer::config::Duty::Duty14Bit,
            Rate::from_hz(SERVO_FREQUENCY_HZ),
            ledc_channel::Number::Channel1,
            p.servo,
        )
        .map_err(|e| log::error!("servo: init failed: {}", e))
        .ok();

        let coils = p.coils.map(|pin| Output::new(pin, Level::Low, OutputConfig::default()));

        let leds = Spi::new(
            p.led_spi,
            SpiConfig::default()
                .with_frequency(Rate::from_khz(LED_SPI_KHZ))
                .with_mode(Mode::_0),
        )
        .map(|spi| Ws2812::new(spi.with_mosi(p.led_data), LED_BUF.init([0; LED_BUF_LEN])))
        .map_err(|e| log::error!("leds: SPI init failed: {:?}", e))
        .ok();

        let button = Input::new(p.button, InputConfig::default().with_pull(Pull::Up));

        Self {
            relay,
            adc,
            sensor,
            dimmer,
            servo,
            tone: Tone::new(p.buzzer, p.tone_timer),
            coils,
            leds,
            encoder: Encoder::new(p.encoder_a, p.encoder_b, p.io_mux),
            button,
        }
    }
}

fn pwm_channel(
    ledc: &'static Ledc<'static>,
    slot: &'static StaticCell<ledc_timer::Timer<'static, LowSpeed>>,
    timer_number: ledc_timer::Number,
    duty: ledc_timer::config::Duty,
    frequency: Rate,
    channel_number: ledc_channel::Number,
    pin: impl esp_hal::gpio::OutputPin + 'static,
) -> Result<PwmChannel, &'static str> {
    let mut timer = ledc.timer::<LowSpeed>(timer_number);
    timer
        .configure(ledc_timer::config::Config {
            duty,
            clock_source: ledc_timer::LSClockSource::APBClk,
            frequency,
        })
        .map_err(|_| "timer")?;
    let timer = slot.init(timer);

    let mut channel = ledc.channel::<LowSpeed>(channel_number, pin);
    channel
        .configure(ledc_channel::config::Config {
            timer: &*timer,
            duty_pct: 0,
            drive_mode: esp_hal::gpio::DriveMode::PushPull,
        })
        .map_err(|_| "channel")?;
    Ok(channel)
}

/// LEDC duty for a servo pulse at `angle` degrees.
fn servo_duty(angle: u8) -> u32 {
    let angle = angle.min(180) as u32;
    let pulse_us = SERVO_MIN_US + angle * (SERVO_MAX_US - SERVO_MIN_US) / 180;
    pulse_us * SERVO_DUTY_MAX / SERVO_PERIOD_US
}

impl Board for EspBoard {
    fn read_sensor(&mut self) -> u16 {
        loop {
            if let Ok(raw) = self.adc.read_oneshot(&mut self.sensor) {
                return raw;
            }
        }
    }

    fn set_actuator(&mut self, engaged: bool) {
        self.relay.set_level(Level::from(engaged));
    }

    fn set_dimmer_duty(&mut self, duty: u8) {
        if let Some(ref dimmer) = self.dimmer {
            dimmer.set_duty_hw(duty as u32);
        }
    }

    fn set_servo(&mut self, angle: Option<u8>) {
        if let Some(ref servo) = self.servo {
            // Zero duty stops the pulse train, which lets the servo go limp.
            servo.set_duty_hw(angle.map_or(0, servo_duty));
        }
    }

    fn set_tone(&mut self, frequency: Option<u16>) {
        self.tone.set(frequency);
    }

    fn drive_stepper(&mut self, coils: [bool; 4]) {
        for (pin, on) in self.coils.iter_mut().zip(coils) {
            pin.set_level(Level::from(on));
        }
    }

    fn show_leds(&mut self, frame: &[RGB8; LED_COUNT]) {
        if let Some(ref mut leds) = self.leds {
            if leds.write(frame.iter().copied()).is_err() {
                log::debug!("leds: write failed");
            }
        }
    }

    fn encoder_count(&mut self) -> i32 {
        self.encoder.count()
    }

    fn set_encoder_count(&mut self, count: i32) {
        self.encoder.set_count(count);
    }

    fn button_pressed(&mut self) -> bool {
        self.button.is_low()
    }
}
