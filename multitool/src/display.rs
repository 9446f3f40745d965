//! SSD1306 128x64 OLED and the rest of the shared I2C bus.
//!
//! Frames are drawn with embedded-graphics into a local page-ordered buffer and
//! pushed to the panel in one pass on `commit`. Every method runs inside the
//! bus guard, so the I2C peripheral is never touched by two cores at once.

use core::convert::Infallible;

use embedded_graphics::mono_font::ascii::FONT_6X10;
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};
use embedded_graphics::text::{Baseline, Text};
use esp_hal::i2c::master::{Config as I2cConfig, ConfigError, I2c};
use esp_hal::peripherals::{GPIO21, GPIO22, I2C0};
use esp_hal::time::Rate;
use esp_hal::Blocking;
use multitool_core::bus::PeripheralBus;
use multitool_core::error::DisplayError;
use multitool_core::render::{Canvas, HEIGHT, WIDTH};

pub const DISPLAY_ADDRESS: u8 = 0x3C;

const BUF_LEN: usize = (WIDTH * HEIGHT / 8) as usize;
const CHUNK: usize = 16;

// Control bytes
const COMMAND: u8 = 0x00;
const DATA: u8 = 0x40;

const INIT: [u8; 25] = [
    0xAE, // display off
    0xD5, 0x80, // clock divide
    0xA8, 0x3F, // multiplex 64
    0xD3, 0x00, // no offset
    0x40, // start line 0
    0x8D, 0x14, // charge pump on
    0x20, 0x00, // horizontal addressing
    0xA1, // segment remap
    0xC8, // COM scan descending
    0xDA, 0x12, // COM pins
    0x81, 0xCF, // contrast
    0xD9, 0xF1, // precharge
    0xDB, 0x40, // VCOM detect
    0xA4, // resume from RAM
    0xA6, // normal polarity
    0xAF, // display on
];

/// One monochrome frame in SSD1306 page order.
pub struct Frame {
    pixels: [u8; BUF_LEN],
}

impl Frame {
    const fn new() -> Self {
        Self { pixels: [0; BUF_LEN] }
    }

    fn style() -> MonoTextStyle<'static, BinaryColor> {
        MonoTextStyle::new(&FONT_6X10, BinaryColor::On)
    }
}

impl OriginDimensions for Frame {
    fn size(&self) -> Size {
        Size::new(WIDTH, HEIGHT)
    }
}

impl DrawTarget for Frame {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            let (Ok(x), Ok(y)) = (u32::try_from(point.x), u32::try_from(point.y)) else {
                continue;
            };
            if x >= WIDTH || y >= HEIGHT {
                continue;
            }
            let index = (x + (y / 8) * WIDTH) as usize;
            let bit = 1 << (y % 8);
            if color.is_on() {
                self.pixels[index] |= bit;
            } else {
                self.pixels[index] &= !bit;
            }
        }
        Ok(())
    }
}

impl Canvas for Frame {
    fn clear(&mut self) {
        self.pixels.fill(0);
    }

    fn text(&mut self, x: i32, y: i32, text: &str) {
        let _ =
            Text::with_baseline(text, Point::new(x, y), Self::style(), Baseline::Top).draw(self);
    }

    fn frame(&mut self, x: i32, y: i32, width: u32, height: u32) {
        let _ = Rectangle::new(Point::new(x, y), Size::new(width, height))
            .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 1))
            .draw(self);
    }

    fn fill(&mut self, x: i32, y: i32, width: u32, height: u32) {
        let _ = Rectangle::new(Point::new(x, y), Size::new(width, height))
            .into_styled(PrimitiveStyle::with_fill(BinaryColor::On))
            .draw(self);
    }
}

/// The shared I2C bus with the display on it.
pub struct OledBus {
    i2c: I2c<'static, Blocking>,
    /// `None` when the panel did not answer at boot.
    frame: Option<Frame>,
}

impl OledBus {
    /// Bring up I2C0 at 400 kHz and initialise the panel. A panel that does
    /// not answer leaves the bus usable for scanning.
    pub fn new(
        i2c: I2C0<'static>,
        sda: GPIO21<'static>,
        scl: GPIO22<'static>,
    ) -> Result<Self, ConfigError> {
        let i2c = I2c::new(i2c, I2cConfig::default().with_frequency(Rate::from_khz(400)))?
            .with_sda(sda)
            .with_scl(scl);
        let mut bus = Self { i2c, frame: None };
        match bus.command(&INIT) {
            Ok(()) => {
                log::info!("display: SSD1306 ready at 0x{:02X}", DISPLAY_ADDRESS);
                bus.frame = Some(Frame::new());
            }
            Err(e) => log::error!("display: init failed ({}), running headless", e),
        }
        Ok(bus)
    }

    fn command(&mut self, bytes: &[u8]) -> Result<(), DisplayError> {
        for &b in bytes {
            self.i2c
                .write(DISPLAY_ADDRESS, &[COMMAND, b])
                .map_err(|_| DisplayError::Nack)?;
        }
        Ok(())
    }
}

impl PeripheralBus for OledBus {
    type Canvas = Frame;

    fn canvas(&mut self) -> Option<&mut Frame> {
        self.frame.as_mut()
    }

    fn commit(&mut self) -> Result<(), DisplayError> {
        let Some(ref frame) = self.frame else {
            return Ok(());
        };
        // Column 0..127, page 0..7; the write pointer then wraps by itself.
        let window = [0x21, 0, (WIDTH - 1) as u8, 0x22, 0, (HEIGHT / 8 - 1) as u8];
        for &b in &window {
            self.i2c
                .write(DISPLAY_ADDRESS, &[COMMAND, b])
                .map_err(|_| DisplayError::Nack)?;
        }
        let mut packet = [0u8; CHUNK + 1];
        packet[0] = DATA;
        for chunk in frame.pixels.chunks(CHUNK) {
            packet[1..=chunk.len()].copy_from_slice(chunk);
            self.i2c
                .write(DISPLAY_ADDRESS, &packet[..=chunk.len()])
                .map_err(|_| DisplayError::Bus)?;
        }
        Ok(())
    }

    fn probe(&mut self, address: u8) -> bool {
        self.i2c.write(address, &[]).is_ok()
    }
}
