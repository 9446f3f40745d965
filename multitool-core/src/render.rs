//! Screen model and its layout on the 128x64 display.
//!
//! The UI produces a [`Screen`] value; the control core draws it through the
//! bus guard only when it differs from the last frame pushed.

use core::fmt::{self, Write as FmtWrite};
use heapless::{String as HString, Vec};

use crate::bus::{device_name, MAX_FOUND};
use crate::shared::{Address, SAMPLE_MAX};
use crate::ui::{AppKind, APPS};

pub const WIDTH: u32 = 128;
pub const HEIGHT: u32 = 64;
const LINE: i32 = 12;
const BODY_TOP: i32 = 16;
const MENU_ROWS: usize = 4;

/// The display collaborator: only ever used inside `BusGuard::with_bus`.
pub trait Canvas {
    fn clear(&mut self);
    /// Draw text with its top-left corner at (x, y).
    fn text(&mut self, x: i32, y: i32, text: &str);
    fn frame(&mut self, x: i32, y: i32, width: u32, height: u32);
    fn fill(&mut self, x: i32, y: i32, width: u32, height: u32);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    Menu { selection: usize },
    Relay { engaged: bool },
    Scanner { found: Vec<u8, MAX_FOUND>, scanning: bool },
    Servo { angle: u8 },
    Buzzer { frequency: u16 },
    Stepper { rate: i8, position: i32 },
    LedRing { brightness: u8 },
    Sensor { sample: u16 },
    Dimmer { level: u8 },
    Network { ready: bool, address: Address, clients: u16 },
    Unavailable { title: &'static str },
}

pub fn draw<C: Canvas + ?Sized>(screen: &Screen, canvas: &mut C) {
    canvas.clear();
    match screen {
        Screen::Menu { selection } => draw_menu(canvas, *selection),
        Screen::Relay { engaged } => {
            header(canvas, AppKind::Relay.title());
            line(canvas, 0, format_args!("State: {}", if *engaged { "ON" } else { "OFF" }));
            line(canvas, 2, format_args!("CW=on  CCW=off"));
        }
        Screen::Scanner { found, scanning } => {
            header(canvas, AppKind::Scanner.title());
            if *scanning && found.is_empty() {
                line(canvas, 0, format_args!("Scanning..."));
                return;
            }
            line(canvas, 0, format_args!("Found: {}", found.len()));
            for (row, addr) in found.iter().take(3).enumerate() {
                line(canvas, row + 1, format_args!("0x{:02X} {}", addr, device_name(*addr)));
            }
        }
        Screen::Servo { angle } => {
            header(canvas, AppKind::Servo.title());
            line(canvas, 0, format_args!("Angle: {} deg", angle));
            bar(canvas, 2, *angle as u32, 180);
        }
        Screen::Buzzer { frequency } => {
            header(canvas, AppKind::Buzzer.title());
            line(canvas, 0, format_args!("Tone: {} Hz", frequency));
        }
        Screen::Stepper { rate, position } => {
            header(canvas, AppKind::Stepper.title());
            line(canvas, 0, format_args!("Rate: {:+}", rate));
            line(canvas, 1, format_args!("Steps: {}", position));
        }
        Screen::LedRing { brightness } => {
            header(canvas, AppKind::LedRing.title());
            line(canvas, 0, format_args!("Brightness: {}", brightness));
            bar(canvas, 2, *brightness as u32, 255);
        }
        Screen::Sensor { sample } => {
            header(canvas, AppKind::Sensor.title());
            line(canvas, 0, format_args!("Raw: {}", sample));
            line(canvas, 1, format_args!("{}%", *sample as u32 * 100 / SAMPLE_MAX as u32));
            bar(canvas, 3, *sample as u32, SAMPLE_MAX as u32);
        }
        Screen::Dimmer { level } => {
            header(canvas, AppKind::Dimmer.title());
            line(canvas, 0, format_args!("Level: {}%", *level as u32 * 100 / 255));
            bar(canvas, 2, *level as u32, 255);
        }
        Screen::Network { ready, address, clients } => {
            header(canvas, AppKind::Network.title());
            if *ready {
                line(canvas, 0, format_args!("IP: {}", address));
                line(canvas, 1, format_args!("Clients: {}", clients));
            } else {
                line(canvas, 0, format_args!("Connecting..."));
            }
        }
        Screen::Unavailable { title } => {
            header(canvas, title);
            line(canvas, 0, format_args!("Feature"));
            line(canvas, 1, format_args!("unavailable"));
        }
    }
}

fn draw_menu<C: Canvas + ?Sized>(canvas: &mut C, selection: usize) {
    header(canvas, "Multitool");
    let first = selection.saturating_sub(MENU_ROWS - 1);
    for (row, app) in APPS.iter().enumerate().skip(first).take(MENU_ROWS) {
        let marker = if row == selection { '>' } else { ' ' };
        line(canvas, row - first, format_args!("{}{}", marker, app.title()));
    }
    // Scroll position
    let track = HEIGHT - BODY_TOP as u32;
    let thumb = track / APPS.len() as u32;
    canvas.frame(WIDTH as i32 - 3, BODY_TOP, 3, track);
    canvas.fill(
        WIDTH as i32 - 3,
        BODY_TOP + (thumb * selection as u32) as i32,
        3,
        thumb.max(2),
    );
}

fn header<C: Canvas + ?Sized>(canvas: &mut C, title: &str) {
    canvas.text(0, 0, title);
    canvas.fill(0, 12, WIDTH, 1);
}

fn line<C: Canvas + ?Sized>(canvas: &mut C, row: usize, args: fmt::Arguments<'_>) {
    let mut text: HString<32> = HString::new();
    // Overlong lines are clipped by the display anyway
    let _ = text.write_fmt(args);
    canvas.text(0, BODY_TOP + row as i32 * LINE, &text);
}

fn bar<C: Canvas + ?Sized>(canvas: &mut C, row: usize, value: u32, max: u32) {
    let y = BODY_TOP + row as i32 * LINE;
    canvas.frame(0, y, WIDTH - 4, 8);
    let inner = WIDTH - 8;
    let filled = if max == 0 { 0 } else { inner * value.min(max) / max };
    if filled > 0 {
        canvas.fill(2, y + 2, filled, 4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::vec::Vec as StdVec;

    #[derive(Default)]
    struct TextLog {
        lines: StdVec<String>,
        clears: usize,
    }

    impl Canvas for TextLog {
        fn clear(&mut self) {
            self.clears += 1;
            self.lines.clear();
        }
        fn text(&mut self, _x: i32, _y: i32, text: &str) {
            self.lines.push(String::from(text));
        }
        fn frame(&mut self, _: i32, _: i32, _: u32, _: u32) {}
        fn fill(&mut self, _: i32, _: i32, _: u32, _: u32) {}
    }

    #[test]
    fn menu_marks_selection_and_scrolls() {
        let mut log = TextLog::default();
        draw(&Screen::Menu { selection: 0 }, &mut log);
        assert_eq!(log.lines[1], ">Relay");

        draw(&Screen::Menu { selection: APPS.len() - 1 }, &mut log);
        assert_eq!(log.clears, 2);
        assert_eq!(log.lines.last().map(String::as_str), Some(">WiFi Info"));
        assert_eq!(log.lines.len(), 1 + MENU_ROWS);
    }

    #[test]
    fn placeholder_reads_feature_unavailable() {
        let mut log = TextLog::default();
        draw(&Screen::Unavailable { title: "Ultrasonic" }, &mut log);
        assert_eq!(log.lines, ["Ultrasonic", "Feature", "unavailable"]);
    }
}
