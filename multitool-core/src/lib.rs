//! Multitool core - chip-independent logic for the dual-core bench multitool.
//!
//! Architecture:
//! - Control context (core 0): samples the sensor, reconciles outputs with the
//!   shared state, runs the menu/app state machine and renders the display.
//! - Network context (core 1): link bring-up, HTTP API, MQTT, firmware update
//!   and periodic metrics.
//!
//! The two contexts only meet in [`shared::StateStore`] and [`bus::BusGuard`].
//! Both are bounded-wait locks: an acquisition that cannot complete within its
//! bound reports [`error::Busy`] and leaves the guarded value untouched. The two
//! locks are never held at the same time.

#![cfg_attr(not(test), no_std)]

pub mod api;
pub mod board;
pub mod bus;
pub mod control;
pub mod crc;
pub mod error;
pub mod flash;
pub mod http;
pub mod input;
pub mod json;
pub mod link;
pub mod lock;
pub mod mqtt;
pub mod network;
pub mod ota;
pub mod portal;
pub mod render;
pub mod settings;
pub mod shared;
pub mod ui;

pub use bus::BusGuard;
pub use lock::{BoundedMutex, Clock};
pub use shared::{SharedState, StateStore};
