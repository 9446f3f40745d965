//! State shared between the control core and the network core.
//!
//! Field ownership (single writer unless noted):
//! - `actuator_engaged`, `dimmer_level`, `servo_angle`: local UI and remote
//!   commands; both writers go through the same lock, ordered by [`Stamp`]
//! - `sensor_sample`: control core
//! - `connected_clients`, `network_ready`, `assigned_address`: network core

use core::fmt::Write as FmtWrite;
use core::sync::atomic::{AtomicU32, Ordering};
use heapless::String as HString;

use crate::error::Busy;
use crate::lock::{BoundedMutex, Clock};

/// Full scale of the 12-bit analog input.
pub const SAMPLE_MAX: u16 = 4095;

/// Longest dotted-quad address ("255.255.255.255").
pub const ADDRESS_LEN: usize = 15;

/// Lock bound used by the control core. A miss skips that part of the tick.
pub const STATE_WAIT_MS: u64 = 20;

/// Lock bound used while answering a network request. A miss becomes a 503.
pub const REQUEST_STATE_WAIT_MS: u64 = 100;

pub const SERVO_MAX_DEGREES: u8 = 180;

pub type Address = HString<ADDRESS_LEN>;

/// A sensor reading clamped to `[0, SAMPLE_MAX]` at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Sample(u16);

impl Sample {
    pub const fn new(raw: u16) -> Self {
        if raw > SAMPLE_MAX {
            Sample(SAMPLE_MAX)
        } else {
            Sample(raw)
        }
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

/// Format an IPv4 address for `assigned_address`.
pub fn format_address(octets: [u8; 4]) -> Address {
    let mut s = Address::new();
    // 15 chars is always enough for four octets
    let _ = write!(s, "{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
    s
}

/// Issue order of a setpoint write, taken from [`StateStore::stamp`] when the
/// write is issued. A write held back for a retry keeps its stamp. 0 is older
/// than every issued stamp.
pub type Stamp = u32;

/// A value with more than one writer. The write issued last wins, even when
/// an earlier one only gets the lock afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setpoint<T> {
    value: T,
    stamp: Stamp,
}

impl<T: Copy> Setpoint<T> {
    pub const fn new(value: T) -> Self {
        Self { value, stamp: 0 }
    }

    pub fn get(&self) -> T {
        self.value
    }

    /// Stamp of the write that produced the current value.
    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    /// Apply a write issued at `stamp`. Returns false, and changes nothing,
    /// when a later-issued write has already landed.
    pub fn set(&mut self, value: T, stamp: Stamp) -> bool {
        if stamp <= self.stamp {
            return false;
        }
        self.value = value;
        self.stamp = stamp;
        true
    }
}

/// The values both cores see. Plain data, no behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedState {
    pub actuator_engaged: Setpoint<bool>,
    pub sensor_sample: Sample,
    pub connected_clients: u16,
    pub network_ready: bool,
    pub assigned_address: Address,
    /// Dimmer output before gamma correction, 0..=255.
    pub dimmer_level: Setpoint<u8>,
    /// Servo target in degrees; `None` until something positions it.
    pub servo_angle: Setpoint<Option<u8>>,
}

impl SharedState {
    pub const fn new() -> Self {
        Self {
            actuator_engaged: Setpoint::new(false),
            sensor_sample: Sample(0),
            connected_clients: 0,
            network_ready: false,
            assigned_address: HString::new(),
            dimmer_level: Setpoint::new(0),
            servo_angle: Setpoint::new(None),
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-guarded owner of the single [`SharedState`].
///
/// Created once at boot and handed to both context entry points by reference.
pub struct StateStore {
    state: BoundedMutex<SharedState>,
    issued: AtomicU32,
}

impl StateStore {
    pub const fn new() -> Self {
        Self {
            state: BoundedMutex::new(SharedState::new()),
            issued: AtomicU32::new(0),
        }
    }

    /// Order a setpoint write. Lock-free, so a writer that is about to be
    /// held back by a busy store can still take its place in line.
    pub fn stamp(&self) -> Stamp {
        self.issued.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Copy the whole state out under the lock.
    pub fn read<C: Clock + ?Sized>(&self, clock: &C, wait_ms: u64) -> Result<SharedState, Busy> {
        self.state.lock_within(clock, wait_ms, |s| s.clone())
    }

    /// Copy part of the state out under the lock.
    pub fn view<C, R>(
        &self,
        clock: &C,
        wait_ms: u64,
        f: impl FnOnce(&SharedState) -> R,
    ) -> Result<R, Busy>
    where
        C: Clock + ?Sized,
    {
        self.state.lock_within(clock, wait_ms, |s| f(s))
    }

    /// Apply a mutation under the lock. On `Busy` nothing was changed.
    pub fn write<C, R>(
        &self,
        clock: &C,
        wait_ms: u64,
        f: impl FnOnce(&mut SharedState) -> R,
    ) -> Result<R, Busy>
    where
        C: Clock + ?Sized,
    {
        self.state.lock_within(clock, wait_ms, f)
    }

    pub fn set_actuator<C: Clock + ?Sized>(
        &self,
        clock: &C,
        wait_ms: u64,
        engaged: bool,
    ) -> Result<(), Busy> {
        let stamp = self.stamp();
        self.write(clock, wait_ms, |s| {
            s.actuator_engaged.set(engaged, stamp);
        })
    }

    pub fn set_dimmer<C: Clock + ?Sized>(
        &self,
        clock: &C,
        wait_ms: u64,
        level: u8,
    ) -> Result<(), Busy> {
        let stamp = self.stamp();
        self.write(clock, wait_ms, |s| {
            s.dimmer_level.set(level, stamp);
        })
    }

    pub fn set_servo<C: Clock + ?Sized>(
        &self,
        clock: &C,
        wait_ms: u64,
        angle: u8,
    ) -> Result<(), Busy> {
        let stamp = self.stamp();
        self.write(clock, wait_ms, |s| {
            s.servo_angle.set(Some(angle), stamp);
        })
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_clamps_to_full_scale() {
        assert_eq!(Sample::new(0).get(), 0);
        assert_eq!(Sample::new(SAMPLE_MAX).get(), SAMPLE_MAX);
        assert_eq!(Sample::new(u16::MAX).get(), SAMPLE_MAX);
    }

    #[test]
    fn earlier_issued_write_never_overrides_a_later_one() {
        let mut relay = Setpoint::new(false);
        assert!(relay.set(true, 2));
        assert!(!relay.set(false, 1));
        assert!(relay.get());
        // Same value again still counts as a newer write
        assert!(relay.set(true, 3));
        assert_eq!(relay.stamp(), 3);
    }

    #[test]
    fn stamps_are_issued_in_order() {
        let store = StateStore::new();
        let first = store.stamp();
        assert!(store.stamp() > first);
        assert!(first > 0);
    }

    #[test]
    fn widest_address_fits() {
        assert_eq!(format_address([255, 255, 255, 255]).as_str(), "255.255.255.255");
        assert_eq!(format_address([10, 0, 0, 7]).as_str(), "10.0.0.7");
    }
}
