use core::sync::atomic::{AtomicU8, Ordering};

use crate::lock::Clock;

/// How long the network core waits for the control core to park.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 500;

/// Upper bound on how long the control core stays parked. The writer always
/// signals `Done`, even on failure; this only guards against a wedged writer.
pub const PARK_LIMIT_MS: u64 = 5_000;

/// Flash write coordination state machine.
///
/// Protocol for safe dual-core flash writes:
/// 1. Network core sets state to `Requested`
/// 2. Control core sees `Requested` at the top of its tick (no locks held),
///    sets state to `Safe` and parks
/// 3. Network core sees `Safe`, performs the flash write, sets state to `Done`
/// 4. Control core sees `Done`, sets state to `Idle` and resumes
///
/// Flash writes stall the cache on both cores, so the control core must not be
/// inside a critical section when one starts.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashState {
    Idle = 0,
    Requested = 1,
    Safe = 2,
    Done = 3,
}

impl From<u8> for FlashState {
    fn from(v: u8) -> Self {
        match v {
            1 => FlashState::Requested,
            2 => FlashState::Safe,
            3 => FlashState::Done,
            _ => FlashState::Idle,
        }
    }
}

pub struct FlashGate {
    state: AtomicU8,
}

impl FlashGate {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(FlashState::Idle as u8),
        }
    }

    #[inline]
    pub fn state(&self) -> FlashState {
        FlashState::from(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: FlashState, to: FlashState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Writer side: request the control core to park and wait for it.
    /// Returns false (and resets to `Idle`) if it does not park in time.
    pub fn acquire<C: Clock + ?Sized>(&self, clock: &C, timeout_ms: u64) -> bool {
        let start = clock.now_ms();
        // The previous write stays `Done` until the control core resumes.
        while !self.transition(FlashState::Idle, FlashState::Requested) {
            if clock.now_ms().saturating_sub(start) > timeout_ms {
                log::error!("flash: write already in progress");
                return false;
            }
            clock.relax();
        }
        loop {
            match self.state() {
                FlashState::Safe => return true,
                FlashState::Requested => {}
                other => {
                    log::warn!("flash: unexpected state {:?} while waiting for Safe", other);
                    return false;
                }
            }
            if clock.now_ms().saturating_sub(start) > timeout_ms {
                log::error!("flash: timeout waiting for control core to park");
                // Only reset if the control core still has not answered
                if !self.transition(FlashState::Requested, FlashState::Idle) {
                    return self.state() == FlashState::Safe;
                }
                return false;
            }
            clock.relax();
        }
    }

    /// Writer side: the flash operation is finished (successfully or not).
    pub fn release(&self) {
        self.state.store(FlashState::Done as u8, Ordering::Release);
    }

    /// Run `write` with the control core parked.
    pub fn with_parked<C, R>(&self, clock: &C, write: impl FnOnce() -> R) -> Option<R>
    where
        C: Clock + ?Sized,
    {
        if !self.acquire(clock, HANDSHAKE_TIMEOUT_MS) {
            return None;
        }
        let r = write();
        self.release();
        Some(r)
    }

    /// Control side: call at the top of every tick, before taking any lock.
    /// Returns true if the core was parked for a write.
    pub fn park_if_requested<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        if !self.transition(FlashState::Requested, FlashState::Safe) {
            return false;
        }
        let start = clock.now_ms();
        while self.state() != FlashState::Done {
            if clock.now_ms().saturating_sub(start) > PARK_LIMIT_MS {
                log::error!("flash: writer never finished, resuming");
                break;
            }
            clock.relax();
        }
        self.state.store(FlashState::Idle as u8, Ordering::Release);
        log::debug!("flash: write complete, resuming");
        true
    }
}

impl Default for FlashGate {
    fn default() -> Self {
        Self::new()
    }
}
