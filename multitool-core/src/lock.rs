//! Bounded-wait locking.
//!
//! Every lock in the system is acquired through [`BoundedMutex::lock_within`].
//! There is no method that waits forever. A core stuck on a lock
//! stops feeding the watchdog and the device resets.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;

use crate::error::Busy;

/// Monotonic millisecond time source.
pub trait Clock {
    fn now_ms(&self) -> u64;

    /// Called between lock attempts while spinning.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn relax(&self) {
        (**self).relax()
    }
}

/// A mutex whose only acquisition path gives up after a fixed wait.
pub struct BoundedMutex<T> {
    inner: Mutex<CriticalSectionRawMutex, T>,
}

impl<T> BoundedMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Run `f` with exclusive access, waiting at most `wait_ms` for the lock.
    ///
    /// On timeout `f` is never called, so the guarded value is unchanged.
    /// The guard is released before this returns; keep `f` short and free of I/O
    /// unless the lock exists to serialize that I/O.
    pub fn lock_within<C, R>(
        &self,
        clock: &C,
        wait_ms: u64,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, Busy>
    where
        C: Clock + ?Sized,
    {
        let deadline = clock.now_ms().saturating_add(wait_ms);
        loop {
            if let Ok(mut guard) = self.inner.try_lock() {
                return Ok(f(&mut guard));
            }
            if clock.now_ms() >= deadline {
                return Err(Busy);
            }
            clock.relax();
        }
    }

    /// Exclusive access without locking, for setup before the value is shared.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
