// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The lock guarding all trap metadata.
//!
//! This is a plain spinlock rather than an OS mutex: the fault path has to be able to *attempt*
//! the lock from inside a signal handler, and only atomics are safe to touch there.

use core::hint;
use core::sync::atomic::{AtomicBool, Ordering};

pub(crate) type Mutex<T> = lock_api::Mutex<MetadataLock, T>;
pub(crate) type MutexGuard<'a, T> = lock_api::MutexGuard<'a, MetadataLock, T>;

/// How often the fault path retries the lock before giving up.
pub(crate) const FAULT_PATH_LOCK_ATTEMPTS: u32 = 8;

pub struct MetadataLock {
    locked: AtomicBool,
}

// Safety: `locked` is only ever set by a successful acquire-CAS and cleared by the holder, so at
// most one guard exists at a time.
unsafe impl lock_api::RawMutex for MetadataLock {
    type GuardMarker = lock_api::GuardSend;

    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    fn lock(&self) {
        let mut boff = Backoff::new();
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                boff.spin();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Attempts to take `mutex` at most `attempts` times, backing off between attempts.
///
/// Never blocks indefinitely, which makes it usable from a signal handler that may have
/// interrupted the current lock holder on the same thread.
pub(crate) fn try_lock_bounded<T>(mutex: &Mutex<T>, attempts: u32) -> Option<MutexGuard<'_, T>> {
    let mut boff = Backoff::new();
    for _ in 0..attempts {
        if let Some(guard) = mutex.try_lock() {
            return Some(guard);
        }
        boff.spin();
    }
    None
}

/// An exponential backoff for spin loops.
///
/// Each call to [`Backoff::spin`] issues `2^exp` spin loop hints, doubling up to
/// `2^MAX_EXPONENT`.
#[derive(Debug, Copy, Clone)]
struct Backoff {
    exp: u8,
}

impl Backoff {
    const MAX_EXPONENT: u8 = 8;

    const fn new() -> Self {
        Self { exp: 0 }
    }

    #[inline(always)]
    fn spin(&mut self) {
        let spins = 1_u32 << self.exp;

        for _ in 0..spins {
            hint::spin_loop();
        }

        if self.exp < Self::MAX_EXPONENT {
            self.exp += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn try_lock() {
        let mutex = Mutex::new(42);

        let a = mutex.try_lock();
        assert_eq!(a.as_deref().copied(), Some(42));

        assert!(mutex.try_lock().is_none());

        drop(a);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn bounded_gives_up() {
        let mutex = Mutex::new(());
        let _held = mutex.lock();

        assert!(try_lock_bounded(&mutex, FAULT_PATH_LOCK_ATTEMPTS).is_none());
        assert!(try_lock_bounded(&mutex, 0).is_none());
    }

    #[test]
    fn bounded_succeeds_when_free() {
        let mutex = Mutex::new(7);
        let guard = try_lock_bounded(&mutex, 1).unwrap();
        assert_eq!(*guard, 7);
    }

    #[test]
    fn multi_threaded() {
        let lock = Arc::new(Mutex::new(0_usize));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*lock.lock(), 4000);
    }
}
