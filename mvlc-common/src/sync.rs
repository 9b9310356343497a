// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Mutex- and condition-variable-backed value wrappers.
//!
//! [`Protected`] pairs a value with a mutex. [`WaitableProtected`] adds a
//! condition variable that is notified whenever a write access is dropped,
//! so other threads can wait for the value to change. Worker state machines
//! expose their state through these wrappers.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// A value guarded by a mutex.
#[derive(Debug, Default)]
pub struct Protected<T> {
    value: Mutex<T>,
}

impl<T> Protected<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Lock and access the value. Poisoning is ignored: a panicking writer
    /// leaves the value in whatever state it reached, which the state
    /// machines here tolerate.
    pub fn access(&self) -> MutexGuard<'_, T> {
        match self.value.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Clone> Protected<T> {
    pub fn copy(&self) -> T {
        self.access().clone()
    }
}

/// A value guarded by a mutex plus a condition variable, allowing callers to
/// wait for modifications.
#[derive(Debug, Default)]
pub struct WaitableProtected<T> {
    value: Mutex<T>,
    cond: Condvar,
}

impl<T> WaitableProtected<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        match self.value.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Modify the value and wake up all waiters.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        {
            let mut guard = self.lock();
            f(&mut guard);
        }
        self.cond.notify_all();
    }

    /// Wait until `pred` holds for the value, without bound.
    pub fn wait(&self, mut pred: impl FnMut(&T) -> bool) -> MutexGuard<'_, T> {
        let guard = self.lock();
        match self.cond.wait_while(guard, |v| !pred(v)) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Wait until `pred` holds for the value or `timeout` elapses. Returns
    /// true if the predicate held when the wait finished.
    pub fn wait_for(&self, timeout: Duration, mut pred: impl FnMut(&T) -> bool) -> bool {
        let guard = self.lock();
        match self.cond.wait_timeout_while(guard, timeout, |v| !pred(v)) {
            Ok((guard, _)) => pred(&guard),
            Err(poisoned) => {
                let (guard, _) = poisoned.into_inner();
                pred(&guard)
            }
        }
    }
}

impl<T: Clone> WaitableProtected<T> {
    pub fn copy(&self) -> T {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn protected_access_roundtrip() {
        let p = Protected::new(41);
        *p.access() += 1;
        assert_eq!(p.copy(), 42);
    }

    #[test]
    fn waitable_wakes_waiter_on_update() {
        let wp = Arc::new(WaitableProtected::new(0u32));
        let wp2 = Arc::clone(&wp);

        let waiter = thread::spawn(move || {
            let guard = wp2.wait(|v| *v == 7);
            *guard
        });

        wp.update(|v| *v = 7);
        assert_eq!(waiter.join().unwrap(), 7);
    }

    #[test]
    fn waitable_wait_for_times_out() {
        let wp = WaitableProtected::new(0u32);
        assert!(!wp.wait_for(Duration::from_millis(10), |v| *v == 1));
        wp.update(|v| *v = 1);
        assert!(wp.wait_for(Duration::from_millis(10), |v| *v == 1));
    }
}
