//! Named mutual exclusion for multi-frame workflows.
//!
//! A workflow such as "clear N mapping slots, then write M entries" must not
//! interleave with frames from unrelated senders, but the transport itself
//! keeps running for everyone else. The lock is keyed by a profile tag: the
//! holder may send freely and re-enter without blocking, any other tag waits.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::debug;

/// Tag-keyed lock. `None` means unheld.
pub struct ProfileLock {
    holder: Mutex<Option<String>>,
    released: Condvar,
}

impl Default for ProfileLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileLock {
    pub fn new() -> Self {
        Self {
            holder: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn blocks(holder: Option<&str>, profile: &str) -> bool {
        holder.is_some_and(|h| h != profile)
    }

    /// Block until the lock is unheld or held by `profile`.
    pub fn wait_for(&self, profile: &str) {
        let guard = self.lock();
        let _guard = self
            .released
            .wait_while(guard, |h| Self::blocks(h.as_deref(), profile))
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// As [`wait_for`](Self::wait_for), giving up after `timeout`.
    /// Returns whether the caller may proceed.
    pub fn wait_for_timeout(&self, profile: &str, timeout: Duration) -> bool {
        let guard = self.lock();
        let (_guard, result) = self
            .released
            .wait_timeout_while(guard, timeout, |h| Self::blocks(h.as_deref(), profile))
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out()
    }

    /// Assign the lock to `profile` (or release it with `None` or an empty
    /// tag) and wake every waiter.
    pub fn set(&self, profile: Option<&str>) {
        let profile = profile.filter(|p| !p.is_empty());
        let mut holder = self.lock();
        if holder.as_deref() != profile {
            debug!("profile lock: {:?} -> {:?}", holder.as_deref(), profile);
        }
        *holder = profile.map(str::to_owned);
        drop(holder);
        self.released.notify_all();
    }

    pub fn release(&self) {
        self.set(None);
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<String> {
        self.lock().clone()
    }

    /// Wait for the lock and take it in one step. Released when the guard
    /// drops, unless it was already held by `profile` on entry.
    pub fn acquire(&self, profile: &str) -> ProfileGuard<'_> {
        let guard = self.lock();
        let mut holder = self
            .released
            .wait_while(guard, |h| Self::blocks(h.as_deref(), profile))
            .unwrap_or_else(PoisonError::into_inner);
        let reentered = holder.is_some();
        *holder = Some(profile.to_owned());
        ProfileGuard {
            lock: self,
            reentered,
            acquired_at: Instant::now(),
        }
    }
}

/// Holds a [`ProfileLock`] for the lifetime of a workflow.
pub struct ProfileGuard<'a> {
    lock: &'a ProfileLock,
    reentered: bool,
    acquired_at: Instant,
}

impl ProfileGuard<'_> {
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for ProfileGuard<'_> {
    fn drop(&mut self) {
        if !self.reentered {
            self.lock.release();
        }
    }
}
