//! Bounded response waits.
//!
//! The reader thread must never block, so correlated responses are handed
//! to waiting callers through `embassy-sync` primitives (`Signal::signal`
//! and `Channel::try_send` never block). The caller side races the wait
//! against an `async-io-mini` reactor timer.
//!
//! ```text
//!  reader thread                     caller task
//!  ─────────────                     ───────────
//!  dispatch(frame) ──signal()──▶  with_timeout(2 s, waiter.wait())
//!                                    │
//!                                    ├─ Some(payload)  response arrived
//!                                    └─ None           timed out
//! ```

use core::future::Future;
use core::time::Duration;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

/// Run `fut` to completion or give up after `timeout`.
pub async fn with_timeout<F: Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    futures_lite::future::or(async { Some(fut.await) }, async {
        async_io_mini::Timer::after(timeout).await;
        None
    })
    .await
}

/// Drive a future on the calling thread. The reactor behind
/// `async_io_mini::Timer` runs on its own thread.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    futures_lite::future::block_on(fut)
}

/// A single-slot rendezvous for one response kind.
///
/// A waiter is armed (cleared) before the request is sent so a stale value
/// from an earlier exchange cannot satisfy the new wait. The latest signal
/// wins if the device answers twice.
pub struct Waiter<T: Send> {
    signal: Signal<CriticalSectionRawMutex, T>,
}

impl<T: Send> Default for Waiter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Waiter<T> {
    pub const fn new() -> Self {
        Self {
            signal: Signal::new(),
        }
    }

    /// Forget any value left from an earlier exchange.
    pub fn arm(&self) {
        self.signal.reset();
    }

    /// Hand a response to the waiting caller. Never blocks.
    pub fn signal(&self, value: T) {
        self.signal.signal(value);
    }

    /// Wait up to `timeout` for the response.
    pub async fn wait(&self, timeout: Duration) -> Option<T> {
        with_timeout(timeout, self.signal.wait()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn value_signalled_before_wait_is_delivered() {
        let w = Waiter::new();
        w.signal(7u8);
        assert_eq!(block_on(w.wait(Duration::from_millis(50))), Some(7));
    }

    #[test]
    fn arm_discards_stale_value() {
        let w = Waiter::new();
        w.signal(1u8);
        w.arm();
        assert_eq!(block_on(w.wait(Duration::from_millis(20))), None);
    }

    #[test]
    fn wait_times_out() {
        let w: Waiter<u8> = Waiter::new();
        let start = Instant::now();
        assert_eq!(block_on(w.wait(Duration::from_millis(30))), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn signal_from_another_thread_wakes_waiter() {
        let w = Arc::new(Waiter::new());
        let w2 = w.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            w2.signal(vec![1u8, 2, 3]);
        });
        assert_eq!(
            block_on(w.wait(Duration::from_secs(2))),
            Some(vec![1, 2, 3])
        );
        t.join().unwrap();
    }
}
