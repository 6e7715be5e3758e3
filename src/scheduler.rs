//! Outbound message scheduler.
//!
//! The only path to the physical port. Any thread may enqueue; exactly one
//! writer thread drains. Messages leave in priority order, FIFO within a
//! priority, and consecutive writes are spaced by the device-class cooldown
//! so the firmware's receive buffer can drain.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Producers                             │
//! │                                                              │
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌──────────┐   │
//! │  │ Poll timer│  │ UI action │  │ EFS calls │  │ Handshake│   │
//! │  │ (Normal)  │  │ (Normal)  │  │(Immediate)│  │(send_asap│   │
//! │  └─────┬─────┘  └─────┬─────┘  └─────┬─────┘  └─────┬────┘   │
//! │        ▼              ▼              ▼              ▼        │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │   tiers: Immediate ▸ … ▸ Normal(0) ▸ … ▸ Low(-10)      │  │
//! │  └───────────────────────┬────────────────────────────────┘  │
//! │                          ▼                                   │
//! │           drain_and_send_one (writer thread, cooldown)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::apt::transport::PortWriter;
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════
//  Message types
// ═══════════════════════════════════════════════════════════════

/// Transmit priority. Higher values leave first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Handshakes and multi-frame workflows.
    pub const IMMEDIATE: Self = Self(i32::MAX);
    /// Default for everything else.
    pub const NORMAL: Self = Self(0);
    /// Background polling that may be delayed.
    pub const LOW: Self = Self(-10);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// One queued wire message.
#[derive(Debug, Clone)]
struct PendingMessage {
    bytes: Vec<u8>,
    priority: Priority,
    order: u64,
}

// ═══════════════════════════════════════════════════════════════
//  Scheduler
// ═══════════════════════════════════════════════════════════════

struct QueueState {
    tiers: BTreeMap<Priority, VecDeque<PendingMessage>>,
    next_order: u64,
    cooldown: Duration,
    last_write: Option<Instant>,
    interrupted: bool,
    sent: u64,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.tiers.values().map(VecDeque::len).sum()
    }

    fn pop_next(&mut self) -> Option<PendingMessage> {
        self.tiers
            .iter_mut()
            .rev()
            .find_map(|(_, queue)| queue.pop_front())
    }
}

/// Multiple-producer, single-consumer priority queue with write pacing.
pub struct OutboundScheduler {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl OutboundScheduler {
    pub fn new(cooldown: Duration) -> Self {
        let mut tiers = BTreeMap::new();
        tiers.insert(Priority::NORMAL, VecDeque::new());
        Self {
            state: Mutex::new(QueueState {
                tiers,
                next_order: 0,
                cooldown,
                last_write: None,
                interrupted: false,
                sent: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without blocking.
    pub fn send(&self, bytes: Vec<u8>, priority: Priority) {
        let mut state = self.lock();
        let order = state.next_order;
        state.next_order += 1;
        trace!(
            "scheduler: queued #{} ({} bytes) at priority {}",
            order,
            bytes.len(),
            priority.0
        );
        state
            .tiers
            .entry(priority)
            .or_default()
            .push_back(PendingMessage {
                bytes,
                priority,
                order,
            });
        drop(state);
        self.ready.notify_one();
    }

    /// Enqueue ahead of everything not already Immediate.
    pub fn send_asap(&self, bytes: Vec<u8>) {
        self.send(bytes, Priority::IMMEDIATE);
    }

    /// Wait up to `timeout` for a message, honour the cooldown, write it.
    ///
    /// Returns `Ok(false)` when nothing was sent (idle, or interrupted).
    /// A write error is returned as-is; the message is consumed and not
    /// retried.
    pub fn drain_and_send_one(&self, port: &mut dyn PortWriter, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.interrupted {
                return Ok(false);
            }
            if state.pending() > 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        // Sleep out the cooldown without holding the queue, so an Immediate
        // message arriving meanwhile still goes first.
        let ready_at = state.last_write.map(|t| t + state.cooldown);
        drop(state);
        if let Some(at) = ready_at {
            let now = Instant::now();
            if at > now {
                std::thread::sleep(at - now);
            }
        }

        let message = {
            let mut state = self.lock();
            if state.interrupted {
                return Ok(false);
            }
            match state.pop_next() {
                Some(m) => m,
                None => return Ok(false),
            }
        };

        trace!(
            "scheduler: writing #{} ({} bytes, priority {})",
            message.order,
            message.bytes.len(),
            message.priority.0
        );
        let result = port.write_all(&message.bytes).and_then(|()| port.flush());

        let mut state = self.lock();
        state.last_write = Some(Instant::now());
        match result {
            Ok(()) => {
                state.sent += 1;
                Ok(true)
            }
            Err(e) => {
                warn!("scheduler: write of #{} failed: {}", message.order, e);
                Err(e)
            }
        }
    }

    /// Drop empty tiers other than Normal. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut state = self.lock();
        let before = state.tiers.len();
        state
            .tiers
            .retain(|priority, queue| *priority == Priority::NORMAL || !queue.is_empty());
        let removed = before - state.tiers.len();
        if removed > 0 {
            debug!("scheduler: pruned {} empty priority tiers", removed);
        }
        removed
    }

    /// Discard everything queued. Returns how many messages were dropped.
    pub fn drop_scheduled(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.pending();
        for queue in state.tiers.values_mut() {
            queue.clear();
        }
        if dropped > 0 {
            debug!("scheduler: dropped {} scheduled messages", dropped);
        }
        dropped
    }

    /// Wake the writer and make every drain return `Ok(false)` until
    /// [`resume`](Self::resume).
    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.ready.notify_all();
    }

    /// Re-arm after a teardown, with the pacing of the new device.
    pub fn resume(&self, cooldown: Duration) {
        let mut state = self.lock();
        state.interrupted = false;
        state.cooldown = cooldown;
        state.last_write = None;
    }

    pub fn cooldown(&self) -> Duration {
        self.lock().cooldown
    }

    /// Temporarily change pacing (e.g. for bulk programming).
    pub fn set_cooldown(&self, cooldown: Duration) {
        self.lock().cooldown = cooldown;
    }

    pub fn pending(&self) -> usize {
        self.lock().pending()
    }

    pub fn tier_count(&self) -> usize {
        self.lock().tiers.len()
    }

    /// Messages successfully written since construction.
    pub fn sent(&self) -> u64 {
        self.lock().sent
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TransportError};
    use std::sync::Arc;

    /// Test port that records every write with its timestamp.
    #[derive(Default)]
    struct RecordingWriter {
        writes: Vec<(Instant, Vec<u8>)>,
        fail: bool,
    }

    impl PortWriter for RecordingWriter {
        fn write_all(&mut self, data: &[u8]) -> Result<()> {
            if self.fail {
                return Err(TransportError::Closed.into());
            }
            self.writes.push((Instant::now(), data.to_vec()));
            Ok(())
        }
    }

    fn drain_all(s: &OutboundScheduler, port: &mut RecordingWriter) {
        while s.drain_and_send_one(port, Duration::from_millis(5)).unwrap() {}
    }

    #[test]
    fn fifo_within_priority() {
        let s = OutboundScheduler::new(Duration::ZERO);
        for i in 0..5u8 {
            s.send(vec![i], Priority::NORMAL);
        }
        let mut port = RecordingWriter::default();
        drain_all(&s, &mut port);
        let order: Vec<u8> = port.writes.iter().map(|(_, b)| b[0]).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(s.sent(), 5);
    }

    #[test]
    fn immediate_overtakes_pending_normal() {
        let s = OutboundScheduler::new(Duration::ZERO);
        for i in 0..3u8 {
            s.send(vec![i], Priority::NORMAL);
        }
        s.send(vec![0xEE], Priority::LOW);
        s.send_asap(vec![0xFF]);

        let mut port = RecordingWriter::default();
        drain_all(&s, &mut port);
        let order: Vec<u8> = port.writes.iter().map(|(_, b)| b[0]).collect();
        assert_eq!(order, vec![0xFF, 0, 1, 2, 0xEE]);
    }

    #[test]
    fn cooldown_spaces_consecutive_writes() {
        let cooldown = Duration::from_millis(15);
        let s = OutboundScheduler::new(cooldown);
        for i in 0..4u8 {
            s.send(vec![i], Priority::NORMAL);
        }
        let mut port = RecordingWriter::default();
        drain_all(&s, &mut port);
        assert_eq!(port.writes.len(), 4);
        for pair in port.writes.windows(2) {
            assert!(pair[1].0.duration_since(pair[0].0) >= cooldown);
        }
    }

    #[test]
    fn idle_drain_times_out() {
        let s = OutboundScheduler::new(Duration::ZERO);
        let mut port = RecordingWriter::default();
        let start = Instant::now();
        assert!(!s.drain_and_send_one(&mut port, Duration::from_millis(20)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn send_from_another_thread_wakes_drain() {
        let s = Arc::new(OutboundScheduler::new(Duration::ZERO));
        let producer = s.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.send(vec![42], Priority::NORMAL);
        });
        let mut port = RecordingWriter::default();
        assert!(s.drain_and_send_one(&mut port, Duration::from_secs(2)).unwrap());
        assert_eq!(port.writes[0].1, vec![42]);
        t.join().unwrap();
    }

    #[test]
    fn write_error_propagates_and_is_not_retried() {
        let s = OutboundScheduler::new(Duration::ZERO);
        s.send(vec![1], Priority::NORMAL);
        let mut port = RecordingWriter {
            fail: true,
            ..RecordingWriter::default()
        };
        assert_eq!(
            s.drain_and_send_one(&mut port, Duration::from_millis(5)),
            Err(Error::Transport(TransportError::Closed))
        );
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn cleanup_prunes_empty_tiers_but_keeps_normal() {
        let s = OutboundScheduler::new(Duration::ZERO);
        s.send(vec![1], Priority(5));
        s.send(vec![2], Priority::LOW);
        s.send_asap(vec![3]);
        assert_eq!(s.tier_count(), 4);

        let mut port = RecordingWriter::default();
        drain_all(&s, &mut port);
        assert_eq!(s.cleanup(), 3);
        assert_eq!(s.tier_count(), 1);
    }

    #[test]
    fn interrupt_stops_drain_until_resumed() {
        let s = OutboundScheduler::new(Duration::ZERO);
        s.send(vec![1], Priority::NORMAL);
        s.interrupt();
        let mut port = RecordingWriter::default();
        assert!(!s.drain_and_send_one(&mut port, Duration::from_millis(5)).unwrap());
        assert_eq!(s.drop_scheduled(), 1);

        s.resume(Duration::from_millis(1));
        s.send(vec![2], Priority::NORMAL);
        assert!(s.drain_and_send_one(&mut port, Duration::from_millis(5)).unwrap());
        assert_eq!(s.cooldown(), Duration::from_millis(1));
    }
}
