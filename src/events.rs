//! Link event bus.
//!
//! Events are produced by:
//! - the reader thread (EFS responses, via dispatcher handlers)
//! - the session (connect / disconnect transitions)
//!
//! and consumed by whatever UI or service layer sits on top, one at a time
//! in FIFO order.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Reader thread│────▶│              │     │              │
//! │ EFS driver   │────▶│  Event bus   │────▶│  Consumer    │
//! │ Link session │────▶│  (bounded)   │     │  (any thread)│
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! Publishing never blocks: when the bus is full the event is dropped and
//! counted, so a slow consumer cannot stall the reader thread.

use core::sync::atomic::{AtomicU64, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::warn;

use crate::link::ConnectionState;

/// Maximum number of pending events.
const EVENT_QUEUE_CAP: usize = 32;

/// Notifications raised by the link and the EFS driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    // ── Session ───────────────────────────────────────────
    /// The connection state machine moved.
    ConnectionChanged(ConnectionState),

    // ── EFS ───────────────────────────────────────────────
    /// Capacity fields were refreshed from the device.
    EfsHeaderChanged,
    /// The set of known files changed (lookup, create, delete, reset).
    EfsFilesChanged,
    /// A file-data response arrived for `identifier`.
    EfsDataAvailable { identifier: u8, len: usize },
}

/// Bounded multi-producer event queue.
pub struct EventBus {
    channel: Channel<CriticalSectionRawMutex, LinkEvent, EVENT_QUEUE_CAP>,
    dropped: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an event. Returns `false` if the queue is full (event dropped).
    pub fn publish(&self, event: LinkEvent) -> bool {
        if self.channel.try_send(event).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n.is_power_of_two() {
                warn!("events: bus full, {} events dropped so far", n);
            }
            return false;
        }
        true
    }

    /// Pop the next event without waiting.
    pub fn try_next(&self) -> Option<LinkEvent> {
        self.channel.try_receive().ok()
    }

    /// Wait for the next event.
    pub async fn next(&self) -> LinkEvent {
        self.channel.receive().await
    }

    /// Drain all pending events into a callback, FIFO.
    pub fn drain(&self, mut handler: impl FnMut(LinkEvent)) {
        while let Some(event) = self.try_next() {
            handler(event);
        }
    }

    /// Collect pending events. Convenient for tests and polling consumers.
    pub fn drain_to_vec(&self) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        self.drain(|e| out.push(e));
        out
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    /// Events lost to a full queue since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
