//! Inbound frame router.
//!
//! Routes are registered once through [`DispatcherBuilder`] when the link is
//! built and are immutable afterwards, so the reader thread dispatches
//! without taking a lock. Several handlers may share one command id; they run
//! in registration order.
//!
//! Handlers run on the reader thread. They may update shared state, publish
//! events or signal a [`Waiter`](super::waiter::Waiter), but must not block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace, warn};

use super::codec::Frame;
use super::protocol::{Command, command_name, slot_from_address};
use crate::error::Result;

/// A decoded frame plus the routing facts derived from its header.
pub struct Inbound<'a> {
    pub frame: &'a Frame,
    /// Zero-based card bay when the source address is a slot address.
    pub slot: Option<u8>,
}

impl Inbound<'_> {
    pub fn command(&self) -> u16 {
        self.frame.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.frame.payload
    }
}

pub type Handler = Box<dyn Fn(&Inbound<'_>) -> Result<()> + Send + Sync>;

/// Collects routes before the dispatcher is frozen.
#[derive(Default)]
pub struct DispatcherBuilder {
    routes: HashMap<u16, Vec<Handler>>,
}

impl DispatcherBuilder {
    /// Route a known command.
    pub fn on<F>(self, command: Command, handler: F) -> Self
    where
        F: Fn(&Inbound<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.on_id(command.id(), handler)
    }

    /// Route a raw id, for feature modules whose commands are not modelled
    /// by [`Command`].
    pub fn on_id<F>(mut self, id: u16, handler: F) -> Self
    where
        F: Fn(&Inbound<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.routes.entry(id).or_default().push(Box::new(handler));
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            routes: self.routes,
            stats: DispatchStats::default(),
        }
    }
}

#[derive(Default)]
struct DispatchStats {
    routed: AtomicU64,
    unknown: AtomicU64,
    rejected: AtomicU64,
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounters {
    pub routed: u64,
    pub unknown: u64,
    pub rejected: u64,
}

/// Immutable command id → handlers map.
pub struct Dispatcher {
    routes: HashMap<u16, Vec<Handler>>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn handles(&self, id: u16) -> bool {
        self.routes.contains_key(&id)
    }

    /// Route one frame. Returns `false` if no handler is registered.
    ///
    /// Handler errors (typically malformed payloads) are logged and counted;
    /// they never stop the reader.
    pub fn dispatch(&self, frame: &Frame) -> bool {
        let Some(handlers) = self.routes.get(&frame.command) else {
            self.stats.unknown.fetch_add(1, Ordering::Relaxed);
            debug!(
                "dispatch: no handler for {:#06x} ({}) from {:#04x}, dropped",
                frame.command,
                command_name(frame.command),
                frame.source
            );
            return false;
        };

        let inbound = Inbound {
            frame,
            slot: slot_from_address(frame.source),
        };
        trace!(
            "dispatch: {} slot={:?} len={}",
            command_name(frame.command),
            inbound.slot,
            frame.payload.len()
        );

        self.stats.routed.fetch_add(1, Ordering::Relaxed);
        for handler in handlers {
            if let Err(e) = handler(&inbound) {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "dispatch: {:#06x} ({}) rejected: {}",
                    frame.command,
                    command_name(frame.command),
                    e
                );
            }
        }
        true
    }

    pub fn counters(&self) -> DispatchCounters {
        DispatchCounters {
            routed: self.stats.routed.load(Ordering::Relaxed),
            unknown: self.stats.unknown.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }
}
