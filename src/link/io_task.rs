//! The two I/O threads of a session.
//!
//! ```text
//!  ┌──────────────┐  drain_and_send_one   ┌──────────┐
//!  │ Scheduler    │ ────────────────────▶ │ apt-writer│──▶ PortWriter
//!  └──────────────┘                       └──────────┘
//!  PortReader ──▶ ┌──────────┐ FrameDecoder ┌────────────┐
//!                 │ apt-reader│ ───────────▶ │ Dispatcher │
//!                 └──────────┘              └────────────┘
//! ```
//!
//! Neither thread tears the link down itself. An I/O failure is parked in
//! the [`Fault`] slot and the thread exits; the next call on the link sees
//! it and runs the full teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::apt::codec::FrameDecoder;
use crate::apt::dispatch::Dispatcher;
use crate::apt::transport::{PortReader, PortWriter};
use crate::error::{Error, Result, TransportError};
use crate::scheduler::OutboundScheduler;

/// First I/O error seen by either thread since the last clear.
#[derive(Default)]
pub(crate) struct Fault {
    slot: Mutex<Option<Error>>,
}

impl Fault {
    /// Record `err` unless a fault is already pending.
    pub(crate) fn raise(&self, err: Error) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn get(&self) -> Option<Error> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn clear(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Writer thread settings.
pub(crate) struct WriterParams {
    pub idle_timeout: Duration,
    pub cleanup_every: u32,
}

pub(crate) fn spawn_writer(
    scheduler: Arc<OutboundScheduler>,
    mut port: Box<dyn PortWriter>,
    stop: Arc<AtomicBool>,
    fault: Arc<Fault>,
    params: WriterParams,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("apt-writer".into())
        .spawn(move || {
            info!("writer: started");
            let mut sends: u32 = 0;
            while !stop.load(Ordering::Acquire) {
                match scheduler.drain_and_send_one(port.as_mut(), params.idle_timeout) {
                    Ok(true) => {
                        sends = sends.wrapping_add(1);
                        if params.cleanup_every > 0 && sends % params.cleanup_every == 0 {
                            scheduler.cleanup();
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("writer: {}", e);
                        fault.raise(e);
                        break;
                    }
                }
            }
            info!("writer: stopped after {} writes", sends);
        })
        .map_err(|_| TransportError::Spawn.into())
}

pub(crate) fn spawn_reader(
    mut port: Box<dyn PortReader>,
    dispatcher: Arc<Dispatcher>,
    stop: Arc<AtomicBool>,
    fault: Arc<Fault>,
    buffer_size: usize,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("apt-reader".into())
        .spawn(move || {
            info!("reader: started");
            let mut decoder = FrameDecoder::new();
            let mut buf = vec![0u8; buffer_size.max(1)];
            while !stop.load(Ordering::Acquire) {
                let n = match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => n,
                    Err(e) => {
                        // A read failing because we are shutting down is not a fault.
                        if !stop.load(Ordering::Acquire) {
                            warn!("reader: {}", e);
                            fault.raise(e);
                        }
                        break;
                    }
                };
                trace!("reader: {} bytes", n);
                for frame in decoder.feed(&buf[..n]) {
                    dispatcher.dispatch(&frame);
                }
            }
            if !decoder.is_idle() {
                debug!("reader: discarding partial frame");
            }
            info!("reader: stopped");
        })
        .map_err(|_| TransportError::Spawn.into())
}
