//! The session: one port, two I/O threads, and everything layered on them.
//!
//! ```text
//!   callers ── send / schedule ──▶ Tx (profile lock, stats) ──▶ Scheduler
//!                                                                  │
//!                                           apt-writer ◀───────────┘
//!   PortProvider::open ──▶ reader half ──▶ apt-reader ──▶ Dispatcher
//!                                                          ├─ EfsDriver
//!                                                          ├─ system queries
//!                                                          └─ caller routes
//! ```
//!
//! Connect opens the port, starts the writer, performs the hardware-info
//! handshake on the calling thread (bootloaders skip it), then starts the
//! reader. Any I/O failure parks a fault; the next call on the link tears
//! the session down completely before anything else happens, and reconnects
//! when configured to.

pub mod identity;
mod io_task;
mod system;

pub use system::SYSTEM_PROFILE;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use self::identity::HwInfo;
use self::io_task::{Fault, WriterParams};
use self::system::SystemState;
use crate::apt::codec::{self, Frame};
use crate::apt::dispatch::{DispatchCounters, Dispatcher, DispatcherBuilder, Inbound};
use crate::apt::protocol::{Command, address};
use crate::apt::transport::{DeadlineReader, PortProvider, PortReader};
use crate::config::{DeviceClass, LinkConfig};
use crate::diagnostics::WriteStats;
use crate::efs::EfsDriver;
use crate::error::{Error, Result};
use crate::events::{EventBus, LinkEvent};
use crate::ports::FrameSink;
use crate::profile_lock::ProfileLock;
use crate::scheduler::{OutboundScheduler, Priority};

/// Profile tag of the connect handshake.
const HANDSHAKE_PROFILE: &str = "handshake";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Running application firmware; the handshake succeeded.
    Application,
    /// Running the bootloader; no handshake, no file system.
    Bootloader,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ═══════════════════════════════════════════════════════════════
//  Outbound path
// ═══════════════════════════════════════════════════════════════

/// Everything between a caller and the scheduler.
struct Tx {
    scheduler: Arc<OutboundScheduler>,
    profile_lock: ProfileLock,
    stats: WriteStats,
    state: Mutex<ConnectionState>,
    fault: Arc<Fault>,
}

impl Tx {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn enqueue(&self, profile: &str, bytes: Vec<u8>, priority: Priority) -> Result<()> {
        if self.state() == ConnectionState::Disconnected || self.fault.get().is_some() {
            return Err(Error::NotConnected);
        }
        trace!("tx [{}]: {} bytes at {}", profile, bytes.len(), priority.0);
        self.stats.record(profile, bytes.len());
        self.scheduler.send(bytes, priority);
        Ok(())
    }

    fn send(&self, profile: &str, bytes: Vec<u8>) -> Result<()> {
        self.profile_lock.wait_for(profile);
        self.enqueue(profile, bytes, Priority::IMMEDIATE)
    }
}

impl FrameSink for Tx {
    fn send_frame(&self, profile: &str, frame: &Frame) -> Result<()> {
        self.send(profile, frame.encode()?)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Builder
// ═══════════════════════════════════════════════════════════════

type Route = Box<dyn FnOnce(DispatcherBuilder) -> DispatcherBuilder + Send>;

/// Assembles a [`Link`]. Extra inbound routes are fixed at build time,
/// like the driver routes.
pub struct LinkBuilder {
    provider: Arc<dyn PortProvider>,
    config: LinkConfig,
    routes: Vec<Route>,
}

impl LinkBuilder {
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Route inbound frames with `id` to `handler` on the reader thread.
    /// The handler must not block.
    pub fn on_id<F>(mut self, id: u16, handler: F) -> Self
    where
        F: Fn(&Inbound<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.routes
            .push(Box::new(move |b: DispatcherBuilder| b.on_id(id, handler)));
        self
    }

    pub fn build(self) -> Result<Link> {
        self.config.validate().map_err(|e| {
            warn!("link: invalid config: {}", e);
            Error::InvalidArgument("link configuration")
        })?;

        let events = Arc::new(EventBus::new());
        let tx = Arc::new(Tx {
            scheduler: Arc::new(OutboundScheduler::new(
                self.config.cooldown_for(DeviceClass::Application),
            )),
            profile_lock: ProfileLock::new(),
            stats: WriteStats::new(),
            state: Mutex::new(ConnectionState::Disconnected),
            fault: Arc::new(Fault::default()),
        });
        let efs = EfsDriver::new(tx.clone(), events.clone(), self.config.response_timeout());
        let hw_info = Arc::new(Mutex::new(None));
        let system = Arc::new(SystemState::new());

        let mut builder = Dispatcher::builder();
        for route in self.routes {
            builder = route(builder);
        }
        builder = efs.register(builder);
        builder = system.register(builder, hw_info.clone(), efs.clone());

        Ok(Link {
            config: self.config,
            provider: self.provider,
            tx,
            events,
            efs,
            system,
            dispatcher: Arc::new(builder.build()),
            hw_info,
            session: Mutex::new(None),
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Link
// ═══════════════════════════════════════════════════════════════

/// Threads of one open session.
struct Session {
    stop: Arc<AtomicBool>,
    writer: JoinHandle<()>,
    reader: Option<JoinHandle<()>>,
}

impl Session {
    fn stop(self, scheduler: &OutboundScheduler) {
        self.stop.store(true, Ordering::Release);
        scheduler.interrupt();
        if self.writer.join().is_err() {
            warn!("link: writer thread panicked");
        }
        if let Some(reader) = self.reader {
            if reader.join().is_err() {
                warn!("link: reader thread panicked");
            }
        }
    }
}

/// A serial session with one motherboard.
pub struct Link {
    config: LinkConfig,
    provider: Arc<dyn PortProvider>,
    tx: Arc<Tx>,
    events: Arc<EventBus>,
    efs: EfsDriver,
    system: Arc<SystemState>,
    dispatcher: Arc<Dispatcher>,
    hw_info: Arc<Mutex<Option<HwInfo>>>,
    session: Mutex<Option<Session>>,
}

impl Link {
    pub fn builder(provider: Arc<dyn PortProvider>) -> LinkBuilder {
        LinkBuilder {
            provider,
            config: LinkConfig::default(),
            routes: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.tx.state()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Identity from the last handshake; `None` when disconnected or in the
    /// bootloader.
    pub fn hw_info(&self) -> Option<HwInfo> {
        lock(&self.hw_info).clone()
    }

    pub fn efs(&self) -> &EfsDriver {
        &self.efs
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn profile_lock(&self) -> &ProfileLock {
        &self.tx.profile_lock
    }

    pub fn stats(&self) -> &WriteStats {
        &self.tx.stats
    }

    pub fn dispatch_counters(&self) -> DispatchCounters {
        self.dispatcher.counters()
    }

    pub fn scheduler(&self) -> &OutboundScheduler {
        &self.tx.scheduler
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = lock(&self.tx.state);
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            self.events.publish(LinkEvent::ConnectionChanged(state));
        }
    }

    // ── Connect / disconnect ─────────────────────────────────

    /// Open the port and bring the session up. A no-op when already
    /// connected.
    pub fn connect(&self) -> Result<ConnectionState> {
        let mut session = lock(&self.session);
        self.open_session(&mut session)
    }

    /// Bring a session up into `session`, which the caller holds locked.
    fn open_session(&self, session: &mut Option<Session>) -> Result<ConnectionState> {
        if session.is_some() {
            return Ok(self.state());
        }

        let port = self.provider.open(self.config.baud_rate)?;
        let mut reader = port.reader;
        reader.discard_input()?;
        self.tx.fault.clear();
        self.tx.scheduler.drop_scheduled();
        self.tx.scheduler.resume(self.config.cooldown_for(port.class));
        debug!("link: port open ({:?})", port.class);

        let stop = Arc::new(AtomicBool::new(false));
        let writer = io_task::spawn_writer(
            self.tx.scheduler.clone(),
            port.writer,
            stop.clone(),
            self.tx.fault.clone(),
            WriterParams {
                idle_timeout: self.config.writer_idle_timeout(),
                cleanup_every: self.config.cleanup_every,
            },
        )?;
        let mut running = Session {
            stop: stop.clone(),
            writer,
            reader: None,
        };

        let state = if port.class == DeviceClass::Bootloader {
            info!("link: bootloader attached, skipping handshake");
            ConnectionState::Bootloader
        } else {
            match self.handshake(reader.as_mut()) {
                Ok(info) => {
                    info!(
                        "link: {} serial {} firmware {}",
                        info.model, info.serial_number, info.firmware
                    );
                    self.efs.set_payload_limit(info.payload_limit);
                    *lock(&self.hw_info) = Some(info);
                    ConnectionState::Application
                }
                Err(e) => {
                    warn!("link: handshake failed: {}", e);
                    running.stop(&self.tx.scheduler);
                    self.tx.scheduler.drop_scheduled();
                    return Err(e);
                }
            }
        };

        match io_task::spawn_reader(
            reader,
            self.dispatcher.clone(),
            stop,
            self.tx.fault.clone(),
            self.config.read_buffer_size,
        ) {
            Ok(handle) => running.reader = Some(handle),
            Err(e) => {
                running.stop(&self.tx.scheduler);
                *lock(&self.hw_info) = None;
                return Err(e);
            }
        }
        *session = Some(running);

        self.set_state(state);
        if state == ConnectionState::Application {
            if let Err(e) = self.efs.request_header_info() {
                warn!("link: EFS header request failed: {}", e);
            }
        }
        Ok(state)
    }

    /// Ask for hardware info until it arrives or the retries run out.
    /// Runs before the reader thread exists, so it reads the port directly.
    fn handshake(&self, port: &mut dyn PortReader) -> Result<HwInfo> {
        let request = Frame::short(
            Command::McmHwReqInfo.id(),
            0,
            0,
            address::MOTHERBOARD,
            address::HOST,
        )
        .encode()?;

        for attempt in 1..=self.config.handshake_retries {
            self.tx.stats.record(HANDSHAKE_PROFILE, request.len());
            self.tx.scheduler.send_asap(request.clone());
            let mut source = DeadlineReader::new(&mut *port, self.config.handshake_timeout());
            loop {
                match codec::decode(&mut source) {
                    Ok(frame)
                        if frame.command == Command::McmHwGetInfo.id()
                            || frame.command == Command::HwGetInfo.id() =>
                    {
                        return HwInfo::parse(&frame.payload);
                    }
                    Ok(frame) => trace!(
                        "link: ignoring {} during handshake",
                        crate::apt::protocol::command_name(frame.command)
                    ),
                    Err(Error::Timeout(_)) => break,
                    Err(e) => return Err(e),
                }
            }
            debug!(
                "link: handshake attempt {}/{} timed out",
                attempt, self.config.handshake_retries
            );
            // A reply cut off mid-frame would misalign the next attempt.
            port.discard_input()?;
        }
        Err(Error::Timeout("hardware info handshake"))
    }

    /// Tear the session down: stop both threads, close the port, drop
    /// everything queued and forget the device.
    pub fn disconnect(&self) {
        let mut session = lock(&self.session);
        self.teardown(&mut session);
    }

    fn teardown(&self, session: &mut Option<Session>) {
        self.set_state(ConnectionState::Disconnected);
        if let Some(running) = session.take() {
            running.stop(&self.tx.scheduler);
        }
        let dropped = self.tx.scheduler.drop_scheduled();
        self.efs.forget_device();
        self.system.reset();
        *lock(&self.hw_info) = None;
        self.tx.profile_lock.release();
        self.tx.fault.clear();
        info!("link: disconnected ({} queued messages dropped)", dropped);
    }

    /// Fault parked by the I/O threads, if any. Does not tear down.
    pub fn pending_fault(&self) -> Option<Error> {
        self.tx.fault.get()
    }

    /// Handle a parked fault, then make sure a session is up.
    ///
    /// The fault check, teardown and reconnect happen under the session
    /// lock, so a caller that saw the same fault finds the new session
    /// instead of tearing it down.
    fn ensure_connected(&self) -> Result<()> {
        if self.tx.fault.get().is_none() && self.state() != ConnectionState::Disconnected {
            return Ok(());
        }
        let mut session = lock(&self.session);
        if let Some(fault) = self.tx.fault.get() {
            warn!("link: tearing down after fault: {}", fault);
            self.teardown(&mut session);
        }
        if session.is_some() {
            return Ok(());
        }
        if !self.config.auto_reconnect {
            return Err(Error::NotConnected);
        }
        info!("link: reconnecting");
        self.open_session(&mut session).map(|_| ())
    }

    /// Check for a parked fault and tear down if one is found. Returns the
    /// fault.
    pub fn check_health(&self) -> Option<Error> {
        let mut session = lock(&self.session);
        let fault = self.tx.fault.get()?;
        warn!("link: tearing down after fault: {}", fault);
        self.teardown(&mut session);
        Some(fault)
    }

    // ── Sending ──────────────────────────────────────────────

    /// Queue raw bytes at Immediate priority on behalf of `profile`, waiting
    /// for the profile lock first.
    pub fn send(&self, profile: &str, bytes: Vec<u8>) -> Result<()> {
        self.ensure_connected()?;
        self.tx.send(profile, bytes)
    }

    /// Queue raw bytes at any priority. Does not wait for the profile lock;
    /// use it for polling traffic that may interleave with workflows.
    pub fn schedule(&self, profile: &str, bytes: Vec<u8>, priority: Priority) -> Result<()> {
        self.ensure_connected()?;
        self.tx.enqueue(profile, bytes, priority)
    }

    pub fn send_frame(&self, profile: &str, frame: &Frame) -> Result<()> {
        self.send(profile, frame.encode()?)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            session.stop(&self.tx.scheduler);
        }
    }
}
