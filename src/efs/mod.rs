//! Embedded file system client.
//!
//! A page-based store on the motherboard, reached through the same frame
//! protocol as everything else. Requests go out through a [`FrameSink`];
//! responses come back on the reader thread through the three handlers
//! registered by [`EfsDriver::register`].
//!
//! ```text
//!  caller task                       reader thread
//!  ───────────                       ─────────────
//!  lookup(id)  ── REQ_FILEINFO ──▶
//!     await Waiter[id]           ◀── on_file_info   (signal)
//!  file.read() ── REQ_FILEDATA ──▶
//!     await DataQueue[id]        ◀── on_file_data   (try_send)
//!  request_header_info() ────────▶
//!                                ◀── on_header_info (capacity + event)
//! ```
//!
//! Responses carry no request id; they are matched by file identifier.
//! Lookups and reads are therefore serialized per identifier, and a data
//! response echoing the wrong address fails the read.

mod file;
pub mod wire;

pub use file::{Attributes, EfsFile, FileId, FileInfo};
pub use wire::EfsCapacity;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex as AsyncMutex;
use log::{debug, info, trace, warn};

use crate::apt::codec::Frame;
use crate::apt::dispatch::DispatcherBuilder;
use crate::apt::protocol::Command;
use crate::apt::waiter::Waiter;
use crate::error::{Error, Result};
use crate::events::{EventBus, LinkEvent};
use crate::ports::FrameSink;

/// Profile tag for every frame the driver sends.
pub const EFS_PROFILE: &str = "efs-driver";

/// Data responses buffered per open read.
const DATA_QUEUE_DEPTH: usize = 4;

type DataQueue = Channel<CriticalSectionRawMutex, Vec<u8>, DATA_QUEUE_DEPTH>;
type Gate = AsyncMutex<CriticalSectionRawMutex, ()>;

/// Result of one file-info exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupOutcome {
    Found(FileInfo),
    Absent,
    TimedOut,
}

#[derive(Default)]
struct DriverState {
    capacity: EfsCapacity,
    header_known: bool,
    payload_limit: u16,
    files: BTreeMap<FileId, FileInfo>,
}

struct Inner {
    sink: Arc<dyn FrameSink>,
    events: Arc<EventBus>,
    timeout: Duration,
    state: Mutex<DriverState>,
    header_waiter: Waiter<EfsCapacity>,
    lookups: Mutex<HashMap<FileId, Arc<Waiter<Option<FileInfo>>>>>,
    readers: Mutex<HashMap<FileId, Arc<DataQueue>>>,
    lookup_gates: Box<[Gate]>,
    gates: Box<[Gate]>,
}

fn gates() -> Box<[Gate]> {
    (0..256).map(|_| AsyncMutex::new(())).collect()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn send(&self, frame: &Frame) -> Result<()> {
        self.sink.send_frame(EFS_PROFILE, frame)
    }

    fn state(&self) -> MutexGuard<'_, DriverState> {
        lock(&self.state)
    }

    /// Route data responses for `id` to the returned subscription until it
    /// drops.
    fn subscribe(&self, id: FileId) -> Subscription<'_> {
        let queue = Arc::new(DataQueue::new());
        lock(&self.readers).insert(id, queue.clone());
        Subscription {
            inner: self,
            id,
            queue,
        }
    }
}

/// An open read's inbox.
struct Subscription<'a> {
    inner: &'a Inner,
    id: FileId,
    queue: Arc<DataQueue>,
}

impl Subscription<'_> {
    async fn receive(&self) -> Vec<u8> {
        self.queue.receive().await
    }
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        lock(&self.inner.readers).remove(&self.id);
    }
}

/// Shared handle to the EFS client. Cheap to clone.
#[derive(Clone)]
pub struct EfsDriver {
    inner: Arc<Inner>,
}

impl EfsDriver {
    pub fn new(sink: Arc<dyn FrameSink>, events: Arc<EventBus>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                events,
                timeout,
                state: Mutex::new(DriverState::default()),
                header_waiter: Waiter::new(),
                lookups: Mutex::new(HashMap::new()),
                readers: Mutex::new(HashMap::new()),
                lookup_gates: gates(),
                gates: gates(),
            }),
        }
    }

    /// Add the driver's response handlers to a dispatcher under construction.
    pub fn register(&self, builder: DispatcherBuilder) -> DispatcherBuilder {
        let (h, f, d) = (self.clone(), self.clone(), self.clone());
        builder
            .on(Command::EfsGetHwInfo, move |inb| h.on_header_info(inb.payload()))
            .on(Command::EfsGetFileInfo, move |inb| f.on_file_info(inb.payload()))
            .on(Command::EfsGetFileData, move |inb| d.on_file_data(inb.payload()))
    }

    // ═══════════════════════════════════════════════════════════
    //  State
    // ═══════════════════════════════════════════════════════════

    pub fn capacity(&self) -> EfsCapacity {
        self.inner.state().capacity
    }

    /// True once a header response has been received this session.
    pub fn header_known(&self) -> bool {
        self.inner.state().header_known
    }

    /// Largest extended payload the device accepts, from its hardware info.
    pub fn payload_limit(&self) -> u16 {
        self.inner.state().payload_limit
    }

    pub fn set_payload_limit(&self, limit: u16) {
        self.inner.state().payload_limit = limit;
    }

    fn write_chunk_len(&self) -> Result<usize> {
        let limit = usize::from(self.payload_limit());
        if limit <= wire::DATA_OVERHEAD {
            return Err(Error::InvalidArgument("transport payload limit unknown"));
        }
        Ok(limit - wire::DATA_OVERHEAD)
    }

    /// Files known from earlier lookups.
    pub fn files(&self) -> Vec<FileInfo> {
        self.inner.state().files.values().copied().collect()
    }

    /// Handle for a file known from an earlier lookup, without asking the
    /// device.
    pub fn file(&self, id: FileId) -> Option<EfsFile> {
        let info = self.inner.state().files.get(&id).copied()?;
        Some(EfsFile::new(info, self.clone()))
    }

    /// Forget every known file.
    pub fn reset(&self) {
        let had_files = {
            let mut state = self.inner.state();
            let had = !state.files.is_empty();
            state.files.clear();
            had
        };
        debug!("efs: reset (had files: {})", had_files);
        self.inner.events.publish(LinkEvent::EfsFilesChanged);
    }

    /// Reset plus forget the device's header and payload limit. Used when
    /// the session ends.
    pub(crate) fn forget_device(&self) {
        {
            let mut state = self.inner.state();
            state.capacity = EfsCapacity::default();
            state.header_known = false;
            state.payload_limit = 0;
        }
        lock(&self.inner.readers).clear();
        self.reset();
    }

    // ═══════════════════════════════════════════════════════════
    //  Header
    // ═══════════════════════════════════════════════════════════

    /// Ask for the store header. The response updates [`capacity`](Self::capacity)
    /// and raises [`LinkEvent::EfsHeaderChanged`].
    pub fn request_header_info(&self) -> Result<()> {
        self.inner.send(&wire::header_request())
    }

    /// As [`request_header_info`](Self::request_header_info), waiting for
    /// the response.
    pub async fn refresh_header(&self) -> Result<EfsCapacity> {
        self.inner.header_waiter.arm();
        self.request_header_info()?;
        self.inner
            .header_waiter
            .wait(self.inner.timeout)
            .await
            .ok_or(Error::Timeout("EFS header"))
    }

    // ═══════════════════════════════════════════════════════════
    //  Lookup
    // ═══════════════════════════════════════════════════════════

    async fn lookup_raw(&self, id: FileId) -> Result<LookupOutcome> {
        let _gate = self.inner.lookup_gates[usize::from(id.raw())].lock().await;
        let waiter = lock(&self.inner.lookups)
            .entry(id)
            .or_insert_with(|| Arc::new(Waiter::new()))
            .clone();

        waiter.arm();
        self.inner.send(&wire::file_info_request(id)?)?;
        let outcome = match waiter.wait(self.inner.timeout).await {
            None => LookupOutcome::TimedOut,
            Some(None) => LookupOutcome::Absent,
            Some(Some(info)) => LookupOutcome::Found(info),
        };

        let changed = {
            let mut state = self.inner.state();
            match outcome {
                LookupOutcome::Found(info) => state.files.insert(id, info) != Some(info),
                LookupOutcome::Absent => state.files.remove(&id).is_some(),
                LookupOutcome::TimedOut => false,
            }
        };
        if changed {
            self.inner.events.publish(LinkEvent::EfsFilesChanged);
        }
        trace!("efs {}: lookup -> {:?}", id, outcome);
        Ok(outcome)
    }

    /// Ask the device about one file.
    ///
    /// `Ok(None)` when the file does not exist, is zero-length, or the
    /// device did not answer in time. Errors are only for failures to send.
    pub async fn lookup(&self, id: FileId) -> Result<Option<EfsFile>> {
        Ok(match self.lookup_raw(id).await? {
            LookupOutcome::Found(info) => Some(EfsFile::new(info, self.clone())),
            LookupOutcome::TimedOut => {
                debug!("efs {}: lookup timed out", id);
                None
            }
            LookupOutcome::Absent => None,
        })
    }

    /// Look up all 256 identifiers; returns the files found.
    pub async fn lookup_all(&self) -> Result<Vec<EfsFile>> {
        let mut found = Vec::new();
        for id in FileId::all() {
            if let Some(file) = self.lookup(id).await? {
                found.push(file);
            }
        }
        info!("efs: scan found {} files", found.len());
        Ok(found)
    }

    // ═══════════════════════════════════════════════════════════
    //  Create / delete
    // ═══════════════════════════════════════════════════════════

    /// Allocate a file large enough for `byte_size` bytes.
    ///
    /// `Ok(None)` if the device did not confirm the file. Remaining counters
    /// are decremented locally; the next header refresh reconciles them.
    pub async fn create(
        &self,
        id: FileId,
        attributes: Attributes,
        byte_size: u32,
    ) -> Result<Option<EfsFile>> {
        if byte_size == 0 {
            return Err(Error::InvalidArgument("file size must be non-zero"));
        }
        if !self.header_known() {
            self.refresh_header().await?;
        }

        let (cap, existed) = {
            let state = self.inner.state();
            (state.capacity, state.files.contains_key(&id))
        };
        if cap.page_size == 0 {
            return Err(Error::Rejected("EFS header with zero page size"));
        }
        let pages = byte_size.div_ceil(u32::from(cap.page_size));
        if cap.files_remaining == 0 {
            return Err(Error::CapacityExceeded {
                requested: 1,
                remaining: 0,
            });
        }
        if pages > u32::from(cap.pages_remaining) {
            return Err(Error::CapacityExceeded {
                requested: pages,
                remaining: u32::from(cap.pages_remaining),
            });
        }

        debug!("efs {}: create {} pages ({:?})", id, pages, attributes);
        self.inner
            .send(&wire::set_file_info(id, attributes, pages as u16)?)?;

        let LookupOutcome::Found(info) = self.lookup_raw(id).await? else {
            warn!("efs {}: create not confirmed", id);
            return Ok(None);
        };
        if !existed {
            let mut state = self.inner.state();
            state.capacity.files_remaining = state.capacity.files_remaining.saturating_sub(1);
            state.capacity.pages_remaining = state
                .capacity
                .pages_remaining
                .saturating_sub(info.page_length as u16);
        }
        self.inner.events.publish(LinkEvent::EfsHeaderChanged);
        Ok(Some(EfsFile::new(info, self.clone())))
    }

    /// Delete a file. `Ok(false)` if it did not exist or still exists
    /// afterwards; local state is only changed on confirmed deletion.
    pub async fn delete(&self, id: FileId) -> Result<bool> {
        let known = self.inner.state().files.get(&id).copied();
        let info = match known {
            Some(info) => info,
            None => match self.lookup_raw(id).await? {
                LookupOutcome::Found(info) => info,
                LookupOutcome::Absent | LookupOutcome::TimedOut => return Ok(false),
            },
        };

        debug!("efs {}: delete", id);
        self.inner
            .send(&wire::set_file_info(id, info.attributes, 0)?)?;

        match self.lookup_raw(id).await? {
            LookupOutcome::Absent => {
                let mut state = self.inner.state();
                state.files.remove(&id);
                state.capacity.files_remaining = state.capacity.files_remaining.saturating_add(1);
                state.capacity.pages_remaining = state
                    .capacity
                    .pages_remaining
                    .saturating_add(info.page_length as u16);
                drop(state);
                self.inner.events.publish(LinkEvent::EfsHeaderChanged);
                Ok(true)
            }
            LookupOutcome::Found(_) => {
                warn!("efs {}: still present after delete", id);
                Ok(false)
            }
            LookupOutcome::TimedOut => {
                warn!("efs {}: delete not confirmed", id);
                Ok(false)
            }
        }
    }

    /// Create, write and verify a whole file.
    pub async fn upload(&self, id: FileId, attributes: Attributes, data: &[u8]) -> Result<EfsFile> {
        let size = u32::try_from(data.len())
            .map_err(|_| Error::InvalidArgument("file larger than 4 GiB"))?;
        let file = self
            .create(id, attributes, size)
            .await?
            .ok_or(Error::Rejected("EFS create"))?;

        file.write(0, data)?;
        let readback = file.read(0, data.len()).await?;
        if let Some(offset) = data
            .iter()
            .zip(&readback)
            .position(|(a, b)| a != b)
            .or_else(|| (readback.len() < data.len()).then_some(readback.len()))
        {
            warn!("efs {}: verify failed at offset {}", id, offset);
            return Err(Error::VerifyFailed {
                offset: offset as u32,
            });
        }
        info!("efs {}: uploaded {} bytes", id, data.len());
        Ok(file)
    }

    // ═══════════════════════════════════════════════════════════
    //  Inbound handlers (reader thread)
    // ═══════════════════════════════════════════════════════════

    fn on_header_info(&self, payload: &[u8]) -> Result<()> {
        let cap = wire::parse_header(payload)?;
        {
            let mut state = self.inner.state();
            state.capacity = cap;
            state.header_known = true;
        }
        debug!(
            "efs: header page_size={} pages={}/{} files={}/{}",
            cap.page_size, cap.pages_remaining, cap.total_pages, cap.files_remaining, cap.max_files
        );
        self.inner.header_waiter.signal(cap);
        self.inner.events.publish(LinkEvent::EfsHeaderChanged);
        Ok(())
    }

    fn on_file_info(&self, payload: &[u8]) -> Result<()> {
        let (id, info) = wire::parse_file_info(payload)?;
        match lock(&self.inner.lookups).get(&id) {
            Some(waiter) => waiter.signal(info),
            None => debug!("efs {}: unsolicited file info", id),
        }
        Ok(())
    }

    fn on_file_data(&self, payload: &[u8]) -> Result<()> {
        let id = wire::data_identifier(payload)?;
        let len = payload.len().saturating_sub(wire::DATA_OVERHEAD);
        self.inner.events.publish(LinkEvent::EfsDataAvailable {
            identifier: id.raw(),
            len,
        });

        let queue = lock(&self.inner.readers).get(&id).cloned();
        match queue {
            Some(q) => {
                if q.try_send(payload.to_vec()).is_err() {
                    warn!("efs {}: read inbox full, dropping data response", id);
                }
            }
            None => trace!("efs {}: data response with no open read", id),
        }
        Ok(())
    }
}
