//! In-process motherboard simulator.
//!
//! [`SimulatedMotherboard`] answers the subset of the protocol this crate speaks:
//! hardware info, the EFS command set, per-slot device queries and serial
//! number programming. [`SimProvider`] runs a model behind an in-memory port
//! so a [`Link`](crate::link::Link) can connect to it exactly as it would to
//! a real device. The model persists across reconnects, like flash does.
//!
//! [`SimControl`] injects the failures the link has to survive: lost
//! handshake replies, an erased serial number, a silent file system,
//! corrupted read addresses, a refused delete, and the port vanishing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::apt::codec::{Frame, FrameDecoder};
use crate::apt::payload::PayloadReader;
use crate::apt::protocol::{Command, SLOT_COUNT, address};
use crate::apt::transport::{
    MemoryCloser, MemoryEnd, OpenPort, PortProvider, PortReader, PortWriter, memory_pair,
};
use crate::config::DeviceClass;
use crate::efs::wire::{self, EfsCapacity};
use crate::efs::{Attributes, FileId, FileInfo};
use crate::error::{Result, TransportError};
use crate::link::identity::{AllowedDevices, DeviceInfo, FirmwareVersion, HwInfo, SERIAL_LEN};

/// Key prefix a serial-number write must carry.
const SERIAL_KEY: &[u8; 4] = b"THOR";

// ═══════════════════════════════════════════════════════════════
//  Configuration and fault injection
// ═══════════════════════════════════════════════════════════════

/// Static shape of the simulated device.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub hw_info: HwInfo,
    pub page_size: u16,
    pub total_pages: u16,
    pub max_files: u16,
    /// Largest data chunk returned per file-data response.
    pub read_chunk: u16,
    pub devices: Vec<DeviceInfo>,
}

impl Default for SimConfig {
    fn default() -> Self {
        let payload_limit = 58;
        Self {
            hw_info: HwInfo {
                model: heapless::String::try_from("MCM301").unwrap_or_default(),
                firmware: FirmwareVersion {
                    major: 1,
                    minor: 0,
                    patch: 3,
                },
                cpld: (2, 0),
                serial_number: heapless::String::try_from("SIM-000001").unwrap_or_default(),
                payload_limit,
                card_types: [0x0010, 0x0011, 0, 0, 0, 0, 0, 0],
                board_type: 0x0301,
                slot_count: SLOT_COUNT,
            },
            page_size: 64,
            total_pages: 256,
            max_files: 32,
            read_chunk: payload_limit - wire::DATA_OVERHEAD as u16,
            devices: vec![DeviceInfo {
                slot: 0,
                device_id: 0x0042,
                serial_number: 0x00C0_FFEE,
                slot_type: 0x0010,
                part_number: heapless::String::try_from("HDR50").unwrap_or_default(),
                detected: true,
            }],
        }
    }
}

/// Runtime fault switches, shared between the test and the model.
#[derive(Default)]
pub struct SimControl {
    /// Swallow this many hardware-info requests before answering.
    pub drop_hw_info: AtomicU32,
    /// Ignore every EFS request.
    pub silence_efs: AtomicBool,
    /// Echo `address + 1` in file-data responses.
    pub corrupt_read_address: AtomicBool,
    /// Accept delete requests but keep the file.
    pub ignore_delete: AtomicBool,
    /// Refuse to open the port.
    pub refuse_open: AtomicBool,
    /// Report the USB serial field as erased EEPROM (all 0xFF).
    pub erase_serial: AtomicBool,
}

// ═══════════════════════════════════════════════════════════════
//  Device model
// ═══════════════════════════════════════════════════════════════

struct SimFile {
    attributes: Attributes,
    pages: u16,
    data: Vec<u8>,
}

/// Protocol state of the simulated motherboard.
pub struct SimulatedMotherboard {
    config: SimConfig,
    control: Arc<SimControl>,
    files: BTreeMap<FileId, SimFile>,
    allowed: BTreeMap<u8, AllowedDevices>,
    frames_seen: u64,
}

impl SimulatedMotherboard {
    pub fn new(config: SimConfig, control: Arc<SimControl>) -> Self {
        Self {
            config,
            control,
            files: BTreeMap::new(),
            allowed: BTreeMap::new(),
            frames_seen: 0,
        }
    }

    pub fn control(&self) -> &Arc<SimControl> {
        &self.control
    }

    pub fn hw_info(&self) -> &HwInfo {
        &self.config.hw_info
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Current file-store header, as the device would report it.
    pub fn capacity(&self) -> EfsCapacity {
        let used_pages: u32 = self.files.values().map(|f| u32::from(f.pages)).sum();
        EfsCapacity {
            identifier: *b"EFS",
            file_version: 1,
            page_size: self.config.page_size,
            total_pages: self.config.total_pages,
            max_files: self.config.max_files,
            files_remaining: self.config.max_files.saturating_sub(self.files.len() as u16),
            pages_remaining: u32::from(self.config.total_pages).saturating_sub(used_pages) as u16,
        }
    }

    /// Raw contents of a stored file.
    pub fn file_data(&self, id: FileId) -> Option<&[u8]> {
        self.files.get(&id).map(|f| f.data.as_slice())
    }

    /// Place a file directly in the store, bypassing the protocol.
    pub fn preload(&mut self, id: FileId, attributes: Attributes, data: &[u8]) {
        let page = usize::from(self.config.page_size.max(1));
        let pages = data.len().div_ceil(page).max(1);
        let mut stored = data.to_vec();
        stored.resize(pages * page, 0);
        self.files.insert(
            id,
            SimFile {
                attributes,
                pages: pages as u16,
                data: stored,
            },
        );
    }

    /// Answer one inbound frame. Malformed requests are ignored, as the
    /// firmware does.
    pub fn handle(&mut self, frame: &Frame) -> Vec<Frame> {
        self.frames_seen += 1;
        let Some(command) = Command::from_id(frame.command) else {
            trace!("sim: ignoring {:#06x}", frame.command);
            return Vec::new();
        };
        match self.respond(command, frame) {
            Ok(replies) => replies,
            Err(e) => {
                debug!("sim: bad {} request: {}", command.name(), e);
                Vec::new()
            }
        }
    }

    fn respond(&mut self, command: Command, frame: &Frame) -> Result<Vec<Frame>> {
        let efs_silent = self.control.silence_efs.load(Ordering::Relaxed);
        let reply = |cmd: Command, payload: Vec<u8>| {
            Frame::extended(cmd.id(), address::HOST, address::MOTHERBOARD, payload)
        };

        Ok(match command {
            Command::HwReqInfo | Command::McmHwReqInfo => {
                let dropped = self
                    .control
                    .drop_hw_info
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                    .is_ok();
                if dropped {
                    debug!("sim: dropping hardware info reply");
                    return Ok(Vec::new());
                }
                let answer = if command == Command::HwReqInfo {
                    Command::HwGetInfo
                } else {
                    Command::McmHwGetInfo
                };
                let mut payload = self.config.hw_info.to_payload();
                if self.control.erase_serial.load(Ordering::Relaxed) {
                    payload[19..19 + SERIAL_LEN].fill(0xFF);
                }
                vec![reply(answer, payload)?]
            }

            Command::EfsReqHwInfo if !efs_silent => vec![wire::header_response(&self.capacity())?],

            Command::EfsReqFileInfo if !efs_silent => {
                let id = FileId::from_raw(PayloadReader::require(&frame.payload, 1)?.u8()?);
                let info = self.files.get(&id).map(|f| FileInfo {
                    identifier: id,
                    owned: false,
                    attributes: f.attributes,
                    page_length: u32::from(f.pages),
                });
                vec![wire::file_info_response(id, info.as_ref())?]
            }

            Command::EfsSetFileInfo if !efs_silent => {
                let mut r = PayloadReader::require(&frame.payload, 4)?;
                let id = FileId::from_raw(r.u8()?);
                let attributes = Attributes::from_bits_truncate(r.u8()?);
                let pages = r.u16()?;
                self.set_file_info(id, attributes, pages);
                Vec::new()
            }

            Command::EfsReqFileData if !efs_silent => {
                let mut r = PayloadReader::require(&frame.payload, 7)?;
                let id = FileId::from_raw(r.u8()?);
                let addr = r.u32()?;
                let len = r.u16()?.min(self.config.read_chunk);
                let data = self
                    .files
                    .get(&id)
                    .map(|f| {
                        let start = (addr as usize).min(f.data.len());
                        let end = (start + usize::from(len)).min(f.data.len());
                        f.data[start..end].to_vec()
                    })
                    .unwrap_or_default();
                let echoed = if self.control.corrupt_read_address.load(Ordering::Relaxed) {
                    addr.wrapping_add(1)
                } else {
                    addr
                };
                vec![wire::file_data_response(id, echoed, &data)?]
            }

            Command::EfsSetFileData if !efs_silent => {
                let mut r = PayloadReader::require(&frame.payload, wire::DATA_OVERHEAD)?;
                let id = FileId::from_raw(r.u8()?);
                let addr = r.u32()? as usize;
                let data = r.rest();
                if let Some(file) = self.files.get_mut(&id) {
                    let end = (addr + data.len()).min(file.data.len());
                    if addr < end {
                        file.data[addr..end].copy_from_slice(&data[..end - addr]);
                    }
                }
                Vec::new()
            }

            Command::ReqDevice => {
                let slot = frame.param1;
                if slot >= SLOT_COUNT {
                    return Ok(Vec::new());
                }
                let info = self
                    .config
                    .devices
                    .iter()
                    .find(|d| d.slot == slot)
                    .cloned()
                    .unwrap_or(DeviceInfo {
                        slot,
                        device_id: 0,
                        serial_number: 0,
                        slot_type: 0,
                        part_number: heapless::String::new(),
                        detected: false,
                    });
                vec![reply(Command::GetDevice, info.to_payload())?]
            }

            Command::McmReqAllowedDevices => {
                let slot = frame.param1;
                let list = self.allowed.get(&slot).cloned().unwrap_or(AllowedDevices {
                    slot,
                    devices: Vec::new(),
                });
                vec![reply(Command::McmGetAllowedDevices, list.to_payload())?]
            }

            Command::McmSetAllowedDevices => {
                let list = AllowedDevices::parse(&frame.payload)?;
                self.allowed.insert(list.slot, list);
                Vec::new()
            }

            Command::SetSerToEeprom => {
                let p = &frame.payload;
                if p.len() != SERIAL_KEY.len() + SERIAL_LEN || !p.starts_with(SERIAL_KEY) {
                    debug!("sim: serial number write refused");
                    return Ok(Vec::new());
                }
                let mut r = PayloadReader::new(p);
                r.skip(SERIAL_KEY.len())?;
                self.config.hw_info.serial_number = r.text(SERIAL_LEN)?;
                self.control.erase_serial.store(false, Ordering::Relaxed);
                vec![reply(Command::GetSerStatus, vec![1])?]
            }

            _ => Vec::new(),
        })
    }

    fn set_file_info(&mut self, id: FileId, attributes: Attributes, pages: u16) {
        if pages == 0 {
            if self.control.ignore_delete.load(Ordering::Relaxed) {
                debug!("sim: ignoring delete of {}", id);
            } else if self.files.remove(&id).is_some() {
                debug!("sim: deleted {}", id);
            }
            return;
        }
        let cap = self.capacity();
        if self.files.contains_key(&id) || cap.files_remaining == 0 || pages > cap.pages_remaining {
            debug!("sim: create of {} refused", id);
            return;
        }
        self.files.insert(
            id,
            SimFile {
                attributes,
                pages,
                data: vec![0; usize::from(pages) * usize::from(self.config.page_size)],
            },
        );
        debug!("sim: created {} ({} pages)", id, pages);
    }
}

// ═══════════════════════════════════════════════════════════════
//  Port plumbing
// ═══════════════════════════════════════════════════════════════

fn lock(model: &Mutex<SimulatedMotherboard>) -> MutexGuard<'_, SimulatedMotherboard> {
    model.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serve one memory-port session until the host side closes.
pub fn serve(mut end: MemoryEnd, model: Arc<Mutex<SimulatedMotherboard>>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("apt-sim".into())
        .spawn(move || {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 512];
            loop {
                let n = match end.reader.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("sim: port ended ({})", e);
                        break;
                    }
                };
                for frame in decoder.feed(&buf[..n]) {
                    let replies = lock(&model).handle(&frame);
                    for reply in replies {
                        let sent = reply
                            .encode()
                            .and_then(|bytes| end.writer.write_all(&bytes));
                        if let Err(e) = sent {
                            warn!("sim: reply failed ({})", e);
                            return;
                        }
                    }
                }
            }
        })
        .map_err(|_| TransportError::Spawn.into())
}

/// [`PortProvider`] backed by a simulated motherboard.
pub struct SimProvider {
    model: Arc<Mutex<SimulatedMotherboard>>,
    control: Arc<SimControl>,
    class: DeviceClass,
    read_timeout: Duration,
    closer: Mutex<Option<MemoryCloser>>,
    opens: AtomicU32,
}

impl SimProvider {
    pub fn new(config: SimConfig, class: DeviceClass) -> Self {
        let control = Arc::new(SimControl::default());
        Self {
            model: Arc::new(Mutex::new(SimulatedMotherboard::new(config, control.clone()))),
            control,
            class,
            read_timeout: Duration::from_millis(10),
            closer: Mutex::new(None),
            opens: AtomicU32::new(0),
        }
    }

    pub fn control(&self) -> &SimControl {
        &self.control
    }

    /// Inspect or modify the device between sessions.
    pub fn with_model<R>(&self, f: impl FnOnce(&mut SimulatedMotherboard) -> R) -> R {
        f(&mut lock(&self.model))
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Pull the cable: both directions of the current port fail.
    pub fn unplug(&self) {
        if let Some(closer) = self
            .closer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            info!("sim: port unplugged");
            closer.close();
        }
    }
}

impl PortProvider for SimProvider {
    fn open(&self, baud_rate: u32) -> Result<OpenPort> {
        if self.control.refuse_open.load(Ordering::Relaxed) {
            return Err(TransportError::OpenFailed.into());
        }
        let (host, device, closer) = memory_pair(self.read_timeout);
        serve(device, self.model.clone())?;
        *self.closer.lock().unwrap_or_else(PoisonError::into_inner) = Some(closer);
        self.opens.fetch_add(1, Ordering::Relaxed);
        debug!("sim: opened at {} baud as {:?}", baud_rate, self.class);
        Ok(OpenPort {
            reader: Box::new(host.reader) as Box<dyn PortReader>,
            writer: Box::new(host.writer) as Box<dyn PortWriter>,
            class: self.class,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> SimulatedMotherboard {
        SimulatedMotherboard::new(SimConfig::default(), Arc::new(SimControl::default()))
    }

    #[test]
    fn answers_hw_info_with_matching_command() {
        let mut m = model();
        let req = Frame::short(Command::McmHwReqInfo.id(), 0, 0, address::MOTHERBOARD, address::HOST);
        let replies = m.handle(&req);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, Command::McmHwGetInfo.id());
        assert_eq!(replies[0].dest, address::HOST | 0x80);
        let info = HwInfo::parse(&replies[0].payload).unwrap();
        assert_eq!(info.serial_number.as_str(), "SIM-000001");
    }

    #[test]
    fn default_identity_strings_fit() {
        let config = SimConfig::default();
        assert_eq!(config.hw_info.model.as_str(), "MCM301");
        assert_eq!(config.devices[0].part_number.as_str(), "HDR50");
    }

    #[test]
    fn erased_serial_until_programmed() {
        let mut m = model();
        m.control().erase_serial.store(true, Ordering::Relaxed);
        let req = Frame::short(Command::HwReqInfo.id(), 0, 0, address::MOTHERBOARD, address::HOST);
        let replies = m.handle(&req);
        assert!(replies[0].payload[19..37].iter().all(|&b| b == 0xFF));
        assert_eq!(HwInfo::parse(&replies[0].payload).unwrap().serial_number.as_str(), "");

        let mut write = SERIAL_KEY.to_vec();
        write.extend_from_slice(b"NEW-1");
        write.resize(SERIAL_KEY.len() + SERIAL_LEN, 0);
        let set = Frame::extended(Command::SetSerToEeprom.id(), address::MOTHERBOARD, address::HOST, write)
            .unwrap();
        assert_eq!(m.handle(&set)[0].payload, vec![1]);
        let info = HwInfo::parse(&m.handle(&req)[0].payload).unwrap();
        assert_eq!(info.serial_number.as_str(), "NEW-1");
    }

    #[test]
    fn drop_hw_info_counts_down() {
        let mut m = model();
        m.control().drop_hw_info.store(1, Ordering::Relaxed);
        let req = Frame::short(Command::HwReqInfo.id(), 0, 0, address::MOTHERBOARD, address::HOST);
        assert!(m.handle(&req).is_empty());
        assert_eq!(m.handle(&req)[0].command, Command::HwGetInfo.id());
    }

    #[test]
    fn create_write_read_through_wire_messages() {
        let mut m = model();
        let id = FileId::new(1, 1);
        m.handle(&wire::set_file_info(id, Attributes::ALL, 2).unwrap());
        assert_eq!(m.capacity().pages_remaining, 254);
        m.handle(&wire::file_data_write(id, 4, &[1, 2, 3]).unwrap());

        let replies = m.handle(&wire::file_data_request(id, 4, 3).unwrap());
        let (addr, data) = wire::parse_file_data(&replies[0].payload).unwrap();
        assert_eq!(addr, 4);
        assert_eq!(data, &[1, 2, 3]);

        let past_end = m.handle(&wire::file_data_request(id, 1000, 3).unwrap());
        assert!(wire::parse_file_data(&past_end[0].payload).unwrap().1.is_empty());
    }

    #[test]
    fn malformed_request_is_ignored() {
        let mut m = model();
        let bad = Frame::extended(
            Command::EfsReqFileData.id(),
            address::MOTHERBOARD,
            address::HOST,
            vec![1, 2],
        )
        .unwrap();
        assert!(m.handle(&bad).is_empty());
    }
}
