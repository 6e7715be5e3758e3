//! EFS file identity, permissions and the per-file handle.

use core::fmt;
use core::ops::BitOr;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use super::{EfsDriver, wire};
use crate::apt::waiter::with_timeout;
use crate::error::{Error, ProtocolViolation, Result};

// ── Identifier ────────────────────────────────────────────────

/// One byte naming a file: 3-bit extension over a 5-bit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(u8);

impl FileId {
    pub const fn new(extension: u8, id: u8) -> Self {
        Self(((extension & 0x07) << 5) | (id & 0x1F))
    }

    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn extension(self) -> u8 {
        self.0 >> 5
    }

    pub const fn id(self) -> u8 {
        self.0 & 0x1F
    }

    /// Every identifier in the 256-entry namespace.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..=u8::MAX).map(Self)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.extension(), self.id())
    }
}

// ── Attributes ────────────────────────────────────────────────

/// Permission bits, granted separately to the host application and the
/// firmware loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Attributes(u8);

impl Attributes {
    pub const APT_READ: Self = Self(0x01);
    pub const APT_WRITE: Self = Self(0x02);
    pub const APT_DELETE: Self = Self(0x04);
    pub const FIRMWARE_READ: Self = Self(0x08);
    pub const FIRMWARE_WRITE: Self = Self(0x10);
    pub const FIRMWARE_DELETE: Self = Self(0x20);

    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0x3F);

    /// Unknown high bits are dropped.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Attributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ── File info ─────────────────────────────────────────────────

/// What the device reported for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub identifier: FileId,
    /// Held open by firmware; not accessible from the host.
    pub owned: bool,
    pub attributes: Attributes,
    /// Allocated size in pages.
    pub page_length: u32,
}

// ── Handle ────────────────────────────────────────────────────

/// Handle to a file known to the driver.
#[derive(Clone)]
pub struct EfsFile {
    info: FileInfo,
    driver: EfsDriver,
}

impl fmt::Debug for EfsFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EfsFile").field("info", &self.info).finish()
    }
}

impl EfsFile {
    pub(super) fn new(info: FileInfo, driver: EfsDriver) -> Self {
        Self { info, driver }
    }

    pub fn info(&self) -> FileInfo {
        self.info
    }

    pub fn identifier(&self) -> FileId {
        self.info.identifier
    }

    pub fn attributes(&self) -> Attributes {
        self.info.attributes
    }

    pub fn page_length(&self) -> u32 {
        self.info.page_length
    }

    /// Allocated size in bytes, given the device page size.
    pub fn capacity_bytes(&self) -> u32 {
        self.info.page_length * u32::from(self.driver.capacity().page_size)
    }

    /// Read `count` bytes starting at `address`.
    ///
    /// Loops one request per response. An empty response ends the read
    /// early (end of file). A response echoing a different address is a
    /// [`ProtocolViolation`]; partial data is discarded rather than returned
    /// truncated. Reads of the same identifier are serialized.
    pub async fn read(&self, address: u32, count: usize) -> Result<Vec<u8>> {
        end_address(address, count)?;
        let id = self.info.identifier;
        let inner = &self.driver.inner;
        let _gate = inner.gates[usize::from(id.raw())].lock().await;
        let subscription = inner.subscribe(id);

        let mut out = Vec::with_capacity(count);
        let mut address = address;
        let mut remaining = count;

        while remaining > 0 {
            let request_len = remaining.min(usize::from(u16::MAX)) as u16;
            trace!("efs {}: read {} bytes at {:#x}", id, request_len, address);
            inner.send(&wire::file_data_request(id, address, request_len)?)?;

            let Some(payload) = with_timeout(inner.timeout, subscription.receive()).await else {
                debug!("efs {}: read timed out at {:#x}", id, address);
                return Err(Error::Timeout("EFS file data"));
            };
            let (echoed, data) = wire::parse_file_data(&payload)?;
            if data.is_empty() {
                break;
            }
            if echoed != address {
                return Err(ProtocolViolation::AddressMismatch {
                    expected: address,
                    actual: echoed,
                }
                .into());
            }

            let take = data.len().min(remaining);
            out.extend_from_slice(&data[..take]);
            address += take as u32;
            remaining -= take;
        }
        Ok(out)
    }

    /// Write `data` starting at `address`.
    ///
    /// Split into packets that fit the transport payload limit and queued
    /// in order; the device does not acknowledge writes, so callers needing
    /// integrity read back and compare (see
    /// [`EfsDriver::upload`](super::EfsDriver::upload)).
    pub fn write(&self, address: u32, data: &[u8]) -> Result<()> {
        end_address(address, data.len())?;
        let chunk = self.driver.write_chunk_len()?;
        let id = self.info.identifier;
        let mut address = address;
        for part in data.chunks(chunk) {
            trace!("efs {}: write {} bytes at {:#x}", id, part.len(), address);
            self.driver.inner.send(&wire::file_data_write(id, address, part)?)?;
            address += part.len() as u32;
        }
        Ok(())
    }
}

/// The range must stay inside the 32-bit address space.
fn end_address(address: u32, len: usize) -> Result<u32> {
    u32::try_from(len)
        .ok()
        .and_then(|len| address.checked_add(len))
        .ok_or(Error::InvalidArgument("EFS range exceeds the 32-bit address space"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_packs_extension_and_id() {
        let f = FileId::new(3, 17);
        assert_eq!(f.raw(), (3 << 5) | 17);
        assert_eq!(f.extension(), 3);
        assert_eq!(f.id(), 17);
        assert_eq!(f.to_string(), "3.17");
        assert_eq!(FileId::new(9, 40), FileId::new(1, 8));
        assert_eq!(FileId::all().count(), 256);
    }

    #[test]
    fn ranges_past_address_space_rejected() {
        assert_eq!(end_address(u32::MAX - 3, 3), Ok(u32::MAX));
        assert!(matches!(end_address(u32::MAX - 3, 4), Err(Error::InvalidArgument(_))));
        assert_eq!(end_address(0, 0), Ok(0));
    }

    #[test]
    fn attributes_combine() {
        let a = Attributes::APT_READ | Attributes::APT_WRITE;
        assert!(a.contains(Attributes::APT_READ));
        assert!(!a.contains(Attributes::FIRMWARE_READ));
        assert_eq!(a.bits(), 0x03);
        assert_eq!(Attributes::from_bits_truncate(0xFF), Attributes::ALL);
    }
}
