//! EFS message layouts.
//!
//! ```text
//! REQ_FILEINFO   [ident]
//! GET_FILEINFO   [ident, exists, owned, attributes, pages u16]
//! SET_FILEINFO   [ident, attributes, pages u16]            pages = 0 deletes
//! REQ_FILEDATA   [ident, address u32, length u16]
//! GET_FILEDATA   [ident, address u32, data ...]
//! SET_FILEDATA   [ident, address u32, data ...]
//! GET_HWINFO     [ident ×3, version, page_size u16, pages u16, reserved ×8,
//!                 max_files u16, files_free u16, pages_free u16]
//! ```
//!
//! All integers little-endian. Device responses are sent from the
//! motherboard to the host; requests go the other way.

use super::file::{Attributes, FileId, FileInfo};
use crate::apt::codec::Frame;
use crate::apt::payload::PayloadReader;
use crate::apt::protocol::{Command, address};
use crate::error::Result;

/// Bytes of each data packet taken by the identifier and address.
pub const DATA_OVERHEAD: usize = 5;

pub const HEADER_INFO_LEN: usize = 22;
pub const FILE_INFO_LEN: usize = 6;

/// Capacity of the device file store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EfsCapacity {
    /// Three-character format identifier.
    pub identifier: [u8; 3],
    pub file_version: u8,
    pub page_size: u16,
    pub total_pages: u16,
    pub max_files: u16,
    pub files_remaining: u16,
    pub pages_remaining: u16,
}

// ── Host → device ─────────────────────────────────────────────

fn request(command: Command, payload: Vec<u8>) -> Result<Frame> {
    Frame::extended(command.id(), address::MOTHERBOARD, address::HOST, payload)
}

pub fn header_request() -> Frame {
    Frame::short(
        Command::EfsReqHwInfo.id(),
        0,
        0,
        address::MOTHERBOARD,
        address::HOST,
    )
}

pub fn file_info_request(id: FileId) -> Result<Frame> {
    request(Command::EfsReqFileInfo, vec![id.raw()])
}

/// Create (`pages > 0`) or delete (`pages == 0`).
pub fn set_file_info(id: FileId, attributes: Attributes, pages: u16) -> Result<Frame> {
    let [lo, hi] = pages.to_le_bytes();
    request(Command::EfsSetFileInfo, vec![id.raw(), attributes.bits(), lo, hi])
}

pub fn file_data_request(id: FileId, addr: u32, len: u16) -> Result<Frame> {
    let mut payload = Vec::with_capacity(7);
    payload.push(id.raw());
    payload.extend_from_slice(&addr.to_le_bytes());
    payload.extend_from_slice(&len.to_le_bytes());
    request(Command::EfsReqFileData, payload)
}

pub fn file_data_write(id: FileId, addr: u32, data: &[u8]) -> Result<Frame> {
    request(Command::EfsSetFileData, data_payload(id, addr, data))
}

fn data_payload(id: FileId, addr: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(DATA_OVERHEAD + data.len());
    payload.push(id.raw());
    payload.extend_from_slice(&addr.to_le_bytes());
    payload.extend_from_slice(data);
    payload
}

// ── Device → host ─────────────────────────────────────────────

pub fn parse_header(payload: &[u8]) -> Result<EfsCapacity> {
    let mut r = PayloadReader::require(payload, HEADER_INFO_LEN)?;
    let mut identifier = [0u8; 3];
    identifier.copy_from_slice(r.bytes(3)?);
    let file_version = r.u8()?;
    let page_size = r.u16()?;
    let total_pages = r.u16()?;
    r.seek(16)?;
    Ok(EfsCapacity {
        identifier,
        file_version,
        page_size,
        total_pages,
        max_files: r.u16()?,
        files_remaining: r.u16()?,
        pages_remaining: r.u16()?,
    })
}

/// Identifier plus the file, or `None` when the device reports no file or a
/// zero-length one.
pub fn parse_file_info(payload: &[u8]) -> Result<(FileId, Option<FileInfo>)> {
    let mut r = PayloadReader::require(payload, FILE_INFO_LEN)?;
    let identifier = FileId::from_raw(r.u8()?);
    let exists = r.u8()? != 0;
    let owned = r.u8()? != 0;
    let attributes = Attributes::from_bits_truncate(r.u8()?);
    let page_length = u32::from(r.u16()?);
    let info = (exists && page_length > 0).then_some(FileInfo {
        identifier,
        owned,
        attributes,
        page_length,
    });
    Ok((identifier, info))
}

/// Identifier of a data response, without parsing the rest.
pub fn data_identifier(payload: &[u8]) -> Result<FileId> {
    Ok(FileId::from_raw(PayloadReader::require(payload, 1)?.u8()?))
}

/// Echoed address and data of a data response (identifier skipped).
pub fn parse_file_data(payload: &[u8]) -> Result<(u32, &[u8])> {
    let mut r = PayloadReader::require(payload, DATA_OVERHEAD)?;
    r.skip(1)?;
    let addr = r.u32()?;
    Ok((addr, r.rest()))
}

// ── Device-side encoders (simulator) ──────────────────────────

fn response(command: Command, payload: Vec<u8>) -> Result<Frame> {
    Frame::extended(command.id(), address::HOST, address::MOTHERBOARD, payload)
}

pub fn header_response(cap: &EfsCapacity) -> Result<Frame> {
    let mut p = Vec::with_capacity(HEADER_INFO_LEN);
    p.extend_from_slice(&cap.identifier);
    p.push(cap.file_version);
    p.extend_from_slice(&cap.page_size.to_le_bytes());
    p.extend_from_slice(&cap.total_pages.to_le_bytes());
    p.resize(16, 0);
    p.extend_from_slice(&cap.max_files.to_le_bytes());
    p.extend_from_slice(&cap.files_remaining.to_le_bytes());
    p.extend_from_slice(&cap.pages_remaining.to_le_bytes());
    response(Command::EfsGetHwInfo, p)
}

pub fn file_info_response(id: FileId, info: Option<&FileInfo>) -> Result<Frame> {
    let (exists, owned, attrs, pages) = match info {
        Some(i) => (1, u8::from(i.owned), i.attributes.bits(), i.page_length as u16),
        None => (0, 0, 0, 0),
    };
    let [lo, hi] = pages.to_le_bytes();
    response(Command::EfsGetFileInfo, vec![id.raw(), exists, owned, attrs, lo, hi])
}

pub fn file_data_response(id: FileId, addr: u32, data: &[u8]) -> Result<Frame> {
    response(Command::EfsGetFileData, data_payload(id, addr, data))
}
