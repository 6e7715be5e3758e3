//! Identity payloads: motherboard hardware info and per-slot devices.
//!
//! ```text
//! HW_GET_INFO (84 bytes)
//!   0  legacy serial u32      4  model ASCII ×8       12 type u16
//!   14 fw patch, minor, major 17 cpld major, minor    19 USB serial ASCII ×18
//!   37 max payload u32        62 card type u16 ×8     78 board type u16
//!   80 mod state u16          82 slot count u16
//!
//! GET_DEVICE (32 bytes)
//!   0 slot, 0   2 device id u16   4 serial u64   12 slot type u16
//!   14 part number ASCII ×16      30 NUL         31 detected
//!
//! GET_ALLOWED_DEVICES
//!   0 slot, 0   2.. (slot type u16, device id u16) pairs
//! ```

use serde::{Deserialize, Serialize};

use crate::apt::payload::PayloadReader;
use crate::apt::protocol::SLOT_COUNT;
use crate::error::Result;

pub const HW_INFO_LEN: usize = 84;
pub const DEVICE_INFO_LEN: usize = 32;
pub const SERIAL_LEN: usize = 18;
pub const PART_NUMBER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl core::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Motherboard identity from the connect handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwInfo {
    pub model: heapless::String<8>,
    pub firmware: FirmwareVersion,
    pub cpld: (u8, u8),
    pub serial_number: heapless::String<SERIAL_LEN>,
    /// Largest extended payload the device accepts.
    pub payload_limit: u16,
    pub card_types: [u16; SLOT_COUNT as usize],
    pub board_type: u16,
    pub slot_count: u8,
}

impl HwInfo {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::require(payload, HW_INFO_LEN)?;
        r.seek(4)?;
        let model = r.text(8)?;
        r.seek(14)?;
        let patch = r.u8()?;
        let minor = r.u8()?;
        let major = r.u8()?;
        let cpld = (r.u8()?, r.u8()?);
        let serial_number = r.text(SERIAL_LEN)?;
        let payload_limit = u16::try_from(r.u32()?).unwrap_or(u16::MAX);
        r.seek(62)?;
        let mut card_types = [0u16; SLOT_COUNT as usize];
        for card in &mut card_types {
            *card = r.u16()?;
        }
        let board_type = r.u16()?;
        r.seek(82)?;
        let slot_count = r.u8()?;
        Ok(Self {
            model,
            firmware: FirmwareVersion {
                major,
                minor,
                patch,
            },
            cpld,
            serial_number,
            payload_limit,
            card_types,
            board_type,
            slot_count,
        })
    }

    /// Device-side encoding, used by the simulator.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut p = vec![0u8; HW_INFO_LEN];
        p[4..4 + self.model.len()].copy_from_slice(self.model.as_bytes());
        p[14] = self.firmware.patch;
        p[15] = self.firmware.minor;
        p[16] = self.firmware.major;
        p[17] = self.cpld.0;
        p[18] = self.cpld.1;
        p[19..19 + self.serial_number.len()].copy_from_slice(self.serial_number.as_bytes());
        p[37..41].copy_from_slice(&u32::from(self.payload_limit).to_le_bytes());
        for (i, card) in self.card_types.iter().enumerate() {
            let at = 62 + i * 2;
            p[at..at + 2].copy_from_slice(&card.to_le_bytes());
        }
        p[78..80].copy_from_slice(&self.board_type.to_le_bytes());
        p[82] = self.slot_count;
        p
    }
}

/// Identity of the card detected in one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub slot: u8,
    pub device_id: u16,
    pub serial_number: u64,
    pub slot_type: u16,
    pub part_number: heapless::String<PART_NUMBER_LEN>,
    pub detected: bool,
}

impl DeviceInfo {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::require(payload, DEVICE_INFO_LEN)?;
        let slot = r.u8()?;
        r.skip(1)?;
        let device_id = r.u16()?;
        let serial_number = r.u64()?;
        let slot_type = r.u16()?;
        let part_number = r.ascii(PART_NUMBER_LEN)?;
        r.seek(31)?;
        let detected = r.u8()? != 0;
        Ok(Self {
            slot,
            device_id,
            serial_number,
            slot_type,
            part_number,
            detected,
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut p = Vec::with_capacity(DEVICE_INFO_LEN);
        p.extend_from_slice(&[self.slot, 0]);
        p.extend_from_slice(&self.device_id.to_le_bytes());
        p.extend_from_slice(&self.serial_number.to_le_bytes());
        p.extend_from_slice(&self.slot_type.to_le_bytes());
        p.extend_from_slice(self.part_number.as_bytes());
        p.resize(31, 0);
        p.push(u8::from(self.detected));
        p
    }
}

/// One entry of a slot's allowed-device list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedDevice {
    pub slot_type: u16,
    pub device_id: u16,
}

/// Allowed-device list of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedDevices {
    pub slot: u8,
    pub devices: Vec<AllowedDevice>,
}

impl AllowedDevices {
    /// Trailing bytes that do not form a whole pair are ignored.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::require(payload, 2)?;
        let slot = r.u8()?;
        r.skip(1)?;
        let mut devices = Vec::with_capacity(r.remaining() / 4);
        while r.remaining() >= 4 {
            devices.push(AllowedDevice {
                slot_type: r.u16()?,
                device_id: r.u16()?,
            });
        }
        Ok(Self { slot, devices })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut p = Vec::with_capacity(2 + self.devices.len() * 4);
        p.extend_from_slice(&[self.slot, 0]);
        for d in &self.devices {
            p.extend_from_slice(&d.slot_type.to_le_bytes());
            p.extend_from_slice(&d.device_id.to_le_bytes());
        }
        p
    }
}
