//! Request/response flows for motherboard and slot identity.
//!
//! Each flow arms a [`Waiter`], sends one frame and awaits the matching
//! response routed here from the reader thread. Responses carry no request
//! id, so each flow holds its own gate for the whole exchange.

use std::sync::{Arc, Mutex, PoisonError};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use log::{debug, info, warn};

use super::Link;
use super::identity::{AllowedDevices, DeviceInfo, HwInfo, SERIAL_LEN};
use crate::apt::codec::Frame;
use crate::apt::dispatch::{DispatcherBuilder, Inbound};
use crate::apt::protocol::{Command, SLOT_COUNT, address};
use crate::apt::waiter::Waiter;
use crate::efs::EfsDriver;
use crate::error::{Error, ProtocolViolation, Result};

/// Profile tag for identity and configuration traffic.
pub const SYSTEM_PROFILE: &str = "system";

/// Key the firmware expects in front of a new serial number.
const SERIAL_KEY: &[u8; 4] = b"THOR";

/// `p1` of an identify request addressed to the whole system.
const IDENTIFY_ALL: u8 = 0xFF;

type Gate = AsyncMutex<CriticalSectionRawMutex, ()>;

/// Waiters and gates shared between the link and its inbound handlers.
pub(crate) struct SystemState {
    hw_info: Waiter<HwInfo>,
    device: Waiter<DeviceInfo>,
    allowed: Waiter<AllowedDevices>,
    serial_ack: Waiter<u8>,
    hw_gate: Gate,
    device_gate: Gate,
    allowed_gate: Gate,
    serial_gate: Gate,
}

impl SystemState {
    pub(crate) fn new() -> Self {
        Self {
            hw_info: Waiter::new(),
            device: Waiter::new(),
            allowed: Waiter::new(),
            serial_ack: Waiter::new(),
            hw_gate: AsyncMutex::new(()),
            device_gate: AsyncMutex::new(()),
            allowed_gate: AsyncMutex::new(()),
            serial_gate: AsyncMutex::new(()),
        }
    }

    /// Clear values left over from the previous session.
    pub(crate) fn reset(&self) {
        self.hw_info.arm();
        self.device.arm();
        self.allowed.arm();
        self.serial_ack.arm();
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        builder: DispatcherBuilder,
        current: Arc<Mutex<Option<HwInfo>>>,
        efs: EfsDriver,
    ) -> DispatcherBuilder {
        let (hw, mcm_hw, dev, allowed, serial) = (
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
        );
        let mcm_current = current.clone();
        let mcm_efs = efs.clone();
        builder
            .on(Command::HwGetInfo, move |inb| {
                hw.on_hw_info(inb, &current, &efs)
            })
            .on(Command::McmHwGetInfo, move |inb| {
                mcm_hw.on_hw_info(inb, &mcm_current, &mcm_efs)
            })
            .on(Command::GetDevice, move |inb| {
                dev.device.signal(DeviceInfo::parse(inb.payload())?);
                Ok(())
            })
            .on(Command::McmGetAllowedDevices, move |inb| {
                allowed.allowed.signal(AllowedDevices::parse(inb.payload())?);
                Ok(())
            })
            .on(Command::GetSerStatus, move |inb| {
                // Extended replies carry the status byte; short ones put it in p1.
                let status = inb.payload().first().copied().unwrap_or(inb.frame.param1);
                serial.serial_ack.signal(status);
                Ok(())
            })
    }

    fn on_hw_info(
        &self,
        inb: &Inbound<'_>,
        current: &Mutex<Option<HwInfo>>,
        efs: &EfsDriver,
    ) -> Result<()> {
        let info = HwInfo::parse(inb.payload())?;
        efs.set_payload_limit(info.payload_limit);
        *current.lock().unwrap_or_else(PoisonError::into_inner) = Some(info.clone());
        self.hw_info.signal(info);
        Ok(())
    }
}

fn check_slot(slot: u8) -> Result<()> {
    if slot >= SLOT_COUNT {
        return Err(Error::InvalidArgument("slot index out of range"));
    }
    Ok(())
}

fn request(command: Command, p1: u8) -> Frame {
    Frame::short(command.id(), p1, 0, address::MOTHERBOARD, address::HOST)
}

impl Link {
    fn system_send(&self, frame: &Frame) -> Result<()> {
        self.send_frame(SYSTEM_PROFILE, frame)
    }

    /// Re-read the motherboard identity over a running session.
    pub async fn request_hw_info(&self) -> Result<HwInfo> {
        let _gate = self.system.hw_gate.lock().await;
        self.system.hw_info.arm();
        self.system_send(&request(Command::McmHwReqInfo, 0))?;
        self.system
            .hw_info
            .wait(self.config.response_timeout())
            .await
            .ok_or(Error::Timeout("hardware info"))
    }

    /// Identity of the card in `slot` (zero-based).
    pub async fn query_device(&self, slot: u8) -> Result<DeviceInfo> {
        check_slot(slot)?;
        let _gate = self.system.device_gate.lock().await;
        self.system.device.arm();
        self.system_send(&request(Command::ReqDevice, slot))?;
        let info = self
            .system
            .device
            .wait(self.config.response_timeout())
            .await
            .ok_or(Error::Timeout("device info"))?;
        if info.slot != slot {
            warn!("system: asked for slot {}, device answered for {}", slot, info.slot);
            return Err(ProtocolViolation::IdentifierMismatch {
                expected: slot,
                actual: info.slot,
            }
            .into());
        }
        debug!("system: slot {} -> {:?}", slot, info.part_number);
        Ok(info)
    }

    pub async fn query_allowed_devices(&self, slot: u8) -> Result<AllowedDevices> {
        check_slot(slot)?;
        let _gate = self.system.allowed_gate.lock().await;
        self.system.allowed.arm();
        self.system_send(&request(Command::McmReqAllowedDevices, slot))?;
        let list = self
            .system
            .allowed
            .wait(self.config.response_timeout())
            .await
            .ok_or(Error::Timeout("allowed devices"))?;
        if list.slot != slot {
            return Err(ProtocolViolation::IdentifierMismatch {
                expected: slot,
                actual: list.slot,
            }
            .into());
        }
        Ok(list)
    }

    /// Replace a slot's allowed-device list. The device does not answer.
    pub fn set_allowed_devices(&self, list: &AllowedDevices) -> Result<()> {
        check_slot(list.slot)?;
        let frame = Frame::extended(
            Command::McmSetAllowedDevices.id(),
            address::MOTHERBOARD,
            address::HOST,
            list.to_payload(),
        )?;
        self.system_send(&frame)
    }

    /// Write a new USB serial number to the motherboard EEPROM.
    ///
    /// Returns whether the device acknowledged it. The new number is only
    /// reported after the device re-enumerates.
    pub async fn program_serial_number(&self, serial: &str) -> Result<bool> {
        // The field keeps a NUL terminator.
        if serial.is_empty() || serial.len() >= SERIAL_LEN || !serial.is_ascii() {
            return Err(Error::InvalidArgument("serial number must be 1-17 ASCII bytes"));
        }
        let mut payload = Vec::with_capacity(SERIAL_KEY.len() + SERIAL_LEN);
        payload.extend_from_slice(SERIAL_KEY);
        payload.extend_from_slice(serial.as_bytes());
        payload.resize(SERIAL_KEY.len() + SERIAL_LEN, 0);
        let frame = Frame::extended(
            Command::SetSerToEeprom.id(),
            address::MOTHERBOARD,
            address::HOST,
            payload,
        )?;

        let _gate = self.system.serial_gate.lock().await;
        self.system.serial_ack.arm();
        self.system_send(&frame)?;
        let status = self
            .system
            .serial_ack
            .wait(self.config.response_timeout())
            .await
            .ok_or(Error::Timeout("serial number acknowledge"))?;
        let ok = status == 1;
        if ok {
            info!("system: serial number set to {}", serial);
        } else {
            warn!("system: serial number write refused (status {})", status);
        }
        Ok(ok)
    }

    /// Flash the identify LED of one slot, or of the whole system for `None`.
    pub fn identify(&self, slot: Option<u8>) -> Result<()> {
        let p1 = match slot {
            Some(s) => {
                check_slot(s)?;
                s
            }
            None => IDENTIFY_ALL,
        };
        self.system_send(&request(Command::ModIdentify, p1))
    }
}
