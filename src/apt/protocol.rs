//! Wire constants: header geometry, unit addresses and command ids.
//!
//! Every literal that appears on the wire lives here. Callers use the typed
//! [`Command`] enum; raw `u16` ids only appear at the dispatcher boundary so
//! feature modules can register ids this crate does not model.

/// Fixed header: `[cmd_lsb, cmd_msb, p1, p2, dest, source]`.
pub const HEADER_LEN: usize = 6;

/// Set on `dest` when a payload of `p1 | p2 << 8` bytes follows the header.
pub const EXTENDED_FLAG: u8 = 0x80;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Number of add-in card bays on the motherboard.
pub const SLOT_COUNT: u8 = 8;

/// Unit addresses carried in the `dest` / `source` header bytes.
pub mod address {
    /// The host PC.
    pub const HOST: u8 = 0x01;
    /// The motherboard controller.
    pub const MOTHERBOARD: u8 = 0x11;
    /// First card bay; bay N answers on `SLOT_BASE + N`.
    pub const SLOT_BASE: u8 = 0x21;
}

/// Address of card bay `index` (zero-based).
pub const fn slot_address(index: u8) -> u8 {
    address::SLOT_BASE + index
}

/// Zero-based bay index if `addr` (extended flag ignored) names a card bay.
pub const fn slot_from_address(addr: u8) -> Option<u8> {
    let unit = addr & !EXTENDED_FLAG;
    if unit >= address::SLOT_BASE && unit < address::SLOT_BASE + SLOT_COUNT {
        Some(unit - address::SLOT_BASE)
    } else {
        None
    }
}

macro_rules! commands {
    ($( $(#[$doc:meta])* $name:ident = $id:literal, )*) => {
        /// Command ids this crate sends or understands.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Command {
            $( $(#[$doc])* $name = $id, )*
        }

        impl Command {
            /// Look up a known command by wire id.
            pub const fn from_id(id: u16) -> Option<Self> {
                match id {
                    $( $id => Some(Self::$name), )*
                    _ => None,
                }
            }

            /// Stable name for log lines.
            pub const fn name(self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )*
                }
            }
        }
    };
}

commands! {
    /// Flash the front-panel LED of a unit.
    ModIdentify = 0x0223,

    // ── Identity ──────────────────────────────────────────
    HwReqInfo = 0x0005,
    HwGetInfo = 0x0006,
    /// Motherboard hardware info request; used as the connect handshake.
    McmHwReqInfo = 0x4000,
    McmHwGetInfo = 0x4001,
    BlReqFirmwareVer = 0x002F,
    BlGetFirmwareVer = 0x0030,

    // ── Serial number programming ─────────────────────────
    SetSerToEeprom = 0x00A0,
    GetSerStatus = 0x00A1,

    // ── Per-slot device identity ──────────────────────────
    ReqDevice = 0x4006,
    GetDevice = 0x4007,
    McmSetAllowedDevices = 0x40F2,
    McmReqAllowedDevices = 0x40F3,
    McmGetAllowedDevices = 0x40F4,

    // ── Status polling ────────────────────────────────────
    BoardReqStatusUpdate = 0x4010,
    BoardGetStatusUpdate = 0x4011,
    McmReqStatusUpdate = 0x4044,
    McmGetStatusUpdate = 0x4045,
    MotReqStatusUpdate = 0x0480,
    MotGetStatusUpdate = 0x0481,

    // ── Embedded file system ──────────────────────────────
    EfsReqHwInfo = 0x40F8,
    EfsGetHwInfo = 0x40F9,
    EfsSetFileInfo = 0x40FA,
    EfsReqFileInfo = 0x40FB,
    EfsGetFileInfo = 0x40FC,
    EfsSetFileData = 0x40FD,
    EfsReqFileData = 0x40FE,
    EfsGetFileData = 0x40FF,
}

impl Command {
    pub const fn id(self) -> u16 {
        self as u16
    }
}

/// Log-friendly name for any id, known or not.
pub fn command_name(id: u16) -> &'static str {
    Command::from_id(id).map_or("unknown", Command::name)
}
