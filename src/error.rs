//! Unified error types for the APT link.
//!
//! A single `Error` enum that every layer converts into. All variants are
//! `Copy` so they can be stored in the link fault slot and handed across
//! threads without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level link error
// ---------------------------------------------------------------------------

/// Every fallible operation in the crate funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The physical port failed. The session tears down and reconnects.
    Transport(TransportError),
    /// A response was inconsistent with the outstanding request.
    Protocol(ProtocolViolation),
    /// No response arrived within the bounded wait.
    Timeout(&'static str),
    /// The EFS entry does not exist on the device.
    NotFound,
    /// An EFS create asked for more than the device has left.
    CapacityExceeded { requested: u32, remaining: u32 },
    /// An inbound frame or payload could not be parsed.
    Malformed(MalformedFrame),
    /// No session is open.
    NotConnected,
    /// The device refused a request.
    Rejected(&'static str),
    /// Read-back after an upload differed from what was written.
    VerifyFailed { offset: u32 },
    /// A caller-supplied argument is out of range.
    InvalidArgument(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Protocol(e) => write!(f, "protocol violation: {e}"),
            Self::Timeout(what) => write!(f, "timed out waiting for {what}"),
            Self::NotFound => write!(f, "not found"),
            Self::CapacityExceeded {
                requested,
                remaining,
            } => write!(f, "capacity exceeded: requested {requested}, {remaining} remaining"),
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Rejected(what) => write!(f, "device rejected {what}"),
            Self::VerifyFailed { offset } => write!(f, "verify failed at offset {offset}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The peer closed the channel.
    Closed,
    /// The port could not be opened.
    OpenFailed,
    /// Underlying I/O failure.
    Io(std::io::ErrorKind),
    /// A worker thread could not be spawned.
    Spawn,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "port closed"),
            Self::OpenFailed => write!(f, "port open failed"),
            Self::Io(kind) => write!(f, "I/O error ({kind})"),
            Self::Spawn => write!(f, "thread spawn failed"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if let Some(inner) = e.get_ref().and_then(|i| i.downcast_ref::<Self>()) {
            return *inner;
        }
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout("port"),
            std::io::ErrorKind::UnexpectedEof => Self::Malformed(MalformedFrame::Truncated),
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => {
                Self::Transport(TransportError::Closed)
            }
            kind => Self::Transport(TransportError::Io(kind)),
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol violations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// An EFS data response echoed a different address than requested.
    AddressMismatch { expected: u32, actual: u32 },
    /// A response carried an identifier other than the one asked for.
    IdentifierMismatch { expected: u8, actual: u8 },
    /// A response arrived for a command we did not expect.
    UnexpectedCommand(u16),
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressMismatch { expected, actual } => {
                write!(f, "address mismatch (expected {expected:#x}, got {actual:#x})")
            }
            Self::IdentifierMismatch { expected, actual } => {
                write!(f, "identifier mismatch (expected {expected:#04x}, got {actual:#04x})")
            }
            Self::UnexpectedCommand(id) => write!(f, "unexpected command {id:#06x}"),
        }
    }
}

impl From<ProtocolViolation> for Error {
    fn from(e: ProtocolViolation) -> Self {
        Self::Protocol(e)
    }
}

// ---------------------------------------------------------------------------
// Malformed frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedFrame {
    /// The byte source ended before the frame was complete.
    Truncated,
    /// A payload was shorter than its layout requires.
    ShortPayload { needed: usize, actual: usize },
    /// A payload exceeds the 16-bit length field.
    PayloadTooLarge(usize),
    /// A text field was not valid ASCII.
    InvalidText,
}

impl fmt::Display for MalformedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated"),
            Self::ShortPayload { needed, actual } => {
                write!(f, "payload too short ({actual} < {needed})")
            }
            Self::PayloadTooLarge(len) => write!(f, "payload of {len} bytes exceeds 65535"),
            Self::InvalidText => write!(f, "invalid text field"),
        }
    }
}

impl From<MalformedFrame> for Error {
    fn from(e: MalformedFrame) -> Self {
        Self::Malformed(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        let e = Error::from(ProtocolViolation::AddressMismatch {
            expected: 0x10,
            actual: 0x20,
        });
        assert_eq!(
            e.to_string(),
            "protocol violation: address mismatch (expected 0x10, got 0x20)"
        );
        assert_eq!(Error::Timeout("EFS lookup").to_string(), "timed out waiting for EFS lookup");
    }

    #[test]
    fn io_errors_map_to_taxonomy() {
        let timed_out = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(Error::from(timed_out), Error::Timeout("port"));

        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(Error::from(eof), Error::Malformed(MalformedFrame::Truncated));

        let broken = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert_eq!(Error::from(broken), Error::Transport(TransportError::Closed));

        let wrapped = std::io::Error::other(Error::NotConnected);
        assert_eq!(Error::from(wrapped), Error::NotConnected);
    }
}
