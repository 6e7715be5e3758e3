//! Link configuration parameters
//!
//! All tunable timing and retry parameters for one serial session.
//! The host application builds this from its own settings store; the demo
//! binary can load it from a JSON file.

use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Serialize};

/// How the motherboard is attached. Selects write pacing and whether the
/// identity handshake runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Native USB-CDC, running application firmware.
    Application,
    /// Native USB-CDC, running the bootloader. No handshake.
    Bootloader,
    /// Application firmware behind an FTDI serial bridge.
    FtdiBridge,
}

/// Core link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    // --- Port ---
    /// Serial baud rate (8N1)
    pub baud_rate: u32,
    /// Receive buffer handed to each port read (bytes)
    pub read_buffer_size: usize,

    // --- Pacing ---
    /// Minimum spacing between physical writes on native USB (milliseconds)
    pub cooldown_ms: u32,
    /// Minimum spacing between physical writes through an FTDI bridge (milliseconds)
    pub ftdi_cooldown_ms: u32,
    /// Writer thread wakes at least this often to check for shutdown (milliseconds)
    pub writer_idle_timeout_ms: u32,
    /// Scheduler bookkeeping is pruned after this many sends
    pub cleanup_every: u32,

    // --- Responses ---
    /// Bounded wait for correlated responses (EFS, system queries) (milliseconds)
    pub response_timeout_ms: u32,
    /// Wait per identity handshake attempt (milliseconds)
    pub handshake_timeout_ms: u32,
    /// Handshake attempts before giving up
    pub handshake_retries: u8,

    // --- Recovery ---
    /// Reopen the port on the next send after a teardown
    pub auto_reconnect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            // Port
            baud_rate: 115_200,
            read_buffer_size: 1024,

            // Pacing
            cooldown_ms: 15,
            ftdi_cooldown_ms: 30,
            writer_idle_timeout_ms: 400,
            cleanup_every: 800,

            // Responses
            response_timeout_ms: 2000,
            handshake_timeout_ms: 500,
            handshake_retries: 5,

            // Recovery
            auto_reconnect: true,
        }
    }
}

/// Why a configuration was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    ValidationFailed(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationFailed(msg) => write!(f, "config validation failed: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl LinkConfig {
    /// Write pacing for the given device class.
    pub fn cooldown_for(&self, class: DeviceClass) -> Duration {
        let ms = match class {
            DeviceClass::Application | DeviceClass::Bootloader => self.cooldown_ms,
            DeviceClass::FtdiBridge => self.ftdi_cooldown_ms,
        };
        Duration::from_millis(u64::from(ms))
    }

    pub fn writer_idle_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.writer_idle_timeout_ms))
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.response_timeout_ms))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.handshake_timeout_ms))
    }

    /// Reject values that would stall or spin the link.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::ValidationFailed("baud_rate must be non-zero"));
        }
        if self.read_buffer_size < crate::apt::protocol::HEADER_LEN {
            return Err(ConfigError::ValidationFailed(
                "read_buffer_size must hold at least one header",
            ));
        }
        if self.writer_idle_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed("writer_idle_timeout_ms must be non-zero"));
        }
        if self.cleanup_every == 0 {
            return Err(ConfigError::ValidationFailed("cleanup_every must be non-zero"));
        }
        if self.response_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed("timeouts must be non-zero"));
        }
        if self.handshake_retries == 0 {
            return Err(ConfigError::ValidationFailed("handshake_retries must be at least 1"));
        }
        Ok(())
    }
}
