//! Host-side APT serial link.
//!
//! Talks to a multi-slot motion-controller motherboard over one USB-CDC or
//! FTDI serial port: frames the wire protocol, paces outbound traffic,
//! routes responses, and drives the embedded file system on the device.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  Link (session)                                                │
//! │    EfsDriver · system queries · caller routes                  │
//! │                                                                │
//! │  ──────────────── FrameSink / Dispatcher ─────────────────     │
//! │                                                                │
//! │  ProfileLock ─▶ OutboundScheduler ─▶ apt-writer ─▶ PortWriter  │
//! │  PortReader ─▶ apt-reader ─▶ FrameDecoder ─▶ Dispatcher        │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The port itself is supplied by the host through
//! [`PortProvider`](apt::transport::PortProvider); [`sim`] provides an
//! in-process motherboard for tests and demos.

#![deny(unused_must_use)]

pub mod apt;
pub mod config;
pub mod diagnostics;
pub mod efs;
pub mod error;
pub mod events;
pub mod link;
pub mod ports;
pub mod profile_lock;
pub mod scheduler;
pub mod sim;

pub use config::{DeviceClass, LinkConfig};
pub use error::{Error, Result};
pub use events::{EventBus, LinkEvent};
pub use link::{ConnectionState, Link, LinkBuilder};
pub use scheduler::Priority;
