//! Port traits between the session and the protocol drivers built on it.
//!
//! ```text
//!   EfsDriver / feature modules ──▶ FrameSink ──▶ Link (profile lock → scheduler)
//! ```
//!
//! Drivers never touch the scheduler or the port directly. They hand frames
//! to a [`FrameSink`], which the session implements; tests substitute an
//! in-process responder.

use crate::apt::codec::Frame;
use crate::error::Result;

/// Outbound path for protocol drivers.
pub trait FrameSink: Send + Sync {
    /// Queue `frame` on behalf of the workflow tagged `profile`.
    ///
    /// Implementations wait for the profile lock to be free (or held by
    /// `profile`) and enqueue at Immediate priority, so frames from one
    /// workflow leave in call order. Fails with
    /// [`Error::NotConnected`](crate::error::Error::NotConnected) when no
    /// session is open.
    fn send_frame(&self, profile: &str, frame: &Frame) -> Result<()>;
}
