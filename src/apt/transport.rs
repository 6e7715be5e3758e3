//! Transport abstraction: the duplex serial port, split into halves.
//!
//! The link owns exactly one reader (the `apt-reader` thread) and one
//! writer (the `apt-writer` thread), so the port is opened as two halves
//! that move to their threads independently.
//!
//! Concrete implementations:
//! - USB-CDC / FTDI serial ports, supplied by the host application
//! - [`memory_pair`], an in-process pipe used by the simulator and tests
//!
//! Port discovery is out of scope; a [`PortProvider`] is handed to the
//! link already knowing which device to open.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::DeviceClass;
use crate::error::{Result, TransportError};

/// Receive half of a serial port.
pub trait PortReader: Send {
    /// Read whatever is buffered, waiting at most the port's own read
    /// timeout. `Ok(0)` means nothing arrived in that window.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Drop any bytes already buffered on the receive side.
    fn discard_input(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Transmit half of a serial port.
pub trait PortWriter: Send {
    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Flush any buffered output.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An opened port, both halves plus how the device is attached.
pub struct OpenPort {
    pub reader: Box<dyn PortReader>,
    pub writer: Box<dyn PortWriter>,
    pub class: DeviceClass,
}

/// Opens the port for a new session. Called once per connect attempt;
/// dropping both halves closes the port.
pub trait PortProvider: Send + Sync {
    fn open(&self, baud_rate: u32) -> Result<OpenPort>;
}

// ── Read-until-N ─────────────────────────────────────────────

/// Adapts a [`PortReader`] to `std::io::Read` with an absolute deadline.
///
/// Each underlying `read` waits at most the port timeout, so the loop wakes
/// regularly instead of spinning; `read_exact` on this type is the
/// read-until-N-available primitive the blocking decoder needs.
pub struct DeadlineReader<'a> {
    port: &'a mut dyn PortReader,
    deadline: Instant,
}

impl<'a> DeadlineReader<'a> {
    pub fn new(port: &'a mut dyn PortReader, timeout: Duration) -> Self {
        Self {
            port,
            deadline: Instant::now() + timeout,
        }
    }
}

impl io::Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.port.read(buf) {
                Ok(0) => {
                    if Instant::now() >= self.deadline {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                }
                Ok(n) => return Ok(n),
                Err(e) => return Err(io::Error::other(e)),
            }
        }
    }
}

// ── In-memory pipe ───────────────────────────────────────────

struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeState {
                data: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        })
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.ready.notify_all();
    }
}

/// Receive half of an in-memory pipe.
pub struct MemoryReader {
    pipe: Arc<Pipe>,
    timeout: Duration,
}

/// Transmit half of an in-memory pipe. Dropping it closes the pipe.
pub struct MemoryWriter {
    pipe: Arc<Pipe>,
}

/// Remote control over both directions of a memory port, used to simulate
/// the device vanishing.
#[derive(Clone)]
pub struct MemoryCloser {
    pipes: [Arc<Pipe>; 2],
}

impl MemoryCloser {
    pub fn close(&self) {
        for pipe in &self.pipes {
            pipe.close();
        }
    }
}

/// One end of a memory port.
pub struct MemoryEnd {
    pub reader: MemoryReader,
    pub writer: MemoryWriter,
}

/// Two connected ends: bytes written on one are read on the other.
/// `read_timeout` bounds each `read` call on both ends.
pub fn memory_pair(read_timeout: Duration) -> (MemoryEnd, MemoryEnd, MemoryCloser) {
    let a_to_b = Pipe::new();
    let b_to_a = Pipe::new();
    let closer = MemoryCloser {
        pipes: [a_to_b.clone(), b_to_a.clone()],
    };
    let a = MemoryEnd {
        reader: MemoryReader {
            pipe: b_to_a.clone(),
            timeout: read_timeout,
        },
        writer: MemoryWriter {
            pipe: a_to_b.clone(),
        },
    };
    let b = MemoryEnd {
        reader: MemoryReader {
            pipe: a_to_b,
            timeout: read_timeout,
        },
        writer: MemoryWriter { pipe: b_to_a },
    };
    (a, b, closer)
}

fn poisoned() -> crate::error::Error {
    TransportError::Io(io::ErrorKind::Other).into()
}

impl PortReader for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let guard = self.pipe.state.lock().map_err(|_| poisoned())?;
        let (mut state, _) = self
            .pipe
            .ready
            .wait_timeout_while(guard, self.timeout, |s| s.data.is_empty() && !s.closed)
            .map_err(|_| poisoned())?;

        if state.data.is_empty() {
            return if state.closed {
                Err(TransportError::Closed.into())
            } else {
                Ok(0)
            };
        }
        let n = buf.len().min(state.data.len());
        for (dst, src) in buf.iter_mut().zip(state.data.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn discard_input(&mut self) -> Result<()> {
        let mut state = self.pipe.state.lock().map_err(|_| poisoned())?;
        state.data.clear();
        Ok(())
    }
}

impl PortWriter for MemoryWriter {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.pipe.state.lock().map_err(|_| poisoned())?;
        if state.closed {
            return Err(TransportError::Closed.into());
        }
        state.data.extend(data);
        drop(state);
        self.pipe.ready.notify_all();
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.pipe.close();
    }
}
