//! Bounds-checked little-endian payload parsing.
//!
//! Inbound handlers read fixed layouts at fixed offsets. Every read goes
//! through [`PayloadReader`] so a short or truncated payload is rejected as
//! [`MalformedFrame::ShortPayload`] instead of panicking on the reader thread.

use crate::error::{MalformedFrame, Result};

/// Cursor over a response payload.
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Fail early unless the payload holds at least `len` bytes.
    pub fn require(data: &'a [u8], len: usize) -> Result<Self> {
        if data.len() < len {
            return Err(MalformedFrame::ShortPayload {
                needed: len,
                actual: data.len(),
            }
            .into());
        }
        Ok(Self::new(data))
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Jump to an absolute offset.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(self.short(pos));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.seek(self.pos + n)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let slice = self.data.get(self.pos..end).ok_or_else(|| self.short(end))?;
        self.pos = end;
        Ok(slice)
    }

    /// Everything from the cursor to the end.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Fixed-width ASCII field, NUL padded. Trailing NULs and spaces are trimmed.
    pub fn ascii<const N: usize>(&mut self, width: usize) -> Result<heapless::String<N>> {
        let raw = self.bytes(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let text = core::str::from_utf8(&raw[..end])
            .ok()
            .filter(|s| s.is_ascii())
            .ok_or(MalformedFrame::InvalidText)?;
        let mut out = heapless::String::new();
        out.push_str(text.trim_end())
            .map_err(|()| MalformedFrame::InvalidText)?;
        Ok(out)
    }

    /// Fixed-width text field from device memory. Decoding stops at the first
    /// NUL or non-printable byte, so an erased (0xFF) field reads as empty.
    pub fn text<const N: usize>(&mut self, width: usize) -> Result<heapless::String<N>> {
        let raw = self.bytes(width)?;
        let mut out = heapless::String::new();
        for &b in raw.iter().take_while(|b| b.is_ascii_graphic() || **b == b' ') {
            if out.push(char::from(b)).is_err() {
                break;
            }
        }
        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
        Ok(out)
    }

    fn short(&self, needed: usize) -> crate::error::Error {
        MalformedFrame::ShortPayload {
            needed,
            actual: self.data.len(),
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn reads_little_endian_fields() {
        let data = [0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12, b'A', b'B', 0, 0];
        let mut r = PayloadReader::new(&data);
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.u32().unwrap(), 0x1234_5678);
        assert_eq!(r.ascii::<4>(4).unwrap().as_str(), "AB");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn short_payload_is_rejected_not_panicking() {
        let data = [0x01, 0x02, 0x03];
        let mut r = PayloadReader::new(&data);
        assert_eq!(
            r.u32(),
            Err(Error::Malformed(MalformedFrame::ShortPayload {
                needed: 4,
                actual: 3
            }))
        );
        assert!(PayloadReader::require(&data, 6).is_err());
        assert!(r.seek(4).is_err());
    }

    #[test]
    fn non_ascii_text_is_rejected() {
        let data = [0xC3, 0xA9, 0x00, 0x00];
        let mut r = PayloadReader::new(&data);
        assert_eq!(
            r.ascii::<4>(4),
            Err(Error::Malformed(MalformedFrame::InvalidText))
        );
    }

    #[test]
    fn device_text_stops_at_first_unprintable_byte() {
        let erased = [0xFF; 6];
        assert_eq!(PayloadReader::new(&erased).text::<6>(6).unwrap().as_str(), "");

        let data = [b'S', b'N', b'1', b' ', 0xFF, b'X', 0x00, 0x00];
        let mut r = PayloadReader::new(&data);
        assert_eq!(r.text::<8>(8).unwrap().as_str(), "SN1");
        assert_eq!(r.remaining(), 0);

        assert!(PayloadReader::new(&data).text::<8>(9).is_err());
    }
}
