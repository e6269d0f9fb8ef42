//! Wire framing for fragmented and batched packages.
//!
//! All multi-byte integers are little-endian. The per-mode layouts:
//!
//! ```text
//! single:                     <package bytes>
//! batch:                      (<u32 len><len bytes>)+
//! fragment-single-producer:   <u32 fragId><u8 flags>(<u32 len><len bytes>)+
//! fragment-multiple-producer: <16-byte producerId><u32 fragId><u8 flags>(<u32 len><len bytes>)+
//! ```

use thiserror::Error;

/// Bytes used for each length prefix in batch and fragment modes.
pub const LEN_PREFIX_SIZE: usize = 4;

/// `<u32 fragId><u8 flags>` header present in both fragment modes.
pub const FRAGMENT_HEADER_SIZE: usize = 5;

pub const PRODUCER_ID_SIZE: usize = 16;

/// Per-action overhead in fragment-single-producer mode.
pub const SINGLE_PRODUCER_OVERHEAD: usize = FRAGMENT_HEADER_SIZE;

/// Per-action overhead in fragment-multiple-producer mode.
pub const MULTIPLE_PRODUCER_OVERHEAD: usize = PRODUCER_ID_SIZE + FRAGMENT_HEADER_SIZE;

/// Set when the first fragment in an action continues a package started in
/// an earlier action.
pub const FLAG_CONTINUE_LAST_PACKAGE: u8 = 0x01;

/// Set when the last fragment in an action does not finish its package.
pub const FLAG_CONTINUE_NEXT_PACKAGE: u8 = 0x02;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("truncated frame: need {needed} bytes at offset {offset}, have {len}")]
    Truncated {
        offset: usize,
        needed: usize,
        len: usize,
    },
}

/// Bounds-checked cursor over one decoded action payload.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn has_remaining(&self) -> bool {
        self.offset < self.buf.len()
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], FramingError> {
        if self.offset + needed > self.buf.len() {
            return Err(FramingError::Truncated {
                offset: self.offset,
                needed,
                len: self.buf.len(),
            });
        }
        let slice = &self.buf[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, FramingError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, FramingError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_producer_id(&mut self) -> Result<[u8; PRODUCER_ID_SIZE], FramingError> {
        let bytes = self.take(PRODUCER_ID_SIZE)?;
        let mut id = [0u8; PRODUCER_ID_SIZE];
        id.copy_from_slice(bytes);
        Ok(id)
    }

    /// Read one `<u32 len><len bytes>` block.
    pub fn read_block(&mut self) -> Result<&'a [u8], FramingError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }
}

/// Append a little-endian length prefix followed by the block itself.
pub fn put_block(out: &mut Vec<u8>, block: &[u8]) {
    put_u32(out, block.len() as u32);
    out.extend_from_slice(block);
}

pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overheads_match_wire_layout() {
        assert_eq!(SINGLE_PRODUCER_OVERHEAD, 5);
        assert_eq!(MULTIPLE_PRODUCER_OVERHEAD, 21);
        assert_eq!(LEN_PREFIX_SIZE, 4);
    }

    #[test]
    fn u32_is_little_endian() {
        let mut out = Vec::new();
        put_u32(&mut out, 0x0102_0304);
        assert_eq!(out, vec![0x04, 0x03, 0x02, 0x01]);

        let mut reader = FrameReader::new(&out);
        assert_eq!(reader.read_u32().unwrap(), 0x0102_0304);
        assert!(!reader.has_remaining());
    }

    #[test]
    fn block_roundtrip() {
        let mut out = Vec::new();
        put_block(&mut out, b"hello");
        put_block(&mut out, b"");
        put_block(&mut out, b"world");

        let mut reader = FrameReader::new(&out);
        assert_eq!(reader.read_block().unwrap(), b"hello");
        assert_eq!(reader.read_block().unwrap(), b"");
        assert_eq!(reader.read_block().unwrap(), b"world");
        assert!(!reader.has_remaining());
    }

    #[test]
    fn truncated_block_reports_offset() {
        let mut out = Vec::new();
        put_u32(&mut out, 10); // promises 10 bytes
        out.extend_from_slice(b"abc"); // delivers 3

        let mut reader = FrameReader::new(&out);
        let err = reader.read_block().unwrap_err();
        assert_eq!(
            err,
            FramingError::Truncated {
                offset: 4,
                needed: 10,
                len: 7
            }
        );
    }

    #[test]
    fn truncated_header_errors() {
        let bytes = [0u8; 3];
        let mut reader = FrameReader::new(&bytes);
        assert!(reader.read_u32().is_err());

        let bytes = [0u8; 15];
        let mut reader = FrameReader::new(&bytes);
        assert!(reader.read_producer_id().is_err());
    }

    #[test]
    fn producer_id_roundtrip() {
        let id: Vec<u8> = (0..16).collect();
        let mut reader = FrameReader::new(&id);
        let parsed = reader.read_producer_id().unwrap();
        assert_eq!(parsed.to_vec(), id);
    }
}
