/// Binary encoding of on-store records
///
/// Every structure is wrapped in a versioned envelope: struct version (u8),
/// compat version (u8) and payload length (u32 LE). Decoders refuse payloads
/// whose compat version is newer than they understand and skip unknown
/// trailing fields of newer versions they can still read.
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use std::io::{Cursor, Read};

use crate::error::DecodeError;

pub mod backtrace;
pub mod dirfrag;
pub mod inode;

pub use backtrace::{Backtrace, BacktraceAncestor, ChainDefect};
pub use dirfrag::{Dentry, DirFrag, FragStat, Fnode};
pub use inode::{FileLayout, InodeRecord, FLAG_PLACEHOLDER};

/// Longest entry name accepted from evidence
pub const NAME_MAX: usize = 255;

/// Types with an on-store encoding
pub trait Encode {
    fn encode(&self, enc: &mut Encoder);

    fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode(&mut enc);
        enc.into_bytes()
    }
}

/// Types that can be read back from their on-store encoding
pub trait Decode: Sized {
    const WHAT: &'static str;

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError>;

    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(data, Self::WHAT);
        Self::decode(&mut dec)
    }
}

/// Append-only little-endian writer
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
    open: Vec<usize>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an envelope; must be paired with [`Encoder::finish`]
    pub fn start(&mut self, version: u8, compat: u8) {
        self.buf.push(version);
        self.buf.push(compat);
        self.open.push(self.buf.len());
        self.buf.extend_from_slice(&[0u8; 4]);
    }

    /// Close the innermost envelope and patch its length
    pub fn finish(&mut self) {
        if let Some(len_at) = self.open.pop() {
            let payload = (self.buf.len() - len_at - 4) as u32;
            LittleEndian::write_u32(&mut self.buf[len_at..len_at + 4], payload);
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        let mut raw = [0u8; 4];
        LittleEndian::write_u32(&mut raw, value);
        self.buf.extend_from_slice(&raw);
    }

    pub fn put_u64(&mut self, value: u64) {
        let mut raw = [0u8; 8];
        LittleEndian::write_u64(&mut raw, value);
        self.buf.extend_from_slice(&raw);
    }

    pub fn put_i64(&mut self, value: i64) {
        let mut raw = [0u8; 8];
        LittleEndian::write_i64(&mut raw, value);
        self.buf.extend_from_slice(&raw);
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn put_time(&mut self, value: &DateTime<Utc>) {
        self.put_i64(value.timestamp());
        self.put_u32(value.timestamp_subsec_nanos());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based reader matching [`Encoder`]
pub struct Decoder<'a> {
    cursor: Cursor<&'a [u8]>,
    what: &'static str,
    ends: Vec<u64>,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8], what: &'static str) -> Self {
        Self {
            cursor: Cursor::new(data),
            what,
            ends: Vec::new(),
        }
    }

    fn limit(&self) -> u64 {
        self.ends
            .last()
            .copied()
            .unwrap_or(self.cursor.get_ref().len() as u64)
    }

    /// Bytes left in the innermost open envelope (or the whole buffer)
    pub fn remaining(&self) -> usize {
        self.limit().saturating_sub(self.cursor.position()) as usize
    }

    fn need(&self, bytes: usize) -> Result<(), DecodeError> {
        if self.remaining() < bytes {
            return Err(DecodeError::Truncated(self.what));
        }
        Ok(())
    }

    /// Enter an envelope, returning its struct version
    pub fn start(&mut self, supported: u8) -> Result<u8, DecodeError> {
        let version = self.u8()?;
        let compat = self.u8()?;
        let len = self.u32()? as usize;
        if compat > supported {
            return Err(DecodeError::Incompatible {
                what: self.what,
                compat,
                supported,
            });
        }
        self.need(len)?;
        self.ends.push(self.cursor.position() + len as u64);
        Ok(version)
    }

    /// Leave the innermost envelope, skipping fields this build does not know
    pub fn finish(&mut self) -> Result<(), DecodeError> {
        let end = self.ends.pop().ok_or_else(|| DecodeError::Invalid {
            what: self.what,
            reason: "unbalanced envelope".to_string(),
        })?;
        if self.cursor.position() > end {
            return Err(DecodeError::Invalid {
                what: self.what,
                reason: "field overran its envelope".to_string(),
            });
        }
        self.cursor.set_position(end);
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        self.cursor
            .read_u8()
            .map_err(|_| DecodeError::Truncated(self.what))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated(self.what))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        self.need(8)?;
        self.cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated(self.what))
    }

    pub fn i64(&mut self) -> Result<i64, DecodeError> {
        self.need(8)?;
        self.cursor
            .read_i64::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated(self.what))
    }

    /// Read a collection length, rejecting counts the buffer cannot hold
    pub fn count(&mut self, min_item_size: usize) -> Result<usize, DecodeError> {
        let count = self.u32()? as usize;
        if count.saturating_mul(min_item_size.max(1)) > self.remaining() {
            return Err(DecodeError::Truncated(self.what));
        }
        Ok(count)
    }

    pub fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let mut raw = vec![0u8; len];
        self.cursor
            .read_exact(&mut raw)
            .map_err(|_| DecodeError::Truncated(self.what))?;
        String::from_utf8(raw).map_err(|e| DecodeError::Invalid {
            what: self.what,
            reason: format!("name is not UTF-8: {}", e),
        })
    }

    pub fn time(&mut self) -> Result<DateTime<Utc>, DecodeError> {
        let secs = self.i64()?;
        let nanos = self.u32()?;
        DateTime::from_timestamp(secs, nanos).ok_or_else(|| DecodeError::Invalid {
            what: self.what,
            reason: format!("timestamp {}.{:09} out of range", secs, nanos),
        })
    }
}

/// Encode a u64 accumulator xattr value
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut raw = vec![0u8; 8];
    LittleEndian::write_u64(&mut raw, value);
    raw
}

/// Decode a u64 accumulator xattr value
pub fn decode_u64(raw: &[u8]) -> Result<u64, DecodeError> {
    if raw.len() != 8 {
        return Err(DecodeError::Invalid {
            what: "u64 xattr",
            reason: format!("expected 8 bytes, found {}", raw.len()),
        });
    }
    Ok(LittleEndian::read_u64(raw))
}
