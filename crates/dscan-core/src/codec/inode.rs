/// Inode records and file layouts
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Backtrace, Decode, Decoder, Encode, Encoder};
use crate::error::DecodeError;
use crate::types::{
    is_dir_mode, InodeNo, PoolId, RootSpec, DEFAULT_CHUNK_SIZE, DIR_MODE, RECOVERED_FILE_MODE,
};

const LAYOUT_VERSION: u8 = 1;
const INODE_VERSION: u8 = 1;

/// Minimal directory inode standing in for an ancestor not yet seen directly
pub const FLAG_PLACEHOLDER: u32 = 0x1;

/// How a file's bytes are striped over data objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLayout {
    pub stripe_unit: u32,
    pub stripe_count: u32,
    pub object_size: u32,
    pub pool_id: PoolId,
}

impl FileLayout {
    /// One stripe per object, `chunk_size` bytes each
    pub fn for_chunk_size(chunk_size: u32, pool_id: PoolId) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            stripe_unit: chunk_size,
            stripe_count: 1,
            object_size: chunk_size,
            pool_id,
        }
    }
}

impl Encode for FileLayout {
    fn encode(&self, enc: &mut Encoder) {
        enc.start(LAYOUT_VERSION, 1);
        enc.put_u32(self.stripe_unit);
        enc.put_u32(self.stripe_count);
        enc.put_u32(self.object_size);
        enc.put_i64(self.pool_id);
        enc.finish();
    }
}

impl Decode for FileLayout {
    const WHAT: &'static str = "file layout";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.start(LAYOUT_VERSION)?;
        let layout = Self {
            stripe_unit: dec.u32()?,
            stripe_count: dec.u32()?,
            object_size: dec.u32()?,
            pool_id: dec.i64()?,
        };
        dec.finish()?;
        if layout.object_size == 0 {
            return Err(DecodeError::Invalid {
                what: Self::WHAT,
                reason: "object size is zero".to_string(),
            });
        }
        Ok(layout)
    }
}

/// Durable attributes of a file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub ino: InodeNo,
    pub mode: u32,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub layout: FileLayout,
    /// Last-known ancestry, kept for later re-verification
    pub backtrace: Backtrace,
    pub flags: u32,
}

impl InodeRecord {
    /// A regular file recovered from its data objects
    pub fn new_file(
        backtrace: Backtrace,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        data_pool_id: PoolId,
    ) -> Self {
        Self {
            ino: backtrace.ino,
            mode: RECOVERED_FILE_MODE,
            size,
            mtime,
            layout: FileLayout::for_chunk_size(chunk_size, data_pool_id),
            backtrace,
            flags: 0,
        }
    }

    /// Stand-in for an ancestor directory
    pub fn placeholder_dir(backtrace: Backtrace, data_pool_id: PoolId) -> Self {
        Self {
            ino: backtrace.ino,
            mode: DIR_MODE,
            size: 0,
            mtime: DateTime::<Utc>::default(),
            layout: FileLayout::for_chunk_size(DEFAULT_CHUNK_SIZE, data_pool_id),
            backtrace,
            flags: FLAG_PLACEHOLDER,
        }
    }

    /// One of the well-known roots
    pub fn root(spec: &RootSpec, data_pool_id: PoolId) -> Self {
        Self {
            ino: spec.ino,
            mode: spec.mode,
            size: 0,
            mtime: DateTime::<Utc>::default(),
            layout: FileLayout::for_chunk_size(DEFAULT_CHUNK_SIZE, data_pool_id),
            backtrace: Backtrace::new(spec.ino, data_pool_id),
            flags: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        is_dir_mode(self.mode)
    }

    pub fn is_placeholder(&self) -> bool {
        self.flags & FLAG_PLACEHOLDER != 0
    }

    /// Fold extent evidence from an older copy of the same inode into this one
    ///
    /// Size and mtime only ever grow: every data object proves the file
    /// reached at least that far and was written at least that late.
    pub fn merged_with(mut self, stored: &InodeRecord) -> Self {
        if stored.ino == self.ino && !stored.is_placeholder() {
            self.size = self.size.max(stored.size);
            self.mtime = self.mtime.max(stored.mtime);
        }
        self
    }
}

impl Encode for InodeRecord {
    fn encode(&self, enc: &mut Encoder) {
        enc.start(INODE_VERSION, 1);
        enc.put_u64(self.ino);
        enc.put_u32(self.mode);
        enc.put_u64(self.size);
        enc.put_time(&self.mtime);
        self.layout.encode(enc);
        self.backtrace.encode(enc);
        enc.put_u32(self.flags);
        enc.finish();
    }
}

impl Decode for InodeRecord {
    const WHAT: &'static str = "inode record";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.start(INODE_VERSION)?;
        let ino = dec.u64()?;
        let mode = dec.u32()?;
        let size = dec.u64()?;
        let mtime = dec.time()?;
        let layout = FileLayout::decode(dec)?;
        let backtrace = Backtrace::decode(dec)?;
        let flags = dec.u32()?;
        dec.finish()?;
        Ok(Self {
            ino,
            mode,
            size,
            mtime,
            layout,
            backtrace,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ROOTS, ROOT_INO};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_file_record_encoding() {
        let bt = Backtrace::new(0x100, 2).with_ancestor(ROOT_INO, "foo", 3);
        let record = InodeRecord::new_file(bt, 1234, ts(1_700_000_000), 1 << 22, 2);
        assert!(!record.is_dir());
        assert!(!record.is_placeholder());
        assert_eq!(record.layout.object_size, 1 << 22);

        let decoded = InodeRecord::from_bytes(&record.to_bytes()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_placeholder_and_roots_are_directories() {
        let placeholder = InodeRecord::placeholder_dir(Backtrace::new(0x200, 2), 2);
        assert!(placeholder.is_dir());
        assert!(placeholder.is_placeholder());

        for spec in ROOTS.iter() {
            let root = InodeRecord::root(spec, 2);
            assert!(root.is_dir());
            assert_eq!(root.mode, spec.mode);
        }
    }

    #[test]
    fn test_zero_chunk_size_uses_default() {
        let layout = FileLayout::for_chunk_size(0, 5);
        assert_eq!(layout.object_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(FileLayout::from_bytes(&layout.to_bytes()).unwrap(), layout);
    }

    #[test]
    fn test_merge_only_grows_extents() {
        let bt = Backtrace::new(0x100, 2).with_ancestor(ROOT_INO, "foo", 3);
        let stored = InodeRecord::new_file(bt.clone(), 9000, ts(200), 4096, 2);
        let incoming = InodeRecord::new_file(bt, 4096, ts(300), 4096, 2);

        let merged = incoming.merged_with(&stored);
        assert_eq!(merged.size, 9000);
        assert_eq!(merged.mtime, ts(300));
    }
}
