/// Directory fragment objects: fnode header plus dentries
///
/// The encoding ends with a CRC32 of everything before it, so a torn or
/// corrupted fragment is reported as such instead of being misread.
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;

use super::{Decode, Decoder, Encode, Encoder, InodeRecord};
use crate::error::DecodeError;
use crate::types::FragId;

const FNODE_VERSION: u8 = 1;
const DENTRY_VERSION: u8 = 1;
const DIRFRAG_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragStat {
    pub nfiles: u64,
    pub nsubdirs: u64,
}

/// Fragment header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fnode {
    /// Mirrors the object version the fragment was written at
    pub version: u64,
    pub frag: FragId,
    pub fragstat: FragStat,
}

/// A name binding inside a fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dentry {
    pub version: u64,
    pub inode: InodeRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirFrag {
    pub fnode: Fnode,
    pub dentries: BTreeMap<String, Dentry>,
}

impl DirFrag {
    /// Empty fragment as written by an exclusive create
    pub fn new(frag: FragId) -> Self {
        Self {
            fnode: Fnode {
                version: 1,
                frag,
                fragstat: FragStat::default(),
            },
            dentries: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Dentry> {
        self.dentries.get(name)
    }

    /// Bind `name`, keeping the fragment statistics in step
    pub fn link(&mut self, name: &str, dentry: Dentry) {
        self.dentries.insert(name.to_string(), dentry);
        self.refresh_stats();
    }

    fn refresh_stats(&mut self) {
        let nsubdirs = self.dentries.values().filter(|d| d.inode.is_dir()).count() as u64;
        self.fnode.fragstat = FragStat {
            nfiles: self.dentries.len() as u64 - nsubdirs,
            nsubdirs,
        };
    }
}

impl Encode for Fnode {
    fn encode(&self, enc: &mut Encoder) {
        enc.start(FNODE_VERSION, 1);
        enc.put_u64(self.version);
        enc.put_u32(self.frag);
        enc.put_u64(self.fragstat.nfiles);
        enc.put_u64(self.fragstat.nsubdirs);
        enc.finish();
    }
}

impl Decode for Fnode {
    const WHAT: &'static str = "fnode";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.start(FNODE_VERSION)?;
        let fnode = Self {
            version: dec.u64()?,
            frag: dec.u32()?,
            fragstat: FragStat {
                nfiles: dec.u64()?,
                nsubdirs: dec.u64()?,
            },
        };
        dec.finish()?;
        Ok(fnode)
    }
}

impl Encode for Dentry {
    fn encode(&self, enc: &mut Encoder) {
        enc.start(DENTRY_VERSION, 1);
        enc.put_u64(self.version);
        self.inode.encode(enc);
        enc.finish();
    }
}

impl Decode for Dentry {
    const WHAT: &'static str = "dentry";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.start(DENTRY_VERSION)?;
        let version = dec.u64()?;
        let inode = InodeRecord::decode(dec)?;
        dec.finish()?;
        Ok(Self { version, inode })
    }
}

impl Encode for DirFrag {
    fn encode(&self, enc: &mut Encoder) {
        let body_start = enc.len();
        enc.start(DIRFRAG_VERSION, 1);
        self.fnode.encode(enc);
        enc.put_u32(self.dentries.len() as u32);
        for (name, dentry) in &self.dentries {
            enc.put_str(name);
            dentry.encode(enc);
        }
        enc.finish();
        let crc = crc32fast::hash(&enc.as_slice()[body_start..]);
        enc.put_u32(crc);
    }
}

impl Decode for DirFrag {
    const WHAT: &'static str = "dirfrag";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.start(DIRFRAG_VERSION)?;
        let fnode = Fnode::decode(dec)?;
        let count = dec.count(4)?;
        let mut dentries = BTreeMap::new();
        for _ in 0..count {
            let name = dec.string()?;
            let dentry = Dentry::decode(dec)?;
            if dentries.insert(name.clone(), dentry).is_some() {
                return Err(DecodeError::Invalid {
                    what: Self::WHAT,
                    reason: format!("duplicate dentry {:?}", name),
                });
            }
        }
        dec.finish()?;
        Ok(Self { fnode, dentries })
    }

    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::Truncated(Self::WHAT));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let stored = LittleEndian::read_u32(trailer);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(DecodeError::Checksum { stored, computed });
        }
        let mut dec = Decoder::new(body, Self::WHAT);
        Self::decode(&mut dec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Backtrace;
    use crate::types::ROOT_INO;
    use chrono::DateTime;

    fn file_dentry(ino: u64, name: &str, version: u64) -> Dentry {
        let bt = Backtrace::new(ino, 2).with_ancestor(ROOT_INO, name, version);
        let mtime = DateTime::from_timestamp(1_000, 0).unwrap();
        Dentry {
            version,
            inode: InodeRecord::new_file(bt, 10, mtime, 4096, 2),
        }
    }

    #[test]
    fn test_link_tracks_fragstat() {
        let mut frag = DirFrag::new(0);
        frag.link("a", file_dentry(0x100, "a", 1));
        frag.link(
            "d",
            Dentry {
                version: 1,
                inode: InodeRecord::placeholder_dir(Backtrace::new(0x200, 2), 2),
            },
        );
        assert_eq!(frag.fnode.fragstat, FragStat { nfiles: 1, nsubdirs: 1 });

        frag.link("a", file_dentry(0x101, "a", 2));
        assert_eq!(frag.fnode.fragstat.nfiles, 1);
        assert_eq!(frag.get("a").unwrap().inode.ino, 0x101);
    }

    #[test]
    fn test_dirfrag_encoding_is_checksummed() {
        let mut frag = DirFrag::new(0);
        frag.fnode.version = 7;
        frag.link("foo", file_dentry(0x100, "foo", 3));

        let bytes = frag.to_bytes();
        assert_eq!(DirFrag::from_bytes(&bytes).unwrap(), frag);

        let mut corrupted = bytes.clone();
        corrupted[10] ^= 0xFF;
        assert!(matches!(
            DirFrag::from_bytes(&corrupted),
            Err(DecodeError::Checksum { .. })
        ));
        assert!(DirFrag::from_bytes(&bytes[..2]).is_err());
    }
}
