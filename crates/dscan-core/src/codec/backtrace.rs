/// Backtrace evidence recovered from data objects
///
/// A backtrace lists the ancestors of an inode nearest-parent first, each
/// entry naming the directory that holds the link, the link name and the
/// version of that link when it was written.
use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Decode, Decoder, Encode, Encoder, NAME_MAX};
use crate::error::DecodeError;
use crate::types::{is_reserved, is_root, InodeNo, PoolId};

const BACKTRACE_VERSION: u8 = 1;
const ANCESTOR_VERSION: u8 = 1;

/// One link in the ancestor chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktraceAncestor {
    /// Directory containing the link
    pub dirino: InodeNo,
    /// Name of the link inside `dirino`
    pub dname: String,
    /// Dentry version at the time the backtrace was written
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backtrace {
    pub ino: InodeNo,
    /// Nearest parent first
    pub ancestors: Vec<BacktraceAncestor>,
    /// Pool the backtrace was written to
    pub pool: PoolId,
    /// Pools the file lived in before a layout change
    pub old_pools: Vec<PoolId>,
}

/// Why an ancestor chain cannot be linked from a root
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainDefect {
    #[error("backtrace has no ancestors")]
    Empty,

    #[error("chain ends at {0:#x}, which is not a root")]
    Dangling(InodeNo),

    #[error("root {0:#x} appears in the middle of the chain")]
    InteriorRoot(InodeNo),

    #[error("reserved inode {0:#x} used as a directory")]
    InteriorReserved(InodeNo),

    #[error("inode {0:#x} appears twice in the chain")]
    Cycle(InodeNo),

    #[error("unusable entry name {0:?}")]
    BadName(String),
}

impl Backtrace {
    pub fn new(ino: InodeNo, pool: PoolId) -> Self {
        Self {
            ino,
            ancestors: Vec::new(),
            pool,
            old_pools: Vec::new(),
        }
    }

    /// Append the next ancestor outwards (call in nearest-parent-first order)
    pub fn with_ancestor(mut self, dirino: InodeNo, dname: impl Into<String>, version: u64) -> Self {
        self.ancestors.push(BacktraceAncestor {
            dirino,
            dname: dname.into(),
            version,
        });
        self
    }

    /// Directory the outermost ancestor lives in
    pub fn root_ino(&self) -> Option<InodeNo> {
        self.ancestors.last().map(|a| a.dirino)
    }

    /// Check that the chain can be linked from a root
    pub fn validate(&self) -> Result<(), ChainDefect> {
        let last = self.ancestors.last().ok_or(ChainDefect::Empty)?;
        if !is_root(last.dirino) {
            return Err(ChainDefect::Dangling(last.dirino));
        }

        let mut seen = HashSet::new();
        seen.insert(self.ino);
        let interior = self.ancestors.len() - 1;
        for (level, ancestor) in self.ancestors.iter().enumerate() {
            if !valid_name(&ancestor.dname) {
                return Err(ChainDefect::BadName(ancestor.dname.clone()));
            }
            if level < interior {
                if is_root(ancestor.dirino) {
                    return Err(ChainDefect::InteriorRoot(ancestor.dirino));
                }
                if is_reserved(ancestor.dirino) {
                    return Err(ChainDefect::InteriorReserved(ancestor.dirino));
                }
            }
            if !seen.insert(ancestor.dirino) {
                return Err(ChainDefect::Cycle(ancestor.dirino));
            }
        }
        Ok(())
    }

    /// The inode linked at `level` (0 is `self.ino`, n is `ancestors[n-1].dirino`)
    pub fn inode_at(&self, level: usize) -> InodeNo {
        if level == 0 {
            self.ino
        } else {
            self.ancestors[level - 1].dirino
        }
    }

    /// Backtrace of the directory linked at `level`, as seen from this evidence
    pub fn suffix(&self, level: usize) -> Backtrace {
        Backtrace {
            ino: self.inode_at(level),
            ancestors: self.ancestors[level..].to_vec(),
            pool: self.pool,
            old_pools: Vec::new(),
        }
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ino)?;
        for ancestor in &self.ancestors {
            write!(f, " <- {:#x}/{}@{}", ancestor.dirino, ancestor.dname, ancestor.version)?;
        }
        Ok(())
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= NAME_MAX
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\0')
}

impl Encode for BacktraceAncestor {
    fn encode(&self, enc: &mut Encoder) {
        enc.start(ANCESTOR_VERSION, 1);
        enc.put_u64(self.dirino);
        enc.put_str(&self.dname);
        enc.put_u64(self.version);
        enc.finish();
    }
}

impl Decode for BacktraceAncestor {
    const WHAT: &'static str = "backtrace ancestor";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.start(ANCESTOR_VERSION)?;
        let dirino = dec.u64()?;
        let dname = dec.string()?;
        let version = dec.u64()?;
        dec.finish()?;
        Ok(Self {
            dirino,
            dname,
            version,
        })
    }
}

impl Encode for Backtrace {
    fn encode(&self, enc: &mut Encoder) {
        enc.start(BACKTRACE_VERSION, 1);
        enc.put_u64(self.ino);
        enc.put_u32(self.ancestors.len() as u32);
        for ancestor in &self.ancestors {
            ancestor.encode(enc);
        }
        enc.put_i64(self.pool);
        enc.put_u32(self.old_pools.len() as u32);
        for pool in &self.old_pools {
            enc.put_i64(*pool);
        }
        enc.finish();
    }
}

impl Decode for Backtrace {
    const WHAT: &'static str = "backtrace";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.start(BACKTRACE_VERSION)?;
        let ino = dec.u64()?;
        // envelope (6) + dirino (8) + name length (4) + version (8)
        let count = dec.count(26)?;
        let mut ancestors = Vec::with_capacity(count);
        for _ in 0..count {
            ancestors.push(BacktraceAncestor::decode(dec)?);
        }
        let pool = dec.i64()?;
        let count = dec.count(8)?;
        let mut old_pools = Vec::with_capacity(count);
        for _ in 0..count {
            old_pools.push(dec.i64()?);
        }
        dec.finish()?;
        Ok(Self {
            ino,
            ancestors,
            pool,
            old_pools,
        })
    }
}
