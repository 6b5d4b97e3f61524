/// Static partitioning of the data pool across workers
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DataScanError, Result};

/// Worker `n` of `m`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub n: u32,
    pub m: u32,
}

impl Shard {
    pub fn new(n: u32, m: u32) -> Result<Self> {
        if m == 0 || n >= m {
            return Err(DataScanError::InvalidShard { n, m });
        }
        Ok(Self { n, m })
    }

    /// The whole namespace, for a single worker
    pub fn single() -> Self {
        Self { n: 0, m: 1 }
    }

    /// Whether this worker owns `name`
    pub fn owns(&self, name: &str) -> bool {
        crc32fast::hash(name.as_bytes()) % self.m == self.n
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self::single()
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.n, self.m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shards_partition_names_exactly_once() {
        let m = 7;
        let shards: Vec<Shard> = (0..m).map(|n| Shard::new(n, m).unwrap()).collect();
        for ino in 0x100u64..0x600 {
            for chunk in 0..3u64 {
                let name = format!("{:x}.{:08x}", ino, chunk);
                let owners = shards.iter().filter(|s| s.owns(&name)).count();
                assert_eq!(owners, 1, "{} owned by {} shards", name, owners);
            }
        }
    }

    #[test]
    fn test_invalid_shards_rejected() {
        assert!(Shard::new(0, 0).is_err());
        assert!(Shard::new(3, 3).is_err());
        assert!(matches!(
            Shard::new(5, 2),
            Err(DataScanError::InvalidShard { n: 5, m: 2 })
        ));
        assert!(Shard::new(2, 3).is_ok());
    }

    #[test]
    fn test_single_worker_owns_everything() {
        let shard = Shard::default();
        assert!(shard.owns("100.00000000"));
        assert!(shard.owns(""));
        assert_eq!(shard.to_string(), "0/1");
    }
}
