//! Object store abstraction
//!
//! The engine only needs a handful of primitives from the cluster: whole
//! object reads and writes, extended attributes, exclusive creation and a
//! version-gated conditional write. Every successful mutation bumps the
//! object version by one; creation yields version 1.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::StoreError;
use crate::types::PoolId;

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryCluster, MemoryStore};
pub use sqlite::{SqliteCluster, SqliteStore};

/// Object metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub version: u64,
}

/// Object payload together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub data: Vec<u8>,
    pub version: u64,
}

/// One pool of a cluster
pub trait ObjectStore: Send + Sync {
    fn stat(&self, oid: &str) -> Result<ObjectStat, StoreError>;

    fn read_versioned(&self, oid: &str) -> Result<Versioned, StoreError>;

    /// Create `oid` only if absent; `AlreadyExists` otherwise
    fn create_exclusive(&self, oid: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Create or replace the object payload
    fn write_full(&self, oid: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Replace the payload only if the object is still at `expected_version`
    fn compare_and_write(
        &self,
        oid: &str,
        expected_version: u64,
        data: &[u8],
    ) -> Result<(), StoreError>;

    fn get_xattr(&self, oid: &str, name: &str) -> Result<Vec<u8>, StoreError>;

    fn set_xattr(&self, oid: &str, name: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Atomically raise a u64 xattr to at least `value`, creating the object
    /// (empty) and the attribute when missing. Returns the resulting value.
    fn xattr_max_u64(&self, oid: &str, name: &str, value: u64) -> Result<u64, StoreError>;

    /// Names strictly after `after`, in lexicographic order, at most `max`
    fn list_objects(&self, after: Option<&str>, max: usize) -> Result<Vec<String>, StoreError>;

    fn read(&self, oid: &str) -> Result<Vec<u8>, StoreError> {
        self.read_versioned(oid).map(|v| v.data)
    }

    fn exists(&self, oid: &str) -> Result<bool, StoreError> {
        match self.stat(oid) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Entry point to the pools of a cluster
pub trait Cluster {
    /// Open a pool; an unknown pool is `Unreachable`
    fn open_pool(&self, pool_id: PoolId) -> Result<Arc<dyn ObjectStore>, StoreError>;
}

/// Filesystem topology: which pools hold metadata and data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsMap {
    pub name: String,
    pub metadata_pool: PoolId,
    pub data_pools: Vec<PoolId>,
}

impl FsMap {
    pub fn new(name: impl Into<String>, metadata_pool: PoolId, data_pools: Vec<PoolId>) -> Self {
        Self {
            name: name.into(),
            metadata_pool,
            data_pools,
        }
    }

    pub fn has_data_pool(&self, pool_id: PoolId) -> bool {
        self.data_pools.contains(&pool_id)
    }
}

/// Page through every object name of a pool
pub struct ObjectLister<'a> {
    store: &'a dyn ObjectStore,
    page_size: usize,
    cursor: Option<String>,
    page: std::vec::IntoIter<String>,
    exhausted: bool,
}

impl<'a> ObjectLister<'a> {
    pub fn new(store: &'a dyn ObjectStore, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            cursor: None,
            page: Vec::new().into_iter(),
            exhausted: false,
        }
    }
}

impl Iterator for ObjectLister<'_> {
    type Item = Result<String, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(name) = self.page.next() {
                self.cursor = Some(name.clone());
                return Some(Ok(name));
            }
            if self.exhausted {
                return None;
            }
            match self
                .store
                .list_objects(self.cursor.as_deref(), self.page_size)
            {
                Ok(names) => {
                    if names.len() < self.page_size {
                        self.exhausted = true;
                    }
                    self.page = names.into_iter();
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lister_pages_through_everything() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store.write_full(&format!("obj{:02}", i), b"x").unwrap();
        }

        let names: Vec<String> = ObjectLister::new(&store, 7)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(names.len(), 25);
        assert_eq!(names.first().map(String::as_str), Some("obj00"));
        assert_eq!(names.last().map(String::as_str), Some("obj24"));
    }

    #[test]
    fn test_exists_maps_not_found() {
        let store = MemoryStore::new();
        assert!(!store.exists("missing").unwrap());
        store.write_full("present", b"").unwrap();
        assert!(store.exists("present").unwrap());
    }

    #[test]
    fn test_fs_map_pools() {
        let fs = FsMap::new("cephfs", 1, vec![2, 3]);
        assert!(fs.has_data_pool(3));
        assert!(!fs.has_data_pool(1));
    }
}
