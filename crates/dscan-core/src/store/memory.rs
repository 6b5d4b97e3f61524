//! In-process object store
//!
//! Keeps every pool in a `BTreeMap` behind a mutex so several drivers can
//! share one pool the way independent workers share a cluster.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Cluster, ObjectStat, ObjectStore, Versioned};
use crate::codec::{decode_u64, encode_u64};
use crate::error::StoreError;
use crate::types::PoolId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryObject {
    pub data: Vec<u8>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub mtime: DateTime<Utc>,
    pub version: u64,
}

impl MemoryObject {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            xattrs: BTreeMap::new(),
            mtime: Utc::now(),
            version: 1,
        }
    }

    fn touch(&mut self) {
        self.mtime = Utc::now();
        self.version += 1;
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, MemoryObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, MemoryObject>>, StoreError> {
        self.objects
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    /// Seed an object with an explicit mtime, replacing any previous one
    pub fn insert(&self, oid: &str, data: &[u8], mtime: DateTime<Utc>) -> Result<(), StoreError> {
        let mut objects = self.lock()?;
        let mut object = MemoryObject::new(data.to_vec());
        object.mtime = mtime;
        objects.insert(oid.to_string(), object);
        Ok(())
    }

    /// Copy of the whole pool, for comparing states
    pub fn snapshot(&self) -> Result<BTreeMap<String, MemoryObject>, StoreError> {
        Ok(self.lock()?.clone())
    }

    pub fn remove(&self, oid: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(oid).is_some())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryStore {
    fn stat(&self, oid: &str) -> Result<ObjectStat, StoreError> {
        let objects = self.lock()?;
        let object = objects
            .get(oid)
            .ok_or_else(|| StoreError::NotFound(oid.to_string()))?;
        Ok(ObjectStat {
            size: object.data.len() as u64,
            mtime: object.mtime,
            version: object.version,
        })
    }

    fn read_versioned(&self, oid: &str) -> Result<Versioned, StoreError> {
        let objects = self.lock()?;
        let object = objects
            .get(oid)
            .ok_or_else(|| StoreError::NotFound(oid.to_string()))?;
        Ok(Versioned {
            data: object.data.clone(),
            version: object.version,
        })
    }

    fn create_exclusive(&self, oid: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut objects = self.lock()?;
        if objects.contains_key(oid) {
            return Err(StoreError::AlreadyExists(oid.to_string()));
        }
        objects.insert(oid.to_string(), MemoryObject::new(data.to_vec()));
        Ok(())
    }

    fn write_full(&self, oid: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut objects = self.lock()?;
        match objects.get_mut(oid) {
            Some(object) => {
                object.data = data.to_vec();
                object.touch();
            }
            None => {
                objects.insert(oid.to_string(), MemoryObject::new(data.to_vec()));
            }
        }
        Ok(())
    }

    fn compare_and_write(
        &self,
        oid: &str,
        expected_version: u64,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let mut objects = self.lock()?;
        let object = objects
            .get_mut(oid)
            .ok_or_else(|| StoreError::NotFound(oid.to_string()))?;
        if object.version != expected_version {
            return Err(StoreError::VersionMismatch {
                oid: oid.to_string(),
                expected: expected_version,
                actual: object.version,
            });
        }
        object.data = data.to_vec();
        object.touch();
        Ok(())
    }

    fn get_xattr(&self, oid: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        let objects = self.lock()?;
        let object = objects
            .get(oid)
            .ok_or_else(|| StoreError::NotFound(oid.to_string()))?;
        object
            .xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{}@{}", oid, name)))
    }

    fn set_xattr(&self, oid: &str, name: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut objects = self.lock()?;
        let object = objects
            .get_mut(oid)
            .ok_or_else(|| StoreError::NotFound(oid.to_string()))?;
        object.xattrs.insert(name.to_string(), value.to_vec());
        object.version += 1;
        Ok(())
    }

    fn xattr_max_u64(&self, oid: &str, name: &str, value: u64) -> Result<u64, StoreError> {
        let mut objects = self.lock()?;
        let object = objects
            .entry(oid.to_string())
            .or_insert_with(|| MemoryObject::new(Vec::new()));
        let current = match object.xattrs.get(name) {
            Some(raw) => {
                decode_u64(raw).map_err(|e| StoreError::Backend(format!("{}@{}: {}", oid, name, e)))?
            }
            None => 0,
        };
        if object.xattrs.contains_key(name) && current >= value {
            return Ok(current);
        }
        let merged = current.max(value);
        object.xattrs.insert(name.to_string(), encode_u64(merged));
        object.version += 1;
        Ok(merged)
    }

    fn list_objects(&self, after: Option<&str>, max: usize) -> Result<Vec<String>, StoreError> {
        let objects = self.lock()?;
        let lower = match after {
            Some(name) => Bound::Excluded(name.to_string()),
            None => Bound::Unbounded,
        };
        Ok(objects
            .range((lower, Bound::Unbounded))
            .take(max)
            .map(|(name, _)| name.clone())
            .collect())
    }
}

/// A cluster whose pools live in memory
#[derive(Debug, Default)]
pub struct MemoryCluster {
    pools: Mutex<HashMap<PoolId, Arc<MemoryStore>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or fetch) a pool
    pub fn add_pool(&self, pool_id: PoolId) -> Arc<MemoryStore> {
        let mut pools = match self.pools.lock() {
            Ok(pools) => pools,
            Err(poisoned) => poisoned.into_inner(),
        };
        pools
            .entry(pool_id)
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone()
    }
}

impl Cluster for MemoryCluster {
    fn open_pool(&self, pool_id: PoolId) -> Result<Arc<dyn ObjectStore>, StoreError> {
        let pools = self
            .pools
            .lock()
            .map_err(|_| StoreError::Backend("cluster lock poisoned".to_string()))?;
        match pools.get(&pool_id) {
            Some(pool) => Ok(pool.clone() as Arc<dyn ObjectStore>),
            None => Err(StoreError::Unreachable(format!("pool {} does not exist", pool_id))),
        }
    }
}
