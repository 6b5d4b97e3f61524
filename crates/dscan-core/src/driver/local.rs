//! Driver that materialises the recovered namespace in a local directory
//!
//! Nothing is written to the cluster. Each recovered file is rebuilt from its
//! data objects at the path its backtrace names, which makes this driver
//! useful for pulling files out of a damaged filesystem without touching it.
//!
//! Directory entries carry no versions on a local filesystem, so every
//! directory keeps a small JSON manifest of the inode and dentry version
//! behind each name. The manifest applies the same version gating as the
//! metadata driver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::{InjectOutcome, RecoveryDriver};
use crate::codec::Backtrace;
use crate::error::{DataScanError, Result};
use crate::store::{Cluster, FsMap, ObjectStore};
use crate::types::{
    data_object_name, is_reserved, lost_and_found_name, InodeNo, PoolId, DEFAULT_CHUNK_SIZE,
    LOST_AND_FOUND_INO, LOST_AND_FOUND_NAME, MDSDIR_INO, ROOT_INO,
};

/// Per-directory record of name bindings
pub const MANIFEST_NAME: &str = ".dscan-dentries.json";
const MANIFEST_TMP_NAME: &str = ".dscan-dentries.json.tmp";

/// Local stand-in for the internal metadata directory
pub const MYDIR_NAME: &str = ".mydir";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ManifestEntry {
    ino: InodeNo,
    version: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    fn load(dir: &Path) -> Result<Self> {
        match fs::read(dir.join(MANIFEST_NAME)) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the manifest atomically
    fn save(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(MANIFEST_TMP_NAME);
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, dir.join(MANIFEST_NAME))?;
        Ok(())
    }
}

/// Outcome of comparing an incoming binding with the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    /// Nothing bound yet
    Vacant,
    /// Same inode, incoming version is at least the stored one
    Refresh,
    /// Another inode, incoming version strictly greater
    Displace,
    /// Stored binding wins
    Lose,
}

fn compare(existing: Option<&ManifestEntry>, incoming: ManifestEntry) -> Binding {
    match existing {
        None => Binding::Vacant,
        Some(stored) if stored.ino == incoming.ino => {
            if incoming.version >= stored.version {
                Binding::Refresh
            } else {
                Binding::Lose
            }
        }
        Some(stored) => {
            if incoming.version > stored.version {
                Binding::Displace
            } else {
                Binding::Lose
            }
        }
    }
}

fn is_bookkeeping_name(name: &str) -> bool {
    name == MANIFEST_NAME || name == MANIFEST_TMP_NAME
}

pub struct LocalFileDriver {
    path: PathBuf,
    data_io: Arc<dyn ObjectStore>,
}

impl LocalFileDriver {
    pub fn new(path: impl Into<PathBuf>, data_io: Arc<dyn ObjectStore>) -> Self {
        Self {
            path: path.into(),
            data_io,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where each root lives inside the export directory
    fn root_dir(&self, ino: InodeNo) -> Option<PathBuf> {
        match ino {
            ROOT_INO => Some(self.path.clone()),
            MDSDIR_INO => Some(self.path.join(MYDIR_NAME)),
            LOST_AND_FOUND_INO => Some(self.path.join(LOST_AND_FOUND_NAME)),
            _ => None,
        }
    }

    /// Bind `name` in `dir` to a directory, creating it when needed
    fn link_dir(&self, dir: &Path, name: &str, entry: ManifestEntry) -> Result<InjectOutcome> {
        let mut manifest = Manifest::load(dir)?;
        let target = dir.join(name);

        let outcome = match compare(manifest.entries.get(name), entry) {
            Binding::Lose => InjectOutcome::Skipped,
            Binding::Refresh if manifest.entries.get(name) == Some(&entry) && target.is_dir() => {
                InjectOutcome::Unchanged
            }
            _ => {
                if target.exists() && !target.is_dir() {
                    fs::remove_file(&target)?;
                }
                fs::create_dir_all(&target)?;
                manifest.entries.insert(name.to_string(), entry);
                manifest.save(dir)?;
                InjectOutcome::Injected
            }
        };
        Ok(outcome)
    }

    /// Bind `name` in `dir` to a file rebuilt from the data pool
    fn link_file(
        &self,
        dir: &Path,
        name: &str,
        entry: ManifestEntry,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
    ) -> Result<InjectOutcome> {
        let mut manifest = Manifest::load(dir)?;
        let target = dir.join(name);

        let binding = compare(manifest.entries.get(name), entry);
        if binding == Binding::Lose {
            return Ok(InjectOutcome::Skipped);
        }
        if target.is_dir() {
            tracing::warn!(
                "{} is a directory, not replacing it with file {:#x}",
                target.display(),
                entry.ino
            );
            return Ok(InjectOutcome::Skipped);
        }

        let (mut size, mut mtime) = (size, mtime);
        if binding == Binding::Refresh {
            if let Ok(meta) = fs::metadata(&target) {
                size = size.max(meta.len());
                if let Ok(modified) = meta.modified() {
                    mtime = mtime.max(DateTime::<Utc>::from(modified));
                }
                let stored = manifest.entries.get(name).copied();
                let current_mtime = meta.modified().ok().map(DateTime::<Utc>::from);
                if stored == Some(entry) && meta.len() == size && current_mtime == Some(mtime) {
                    return Ok(InjectOutcome::Unchanged);
                }
            }
        }

        self.write_file(&target, entry.ino, size, mtime, chunk_size)?;
        manifest.entries.insert(name.to_string(), entry);
        manifest.save(dir)?;
        Ok(InjectOutcome::Injected)
    }

    /// Assemble a file from its chunks; absent chunks become holes
    fn write_file(
        &self,
        target: &Path,
        ino: InodeNo,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
    ) -> Result<()> {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        } as u64;

        let tmp = target.with_file_name(format!(".{:x}.partial", ino));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;

        let chunks = size.div_ceil(chunk_size);
        let mut recovered = 0u64;
        for chunk in 0..chunks {
            match self.data_io.read(&data_object_name(ino, chunk)) {
                Ok(data) => {
                    file.seek(SeekFrom::Start(chunk * chunk_size))?;
                    file.write_all(&data)?;
                    recovered += 1;
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        file.set_len(size)?;
        file.set_modified(SystemTime::from(mtime))?;
        drop(file);

        fs::rename(&tmp, target)?;
        tracing::debug!(
            "Wrote {} ({} bytes, {}/{} chunks present)",
            target.display(),
            size,
            recovered,
            chunks
        );
        Ok(())
    }
}

impl RecoveryDriver for LocalFileDriver {
    fn init(&mut self, cluster: &dyn Cluster, fs_map: &FsMap) -> Result<()> {
        // Only the data pool matters; the metadata pool is never touched
        if let Some(pool) = fs_map.data_pools.first() {
            cluster.open_pool(*pool)?;
        }
        fs::create_dir_all(&self.path)?;
        tracing::info!(
            "Exporting filesystem '{}' to {}",
            fs_map.name,
            self.path.display()
        );
        Ok(())
    }

    fn inject_with_backtrace(
        &mut self,
        backtrace: &Backtrace,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        data_pool_id: PoolId,
    ) -> Result<InjectOutcome> {
        if is_reserved(backtrace.ino) {
            return Err(DataScanError::ReservedInode(backtrace.ino));
        }
        let usable = backtrace.validate().is_ok()
            && !backtrace
                .ancestors
                .iter()
                .any(|a| is_bookkeeping_name(&a.dname));
        let mut dir = match backtrace.root_ino().and_then(|ino| self.root_dir(ino)) {
            Some(dir) if usable => dir,
            _ => {
                tracing::warn!(
                    "Backtrace {} cannot be exported, using lost+found",
                    backtrace
                );
                return self.inject_lost_and_found(
                    backtrace.ino,
                    size,
                    mtime,
                    chunk_size,
                    data_pool_id,
                );
            }
        };

        let mut ancestors_changed = false;
        for level in (1..backtrace.ancestors.len()).rev() {
            let ancestor = &backtrace.ancestors[level];
            let entry = ManifestEntry {
                ino: backtrace.inode_at(level),
                version: ancestor.version,
            };
            match self.link_dir(&dir, &ancestor.dname, entry)? {
                InjectOutcome::Injected => ancestors_changed = true,
                InjectOutcome::Skipped if !dir.join(&ancestor.dname).is_dir() => {
                    tracing::warn!(
                        "{} is held by a file; {:#x} goes to lost+found",
                        dir.join(&ancestor.dname).display(),
                        backtrace.ino
                    );
                    return self.inject_lost_and_found(
                        backtrace.ino,
                        size,
                        mtime,
                        chunk_size,
                        data_pool_id,
                    );
                }
                InjectOutcome::Skipped => tracing::warn!(
                    "{} belongs to another inode; placing {:#x} inside it anyway",
                    dir.join(&ancestor.dname).display(),
                    entry.ino
                ),
                _ => {}
            }
            dir.push(&ancestor.dname);
        }

        let leaf = &backtrace.ancestors[0];
        let entry = ManifestEntry {
            ino: backtrace.ino,
            version: leaf.version,
        };
        let outcome = self.link_file(&dir, &leaf.dname, entry, size, mtime, chunk_size)?;
        if outcome == InjectOutcome::Unchanged && ancestors_changed {
            return Ok(InjectOutcome::Injected);
        }
        Ok(outcome)
    }

    fn inject_lost_and_found(
        &mut self,
        ino: InodeNo,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        _data_pool_id: PoolId,
    ) -> Result<InjectOutcome> {
        if is_reserved(ino) {
            return Err(DataScanError::ReservedInode(ino));
        }
        let dir = self.path.join(LOST_AND_FOUND_NAME);
        fs::create_dir_all(&dir)?;
        let entry = ManifestEntry { ino, version: 1 };
        let outcome =
            self.link_file(&dir, &lost_and_found_name(ino), entry, size, mtime, chunk_size)?;
        Ok(match outcome {
            InjectOutcome::Injected => InjectOutcome::LostAndFound,
            other => other,
        })
    }

    fn init_metadata(&mut self, _data_pool_id: PoolId) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        fs::create_dir_all(self.path.join(MYDIR_NAME))?;
        let entry = ManifestEntry {
            ino: LOST_AND_FOUND_INO,
            version: 1,
        };
        self.link_dir(&self.path, LOST_AND_FOUND_NAME, entry)?;
        Ok(())
    }

    fn check_roots(&mut self) -> Result<bool> {
        for ino in [ROOT_INO, MDSDIR_INO, LOST_AND_FOUND_INO] {
            let present = self.root_dir(ino).map_or(false, |dir| dir.is_dir());
            if !present {
                tracing::info!("Export root {:#x} is missing", ino);
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const POOL: PoolId = 2;

    fn setup() -> (TempDir, Arc<MemoryStore>, LocalFileDriver) {
        let tmp = TempDir::new().unwrap();
        let data = Arc::new(MemoryStore::new());
        let mut driver = LocalFileDriver::new(tmp.path().join("export"), data.clone());
        driver.init_metadata(POOL).unwrap();
        (tmp, data, driver)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_roots_created_on_init() {
        let tmp = TempDir::new().unwrap();
        let data = Arc::new(MemoryStore::new());
        let mut driver = LocalFileDriver::new(tmp.path().join("out"), data);
        assert!(!driver.check_roots().unwrap());
        driver.init_metadata(POOL).unwrap();
        driver.init_metadata(POOL).unwrap();
        assert!(driver.check_roots().unwrap());
        assert!(driver.path().join(MYDIR_NAME).is_dir());
    }

    #[test]
    fn test_file_rebuilt_from_chunks_with_holes() {
        let (_tmp, data, mut driver) = setup();
        data.write_full("100.00000000", b"abcd").unwrap();
        data.write_full("100.00000002", b"ij").unwrap();

        let bt = Backtrace::new(0x100, POOL)
            .with_ancestor(0x10, "notes.txt", 2)
            .with_ancestor(ROOT_INO, "docs", 1);
        let outcome = driver
            .inject_with_backtrace(&bt, 10, at(1_600_000_000), 4, POOL)
            .unwrap();
        assert_eq!(outcome, InjectOutcome::Injected);

        let path = driver.path().join("docs").join("notes.txt");
        let content = fs::read(&path).unwrap();
        assert_eq!(content, b"abcd\0\0\0\0ij");
        let modified = DateTime::<Utc>::from(fs::metadata(&path).unwrap().modified().unwrap());
        assert_eq!(modified, at(1_600_000_000));

        let again = driver
            .inject_with_backtrace(&bt, 10, at(1_600_000_000), 4, POOL)
            .unwrap();
        assert_eq!(again, InjectOutcome::Unchanged);
    }

    #[test]
    fn test_versions_gate_local_names() {
        let (_tmp, data, mut driver) = setup();
        data.write_full("100.00000000", b"old").unwrap();
        data.write_full("200.00000000", b"new").unwrap();

        let older = Backtrace::new(0x100, POOL).with_ancestor(ROOT_INO, "f", 1);
        let newer = Backtrace::new(0x200, POOL).with_ancestor(ROOT_INO, "f", 2);

        driver.inject_with_backtrace(&newer, 3, at(10), 4, POOL).unwrap();
        let outcome = driver.inject_with_backtrace(&older, 3, at(10), 4, POOL).unwrap();
        assert_eq!(outcome, InjectOutcome::Skipped);
        assert_eq!(fs::read(driver.path().join("f")).unwrap(), b"new");

        let manifest = Manifest::load(driver.path()).unwrap();
        assert_eq!(manifest.entries["f"], ManifestEntry { ino: 0x200, version: 2 });
    }

    #[test]
    fn test_ancestor_name_held_by_file_sends_leaf_to_lost_and_found() {
        let (_tmp, data, mut driver) = setup();
        data.write_full("200.00000000", b"plain").unwrap();
        data.write_full("300.00000000", b"nested").unwrap();

        let file = Backtrace::new(0x200, POOL).with_ancestor(ROOT_INO, "docs", 5);
        driver.inject_with_backtrace(&file, 5, at(10), 4096, POOL).unwrap();

        let nested = Backtrace::new(0x300, POOL)
            .with_ancestor(0x150, "a.txt", 1)
            .with_ancestor(ROOT_INO, "docs", 1);
        let outcome = driver.inject_with_backtrace(&nested, 6, at(20), 4096, POOL).unwrap();
        assert_eq!(outcome, InjectOutcome::LostAndFound);

        assert_eq!(fs::read(driver.path().join("docs")).unwrap(), b"plain");
        let parked = driver.path().join(LOST_AND_FOUND_NAME).join("0x300");
        assert_eq!(fs::read(parked).unwrap(), b"nested");
    }

    #[test]
    fn test_dangling_backtrace_goes_to_lost_and_found() {
        let (_tmp, data, mut driver) = setup();
        data.write_full("300.00000000", b"orphan").unwrap();
        let bt = Backtrace::new(0x300, POOL).with_ancestor(0x999, "x", 1);
        let outcome = driver.inject_with_backtrace(&bt, 6, at(5), 4096, POOL).unwrap();
        assert_eq!(outcome, InjectOutcome::LostAndFound);
        let path = driver.path().join(LOST_AND_FOUND_NAME).join("0x300");
        assert_eq!(fs::read(path).unwrap(), b"orphan");
    }

    #[test]
    fn test_manifest_name_is_never_exported() {
        let (_tmp, _data, mut driver) = setup();
        let bt = Backtrace::new(0x400, POOL).with_ancestor(ROOT_INO, MANIFEST_NAME, 1);
        let outcome = driver.inject_with_backtrace(&bt, 0, at(0), 4096, POOL).unwrap();
        assert_eq!(outcome, InjectOutcome::LostAndFound);
    }
}
