/// Driver that rebuilds the metadata pool itself
///
/// Dirfrags are created with exclusive creates and dentries are written with
/// version-gated conditional writes, so any number of workers can inject into
/// the same directories without locks: the highest dentry version always
/// wins, whichever worker gets there first.
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{InjectOutcome, RecoveryDriver};
use crate::codec::{Backtrace, Decode, Dentry, DirFrag, Encode, Fnode, InodeRecord};
use crate::error::{DataScanError, Result, StoreError};
use crate::store::{Cluster, FsMap, ObjectStore};
use crate::types::{
    dirfrag_object_name, inode_object_name, is_reserved, lost_and_found_name, FragId, InodeNo,
    PoolId, RootSpec, LOST_AND_FOUND_INO, LOST_AND_FOUND_NAME, ROOTS, ROOT_FRAG, ROOT_INO,
};

/// Conditional write attempts before giving up on a contended dirfrag
pub const DEFAULT_MAX_RETRIES: usize = 16;

/// Version given to dentries created by this tool rather than by evidence
const SYNTHETIC_DENTRY_VERSION: u64 = 1;

/// Resolved directory fragment, passed between walk steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragHandle {
    pub ino: InodeNo,
    pub frag: FragId,
}

impl FragHandle {
    pub fn new(ino: InodeNo, frag: FragId) -> Self {
        Self { ino, frag }
    }

    pub fn object_name(&self) -> String {
        dirfrag_object_name(self.ino, self.frag)
    }
}

/// Which conflict rules apply to a linkage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkKind {
    /// The inode the evidence is about
    Leaf,
    /// A directory on the way to the leaf
    Ancestor,
}

#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Write(Dentry),
    Unchanged,
    Skip,
}

/// Resolve an incoming dentry against whatever is stored under the same name
fn decide(existing: Option<&Dentry>, incoming: Dentry, kind: LinkKind) -> Decision {
    let existing = match existing {
        None => return Decision::Write(incoming),
        Some(existing) => existing,
    };

    if existing.inode.ino != incoming.inode.ino {
        // Another inode holds the name; ties keep the existing binding
        return if incoming.version > existing.version {
            Decision::Write(incoming)
        } else {
            Decision::Skip
        };
    }

    match kind {
        LinkKind::Ancestor => {
            if existing.inode.is_placeholder() && incoming.version > existing.version {
                Decision::Write(incoming)
            } else {
                Decision::Unchanged
            }
        }
        LinkKind::Leaf => {
            if incoming.version < existing.version {
                return Decision::Skip;
            }
            let merged = Dentry {
                version: incoming.version,
                inode: incoming.inode.merged_with(&existing.inode),
            };
            if merged == *existing {
                Decision::Unchanged
            } else {
                Decision::Write(merged)
            }
        }
    }
}

pub struct MetadataDriver {
    metadata_io: Option<Arc<dyn ObjectStore>>,
    max_retries: usize,
}

impl MetadataDriver {
    pub fn new() -> Self {
        Self {
            metadata_io: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Attach directly to an opened metadata pool, skipping `init`
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            metadata_io: Some(store),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    fn io(&self) -> Result<&dyn ObjectStore> {
        self.metadata_io
            .as_deref()
            .ok_or(DataScanError::NotInitialized)
    }

    /// Check for existence of a root's `.inode` object
    pub fn root_exists(&self, ino: InodeNo) -> Result<bool> {
        Ok(self.io()?.exists(&inode_object_name(ino))?)
    }

    pub fn read_root_inode(&self, ino: InodeNo) -> Result<InodeRecord> {
        let raw = self.io()?.read(&inode_object_name(ino))?;
        Ok(InodeRecord::from_bytes(&raw)?)
    }

    /// Create a root's `.inode` object; an existing one is left untouched
    fn inject_unlinked_inode(&self, spec: &RootSpec, data_pool_id: PoolId) -> Result<bool> {
        let record = InodeRecord::root(spec, data_pool_id);
        match self
            .io()?
            .create_exclusive(&inode_object_name(spec.ino), &record.to_bytes())
        {
            Ok(()) => {
                tracing::info!("Created {} inode {:#x}", spec.label, spec.ino);
                Ok(true)
            }
            Err(StoreError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_dirfrag(&self, frag: FragHandle) -> Result<(DirFrag, u64)> {
        let current = self.io()?.read_versioned(&frag.object_name())?;
        Ok((DirFrag::from_bytes(&current.data)?, current.version))
    }

    /// Read the header of a dirfrag
    pub fn read_fnode(&self, frag: FragHandle) -> Result<Fnode> {
        self.read_dirfrag(frag).map(|(dirfrag, _)| dirfrag.fnode)
    }

    /// Read one dentry; a missing fragment reads as a missing dentry
    pub fn read_dentry(&self, frag: FragHandle, name: &str) -> Result<Option<Dentry>> {
        match self.read_dirfrag(frag) {
            Ok((dirfrag, _)) => Ok(dirfrag.get(name).cloned()),
            Err(DataScanError::Store(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolve the fragment of `ino`, creating an empty one when absent
    pub fn find_or_create_dirfrag(&self, ino: InodeNo) -> Result<(FragHandle, bool)> {
        let frag = FragHandle::new(ino, ROOT_FRAG);
        let empty = DirFrag::new(ROOT_FRAG).to_bytes();
        match self.io()?.create_exclusive(&frag.object_name(), &empty) {
            Ok(()) => {
                tracing::debug!("Created dirfrag {}", frag.object_name());
                Ok((frag, true))
            }
            Err(StoreError::AlreadyExists(_)) => Ok((frag, false)),
            Err(e) => Err(e.into()),
        }
    }

    /// Link `name` to `dentry` inside `frag`, applying the version rules
    ///
    /// Optimistic: read the fragment and its version, decide, then write
    /// conditionally on that version. A lost race re-reads and decides again.
    fn link(
        &self,
        frag: FragHandle,
        name: &str,
        dentry: Dentry,
        kind: LinkKind,
    ) -> Result<InjectOutcome> {
        let io = self.io()?;
        let oid = frag.object_name();

        for attempt in 0..self.max_retries {
            let (mut dirfrag, version) = self.read_dirfrag(frag)?;

            match decide(dirfrag.get(name), dentry.clone(), kind) {
                Decision::Unchanged => return Ok(InjectOutcome::Unchanged),
                Decision::Skip => {
                    if let Some(stored) = dirfrag.get(name) {
                        tracing::warn!(
                            "Not linking {}/{} -> {:#x} v{}: stored {:#x} v{} wins",
                            oid,
                            name,
                            dentry.inode.ino,
                            dentry.version,
                            stored.inode.ino,
                            stored.version
                        );
                    }
                    return Ok(InjectOutcome::Skipped);
                }
                Decision::Write(winner) => {
                    dirfrag.link(name, winner);
                    dirfrag.fnode.version = version + 1;
                    match io.compare_and_write(&oid, version, &dirfrag.to_bytes()) {
                        Ok(()) => {
                            tracing::debug!(
                                "Linked {}/{} -> {:#x} v{}",
                                oid,
                                name,
                                dentry.inode.ino,
                                dentry.version
                            );
                            return Ok(InjectOutcome::Injected);
                        }
                        Err(StoreError::VersionMismatch { actual, .. }) => {
                            tracing::debug!(
                                "Lost race on {} (attempt {}, now at v{}), retrying",
                                oid,
                                attempt + 1,
                                actual
                            );
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        Err(DataScanError::ConflictRetriesExhausted {
            oid,
            attempts: self.max_retries,
        })
    }

    /// Write the dentry binding `name` to `inode` in `frag`
    pub fn inject_linkage(
        &self,
        frag: FragHandle,
        name: &str,
        version: u64,
        inode: InodeRecord,
    ) -> Result<InjectOutcome> {
        let kind = if inode.is_placeholder() {
            LinkKind::Ancestor
        } else {
            LinkKind::Leaf
        };
        self.link(frag, name, Dentry { version, inode }, kind)
    }
}

impl Default for MetadataDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryDriver for MetadataDriver {
    fn init(&mut self, cluster: &dyn Cluster, fs_map: &FsMap) -> Result<()> {
        let store = cluster.open_pool(fs_map.metadata_pool)?;
        // Probe: an unreachable pool must fail here, not halfway through a scan
        store.list_objects(None, 1).map_err(|e| match e {
            StoreError::Unreachable(_) => e,
            other => StoreError::Unreachable(other.to_string()),
        })?;
        tracing::info!(
            "Attached to metadata pool {} of filesystem '{}'",
            fs_map.metadata_pool,
            fs_map.name
        );
        self.metadata_io = Some(store);
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
        if let Err(defect) = backtrace.validate() {
            tracing::warn!(
                "Backtrace for {:#x} cannot be linked ({}), using lost+found",
                backtrace.ino,
                defect
            );
            return self.inject_lost_and_found(backtrace.ino, size, mtime, chunk_size, data_pool_id);
        }

        // Root-most ancestor first; each step hands its fragment to the next
        let mut ancestors_changed = false;
        let mut outcome = InjectOutcome::Unchanged;
        for level in (0..backtrace.ancestors.len()).rev() {
            let ancestor = &backtrace.ancestors[level];
            let (parent, _) = self.find_or_create_dirfrag(ancestor.dirino)?;

            if level > 0 {
                let dir = InodeRecord::placeholder_dir(backtrace.suffix(level), data_pool_id);
                match self.inject_linkage(parent, &ancestor.dname, ancestor.version, dir)? {
                    InjectOutcome::Injected => ancestors_changed = true,
                    InjectOutcome::Skipped => tracing::warn!(
                        "Directory {:#x} is not reachable as {:#x}/{}; linking below it anyway",
                        backtrace.inode_at(level),
                        ancestor.dirino,
                        ancestor.dname
                    ),
                    _ => {}
                }
            } else {
                let record =
                    InodeRecord::new_file(backtrace.clone(), size, mtime, chunk_size, data_pool_id);
                outcome = self.inject_linkage(parent, &ancestor.dname, ancestor.version, record)?;
            }
        }

        if outcome == InjectOutcome::Unchanged && ancestors_changed {
            outcome = InjectOutcome::Injected;
        }
        Ok(outcome)
    }

    fn inject_lost_and_found(
        &mut self,
        ino: InodeNo,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        data_pool_id: PoolId,
    ) -> Result<InjectOutcome> {
        if is_reserved(ino) {
            return Err(DataScanError::ReservedInode(ino));
        }
        let name = lost_and_found_name(ino);
        let backtrace = Backtrace::new(ino, data_pool_id).with_ancestor(
            LOST_AND_FOUND_INO,
            name.clone(),
            SYNTHETIC_DENTRY_VERSION,
        );
        let (frag, _) = self.find_or_create_dirfrag(LOST_AND_FOUND_INO)?;
        let record = InodeRecord::new_file(backtrace, size, mtime, chunk_size, data_pool_id);

        let outcome = self.inject_linkage(frag, &name, SYNTHETIC_DENTRY_VERSION, record)?;
        Ok(match outcome {
            InjectOutcome::Injected => InjectOutcome::LostAndFound,
            other => other,
        })
    }

    fn init_metadata(&mut self, data_pool_id: PoolId) -> Result<()> {
        for spec in ROOTS.iter() {
            if self.root_exists(spec.ino)? {
                tracing::debug!("{} inode {:#x} already present", spec.label, spec.ino);
                continue;
            }
            self.inject_unlinked_inode(spec, data_pool_id)?;
        }

        let mut root_frag = None;
        for spec in ROOTS.iter() {
            let (frag, _) = self.find_or_create_dirfrag(spec.ino)?;
            if spec.ino == ROOT_INO {
                root_frag = Some(frag);
            }
        }

        // lost+found must be reachable from the root like any directory
        if let (Some(frag), Some(spec)) = (
            root_frag,
            ROOTS.iter().find(|spec| spec.ino == LOST_AND_FOUND_INO),
        ) {
            let mut lost_and_found = InodeRecord::root(spec, data_pool_id);
            lost_and_found.backtrace = Backtrace::new(LOST_AND_FOUND_INO, data_pool_id)
                .with_ancestor(ROOT_INO, LOST_AND_FOUND_NAME, SYNTHETIC_DENTRY_VERSION);
            let outcome = self.link(
                frag,
                LOST_AND_FOUND_NAME,
                Dentry {
                    version: SYNTHETIC_DENTRY_VERSION,
                    inode: lost_and_found,
                },
                LinkKind::Ancestor,
            )?;
            if outcome == InjectOutcome::Skipped {
                tracing::warn!("Root already links another inode as '{}'", LOST_AND_FOUND_NAME);
            }
        }

        Ok(())
    }

    fn check_roots(&mut self) -> Result<bool> {
        let mut present = true;
        for spec in ROOTS.iter() {
            match self.read_root_inode(spec.ino) {
                Ok(record) if record.ino == spec.ino && record.mode == spec.mode => {}
                Ok(record) => {
                    tracing::warn!(
                        "{} inode {:#x} has mode {:o} (expected {:o}); remove it and re-run init",
                        spec.label,
                        spec.ino,
                        record.mode,
                        spec.mode
                    );
                    present = false;
                }
                Err(DataScanError::Store(e)) if e.is_not_found() => {
                    tracing::info!("{} inode {:#x} is missing", spec.label, spec.ino);
                    present = false;
                }
                Err(e) => return Err(e),
            }
        }
        if !present {
            return Ok(false);
        }

        // init may have stopped before linking lost+found into the root
        let root = FragHandle::new(ROOT_INO, ROOT_FRAG);
        match self.read_dentry(root, LOST_AND_FOUND_NAME)? {
            Some(dentry) if dentry.inode.ino == LOST_AND_FOUND_INO => Ok(true),
            Some(dentry) => {
                tracing::warn!(
                    "Root links inode {:#x} as '{}', expected {:#x}",
                    dentry.inode.ino,
                    LOST_AND_FOUND_NAME,
                    LOST_AND_FOUND_INO
                );
                Ok(false)
            }
            None => {
                tracing::info!("'{}' is not linked into the root", LOST_AND_FOUND_NAME);
                Ok(false)
            }
        }
    }
}
