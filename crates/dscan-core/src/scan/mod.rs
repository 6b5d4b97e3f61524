//! Scan coordinator
//!
//! Walks the data pool, picks out the objects owned by this worker and turns
//! the evidence they carry into driver calls. Two passes exist:
//!
//! * the backtrace pass reads the `parent` backtrace on each head object and
//!   injects the file at the path it names (or into lost+found);
//! * the extent pass first folds the size and mtime of every chunk into
//!   accumulators on the head object, then re-injects heads with those
//!   values so files whose later chunks outgrew the head get their full size.
//!
//! Workers never talk to each other. With several workers, run the
//! accumulate phase everywhere before any worker applies.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::codec::{decode_u64, Backtrace, Decode, FileLayout};
use crate::driver::{InjectOutcome, RecoveryDriver};
use crate::error::{DataScanError, Result};
use crate::store::{Cluster, FsMap, ObjectLister, ObjectStore};
use crate::types::{
    DataObjectId, PoolId, DEFAULT_CHUNK_SIZE, XATTR_LAYOUT, XATTR_PARENT, XATTR_SCAN_CEILING,
    XATTR_SCAN_MAX_MTIME,
};

mod shard;

pub use shard::Shard;

const DEFAULT_PAGE_SIZE: usize = 1024;

/// Scan tuning
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub shard: Shard,
    /// Data pool to scan; the first pool of the filesystem when unset
    pub data_pool_id: Option<PoolId>,
    /// Chunk size assumed for files whose head carries no layout
    pub default_chunk_size: u32,
    /// Object names fetched per listing request
    pub page_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            shard: Shard::single(),
            data_pool_id: None,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ScanConfig {
    pub fn with_shard(mut self, shard: Shard) -> Self {
        self.shard = shard;
        self
    }

    pub fn with_data_pool(mut self, pool_id: PoolId) -> Self {
        self.data_pool_id = Some(pool_id);
        self
    }

    pub fn with_default_chunk_size(mut self, chunk_size: u32) -> Self {
        self.default_chunk_size = chunk_size;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtentPhase {
    /// Record chunk extents on head objects
    Accumulate,
    /// Inject heads using the recorded extents
    Apply,
    Both,
}

impl ExtentPhase {
    pub fn accumulates(&self) -> bool {
        matches!(self, ExtentPhase::Accumulate | ExtentPhase::Both)
    }

    pub fn applies(&self) -> bool {
        matches!(self, ExtentPhase::Apply | ExtentPhase::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPass {
    Backtrace,
    Extents(ExtentPhase),
}

impl fmt::Display for ScanPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanPass::Backtrace => write!(f, "backtrace scan"),
            ScanPass::Extents(ExtentPhase::Accumulate) => write!(f, "extent scan (accumulate)"),
            ScanPass::Extents(ExtentPhase::Apply) => write!(f, "extent scan (apply)"),
            ScanPass::Extents(ExtentPhase::Both) => write!(f, "extent scan"),
        }
    }
}

/// What one pass did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub run_id: Uuid,
    pub pass: ScanPass,
    pub shard: Shard,
    pub data_pool_id: PoolId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub objects_listed: u64,
    pub objects_in_shard: u64,
    /// Chunks whose extents were folded into their head
    pub accumulated: u64,
    pub injected: u64,
    pub unchanged: u64,
    pub lost_and_found: u64,
    pub skipped: u64,
    /// Names in the shard that are not data objects of interest
    pub ignored: u64,
    pub errored: u64,
}

impl ScanSummary {
    pub fn new(pass: ScanPass, shard: Shard, data_pool_id: PoolId) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pass,
            shard,
            data_pool_id,
            started_at: Utc::now(),
            finished_at: None,
            objects_listed: 0,
            objects_in_shard: 0,
            accumulated: 0,
            injected: 0,
            unchanged: 0,
            lost_and_found: 0,
            skipped: 0,
            ignored: 0,
            errored: 0,
        }
    }

    pub fn record(&mut self, outcome: InjectOutcome) {
        match outcome {
            InjectOutcome::Injected => self.injected += 1,
            InjectOutcome::Unchanged => self.unchanged += 1,
            InjectOutcome::Skipped => self.skipped += 1,
            InjectOutcome::LostAndFound => self.lost_and_found += 1,
        }
    }

    pub fn has_errors(&self) -> bool {
        self.errored > 0
    }

    fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

/// Snapshot handed to the progress callback after every object
#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub pass: ScanPass,
    pub objects_listed: u64,
    pub objects_in_shard: u64,
    pub recovered: u64,
    pub errored: u64,
    pub current_object: String,
}

pub struct DataScan {
    driver: Box<dyn RecoveryDriver>,
    data_io: Arc<dyn ObjectStore>,
    data_pool_id: PoolId,
    config: ScanConfig,
    progress_callback: Option<Box<dyn Fn(ScanProgress) + Send + Sync>>,
}

impl DataScan {
    /// Validate the configuration against the filesystem and start the driver
    pub fn new(
        cluster: &dyn Cluster,
        fs_map: &FsMap,
        mut driver: Box<dyn RecoveryDriver>,
        config: ScanConfig,
    ) -> Result<Self> {
        Shard::new(config.shard.n, config.shard.m)?;

        let data_pool_id = config
            .data_pool_id
            .or_else(|| fs_map.data_pools.first().copied())
            .ok_or(DataScanError::UnknownDataPool(0))?;
        if !fs_map.has_data_pool(data_pool_id) {
            return Err(DataScanError::UnknownDataPool(data_pool_id));
        }

        driver.init(cluster, fs_map)?;
        let data_io = cluster.open_pool(data_pool_id)?;

        Ok(Self {
            driver,
            data_io,
            data_pool_id,
            config,
            progress_callback: None,
        })
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(ScanProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    pub fn data_pool_id(&self) -> PoolId {
        self.data_pool_id
    }

    pub fn shard(&self) -> Shard {
        self.config.shard
    }

    /// Create whichever roots are missing
    pub fn init_metadata(&mut self) -> Result<()> {
        tracing::info!("Initialising metadata roots");
        self.driver.init_metadata(self.data_pool_id)
    }

    pub fn check_roots(&mut self) -> Result<bool> {
        self.driver.check_roots()
    }

    /// Backtrace pass over this worker's shard
    pub fn recover(&mut self) -> Result<ScanSummary> {
        self.require_roots()?;
        let mut summary = ScanSummary::new(ScanPass::Backtrace, self.config.shard, self.data_pool_id);
        tracing::info!(
            "🔍 Starting {} of pool {} (shard {})",
            summary.pass,
            self.data_pool_id,
            self.config.shard
        );
        self.inject_heads(&mut summary, true)?;
        summary.finish();
        log_summary(&summary);
        Ok(summary)
    }

    /// Extent pass over this worker's shard
    pub fn recover_extents(&mut self, phase: ExtentPhase) -> Result<ScanSummary> {
        if phase.applies() {
            self.require_roots()?;
        }
        let mut summary =
            ScanSummary::new(ScanPass::Extents(phase), self.config.shard, self.data_pool_id);
        tracing::info!(
            "🔍 Starting {} of pool {} (shard {})",
            summary.pass,
            self.data_pool_id,
            self.config.shard
        );

        if phase.accumulates() {
            self.accumulate(&mut summary)?;
        }
        if phase.applies() {
            let count_listing = !phase.accumulates();
            self.inject_heads(&mut summary, count_listing)?;
        }

        summary.finish();
        log_summary(&summary);
        Ok(summary)
    }

    fn require_roots(&mut self) -> Result<()> {
        if self.driver.check_roots()? {
            Ok(())
        } else {
            Err(DataScanError::RootsMissing)
        }
    }

    fn emit_progress(&self, summary: &ScanSummary, current_object: &str) {
        if let Some(ref callback) = self.progress_callback {
            callback(ScanProgress {
                pass: summary.pass,
                objects_listed: summary.objects_listed,
                objects_in_shard: summary.objects_in_shard,
                recovered: summary.injected + summary.lost_and_found + summary.accumulated,
                errored: summary.errored,
                current_object: current_object.to_string(),
            });
        }
    }

    /// Run `inject_head` on every head object of the shard
    fn inject_heads(&mut self, summary: &mut ScanSummary, count_listing: bool) -> Result<()> {
        let data_io = Arc::clone(&self.data_io);
        for entry in ObjectLister::new(data_io.as_ref(), self.config.page_size) {
            let name = entry?;
            if count_listing {
                summary.objects_listed += 1;
            }
            if !self.config.shard.owns(&name) {
                continue;
            }
            if count_listing {
                summary.objects_in_shard += 1;
            }

            match DataObjectId::parse(&name) {
                Some(id) if id.is_head() => match self.inject_head(id) {
                    Ok(outcome) => summary.record(outcome),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::error!("Failed to recover {}: {}", name, e);
                        summary.errored += 1;
                    }
                },
                Some(_) => {
                    if count_listing {
                        summary.ignored += 1;
                    }
                }
                None => {
                    tracing::debug!("Ignoring non-data object {}", name);
                    if count_listing {
                        summary.ignored += 1;
                    }
                }
            }
            self.emit_progress(summary, &name);
        }
        Ok(())
    }

    /// Turn one head object into a driver call
    fn inject_head(&mut self, id: DataObjectId) -> Result<InjectOutcome> {
        let oid = id.object_name();
        let stat = self.data_io.stat(&oid)?;
        let chunk_size = self.chunk_size_of(&oid)?;

        let size = match self.accumulator(&oid, XATTR_SCAN_CEILING)? {
            Some(ceiling) => stat.size.max(ceiling),
            None => stat.size,
        };
        let mtime = match self
            .accumulator(&oid, XATTR_SCAN_MAX_MTIME)?
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        {
            // An empty head may have been created by the accumulate phase
            Some(newest) if stat.size == 0 => newest,
            Some(newest) => stat.mtime.max(newest),
            None => stat.mtime,
        };

        match self.backtrace_of(&oid)? {
            Some(backtrace) if backtrace.ino == id.ino => {
                tracing::debug!("Injecting {} ({} bytes) via {}", oid, size, backtrace);
                self.driver
                    .inject_with_backtrace(&backtrace, size, mtime, chunk_size, self.data_pool_id)
            }
            Some(backtrace) => {
                tracing::warn!(
                    "Backtrace on {} belongs to inode {:#x}, using lost+found",
                    oid,
                    backtrace.ino
                );
                self.driver
                    .inject_lost_and_found(id.ino, size, mtime, chunk_size, self.data_pool_id)
            }
            None => self
                .driver
                .inject_lost_and_found(id.ino, size, mtime, chunk_size, self.data_pool_id),
        }
    }

    /// Decoded `parent` xattr, or `None` when absent or unreadable
    fn backtrace_of(&self, oid: &str) -> Result<Option<Backtrace>> {
        let raw = match self.data_io.get_xattr(oid, XATTR_PARENT) {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => {
                tracing::info!("No backtrace on {}, using lost+found", oid);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        match Backtrace::from_bytes(&raw) {
            Ok(backtrace) => Ok(Some(backtrace)),
            Err(e) => {
                tracing::warn!("Undecodable backtrace on {} ({}), using lost+found", oid, e);
                Ok(None)
            }
        }
    }

    /// Chunk size from the head's `layout` xattr
    fn chunk_size_of(&self, head_oid: &str) -> Result<u32> {
        let raw = match self.data_io.get_xattr(head_oid, XATTR_LAYOUT) {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(self.config.default_chunk_size),
            Err(e) => return Err(e.into()),
        };
        match FileLayout::from_bytes(&raw) {
            Ok(layout) => Ok(layout.object_size),
            Err(e) => {
                tracing::warn!("Bad layout on {} ({}), assuming default chunk size", head_oid, e);
                Ok(self.config.default_chunk_size)
            }
        }
    }

    fn accumulator(&self, head_oid: &str, name: &str) -> Result<Option<u64>> {
        let raw = match self.data_io.get_xattr(head_oid, name) {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match decode_u64(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!("Ignoring {} on {}: {}", name, head_oid, e);
                Ok(None)
            }
        }
    }

    /// Fold every chunk of the shard into its head's accumulators
    fn accumulate(&mut self, summary: &mut ScanSummary) -> Result<()> {
        let data_io = Arc::clone(&self.data_io);
        for entry in ObjectLister::new(data_io.as_ref(), self.config.page_size) {
            let name = entry?;
            summary.objects_listed += 1;
            if !self.config.shard.owns(&name) {
                continue;
            }
            summary.objects_in_shard += 1;

            let Some(id) = DataObjectId::parse(&name) else {
                summary.ignored += 1;
                continue;
            };
            match self.accumulate_object(id) {
                Ok(()) => summary.accumulated += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!("Failed to accumulate {}: {}", name, e);
                    summary.errored += 1;
                }
            }
            self.emit_progress(summary, &name);
        }
        Ok(())
    }

    fn accumulate_object(&self, id: DataObjectId) -> Result<()> {
        let stat = self.data_io.stat(&id.object_name())?;
        let head = id.head().object_name();
        let chunk_size = self.chunk_size_of(&head)? as u64;

        let end = id.chunk.saturating_mul(chunk_size).saturating_add(stat.size);
        let secs = stat.mtime.timestamp().max(0) as u64;
        self.data_io.xattr_max_u64(&head, XATTR_SCAN_CEILING, end)?;
        self.data_io.xattr_max_u64(&head, XATTR_SCAN_MAX_MTIME, secs)?;
        tracing::debug!("Chunk {} of {:#x} ends at {}", id.chunk, id.ino, end);
        Ok(())
    }
}

fn log_summary(summary: &ScanSummary) {
    tracing::info!(
        "✅ {} finished: {} listed, {} in shard, {} injected, {} unchanged, {} lost+found, {} skipped, {} errored",
        summary.pass,
        summary.objects_listed,
        summary.objects_in_shard,
        summary.injected,
        summary.unchanged,
        summary.lost_and_found,
        summary.skipped,
        summary.errored
    );
}
