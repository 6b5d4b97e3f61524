//! Reconstruction drivers
//!
//! A driver turns recovered evidence into namespace metadata. The scan
//! coordinator talks to it only through [`RecoveryDriver`], so the same scan
//! can rebuild the live metadata pool ([`MetadataDriver`]) or materialise the
//! namespace in a local directory for inspection ([`LocalFileDriver`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Backtrace;
use crate::error::Result;
use crate::store::{Cluster, FsMap};
use crate::types::{InodeNo, PoolId};

mod local;
mod metadata;

pub use local::LocalFileDriver;
pub use metadata::{FragHandle, MetadataDriver, DEFAULT_MAX_RETRIES};

/// What a single injection did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InjectOutcome {
    /// New or newer state was written
    Injected,
    /// The stored state already matched the evidence
    Unchanged,
    /// A stored binding with a higher (or tied, for another inode) version won
    Skipped,
    /// The evidence could not be linked; the inode went to lost+found
    LostAndFound,
}

/// Common interface of the reconstruction targets
pub trait RecoveryDriver {
    /// Establish the session against the cluster; fails if it is unreachable
    fn init(&mut self, cluster: &dyn Cluster, fs_map: &FsMap) -> Result<()>;

    /// Inject an inode and its ancestry, based on a backtrace recovered from
    /// the data pool
    fn inject_with_backtrace(
        &mut self,
        backtrace: &Backtrace,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        data_pool_id: PoolId,
    ) -> Result<InjectOutcome>;

    /// Inject an inode into lost+found when all we know about it is its number
    fn inject_lost_and_found(
        &mut self,
        ino: InodeNo,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        data_pool_id: PoolId,
    ) -> Result<InjectOutcome>;

    /// Create any missing roots (root, mydir, lost+found)
    fn init_metadata(&mut self, data_pool_id: PoolId) -> Result<()>;

    /// Pre-injection check that all the roots are present.
    ///
    /// Missing roots are not an error: `Ok(false)` tells the operator to run
    /// `init` on a single worker before starting a parallel scan.
    fn check_roots(&mut self) -> Result<bool>;
}
