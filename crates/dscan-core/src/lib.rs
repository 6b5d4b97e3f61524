use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod codec;
pub mod driver;
pub mod error;
pub mod scan;
pub mod store;
pub mod types;

// Re-export the types most callers need
pub use codec::{Backtrace, BacktraceAncestor, Dentry, DirFrag, FileLayout, InodeRecord};
pub use driver::{InjectOutcome, LocalFileDriver, MetadataDriver, RecoveryDriver};
pub use error::{DataScanError, DecodeError, StoreError};
pub use scan::{DataScan, ExtentPhase, ScanConfig, ScanPass, ScanProgress, ScanSummary, Shard};
pub use store::{Cluster, FsMap, MemoryCluster, ObjectStore, SqliteCluster};

/// Where recovered metadata is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverTarget {
    /// Rebuild the filesystem's metadata pool in place
    MetadataPool,
    /// Materialise files under a local directory, leaving the cluster untouched
    LocalExport(PathBuf),
}

impl DriverTarget {
    pub fn from_output_dir(output_dir: Option<PathBuf>) -> Self {
        match output_dir {
            Some(dir) => DriverTarget::LocalExport(dir),
            None => DriverTarget::MetadataPool,
        }
    }
}

/// Pick the driver for `target` and attach a scan coordinator to it
pub fn open_scan(
    cluster: &dyn Cluster,
    fs_map: &FsMap,
    target: &DriverTarget,
    config: ScanConfig,
) -> Result<DataScan> {
    let driver: Box<dyn RecoveryDriver> = match target {
        DriverTarget::MetadataPool => Box::new(MetadataDriver::new()),
        DriverTarget::LocalExport(dir) => {
            let pool = config
                .data_pool_id
                .or_else(|| fs_map.data_pools.first().copied())
                .ok_or(DataScanError::UnknownDataPool(0))?;
            let data_io = cluster
                .open_pool(pool)
                .map_err(DataScanError::from)
                .with_context(|| format!("Failed to open data pool {}", pool))?;
            Box::new(LocalFileDriver::new(dir.clone(), data_io))
        }
    };

    tracing::info!("Opening filesystem '{}' ({:?})", fs_map.name, target);
    DataScan::new(cluster, fs_map, driver, config)
        .with_context(|| format!("Failed to start data scan of '{}'", fs_map.name))
}

/// Write a pass summary as pretty JSON
pub fn write_report(summary: &ScanSummary, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create report {}", path.display()))?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}
