//! Error taxonomy for the reconstruction engine
//!
//! Three layers: [`StoreError`] for the object store, [`DecodeError`] for
//! malformed on-store evidence, and [`DataScanError`] for everything the
//! drivers and the scan coordinator surface to callers.

use thiserror::Error;

use crate::types::{InodeNo, PoolId};

/// Failures reported by an [`ObjectStore`](crate::store::ObjectStore)
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object or attribute absent; expected while the namespace is rebuilt
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// Conditional write lost against a concurrent writer
    #[error("version mismatch on {oid}: expected {expected}, found {actual}")]
    VersionMismatch {
        oid: String,
        expected: u64,
        actual: u64,
    },

    /// The store (or pool) cannot be reached at all
    #[error("backing store unreachable: {0}")]
    Unreachable(String),

    #[error("backing store failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        StoreError::Backend(error.to_string())
    }
}

/// Malformed on-store encodings
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected end of buffer while decoding {0}")]
    Truncated(&'static str),

    #[error("{what} encoded with compat version {compat}, this build understands up to {supported}")]
    Incompatible {
        what: &'static str,
        compat: u8,
        supported: u8,
    },

    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum { stored: u32, computed: u32 },
}

/// Errors surfaced by drivers and by the scan coordinator
#[derive(Debug, Error)]
pub enum DataScanError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("local export I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("local export manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("driver used before init()")]
    NotInitialized,

    /// Precondition failure: the root set is incomplete
    #[error("metadata roots are missing; run `init` on a single worker before scanning")]
    RootsMissing,

    #[error("inode {0:#x} is reserved and cannot be injected")]
    ReservedInode(InodeNo),

    #[error("gave up on {oid} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { oid: String, attempts: usize },

    #[error("invalid shard: worker {n} of {m}")]
    InvalidShard { n: u32, m: u32 },

    #[error("data pool {0} is not part of the filesystem")]
    UnknownDataPool(PoolId),
}

impl DataScanError {
    /// Errors that must stop a whole pass rather than a single object
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DataScanError::Store(StoreError::Unreachable(_)) | DataScanError::NotInitialized
        )
    }

    /// Errors caused by operator input rather than by the store
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            DataScanError::InvalidShard { .. } | DataScanError::UnknownDataPool(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DataScanError>;
