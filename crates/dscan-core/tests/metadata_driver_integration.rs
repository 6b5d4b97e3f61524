//! Integration tests for metadata pool reconstruction

use chrono::{DateTime, TimeZone, Utc};
use dscan_core::codec::{Decode, Dentry, DirFrag, Encode, InodeRecord};
use dscan_core::driver::{FragHandle, InjectOutcome, MetadataDriver, RecoveryDriver};
use dscan_core::error::{DataScanError, StoreError};
use dscan_core::store::{
    Cluster, FsMap, MemoryCluster, MemoryStore, ObjectStat, ObjectStore, SqliteCluster, Versioned,
};
use dscan_core::types::{LOST_AND_FOUND_INO, ROOT_FRAG, ROOT_INO};
use dscan_core::Backtrace;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const DATA_POOL: i64 = 2;
const CHUNK: u32 = 4 * 1024 * 1024;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn initialised() -> (Arc<MemoryStore>, MetadataDriver) {
    let store = Arc::new(MemoryStore::new());
    let mut driver = MetadataDriver::with_store(store.clone());
    driver.init_metadata(DATA_POOL).unwrap();
    (store, driver)
}

fn root_frag() -> FragHandle {
    FragHandle::new(ROOT_INO, ROOT_FRAG)
}

fn file_at_root(ino: u64, name: &str, version: u64) -> Backtrace {
    Backtrace::new(ino, DATA_POOL).with_ancestor(ROOT_INO, name, version)
}

#[test]
fn test_single_level_injection_scenario() {
    let (store, mut driver) = initialised();
    let bt = file_at_root(0x100, "foo", 3);

    let outcome = driver
        .inject_with_backtrace(&bt, 4096, at(1_700_000_000), CHUNK, DATA_POOL)
        .unwrap();
    assert_eq!(outcome, InjectOutcome::Injected);

    let dentry = driver.read_dentry(root_frag(), "foo").unwrap().unwrap();
    assert_eq!(dentry.version, 3);
    assert_eq!(dentry.inode.ino, 0x100);
    assert_eq!(dentry.inode.size, 4096);
    assert_eq!(dentry.inode.mtime, at(1_700_000_000));
    assert_eq!(dentry.inode.backtrace, bt);

    // Repeating the call must not touch the pool at all
    let before = store.snapshot().unwrap();
    let again = driver
        .inject_with_backtrace(&bt, 4096, at(1_700_000_000), CHUNK, DATA_POOL)
        .unwrap();
    assert_eq!(again, InjectOutcome::Unchanged);
    assert_eq!(store.snapshot().unwrap(), before);

    // An older binding of another inode under the same name is a no-op
    let rival = file_at_root(0x200, "foo", 2);
    let outcome = driver
        .inject_with_backtrace(&rival, 1, at(1), CHUNK, DATA_POOL)
        .unwrap();
    assert_eq!(outcome, InjectOutcome::Skipped);
    assert_eq!(store.snapshot().unwrap(), before);

    // A tie keeps the existing inode too
    let tie = file_at_root(0x200, "foo", 3);
    let outcome = driver.inject_with_backtrace(&tie, 1, at(1), CHUNK, DATA_POOL).unwrap();
    assert_eq!(outcome, InjectOutcome::Skipped);
    assert_eq!(
        driver.read_dentry(root_frag(), "foo").unwrap().unwrap().inode.ino,
        0x100
    );
}

#[test]
fn test_conflicting_versions_converge_in_either_order() {
    let v1 = file_at_root(0x300, "bar", 1);
    let v2 = file_at_root(0x301, "bar", 2);

    let mut results = Vec::new();
    for order in [[&v1, &v2], [&v2, &v1]] {
        let (_, mut driver) = initialised();
        for bt in order {
            driver
                .inject_with_backtrace(bt, 10, at(100), CHUNK, DATA_POOL)
                .unwrap();
        }
        results.push(driver.read_dentry(root_frag(), "bar").unwrap().unwrap());
    }

    assert_eq!(results[0], results[1]);
    assert_eq!(results[0].version, 2);
    assert_eq!(results[0].inode.ino, 0x301);
}

#[test]
fn test_nested_backtrace_creates_placeholders() {
    let (_, mut driver) = initialised();
    // /home/alice/notes.txt
    let bt = Backtrace::new(0x1002, DATA_POOL)
        .with_ancestor(0x1001, "notes.txt", 4)
        .with_ancestor(0x1000, "alice", 2)
        .with_ancestor(ROOT_INO, "home", 1);

    let outcome = driver
        .inject_with_backtrace(&bt, 12, at(50), CHUNK, DATA_POOL)
        .unwrap();
    assert_eq!(outcome, InjectOutcome::Injected);

    let home = driver.read_dentry(root_frag(), "home").unwrap().unwrap();
    assert_eq!(home.inode.ino, 0x1000);
    assert!(home.inode.is_placeholder());
    assert!(home.inode.is_dir());
    assert_eq!(home.inode.backtrace, bt.suffix(2));

    let alice = driver
        .read_dentry(FragHandle::new(0x1000, ROOT_FRAG), "alice")
        .unwrap()
        .unwrap();
    assert_eq!(alice.inode.ino, 0x1001);
    assert_eq!(alice.version, 2);

    let notes = driver
        .read_dentry(FragHandle::new(0x1001, ROOT_FRAG), "notes.txt")
        .unwrap()
        .unwrap();
    assert_eq!(notes.inode.ino, 0x1002);
    assert!(!notes.inode.is_placeholder());
    assert_eq!(notes.inode.size, 12);

    let fnode = driver.read_fnode(root_frag()).unwrap();
    assert_eq!(fnode.fragstat.nsubdirs, 2); // home and lost+found
}

#[test]
fn test_placeholders_only_move_forward() {
    let (_, mut driver) = initialised();
    let under = |ino: u64, dir_version: u64| {
        Backtrace::new(ino, DATA_POOL)
            .with_ancestor(0x2000, format!("f{:x}", ino), 1)
            .with_ancestor(ROOT_INO, "dir", dir_version)
    };

    driver
        .inject_with_backtrace(&under(0x2001, 2), 1, at(1), CHUNK, DATA_POOL)
        .unwrap();
    driver
        .inject_with_backtrace(&under(0x2002, 5), 1, at(1), CHUNK, DATA_POOL)
        .unwrap();
    driver
        .inject_with_backtrace(&under(0x2003, 3), 1, at(1), CHUNK, DATA_POOL)
        .unwrap();

    let dir = driver.read_dentry(root_frag(), "dir").unwrap().unwrap();
    assert_eq!(dir.version, 5);
    assert!(dir.inode.is_placeholder());

    let frag = driver.read_fnode(FragHandle::new(0x2000, ROOT_FRAG)).unwrap();
    assert_eq!(frag.fragstat.nfiles, 3);
}

#[test]
fn test_placeholder_never_downgrades_real_directory() {
    let (_, mut driver) = initialised();
    let dir_bt = file_at_root(0x3000, "real", 1);
    let mut real = InodeRecord::placeholder_dir(dir_bt, DATA_POOL);
    real.flags = 0;
    real.mtime = at(77);
    driver
        .inject_linkage(root_frag(), "real", 1, real.clone())
        .unwrap();

    let bt = Backtrace::new(0x3001, DATA_POOL)
        .with_ancestor(0x3000, "child", 1)
        .with_ancestor(ROOT_INO, "real", 9);
    driver
        .inject_with_backtrace(&bt, 1, at(1), CHUNK, DATA_POOL)
        .unwrap();

    let stored = driver.read_dentry(root_frag(), "real").unwrap().unwrap();
    assert_eq!(stored.inode, real);
    assert_eq!(stored.version, 1);
}

#[test]
fn test_root_precondition() {
    let store = Arc::new(MemoryStore::new());
    let mut driver = MetadataDriver::with_store(store.clone());
    assert!(!driver.check_roots().unwrap());

    for _ in 0..3 {
        driver.init_metadata(DATA_POOL).unwrap();
        assert!(driver.check_roots().unwrap());
    }

    // Re-running init leaves the pool alone once it converged
    let before = store.snapshot().unwrap();
    driver.init_metadata(DATA_POOL).unwrap();
    assert_eq!(store.snapshot().unwrap(), before);

    store.remove("2.00000000.inode").unwrap();
    assert!(!driver.check_roots().unwrap());
    driver.init_metadata(DATA_POOL).unwrap();
    assert!(driver.check_roots().unwrap());
}

#[test]
fn test_garbage_root_object_is_an_error() {
    let (store, mut driver) = initialised();
    store.write_full("1.00000000.inode", b"garbage").unwrap();
    assert!(matches!(
        driver.check_roots(),
        Err(DataScanError::Decode(_))
    ));
}

#[test]
fn test_orphans_go_to_lost_and_found() {
    let (_, mut driver) = initialised();
    let lost = FragHandle::new(LOST_AND_FOUND_INO, ROOT_FRAG);

    // Chain ends at a directory that is not a root
    let dangling = Backtrace::new(0x500, DATA_POOL).with_ancestor(0x999, "x", 7);
    let outcome = driver
        .inject_with_backtrace(&dangling, 99, at(9), CHUNK, DATA_POOL)
        .unwrap();
    assert_eq!(outcome, InjectOutcome::LostAndFound);

    let parked = driver.read_dentry(lost, "0x500").unwrap().unwrap();
    assert_eq!(parked.inode.ino, 0x500);
    assert_eq!(parked.inode.size, 99);
    assert_eq!(parked.version, 1);

    // A chain with a cycle is equally unusable
    let cycle = Backtrace::new(0x600, DATA_POOL)
        .with_ancestor(0x601, "a", 1)
        .with_ancestor(0x600, "b", 1)
        .with_ancestor(ROOT_INO, "c", 1);
    let outcome = driver
        .inject_with_backtrace(&cycle, 1, at(1), CHUNK, DATA_POOL)
        .unwrap();
    assert_eq!(outcome, InjectOutcome::LostAndFound);
    assert!(driver.read_dentry(lost, "0x600").unwrap().is_some());
    assert!(driver.read_dentry(root_frag(), "c").unwrap().is_none());

    let again = driver
        .inject_lost_and_found(0x500, 99, at(9), CHUNK, DATA_POOL)
        .unwrap();
    assert_eq!(again, InjectOutcome::Unchanged);
}

#[test]
fn test_extent_evidence_only_grows() {
    let (_, mut driver) = initialised();
    let bt = file_at_root(0x700, "grow", 1);

    driver.inject_with_backtrace(&bt, 100, at(10), CHUNK, DATA_POOL).unwrap();
    let outcome = driver.inject_with_backtrace(&bt, 50, at(5), CHUNK, DATA_POOL).unwrap();
    assert_eq!(outcome, InjectOutcome::Unchanged);

    let outcome = driver.inject_with_backtrace(&bt, 500, at(5), CHUNK, DATA_POOL).unwrap();
    assert_eq!(outcome, InjectOutcome::Injected);

    let dentry = driver.read_dentry(root_frag(), "grow").unwrap().unwrap();
    assert_eq!(dentry.inode.size, 500);
    assert_eq!(dentry.inode.mtime, at(10));
}

#[test]
fn test_init_fails_on_unreachable_pool() {
    let cluster = MemoryCluster::new();
    cluster.add_pool(DATA_POOL);
    let fs_map = FsMap::new("cephfs", 1, vec![DATA_POOL]);

    let mut driver = MetadataDriver::new();
    let err = driver.init(&cluster, &fs_map).unwrap_err();
    assert!(err.is_fatal());
}

/// Store wrapper that lets another "worker" write to a dirfrag between our
/// read and our conditional write
struct RacingStore {
    inner: Arc<MemoryStore>,
    races: AtomicUsize,
    next_ino: AtomicUsize,
}

impl RacingStore {
    fn interfere(&self, oid: &str) {
        let current = self.inner.read_versioned(oid).unwrap();
        let mut frag = DirFrag::from_bytes(&current.data).unwrap();
        let ino = 0x9000 + self.next_ino.fetch_add(1, Ordering::SeqCst) as u64;
        let bt = Backtrace::new(ino, DATA_POOL).with_ancestor(ROOT_INO, format!("intruder{:x}", ino), 1);
        let name = bt.ancestors[0].dname.clone();
        frag.link(
            &name,
            Dentry {
                version: 1,
                inode: InodeRecord::new_file(bt, 0, at(0), CHUNK, DATA_POOL),
            },
        );
        frag.fnode.version = current.version + 1;
        self.inner
            .compare_and_write(oid, current.version, &frag.to_bytes())
            .unwrap();
    }
}

impl ObjectStore for RacingStore {
    fn stat(&self, oid: &str) -> Result<ObjectStat, StoreError> {
        self.inner.stat(oid)
    }

    fn read_versioned(&self, oid: &str) -> Result<Versioned, StoreError> {
        self.inner.read_versioned(oid)
    }

    fn create_exclusive(&self, oid: &str, data: &[u8]) -> Result<(), StoreError> {
        self.inner.create_exclusive(oid, data)
    }

    fn write_full(&self, oid: &str, data: &[u8]) -> Result<(), StoreError> {
        self.inner.write_full(oid, data)
    }

    fn compare_and_write(
        &self,
        oid: &str,
        expected_version: u64,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let pending = self.races.load(Ordering::SeqCst);
        if pending > 0 {
            self.races.store(pending - 1, Ordering::SeqCst);
            self.interfere(oid);
        }
        self.inner.compare_and_write(oid, expected_version, data)
    }

    fn get_xattr(&self, oid: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.get_xattr(oid, name)
    }

    fn set_xattr(&self, oid: &str, name: &str, value: &[u8]) -> Result<(), StoreError> {
        self.inner.set_xattr(oid, name, value)
    }

    fn xattr_max_u64(&self, oid: &str, name: &str, value: u64) -> Result<u64, StoreError> {
        self.inner.xattr_max_u64(oid, name, value)
    }

    fn list_objects(&self, after: Option<&str>, max: usize) -> Result<Vec<String>, StoreError> {
        self.inner.list_objects(after, max)
    }
}

fn racing(races: usize) -> (Arc<MemoryStore>, Arc<RacingStore>) {
    let inner = Arc::new(MemoryStore::new());
    let mut setup = MetadataDriver::with_store(inner.clone());
    setup.init_metadata(DATA_POOL).unwrap();
    let store = Arc::new(RacingStore {
        inner: inner.clone(),
        races: AtomicUsize::new(races),
        next_ino: AtomicUsize::new(0),
    });
    (inner, store)
}

#[test]
fn test_lost_race_is_retried_with_fresh_state() {
    let (_, store) = racing(2);
    let mut driver = MetadataDriver::with_store(store.clone());

    let outcome = driver
        .inject_with_backtrace(&file_at_root(0x800, "mine", 1), 1, at(1), CHUNK, DATA_POOL)
        .unwrap();
    assert_eq!(outcome, InjectOutcome::Injected);

    // Both the racing writes and ours survive
    assert!(driver.read_dentry(root_frag(), "mine").unwrap().is_some());
    assert!(driver.read_dentry(root_frag(), "intruder9000").unwrap().is_some());
    assert!(driver.read_dentry(root_frag(), "intruder9001").unwrap().is_some());

    let fnode = driver.read_fnode(root_frag()).unwrap();
    assert_eq!(fnode.version, store.stat("1.00000000").unwrap().version);
}

#[test]
fn test_endless_races_give_up() {
    let (_, store) = racing(usize::MAX);
    let mut driver = MetadataDriver::with_store(store).with_max_retries(3);

    let err = driver
        .inject_with_backtrace(&file_at_root(0x801, "never", 1), 1, at(1), CHUNK, DATA_POOL)
        .unwrap_err();
    match err {
        DataScanError::ConflictRetriesExhausted { oid, attempts } => {
            assert_eq!(oid, "1.00000000");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_sqlite_backed_injection_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = SqliteCluster::open(dir.path().join("cluster.db")).unwrap();
    cluster.create_pool(1, "cephfs_metadata").unwrap();
    cluster.create_pool(DATA_POOL, "cephfs_data").unwrap();
    let fs_map = FsMap::new("cephfs", 1, vec![DATA_POOL]);

    let mut driver = MetadataDriver::new();
    driver.init(&cluster, &fs_map).unwrap();
    assert!(!driver.check_roots().unwrap());
    driver.init_metadata(DATA_POOL).unwrap();
    assert!(driver.check_roots().unwrap());

    let bt = file_at_root(0x100, "foo", 3);
    assert_eq!(
        driver.inject_with_backtrace(&bt, 4096, at(1), CHUNK, DATA_POOL).unwrap(),
        InjectOutcome::Injected
    );

    let metadata = cluster.open_pool(1).unwrap();
    let version = metadata.stat("1.00000000").unwrap().version;
    assert_eq!(
        driver.inject_with_backtrace(&bt, 4096, at(1), CHUNK, DATA_POOL).unwrap(),
        InjectOutcome::Unchanged
    );
    assert_eq!(metadata.stat("1.00000000").unwrap().version, version);

    let frag = DirFrag::from_bytes(&metadata.read("1.00000000").unwrap()).unwrap();
    assert_eq!(frag.fnode.version, version);
    assert_eq!(frag.get("foo").map(|d| d.inode.ino), Some(0x100));
}
