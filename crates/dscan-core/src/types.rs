/// Inode numbers, pools, fragments and the object naming scheme
///
/// Every object the engine touches is addressed by name. Dirfrags and data
/// chunks share the `<ino hex>.<index 8 hex>` shape and live in different
/// pools; root inodes get a dedicated `.inode` object.
use nom::{
    bytes::complete::{tag, take_while_m_n},
    combinator::{all_consuming, map_res},
    sequence::tuple,
    IResult,
};

/// Inode number
pub type InodeNo = u64;

/// Directory fragment identifier
pub type FragId = u32;

/// Pool identifier inside the cluster
pub type PoolId = i64;

/// Filesystem root
pub const ROOT_INO: InodeNo = 0x1;

/// Internal metadata directory ("mydir")
pub const MDSDIR_INO: InodeNo = 0x2;

/// Lost-and-found directory, linked into the root as `lost+found`
pub const LOST_AND_FOUND_INO: InodeNo = 0x4;

/// Inode numbers below this value belong to the system
pub const FIRST_USER_INO: InodeNo = 0x100;

/// The unfragmented directory fragment
pub const ROOT_FRAG: FragId = 0;

pub const LOST_AND_FOUND_NAME: &str = "lost+found";

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

/// Mode of recovered regular files
pub const RECOVERED_FILE_MODE: u32 = S_IFREG | 0o500;

/// Mode of placeholder directories and of the root
pub const DIR_MODE: u32 = S_IFDIR | 0o755;

/// Mode of the system-private roots (mydir, lost+found)
pub const PRIVATE_DIR_MODE: u32 = S_IFDIR | 0o700;

/// Default object size when a file carries no layout
pub const DEFAULT_CHUNK_SIZE: u32 = 4 * 1024 * 1024;

/// Data object xattr holding the encoded backtrace
pub const XATTR_PARENT: &str = "parent";

/// Data object xattr holding the encoded file layout
pub const XATTR_LAYOUT: &str = "layout";

/// Extent pass accumulator: furthest byte written into the file
pub const XATTR_SCAN_CEILING: &str = "scan_ceiling";

/// Extent pass accumulator: newest object mtime (unix seconds)
pub const XATTR_SCAN_MAX_MTIME: &str = "scan_max_mtime";

/// One of the three anchors that must exist before injection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootSpec {
    pub ino: InodeNo,
    pub mode: u32,
    pub label: &'static str,
}

/// Root set, in creation order
pub const ROOTS: [RootSpec; 3] = [
    RootSpec {
        ino: ROOT_INO,
        mode: DIR_MODE,
        label: "root",
    },
    RootSpec {
        ino: MDSDIR_INO,
        mode: PRIVATE_DIR_MODE,
        label: "mydir",
    },
    RootSpec {
        ino: LOST_AND_FOUND_INO,
        mode: PRIVATE_DIR_MODE,
        label: "lost+found",
    },
];

pub fn is_root(ino: InodeNo) -> bool {
    ROOTS.iter().any(|r| r.ino == ino)
}

pub fn is_reserved(ino: InodeNo) -> bool {
    ino < FIRST_USER_INO
}

pub fn is_dir_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// Name of the object holding a root inode record
pub fn inode_object_name(ino: InodeNo) -> String {
    format!("{:x}.{:08x}.inode", ino, ROOT_FRAG)
}

/// Name of a dirfrag object in the metadata pool
pub fn dirfrag_object_name(ino: InodeNo, frag: FragId) -> String {
    format!("{:x}.{:08x}", ino, frag)
}

/// Name of a data chunk in a data pool
pub fn data_object_name(ino: InodeNo, chunk: u64) -> String {
    format!("{:x}.{:08x}", ino, chunk)
}

/// Dentry name used for inodes parked in lost+found
pub fn lost_and_found_name(ino: InodeNo) -> String {
    format!("{:#x}", ino)
}

/// A parsed data object name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataObjectId {
    pub ino: InodeNo,
    pub chunk: u64,
}

impl DataObjectId {
    /// Parse `<ino hex>.<chunk hex>`; anything else is not a data object
    pub fn parse(name: &str) -> Option<Self> {
        all_consuming(data_object_id)(name)
            .ok()
            .map(|(_, id)| id)
    }

    pub fn is_head(&self) -> bool {
        self.chunk == 0
    }

    pub fn head(&self) -> Self {
        Self {
            ino: self.ino,
            chunk: 0,
        }
    }

    pub fn object_name(&self) -> String {
        data_object_name(self.ino, self.chunk)
    }
}

fn hex_u64(input: &str) -> IResult<&str, u64> {
    map_res(
        take_while_m_n(1, 16, |c: char| c.is_ascii_hexdigit()),
        |s: &str| u64::from_str_radix(s, 16),
    )(input)
}

fn data_object_id(input: &str) -> IResult<&str, DataObjectId> {
    let (rest, (ino, _, chunk)) = tuple((
        hex_u64,
        tag("."),
        map_res(
            take_while_m_n(8, 16, |c: char| c.is_ascii_hexdigit()),
            |s: &str| u64::from_str_radix(s, 16),
        ),
    ))(input)?;
    Ok((rest, DataObjectId { ino, chunk }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_names() {
        assert_eq!(inode_object_name(ROOT_INO), "1.00000000.inode");
        assert_eq!(dirfrag_object_name(0x100, 0), "100.00000000");
        assert_eq!(data_object_name(0x10000000000, 3), "10000000000.00000003");
        assert_eq!(lost_and_found_name(0x100), "0x100");
    }

    #[test]
    fn test_data_object_parsing() {
        let id = DataObjectId::parse("100.00000000").unwrap();
        assert_eq!(id, DataObjectId { ino: 0x100, chunk: 0 });
        assert!(id.is_head());

        let id = DataObjectId::parse("1a2b.0000000f").unwrap();
        assert_eq!(id.ino, 0x1a2b);
        assert_eq!(id.chunk, 15);
        assert_eq!(id.head().object_name(), "1a2b.00000000");

        assert_eq!(DataObjectId::parse("1.00000000.inode"), None);
        assert_eq!(DataObjectId::parse("100.0"), None);
        assert_eq!(DataObjectId::parse("zz.00000000"), None);
        assert_eq!(DataObjectId::parse(""), None);
    }

    #[test]
    fn test_root_classification() {
        assert!(is_root(ROOT_INO));
        assert!(is_root(LOST_AND_FOUND_INO));
        assert!(!is_root(0x3));
        assert!(is_reserved(0x3));
        assert!(!is_reserved(FIRST_USER_INO));
        assert!(is_dir_mode(DIR_MODE));
        assert!(!is_dir_mode(RECOVERED_FILE_MODE));
    }
}
