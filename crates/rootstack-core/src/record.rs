use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::digest::digest_for_path;

// Mode type bits (S_IFMT family); kept as raw octal so records loaded from
// the catalog need no platform types.
const IFMT: u32 = 0o170000;
const IFREG: u32 = 0o100000;
const IFDIR: u32 = 0o040000;
const IFLNK: u32 = 0o120000;
const IFIFO: u32 = 0o010000;
const IFBLK: u32 = 0o060000;
const IFCHR: u32 = 0o020000;
const IFSOCK: u32 = 0o140000;
const ALLPERMS: u32 = 0o7777;

/// Persistent per-record flags stored in the catalog's `info` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileInfo(u32);

impl FileInfo {
    pub const NONE: FileInfo = FileInfo(0);
    /// Existed on the host before any overlay touched the path; never removed.
    pub const BASE_SYSTEM: FileInfo = FileInfo(0x0001);
    /// Placeholder meaning "nothing existed at this path".
    pub const NO_ENTRY: FileInfo = FileInfo(0x0002);
    /// Bytes are materialized from the staging area at install time.
    pub const INSTALL_DATA: FileInfo = FileInfo(0x0010);
    /// Bytes are saved under the owning rollback archive's backing store.
    pub const ROLLBACK_DATA: FileInfo = FileInfo(0x0020);

    pub fn from_bits(bits: u32) -> FileInfo {
        FileInfo(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn set(&mut self, flag: FileInfo) {
        self.0 |= flag.0;
    }

    pub fn contains(self, flag: FileInfo) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn intersects(self, flag: FileInfo) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn union(self, flag: FileInfo) -> FileInfo {
        FileInfo(self.0 | flag.0)
    }
}

/// Difference bits produced by [`FileRecord::compare`]. Zero means the two
/// records are identical for install/uninstall purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffFlags(u32);

impl DiffFlags {
    pub const IDENTICAL: DiffFlags = DiffFlags(0);
    pub const GID_DIFFERS: DiffFlags = DiffFlags(0x0010_0000);
    pub const UID_DIFFERS: DiffFlags = DiffFlags(0x0020_0000);
    pub const MODE_DIFFERS: DiffFlags = DiffFlags(0x0100_0000);
    pub const TYPE_DIFFERS: DiffFlags = DiffFlags(0x0200_0000);
    pub const PERM_DIFFERS: DiffFlags = DiffFlags(0x0400_0000);
    pub const DATA_DIFFERS: DiffFlags = DiffFlags(0x2000_0000);
    /// Present vs. absent: infinitely different.
    pub const ALL: DiffFlags = DiffFlags(u32::MAX);

    pub fn set(&mut self, flag: DiffFlags) {
        self.0 |= flag.0;
    }

    pub fn intersects(self, flag: DiffFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn is_identical(self) -> bool {
        self.0 == 0
    }
}

/// File type as encoded in the mode's type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Fifo,
    BlockDevice,
    CharDevice,
    Socket,
    NoEntry,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> FileKind {
        match mode & IFMT {
            IFREG => FileKind::Regular,
            IFDIR => FileKind::Directory,
            IFLNK => FileKind::Symlink,
            IFIFO => FileKind::Fifo,
            IFBLK => FileKind::BlockDevice,
            IFCHR => FileKind::CharDevice,
            IFSOCK => FileKind::Socket,
            _ => FileKind::NoEntry,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Regular => "file",
            FileKind::Directory => "directory",
            FileKind::Symlink => "symlink",
            FileKind::Fifo => "fifo",
            FileKind::BlockDevice => "block device",
            FileKind::CharDevice => "character device",
            FileKind::Socket => "socket",
            FileKind::NoEntry => "no entry",
        }
    }
}

/// One catalog entry: a single path as contributed by a single archive.
///
/// `path` is always depot-relative with a leading `/`. `serial` is zero until
/// the record has been inserted into the catalog. For device nodes `size`
/// carries the rdev so the node can be recreated on restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub serial: i64,
    pub archive_serial: i64,
    pub info: FileInfo,
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub digest: Option<String>,
}

impl FileRecord {
    /// Placeholder for a path with nothing on disk.
    pub fn no_entry(path: impl Into<String>) -> FileRecord {
        FileRecord {
            serial: 0,
            archive_serial: 0,
            info: FileInfo::NO_ENTRY,
            path: path.into(),
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            digest: None,
        }
    }

    /// Stat `full` and build a record for it under the depot-relative `rel`
    /// path. An absent path yields a [`FileRecord::no_entry`] placeholder.
    pub fn from_disk(full: &Path, rel: &str) -> Result<FileRecord> {
        let meta = match fs::symlink_metadata(full) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(FileRecord::no_entry(rel));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to stat {}", full.display()));
            }
        };

        let file_type = meta.file_type();
        let kind = FileKind::from_mode(meta.mode());
        let size = match kind {
            FileKind::BlockDevice | FileKind::CharDevice => meta.rdev(),
            _ => meta.len(),
        };

        Ok(FileRecord {
            serial: 0,
            archive_serial: 0,
            info: FileInfo::NONE,
            path: rel.to_string(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size,
            digest: digest_for_path(full, file_type)?,
        })
    }

    pub fn kind(&self) -> FileKind {
        if self.info.contains(FileInfo::NO_ENTRY) {
            FileKind::NoEntry
        } else {
            FileKind::from_mode(self.mode)
        }
    }

    pub fn is_no_entry(&self) -> bool {
        self.kind() == FileKind::NoEntry
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    pub fn permissions(&self) -> u32 {
        self.mode & ALLPERMS
    }

    /// Bitwise difference between two records. Directories compare only on
    /// type and metadata; a present and an absent record differ in every bit.
    pub fn compare(a: &FileRecord, b: &FileRecord) -> DiffFlags {
        match (a.is_no_entry(), b.is_no_entry()) {
            (true, true) => return DiffFlags::IDENTICAL,
            (true, false) | (false, true) => return DiffFlags::ALL,
            (false, false) => {}
        }

        let mut flags = DiffFlags::IDENTICAL;
        if a.uid != b.uid {
            flags.set(DiffFlags::UID_DIFFERS);
        }
        if a.gid != b.gid {
            flags.set(DiffFlags::GID_DIFFERS);
        }
        if a.mode != b.mode {
            flags.set(DiffFlags::MODE_DIFFERS);
        }
        if a.mode & IFMT != b.mode & IFMT {
            flags.set(DiffFlags::TYPE_DIFFERS);
        }
        if a.permissions() != b.permissions() {
            flags.set(DiffFlags::PERM_DIFFERS);
        }
        match (&a.digest, &b.digest) {
            (Some(x), Some(y)) if x == y => {}
            (None, None) => {}
            _ => flags.set(DiffFlags::DATA_DIFFERS),
        }
        flags
    }
}
