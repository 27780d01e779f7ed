use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Display name given to the synthetic archives that hold pre-install
/// snapshots.
pub const ROLLBACK_NAME: &str = "<Rollback>";

/// Persistent per-archive flags stored in the catalog's `info` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveInfo(u64);

impl ArchiveInfo {
    pub const NONE: ArchiveInfo = ArchiveInfo(0);
    /// Synthetic archive holding the files displaced by an install.
    pub const ROLLBACK: ArchiveInfo = ArchiveInfo(0x1);

    pub fn from_bits(bits: u64) -> ArchiveInfo {
        ArchiveInfo(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, flag: ArchiveInfo) -> bool {
        self.0 & flag.0 == flag.0
    }
}

/// One installed overlay. `serial` is zero until the catalog assigns one;
/// greater serial means higher in the stack. `active` stays false until the
/// install's filesystem phase has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub serial: i64,
    pub uuid: String,
    pub name: String,
    pub date_added: i64,
    pub active: bool,
    pub info: ArchiveInfo,
}

impl ArchiveRecord {
    pub fn new(name: impl Into<String>) -> ArchiveRecord {
        ArchiveRecord {
            serial: 0,
            uuid: Uuid::new_v4().to_string().to_uppercase(),
            name: name.into(),
            date_added: unix_now(),
            active: false,
            info: ArchiveInfo::NONE,
        }
    }

    pub fn rollback() -> ArchiveRecord {
        ArchiveRecord {
            info: ArchiveInfo::ROLLBACK,
            ..ArchiveRecord::new(ROLLBACK_NAME)
        }
    }

    pub fn is_rollback(&self) -> bool {
        self.info.contains(ArchiveInfo::ROLLBACK)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
