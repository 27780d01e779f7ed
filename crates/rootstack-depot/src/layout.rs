use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEPOT_DIR: &str = ".DarwinDepot";
pub const DATABASE_FILE: &str = "Database-V100";

/// On-disk layout of a depot under its prefix. Every path below
/// `<prefix>/.DarwinDepot/` is derived here and nowhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepotLayout {
    prefix: PathBuf,
}

impl DepotLayout {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn depot_dir(&self) -> PathBuf {
        self.prefix.join(DEPOT_DIR)
    }

    pub fn database_path(&self) -> PathBuf {
        self.depot_dir().join(DATABASE_FILE)
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.depot_dir().join("Archives")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.depot_dir().join("Downloads")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.depot_dir().join(".lock")
    }

    /// Expanded backing-store directory for an archive, named by uppercase
    /// UUID.
    pub fn archive_dir(&self, uuid: &str) -> PathBuf {
        self.archives_dir().join(uuid)
    }

    /// Compacted copy of the backing-store directory, a sibling of it.
    pub fn archive_tarball(&self, uuid: &str) -> PathBuf {
        self.archives_dir().join(format!("{uuid}.tar.bz2"))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.depot_dir(), self.archives_dir(), self.downloads_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
