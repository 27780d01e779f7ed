use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::DepotError;

/// Whole-depot advisory lock: shared for reads, exclusive for mutation.
///
/// The lock file is never unlinked; removing a still-locked file would let a
/// second process lock a fresh inode at the same path.
#[derive(Debug)]
pub struct DepotLock {
    file: File,
    path: PathBuf,
}

impl DepotLock {
    /// Open the lock file and take a shared lock. A depot that cannot get at
    /// least shared access refuses to initialize.
    pub fn acquire_shared(path: &Path) -> Result<DepotLock> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|err| map_open_error(err, path))?;
        if file.try_lock_shared().is_err() {
            return Err(DepotError::LockBusy {
                path: path.to_path_buf(),
            }
            .into());
        }
        Ok(DepotLock {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Upgrade to an exclusive lock for a mutating operation. On contention
    /// the shared lock is re-taken before reporting busy.
    pub fn upgrade(&self) -> Result<()> {
        self.file.unlock().ok();
        if self.file.try_lock_exclusive().is_err() {
            self.file.lock_shared().ok();
            return Err(DepotError::LockBusy {
                path: self.path.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Downgrade back to shared after the mutation completes.
    pub fn downgrade(&self) -> Result<()> {
        self.file.unlock().ok();
        self.file
            .lock_shared()
            .with_context(|| format!("failed to re-acquire shared lock on {}", self.path.display()))
    }
}

impl Drop for DepotLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn map_open_error(err: io::Error, path: &Path) -> anyhow::Error {
    if err.kind() == io::ErrorKind::PermissionDenied {
        DepotError::PermissionDenied {
            path: path.to_path_buf(),
        }
        .into()
    } else {
        DepotError::Io {
            path: path.to_path_buf(),
            source: err,
        }
        .into()
    }
}
