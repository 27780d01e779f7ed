//! Backing store under `<prefix>/.DarwinDepot/Archives/`: one expanded
//! directory per archive plus a compacted `<UUID>.tar.bz2` sibling. The
//! expanded directory doubles as the staging area during install and is
//! pruned afterwards; `expand` restores it from the tarball on demand.

use anyhow::{anyhow, Context, Result};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use std::ffi::CString;
use std::fs::{self, File};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{chown, lchown, symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

use rootstack_core::{ensure_dir, join_under_prefix};

use crate::archive::ArchiveRecord;
use crate::layout::DepotLayout;

#[derive(Debug)]
pub struct BackingStore {
    layout: DepotLayout,
}

impl BackingStore {
    pub fn new(layout: DepotLayout) -> BackingStore {
        BackingStore { layout }
    }

    /// The archive's expanded directory, created on demand.
    pub fn archive_dir(&self, archive: &ArchiveRecord) -> Result<PathBuf> {
        let dir = self.layout.archive_dir(&archive.uuid);
        ensure_dir(&dir)?;
        Ok(dir)
    }

    /// Writable directory for the archive decoder to extract into. This is
    /// the archive's own backing directory; it must not already hold content.
    pub fn stage(&self, archive: &ArchiveRecord) -> Result<PathBuf> {
        let dir = self.archive_dir(archive)?;
        let occupied = fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .next()
            .is_some();
        if occupied {
            return Err(anyhow!("staging area is not empty: {}", dir.display()));
        }
        Ok(dir)
    }

    /// Where a depot-relative path lives inside the archive's directory.
    pub fn saved_path(&self, archive: &ArchiveRecord, rel: &str) -> PathBuf {
        join_under_prefix(&self.layout.archive_dir(&archive.uuid), rel)
    }

    /// Make room for a saved file's parents under the archive directory.
    pub fn prepare_save(&self, archive: &ArchiveRecord, rel: &str) -> Result<()> {
        let dst = self.saved_path(archive, rel);
        if let Some(parent) = dst.parent() {
            ensure_dir(parent)?;
        }
        Ok(())
    }

    /// Copy a live file into the archive's mirrored tree, preserving mode,
    /// ownership, and timestamps.
    pub fn save(&self, archive: &ArchiveRecord, rel: &str, src: &Path) -> Result<()> {
        let dst = self.saved_path(archive, rel);
        self.prepare_save(archive, rel)?;
        debug!(src = %src.display(), dst = %dst.display(), "saving original");
        copy_preserving(src, &dst)
    }

    /// Produce `Archives/<UUID>.tar.bz2` from the expanded directory so the
    /// directory itself can later be pruned.
    pub fn compact(&self, archive: &ArchiveRecord) -> Result<()> {
        let dir = self.layout.archive_dir(&archive.uuid);
        let tarball = self.layout.archive_tarball(&archive.uuid);
        debug!(dir = %dir.display(), tarball = %tarball.display(), "compacting");

        let out = File::create(&tarball)
            .with_context(|| format!("failed to create {}", tarball.display()))?;
        let encoder = BzEncoder::new(out, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder
            .append_dir_all(&archive.uuid, &dir)
            .with_context(|| format!("failed to archive {}", dir.display()))?;
        let encoder = builder
            .into_inner()
            .with_context(|| format!("failed to finalize {}", tarball.display()))?;
        encoder
            .finish()
            .with_context(|| format!("failed to flush {}", tarball.display()))?;
        Ok(())
    }

    /// Restore the expanded directory from the compacted tarball.
    pub fn expand(&self, archive: &ArchiveRecord) -> Result<()> {
        let tarball = self.layout.archive_tarball(&archive.uuid);
        debug!(tarball = %tarball.display(), "expanding");
        let f = File::open(&tarball)
            .with_context(|| format!("failed to open {}", tarball.display()))?;
        let mut unpacker = tar::Archive::new(BzDecoder::new(f));
        unpacker.set_preserve_permissions(true);
        unpacker.set_preserve_mtime(true);
        unpacker
            .unpack(self.layout.archives_dir())
            .with_context(|| format!("failed to unpack {}", tarball.display()))?;
        Ok(())
    }

    /// The expanded directory, expanding the tarball first if it was pruned.
    pub fn ensure_expanded(&self, archive: &ArchiveRecord) -> Result<PathBuf> {
        let dir = self.layout.archive_dir(&archive.uuid);
        if !dir.is_dir() && self.layout.archive_tarball(&archive.uuid).is_file() {
            self.expand(archive)?;
        }
        Ok(dir)
    }

    /// Delete the expanded directory; the compacted tarball remains.
    pub fn prune(&self, archive: &ArchiveRecord) -> Result<()> {
        let dir = self.layout.archive_dir(&archive.uuid);
        if dir.is_dir() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to prune {}", dir.display()))?;
        }
        Ok(())
    }

    /// Delete everything the store holds for an archive.
    pub fn remove(&self, archive: &ArchiveRecord) -> Result<()> {
        self.prune(archive)?;
        let tarball = self.layout.archive_tarball(&archive.uuid);
        if tarball.is_file() {
            fs::remove_file(&tarball)
                .with_context(|| format!("failed to remove {}", tarball.display()))?;
        }
        Ok(())
    }
}

/// Copy one filesystem entry (file, directory, or symlink), carrying over
/// mode, ownership, and timestamps.
pub fn copy_preserving(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)
        .with_context(|| format!("failed to stat {}", src.display()))?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        let target = fs::read_link(src)
            .with_context(|| format!("failed to read symlink {}", src.display()))?;
        if dst.exists() || fs::symlink_metadata(dst).is_ok() {
            fs::remove_file(dst)
                .with_context(|| format!("failed to replace {}", dst.display()))?;
        }
        symlink(&target, dst)
            .with_context(|| format!("failed to create symlink {}", dst.display()))?;
        lchown(dst, Some(meta.uid()), Some(meta.gid()))
            .with_context(|| format!("failed to chown {}", dst.display()))?;
        return Ok(());
    }

    if file_type.is_dir() {
        fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    } else {
        fs::copy(src, dst).with_context(|| {
            format!("failed to copy {} to {}", src.display(), dst.display())
        })?;
    }
    fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))
        .with_context(|| format!("failed to chmod {}", dst.display()))?;
    chown(dst, Some(meta.uid()), Some(meta.gid()))
        .with_context(|| format!("failed to chown {}", dst.display()))?;
    preserve_times(dst, &meta)?;
    Ok(())
}

fn preserve_times(path: &Path, meta: &fs::Metadata) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path contains NUL: {}", path.display()))?;
    let times = [
        libc::timespec {
            tv_sec: meta.atime(),
            tv_nsec: meta.atime_nsec(),
        },
        libc::timespec {
            tv_sec: meta.mtime(),
            tv_nsec: meta.mtime_nsec(),
        },
    ];
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            cpath.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to set times on {}", path.display()));
    }
    Ok(())
}
