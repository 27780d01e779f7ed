//! Materializing catalog records onto the target tree: install the bytes,
//! refresh metadata only, or remove the path.

use anyhow::{anyhow, Context, Result};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{chown, lchown, symlink, PermissionsExt};
use std::path::Path;
use tracing::debug;

use rootstack_core::{join_under_prefix, FileKind, FileRecord};

/// Materialize `record` at `prefix + record.path`, taking file content from
/// the same relative path under `src_root` (a staging or backing-store
/// tree). `NO_ENTRY` records ensure the path is absent.
pub fn install(record: &FileRecord, src_root: &Path, prefix: &Path) -> Result<()> {
    let dst = join_under_prefix(prefix, &record.path);
    match record.kind() {
        FileKind::NoEntry => remove(record, prefix),
        FileKind::Directory => {
            if let Ok(meta) = fs::symlink_metadata(&dst) {
                if !meta.is_dir() {
                    clear_destination(&dst)?;
                }
            }
            match fs::create_dir(&dst) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists && dst.is_dir() => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create {}", dst.display()));
                }
            }
            install_info(record, prefix)
        }
        FileKind::Regular => {
            let src = join_under_prefix(src_root, &record.path);
            clear_destination(&dst)?;
            debug!(src = %src.display(), dst = %dst.display(), "installing");
            fs::copy(&src, &dst).with_context(|| {
                format!("failed to copy {} to {}", src.display(), dst.display())
            })?;
            install_info(record, prefix)
        }
        FileKind::Symlink => {
            let src = join_under_prefix(src_root, &record.path);
            let target = fs::read_link(&src)
                .with_context(|| format!("failed to read symlink {}", src.display()))?;
            clear_destination(&dst)?;
            symlink(&target, &dst)
                .with_context(|| format!("failed to create symlink {}", dst.display()))?;
            install_info(record, prefix)
        }
        FileKind::Fifo => {
            clear_destination(&dst)?;
            mkfifo(&dst, record.permissions())?;
            install_info(record, prefix)
        }
        FileKind::BlockDevice | FileKind::CharDevice => {
            clear_destination(&dst)?;
            // rdev rides in the size column for device records
            mknod(&dst, record.mode, record.size)?;
            install_info(record, prefix)
        }
        FileKind::Socket => Err(anyhow!(
            "cannot recreate socket {}; sockets only exist while bound",
            record.path
        )),
    }
}

/// Metadata-only refresh: chmod and chown to the record's values, leaving
/// content alone. Symlinks get ownership only.
pub fn install_info(record: &FileRecord, prefix: &Path) -> Result<()> {
    let dst = join_under_prefix(prefix, &record.path);
    if record.kind() == FileKind::Symlink {
        lchown(&dst, Some(record.uid), Some(record.gid))
            .with_context(|| format!("failed to chown {}", dst.display()))?;
        return Ok(());
    }
    fs::set_permissions(&dst, fs::Permissions::from_mode(record.permissions()))
        .with_context(|| format!("failed to chmod {}", dst.display()))?;
    chown(&dst, Some(record.uid), Some(record.gid))
        .with_context(|| format!("failed to chown {}", dst.display()))?;
    Ok(())
}

/// Remove the record's path from the target tree. Already-absent paths are
/// fine; directories are removed only when empty.
pub fn remove(record: &FileRecord, prefix: &Path) -> Result<()> {
    let dst = join_under_prefix(prefix, &record.path);
    let meta = match fs::symlink_metadata(&dst) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", dst.display()));
        }
    };

    if meta.is_dir() {
        match fs::remove_dir(&dst) {
            Ok(()) => Ok(()),
            // a non-empty directory is still shared with other owners
            Err(err) if err.raw_os_error() == Some(libc::ENOTEMPTY) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", dst.display()))
            }
        }
    } else {
        match fs::remove_file(&dst) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", dst.display()))
            }
        }
    }
}

/// Clear whatever sits at `dst` so a different type can take its place.
fn clear_destination(dst: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(dst) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", dst.display()));
        }
    };
    if meta.is_dir() {
        fs::remove_dir_all(dst)
            .with_context(|| format!("failed to replace directory {}", dst.display()))
    } else {
        fs::remove_file(dst).with_context(|| format!("failed to replace {}", dst.display()))
    }
}

fn mkfifo(path: &Path, mode: u32) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path contains NUL: {}", path.display()))?;
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to create fifo {}", path.display()));
    }
    Ok(())
}

fn mknod(path: &Path, mode: u32, rdev: u64) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path contains NUL: {}", path.display()))?;
    let rc = unsafe { libc::mknod(cpath.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to create device node {}", path.display()));
    }
    Ok(())
}
