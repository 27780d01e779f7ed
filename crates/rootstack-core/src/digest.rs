//! Content hashing for catalog records. Regular files hash their bytes,
//! symlinks hash the link target; directories and special files carry no
//! digest.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

pub fn file_digest(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn symlink_digest(path: &Path) -> Result<String> {
    let target = fs::read_link(path)
        .with_context(|| format!("failed to read symlink {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(target.as_os_str().as_bytes())))
}

/// Digest appropriate for whatever lives at `path`, or `None` for types that
/// are not hashed.
pub fn digest_for_path(path: &Path, file_type: fs::FileType) -> Result<Option<String>> {
    if file_type.is_file() {
        return Ok(Some(file_digest(path)?));
    }
    if file_type.is_symlink() {
        return Ok(Some(symlink_digest(path)?));
    }
    Ok(None)
}
