//! Archive decoding: turn an install source (local directory, tar family
//! archive, `http(s)` URL, or `user@host:path` spec) into an extracted
//! tree in the staging directory.

use anyhow::{anyhow, Context, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;
use walkdir::WalkDir;

use rootstack_core::{ArchiveSource, RemoteSource};

use crate::error::DepotError;
use crate::store::copy_preserving;

/// Fetch a remote source into `downloads_dir`, or pass a local path through.
/// Returns the local path to extract plus the display name for the archive.
pub fn resolve_source(spec: &str, downloads_dir: &Path) -> Result<(PathBuf, String)> {
    let name = source_basename(spec);
    match RemoteSource::classify(spec) {
        Some(RemoteSource::Http) => {
            let dest = downloads_dir.join(&name);
            fetch_with_curl(spec, &dest)?;
            Ok((dest, name))
        }
        Some(RemoteSource::Scp) => {
            let dest = downloads_dir.join(&name);
            fetch_with_scp(spec, &dest)?;
            Ok((dest, name))
        }
        None => {
            let path = PathBuf::from(spec);
            if !path.exists() {
                return Err(DepotError::ArchiveNotFound {
                    spec: spec.to_string(),
                }
                .into());
            }
            Ok((path, name))
        }
    }
}

/// Extract `source` into `dest_dir`, which must already exist and be empty.
pub fn extract(source: &Path, dest_dir: &Path) -> Result<()> {
    let kind = ArchiveSource::classify(source).ok_or_else(|| {
        DepotError::Decode(format!("unknown archive type: {}", source.display()))
    })?;
    debug!(source = %source.display(), kind = kind.as_str(), "extracting");
    match kind {
        ArchiveSource::Directory => copy_tree(source, dest_dir),
        ArchiveSource::Tar => {
            let f = open_archive(source)?;
            unpack_tar(tar::Archive::new(f), source, dest_dir)
        }
        ArchiveSource::TarGz => {
            let f = open_archive(source)?;
            unpack_tar(tar::Archive::new(GzDecoder::new(f)), source, dest_dir)
        }
        ArchiveSource::TarBz2 => {
            let f = open_archive(source)?;
            unpack_tar(tar::Archive::new(BzDecoder::new(f)), source, dest_dir)
        }
    }
}

fn open_archive(source: &Path) -> Result<File> {
    File::open(source).with_context(|| format!("failed to open {}", source.display()))
}

fn unpack_tar<R: std::io::Read>(
    mut archive: tar::Archive<R>,
    source: &Path,
    dest_dir: &Path,
) -> Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.unpack(dest_dir).map_err(|err| {
        anyhow::Error::from(DepotError::Decode(format!(
            "{}: {err}",
            source.display()
        )))
    })
}

/// Replicate a directory source into the staging area, preserving metadata
/// on every entry.
fn copy_tree(src_root: &Path, dest_root: &Path) -> Result<()> {
    for entry in WalkDir::new(src_root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", src_root.display()))?;
        if entry.path() == src_root {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src_root)
            .expect("walked path is under its root");
        copy_preserving(entry.path(), &dest_root.join(rel))?;
    }
    Ok(())
}

fn source_basename(spec: &str) -> String {
    let tail = spec
        .rsplit(['/', ':'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(spec);
    tail.to_string()
}

fn fetch_with_curl(url: &str, dest: &Path) -> Result<()> {
    let mut command = Command::new("curl");
    command
        .arg("-fL")
        .arg("--retry")
        .arg("2")
        .arg("-o")
        .arg(dest)
        .arg(url);
    run_command(&mut command, &format!("failed to download {url}"))
}

fn fetch_with_scp(spec: &str, dest: &Path) -> Result<()> {
    let mut command = Command::new("scp");
    command.arg("-q").arg(spec).arg(dest);
    run_command(&mut command, &format!("failed to copy {spec}"))
}

fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(anyhow!(
        "{context_message}: status={} stderr='{}'",
        output.status,
        stderr.trim()
    ))
}
