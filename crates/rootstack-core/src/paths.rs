use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Convert an absolute or already-relative path into the canonical
/// depot-relative form: a single leading `/` followed by the path below the
/// prefix. This is the only normalization point; everything stored in the
/// catalog goes through here.
pub fn depot_relative(path: &Path, prefix: &Path) -> Result<String> {
    let stripped = match path.strip_prefix(prefix) {
        Ok(rest) => rest,
        Err(_) => path
            .strip_prefix("/")
            .map_err(|_| anyhow!("path is neither under the prefix nor relative: {}", path.display()))?,
    };
    let rel = stripped.to_str().ok_or_else(|| {
        anyhow!("path is not valid UTF-8: {}", path.display())
    })?;
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        return Err(anyhow!("path resolves to the prefix itself: {}", path.display()));
    }
    Ok(format!("/{rel}"))
}

/// Rejoin a depot-relative path (leading `/`) under a prefix directory.
pub fn join_under_prefix(prefix: &Path, rel: &str) -> PathBuf {
    prefix.join(rel.trim_start_matches('/'))
}

/// Create a directory and all missing parents.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}
