use std::path::Path;

/// Local archive formats the depot can extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveSource {
    Directory,
    Tar,
    TarGz,
    TarBz2,
}

impl ArchiveSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarBz2 => "tar.bz2",
        }
    }

    /// Classify a local path by directory-ness and suffix.
    pub fn classify(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return Some(Self::Directory);
        }
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            return Some(Self::TarGz);
        }
        if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            return Some(Self::TarBz2);
        }
        if name.ends_with(".tar") {
            return Some(Self::Tar);
        }
        None
    }
}

/// A source spec that must be fetched before extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSource {
    Http,
    Scp,
}

impl RemoteSource {
    /// Detect `http(s)://` URLs and `user@host:path` scp specs. Anything
    /// else is a local path.
    pub fn classify(spec: &str) -> Option<Self> {
        if spec.starts_with("http://") || spec.starts_with("https://") {
            return Some(Self::Http);
        }
        // user@host:path has an '@' and a ':' both before any '/'
        let head = spec.split('/').next().unwrap_or(spec);
        if let (Some(at), Some(colon)) = (head.find('@'), head.find(':')) {
            if at < colon {
                return Some(Self::Scp);
            }
        }
        None
    }
}
