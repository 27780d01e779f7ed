use std::path::PathBuf;

/// Failure kinds surfaced by the depot. Operations return `anyhow::Result`;
/// callers that need an exit code downcast to this type.
#[derive(Debug, thiserror::Error)]
pub enum DepotError {
    #[error("depot is locked by another process: {path}")]
    LockBusy { path: PathBuf },

    #[error("permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("read permission denied on catalog: {path}")]
    CatalogPermissionDenied { path: PathBuf },

    #[error("archive not found: {spec}")]
    ArchiveNotFound { spec: String },

    #[error("catalog is corrupt: {detail}")]
    CorruptCatalog { detail: String },

    #[error("catalog error ({code}) in `{statement}`")]
    Catalog { code: i32, statement: String },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid argument: {0}")]
    BadArgument(String),

    #[error("{} interrupted archive(s) must be uninstalled before proceeding", serials.len())]
    InconsistentState { serials: Vec<i64> },

    #[error("failed to decode archive: {0}")]
    Decode(String),
}

impl DepotError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ArchiveNotFound { .. } => 1,
            Self::LockBusy { .. } | Self::PermissionDenied { .. } => 2,
            Self::BadArgument(_) => 4,
            Self::CatalogPermissionDenied { .. } => 6,
            _ => 1,
        }
    }
}
