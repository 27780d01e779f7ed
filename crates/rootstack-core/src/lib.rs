mod digest;
mod paths;
mod record;
mod source;

pub use digest::{digest_for_path, file_digest, symlink_digest};
pub use paths::{depot_relative, ensure_dir, join_under_prefix};
pub use record::{DiffFlags, FileInfo, FileKind, FileRecord};
pub use source::{ArchiveSource, RemoteSource};
