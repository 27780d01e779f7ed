//! The per-file three-way diff between the staged tree, the live
//! filesystem, and the most recent preceding catalog record. Decides what
//! gets installed, what gets backed up, and authors the rollback archive's
//! records.

use anyhow::{Context, Result};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use rootstack_core::{depot_relative, join_under_prefix, DiffFlags, FileInfo, FileRecord};

use crate::archive::ArchiveRecord;
use crate::catalog::Catalog;
use crate::store::BackingStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeOptions {
    /// Catalog-only run: never touch the backing store or the target tree.
    pub dry_run: bool,
    /// Log and skip per-file failures instead of aborting.
    pub force: bool,
}

#[derive(Debug, Default)]
pub struct AnalyzeOutcome {
    pub rollback_files: usize,
    pub files_added: u64,
    pub files_updated: u64,
    pub errors: u64,
}

/// Walk the staged tree depth-first (physical, single device, sorted) and
/// insert file records for both the new archive and its rollback archive.
pub fn analyze_stage(
    catalog: &Catalog,
    store: &BackingStore,
    prefix: &Path,
    stage: &Path,
    archive: &ArchiveRecord,
    rollback: &ArchiveRecord,
    opts: AnalyzeOptions,
) -> Result<AnalyzeOutcome> {
    let stage_dev = std::fs::symlink_metadata(stage)
        .with_context(|| format!("failed to stat {}", stage.display()))?
        .dev();

    let mut outcome = AnalyzeOutcome::default();
    for entry in WalkDir::new(stage).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", stage.display()))?;
        if entry.path() == stage {
            continue;
        }
        let meta = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        if meta.dev() != stage_dev {
            debug!(path = %entry.path().display(), "crosses device boundary; skipping");
            continue;
        }

        let result = analyze_entry(
            catalog, store, prefix, stage, entry.path(), archive, rollback, opts, &mut outcome,
        );
        if let Err(err) = result {
            if opts.force {
                warn!(path = %entry.path().display(), error = %err, "skipping after error");
                outcome.errors += 1;
            } else {
                return Err(err);
            }
        }
    }
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn analyze_entry(
    catalog: &Catalog,
    store: &BackingStore,
    prefix: &Path,
    stage: &Path,
    staged_path: &Path,
    archive: &ArchiveRecord,
    rollback: &ArchiveRecord,
    opts: AnalyzeOptions,
    outcome: &mut AnalyzeOutcome,
) -> Result<()> {
    let rel = depot_relative(staged_path, stage)?;
    debug!(path = %rel, "analyzing");

    let mut incoming = FileRecord::from_disk(staged_path, &rel)?;
    let mut actual = FileRecord::from_disk(&join_under_prefix(prefix, &rel), &rel)?;
    let mut preceding = catalog.preceding(archive.serial, &rel)?;

    // First touch: nothing is known about this path. An existing file is a
    // base-system original whose bytes must survive every uninstall; an
    // absent path stays a bare placeholder so the rollback archive can be
    // pruned once it unwinds.
    let first_touch = preceding.is_none();
    if first_touch {
        if !actual.is_no_entry() {
            actual.info.set(FileInfo::BASE_SYSTEM);
            if !actual.is_directory() {
                actual.info.set(FileInfo::ROLLBACK_DATA);
                incoming.info.set(FileInfo::INSTALL_DATA);
            }
        }
        preceding = Some(actual.clone());
    }
    let preceding = preceding.expect("preceding is filled on first touch");

    let actual_flags = FileRecord::compare(&incoming, &actual);
    let preceding_flags = FileRecord::compare(&actual, &preceding);

    let mut state = ' ';
    if !actual_flags.is_identical() {
        state = if actual.is_no_entry() { 'A' } else { 'U' };

        if actual_flags.intersects(DiffFlags::TYPE_DIFFERS)
            || actual_flags.intersects(DiffFlags::DATA_DIFFERS)
        {
            incoming.info.set(FileInfo::INSTALL_DATA);
            // user changes since the preceding install: capture live bytes
            if (preceding_flags.intersects(DiffFlags::TYPE_DIFFERS)
                || preceding_flags.intersects(DiffFlags::DATA_DIFFERS))
                && !actual.is_no_entry()
                && !actual.is_directory()
            {
                actual.info.set(FileInfo::ROLLBACK_DATA);
            }
        }
    }

    if actual.info.contains(FileInfo::ROLLBACK_DATA) && !opts.dry_run {
        store.prepare_save(rollback, &rel)?;
    }

    let preserve = actual
        .info
        .intersects(FileInfo::BASE_SYSTEM.union(FileInfo::ROLLBACK_DATA))
        || (state != ' ' && !preceding_flags.is_identical())
        || (first_touch && state != ' ');
    if preserve {
        outcome.rollback_files += 1;
        catalog.insert_file(rollback.serial, &mut actual)?;
        record_parent_directories(catalog, prefix, rollback, &rel)?;
    }

    match state {
        'A' => outcome.files_added += 1,
        'U' => outcome.files_updated += 1,
        _ => {}
    }
    catalog.insert_file(archive.serial, &mut incoming)?;
    eprintln!("{state} {rel}");
    Ok(())
}

/// Record the existing parent directories of a preserved path so uninstall
/// can restore their metadata. Stops at the first parent with no entry on
/// disk (a base-system rollback may predate the directories entirely).
fn record_parent_directories(
    catalog: &Catalog,
    prefix: &Path,
    rollback: &ArchiveRecord,
    rel: &str,
) -> Result<()> {
    let mut parent = parent_of(rel);
    while let Some(rel_parent) = parent {
        let full = join_under_prefix(prefix, rel_parent);
        let mut record = FileRecord::from_disk(&full, rel_parent)?;
        if record.is_no_entry() {
            break;
        }
        // an analyzed record for this directory may already be here with its
        // flags; never overwrite it with a bare stat
        if !catalog.has_file(rollback.serial, rel_parent)? {
            debug!(path = %rel_parent, "recording parent directory");
            catalog.insert_file(rollback.serial, &mut record)?;
        }
        parent = parent_of(rel_parent);
    }
    Ok(())
}

fn parent_of(rel: &str) -> Option<&str> {
    let cut = rel.rfind('/')?;
    if cut == 0 {
        return None;
    }
    Some(&rel[..cut])
}
