//! Removing a layer from the overlay stack: every path is reconstructed
//! from its immediately preceding record, paths owned by a newer layer are
//! left untouched, and base-system files are never removed.

use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use tracing::{debug, warn};

use rootstack_core::{join_under_prefix, DiffFlags, FileInfo, FileRecord};

use crate::archive::ArchiveRecord;
use crate::catalog::Catalog;
use crate::error::DepotError;
use crate::layout::DepotLayout;
use crate::place;
use crate::store::BackingStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct UninstallOptions {
    pub force: bool,
}

#[derive(Debug, Default)]
pub struct UninstallOutcome {
    pub files_removed: u64,
    pub files_restored: u64,
    pub files_skipped: u64,
    pub errors: u64,
}

pub fn uninstall(
    catalog: &mut Catalog,
    store: &BackingStore,
    layout: &DepotLayout,
    archive: &ArchiveRecord,
    opts: UninstallOptions,
) -> Result<UninstallOutcome> {
    if archive.is_rollback() {
        return Err(DepotError::BadArgument(format!(
            "cannot uninstall rollback archive {}",
            archive.uuid
        ))
        .into());
    }

    // Drop the active flag first so a crash mid-restore is detected.
    catalog.begin()?;
    catalog.deactivate(archive.serial)?;
    catalog.commit()?;

    let mut outcome = UninstallOutcome::default();
    let mut records_to_delete: Vec<i64> = Vec::new();
    let mut dirs_to_remove: Vec<FileRecord> = Vec::new();
    let mut expanded: HashSet<i64> = HashSet::new();

    for record in catalog.files(archive.serial)? {
        let result = uninstall_file(
            catalog,
            store,
            layout,
            archive,
            &record,
            &mut records_to_delete,
            &mut dirs_to_remove,
            &mut expanded,
            &mut outcome,
        );
        if let Err(err) = result {
            if opts.force {
                warn!(path = %record.path, error = %err, "skipping after error");
                outcome.errors += 1;
            } else {
                return Err(err);
            }
        }
    }

    // directory removals run children-first; a directory that still holds
    // user files simply stays behind
    for record in dirs_to_remove.iter().rev() {
        place::remove(record, layout.prefix())?;
        outcome.files_removed += 1;
    }

    catalog.begin()?;
    for serial in records_to_delete {
        debug!(serial, "deleting superseded rollback record");
        catalog.delete_file(serial)?;
    }
    catalog.commit()?;

    catalog.begin()?;
    catalog.delete_archive(archive.serial)?;
    catalog.commit()?;
    store.remove(archive)?;

    prune_orphan_archives(catalog, store)?;

    // directory cleanup last: re-prune whatever the restore phase expanded
    for serial in expanded {
        if let Some(owner) = catalog.archive_by_serial(serial)? {
            store.prune(&owner)?;
        }
    }

    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn uninstall_file(
    catalog: &Catalog,
    store: &BackingStore,
    layout: &DepotLayout,
    archive: &ArchiveRecord,
    record: &FileRecord,
    records_to_delete: &mut Vec<i64>,
    dirs_to_remove: &mut Vec<FileRecord>,
    expanded: &mut HashSet<i64>,
    outcome: &mut UninstallOutcome,
) -> Result<()> {
    debug!(path = %record.path, "uninstalling");

    // base-system files are never removed
    if record.info.contains(FileInfo::BASE_SYSTEM) {
        debug!(path = %record.path, "base system; leaving in place");
        return Ok(());
    }

    // A newer layer owns this path: the filesystem stays untouched, and the
    // only cleanup is dropping a now-moot placeholder below us.
    if catalog.superseding(archive.serial, &record.path)?.is_some() {
        debug!(path = %record.path, "owned by a newer layer; leaving in place");
        if let Some(preceding) = catalog.preceding(archive.serial, &record.path)? {
            if preceding.info.contains(FileInfo::NO_ENTRY)
                && !preceding.info.contains(FileInfo::BASE_SYSTEM)
            {
                records_to_delete.push(preceding.serial);
            }
        }
        eprintln!("  {}", record.path);
        return Ok(());
    }

    let actual = FileRecord::from_disk(
        &join_under_prefix(layout.prefix(), &record.path),
        &record.path,
    )?;

    if !actual.is_no_entry() && !FileRecord::compare(record, &actual).is_identical() {
        warn!(path = %record.path, "user changes since install; leaving in place");
        outcome.files_skipped += 1;
        eprintln!("  {}", record.path);
        return Ok(());
    }

    // A missing preceding record means a middle-layer uninstall already
    // consumed the placeholder chain below us; base-system records are never
    // deleted, so the pre-overlay state at this path was absence.
    let preceding = catalog.preceding(archive.serial, &record.path)?;
    let preceding = match preceding {
        Some(preceding) => preceding,
        None => {
            if record.is_directory() {
                dirs_to_remove.push(record.clone());
            } else {
                place::remove(record, layout.prefix())?;
                outcome.files_removed += 1;
            }
            eprintln!("R {}", record.path);
            return Ok(());
        }
    };

    let mut state = ' ';
    if preceding.info.contains(FileInfo::NO_ENTRY) {
        state = 'R';
        if record.is_directory() {
            dirs_to_remove.push(record.clone());
        } else {
            place::remove(record, layout.prefix())?;
            outcome.files_removed += 1;
        }
    } else {
        let diff = FileRecord::compare(record, &preceding);
        if diff.intersects(DiffFlags::DATA_DIFFERS) {
            state = 'U';
            let owner = catalog
                .archive_by_serial(preceding.archive_serial)?
                .ok_or_else(|| {
                    anyhow!(DepotError::CorruptCatalog {
                        detail: format!("file {} references missing archive {}", preceding.serial, preceding.archive_serial),
                    })
                })?;
            let src_root = store.ensure_expanded(&owner)?;
            expanded.insert(owner.serial);
            place::install(&preceding, &src_root, layout.prefix())
                .with_context(|| format!("failed to restore {}", preceding.path))?;
            outcome.files_restored += 1;
        } else if diff.intersects(DiffFlags::MODE_DIFFERS)
            || diff.intersects(DiffFlags::UID_DIFFERS)
            || diff.intersects(DiffFlags::GID_DIFFERS)
        {
            place::install_info(&preceding, layout.prefix())?;
            outcome.files_restored += 1;
        } else {
            debug!(path = %record.path, "no changes; leaving in place");
        }
    }

    // the preceding snapshot has served its purpose once the layer above it
    // is gone, unless it describes a base-system file
    if preceding
        .info
        .intersects(FileInfo::NO_ENTRY.union(FileInfo::ROLLBACK_DATA))
        && !preceding.info.contains(FileInfo::BASE_SYSTEM)
    {
        records_to_delete.push(preceding.serial);
    }

    eprintln!("{state} {}", record.path);
    Ok(())
}

/// Delete archives that no longer own any file records, catalog and backing
/// store both.
pub fn prune_orphan_archives(catalog: &mut Catalog, store: &BackingStore) -> Result<usize> {
    let orphans = catalog.orphan_archives()?;
    if orphans.is_empty() {
        return Ok(0);
    }
    catalog.begin()?;
    for orphan in &orphans {
        debug!(serial = orphan.serial, uuid = %orphan.uuid, "pruning orphan archive");
        catalog.delete_archive(orphan.serial)?;
    }
    catalog.commit()?;
    for orphan in &orphans {
        store.remove(orphan)?;
    }
    Ok(orphans.len())
}
