//! The install transaction. Catalog work commits before the filesystem is
//! touched, so a crash mid-install leaves `active = 0` archives that the
//! next run detects and offers to uninstall.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, warn};

use rootstack_core::{join_under_prefix, FileInfo};

use crate::analyze::{analyze_stage, AnalyzeOptions};
use crate::archive::ArchiveRecord;
use crate::catalog::Catalog;
use crate::extract;
use crate::layout::DepotLayout;
use crate::place;
use crate::store::BackingStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    pub dry_run: bool,
    pub force: bool,
}

#[derive(Debug)]
pub struct InstallOutcome {
    pub archive: ArchiveRecord,
    pub rollback: Option<ArchiveRecord>,
    pub files_added: u64,
    pub files_updated: u64,
    pub errors: u64,
}

pub fn install(
    catalog: &mut Catalog,
    store: &BackingStore,
    layout: &DepotLayout,
    source_spec: &str,
    opts: InstallOptions,
) -> Result<InstallOutcome> {
    let (source_path, name) = extract::resolve_source(source_spec, &layout.downloads_dir())?;

    let mut archive = ArchiveRecord::new(name);
    let mut rollback = ArchiveRecord::rollback();

    // Insert the rollback archive first so its serial sits below the new
    // archive's in the stack.
    catalog.begin()?;
    let analyzed = stage_and_analyze(
        catalog,
        store,
        layout,
        &source_path,
        &mut archive,
        &mut rollback,
        opts,
    );
    let (stage, rollback_kept, outcome) = match analyzed {
        Ok(result) => result,
        Err(err) => {
            catalog.rollback().ok();
            store.remove(&archive).ok();
            store.remove(&rollback).ok();
            return Err(err);
        }
    };

    if opts.dry_run {
        catalog.rollback()?;
        store.remove(&archive)?;
        debug!("dry run complete; catalog untouched");
        return Ok(InstallOutcome {
            archive,
            rollback: None,
            files_added: outcome.files_added,
            files_updated: outcome.files_updated,
            errors: outcome.errors,
        });
    }

    catalog.commit()?;

    // The catalog now describes the install; everything below is filesystem
    // work that crash recovery can redo or undo.
    let mut errors = outcome.errors;
    store.compact(&archive)?;

    if rollback_kept {
        let mut saved = 0u64;
        for record in catalog.files(rollback.serial)? {
            if !record.info.contains(FileInfo::ROLLBACK_DATA) {
                continue;
            }
            let live = join_under_prefix(layout.prefix(), &record.path);
            match store.save(&rollback, &record.path, &live) {
                Ok(()) => saved += 1,
                Err(err) if opts.force => {
                    warn!(path = %record.path, error = %err, "backup failed; continuing");
                    errors += 1;
                }
                Err(err) => return Err(err).context("backup phase failed"),
            }
        }
        if saved > 0 {
            store.compact(&rollback)?;
        }
    }

    for record in catalog.files(archive.serial)? {
        let placed = if record.info.contains(FileInfo::INSTALL_DATA) {
            place::install(&record, &stage, layout.prefix())
        } else {
            place::install_info(&record, layout.prefix())
        };
        match placed {
            Ok(()) => {}
            Err(err) if opts.force => {
                warn!(path = %record.path, error = %err, "install failed; continuing");
                errors += 1;
            }
            Err(err) => return Err(err).context("install phase failed"),
        }
    }

    catalog.begin()?;
    if rollback_kept {
        catalog.activate(rollback.serial)?;
    }
    catalog.activate(archive.serial)?;
    catalog.commit()?;

    store.prune(&archive)?;
    store.prune(&rollback)?;

    Ok(InstallOutcome {
        archive,
        rollback: rollback_kept.then_some(rollback),
        files_added: outcome.files_added,
        files_updated: outcome.files_updated,
        errors,
    })
}

fn stage_and_analyze(
    catalog: &mut Catalog,
    store: &BackingStore,
    layout: &DepotLayout,
    source_path: &Path,
    archive: &mut ArchiveRecord,
    rollback: &mut ArchiveRecord,
    opts: InstallOptions,
) -> Result<(std::path::PathBuf, bool, crate::analyze::AnalyzeOutcome)> {
    catalog.insert_archive(rollback)?;
    catalog.insert_archive(archive)?;
    debug!(
        serial = archive.serial,
        uuid = %archive.uuid,
        rollback_serial = rollback.serial,
        "inserted archives"
    );

    let stage = store.stage(archive)?;
    extract::extract(source_path, &stage)?;

    let outcome = analyze_stage(
        catalog,
        store,
        layout.prefix(),
        &stage,
        archive,
        rollback,
        AnalyzeOptions {
            dry_run: opts.dry_run,
            force: opts.force,
        },
    )?;

    // a rollback that captured nothing has no reason to exist
    let rollback_kept = outcome.rollback_files > 0;
    if !rollback_kept {
        debug!("rollback archive is empty; dropping it");
        catalog.delete_archive(rollback.serial)?;
    }
    Ok((stage, rollback_kept, outcome))
}
