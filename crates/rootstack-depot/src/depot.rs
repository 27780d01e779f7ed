//! Depot orchestration: opening the on-disk state, resolving archive
//! references, driving install/uninstall under the whole-depot lock, and
//! the read-only query verbs.

use anyhow::Result;
use std::io::Write;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use rootstack_core::{join_under_prefix, FileKind, FileRecord};

use crate::archive::ArchiveRecord;
use crate::catalog::Catalog;
use crate::error::DepotError;
use crate::install::{self, InstallOptions, InstallOutcome};
use crate::layout::DepotLayout;
use crate::lock::DepotLock;
use crate::store::BackingStore;
use crate::uninstall::{self, UninstallOptions, UninstallOutcome};

#[derive(Debug)]
pub struct Depot {
    layout: DepotLayout,
    catalog: Catalog,
    store: BackingStore,
    lock: DepotLock,
}

impl Depot {
    /// Open (and, if asked, create) the depot under `prefix`. Holds at least
    /// a shared lock for the lifetime of the value; refuses to initialize
    /// without one.
    pub fn open(prefix: &Path, create_if_missing: bool) -> Result<Depot> {
        if !prefix.is_absolute() {
            return Err(DepotError::BadArgument(format!(
                "prefix must be absolute: {}",
                prefix.display()
            ))
            .into());
        }

        let layout = DepotLayout::new(prefix);
        if create_if_missing {
            layout.ensure_base_dirs()?;
        }
        let lock = DepotLock::acquire_shared(&layout.lock_path())?;
        let catalog = Catalog::open(&layout.database_path(), create_if_missing)?;
        Ok(Depot {
            store: BackingStore::new(layout.clone()),
            layout,
            catalog,
            lock,
        })
    }

    pub fn prefix(&self) -> &Path {
        self.layout.prefix()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // -- archive references --

    /// Resolve a user-supplied archive reference: UUID, serial, name (newest
    /// match), or the keywords `newest`, `oldest`, `superseded`, `all`.
    pub fn resolve_archives(&self, arg: &str) -> Result<Vec<ArchiveRecord>> {
        let not_found = || DepotError::ArchiveNotFound {
            spec: arg.to_string(),
        };

        if arg.eq_ignore_ascii_case("all") {
            let archives = self.catalog.archives(false)?;
            if archives.is_empty() {
                return Err(not_found().into());
            }
            return Ok(archives);
        }
        if arg.eq_ignore_ascii_case("superseded") {
            let mut superseded = Vec::new();
            for archive in self.catalog.archives(false)? {
                if self.catalog.is_superseded(archive.serial)? {
                    superseded.push(archive);
                }
            }
            if superseded.is_empty() {
                return Err(not_found().into());
            }
            return Ok(superseded);
        }

        let found = if arg.eq_ignore_ascii_case("newest") {
            self.catalog.newest_archive()?
        } else if arg.eq_ignore_ascii_case("oldest") {
            self.catalog.oldest_archive()?
        } else if Uuid::parse_str(arg).is_ok() {
            self.catalog.archive_by_uuid(arg)?
        } else if let Ok(serial) = arg.parse::<i64>() {
            self.catalog.archive_by_serial(serial)?
        } else {
            self.catalog.archive_by_name(arg)?
        };
        found.map(|archive| vec![archive]).ok_or_else(|| not_found().into())
    }

    // -- mutating verbs --

    pub fn install(&mut self, source_spec: &str, opts: InstallOptions) -> Result<InstallOutcome> {
        self.lock.upgrade()?;
        let result = install::install(
            &mut self.catalog,
            &self.store,
            &self.layout,
            source_spec,
            opts,
        );
        self.lock.downgrade()?;
        result
    }

    pub fn uninstall(
        &mut self,
        archive: &ArchiveRecord,
        opts: UninstallOptions,
    ) -> Result<UninstallOutcome> {
        self.lock.upgrade()?;
        let result = uninstall::uninstall(
            &mut self.catalog,
            &self.store,
            &self.layout,
            archive,
            opts,
        );
        self.lock.downgrade()?;
        result
    }

    // -- crash recovery --

    /// Archives left `active = 0` by an interrupted operation, newest first.
    pub fn inactive_archives(&self) -> Result<Vec<ArchiveRecord>> {
        let mut inactive = Vec::new();
        for serial in self.catalog.find_inactive()? {
            if let Some(archive) = self.catalog.archive_by_serial(serial)? {
                inactive.push(archive);
            }
        }
        Ok(inactive)
    }

    /// Uninstall every inactive archive, newest first. Inactive rollback
    /// archives are deleted outright once the real archive above them is
    /// gone; their snapshots reference an install that no longer exists.
    pub fn recover(&mut self, opts: UninstallOptions) -> Result<()> {
        for archive in self.inactive_archives()? {
            if archive.is_rollback() {
                continue;
            }
            warn!(serial = archive.serial, uuid = %archive.uuid, "uninstalling interrupted archive");
            self.uninstall(&archive, opts)?;
        }

        let leftovers = self.inactive_archives()?;
        if leftovers.is_empty() {
            return Ok(());
        }
        self.lock.upgrade()?;
        let result = (|| -> Result<()> {
            self.catalog.begin()?;
            for archive in &leftovers {
                debug!(serial = archive.serial, uuid = %archive.uuid, "dropping stale rollback");
                self.catalog.delete_archive(archive.serial)?;
            }
            self.catalog.commit()?;
            for archive in &leftovers {
                self.store.remove(archive)?;
            }
            Ok(())
        })();
        self.lock.downgrade()?;
        result
    }

    // -- read-only verbs --

    /// Compare every record of an archive against the live tree, writing one
    /// line per file: `M` modified, `R` missing, blank untouched. Returns
    /// the number of non-blank lines.
    pub fn verify(&self, archive: &ArchiveRecord, out: &mut impl Write) -> Result<u64> {
        list_header(out)?;
        write_archive_line(out, archive)?;
        let mut flagged = 0;
        for record in self.catalog.files(archive.serial)? {
            let actual = FileRecord::from_disk(
                &join_under_prefix(self.layout.prefix(), &record.path),
                &record.path,
            )?;
            let state = if actual.is_no_entry() {
                'R'
            } else if FileRecord::compare(&record, &actual).is_identical() {
                ' '
            } else {
                'M'
            };
            if state != ' ' {
                flagged += 1;
            }
            writeln!(out, "{state} {}", file_line(&record))?;
        }
        Ok(flagged)
    }

    /// Print archives newest-first: `serial uuid date name`. Rollback
    /// archives appear only when `verbose` is set.
    pub fn list(&self, verbose: bool, out: &mut impl Write) -> Result<()> {
        list_header(out)?;
        for archive in self.catalog.archives(verbose)? {
            write_archive_line(out, &archive)?;
        }
        Ok(())
    }

    /// Print a caller-resolved set of archives in the `list` format.
    pub fn list_archives(&self, archives: &[ArchiveRecord], out: &mut impl Write) -> Result<()> {
        list_header(out)?;
        for archive in archives {
            write_archive_line(out, archive)?;
        }
        Ok(())
    }

    /// Print every file record of an archive in path order.
    pub fn files(&self, archive: &ArchiveRecord, verbose: bool, out: &mut impl Write) -> Result<()> {
        list_header(out)?;
        write_archive_line(out, archive)?;
        for record in self.catalog.files(archive.serial)? {
            if verbose {
                writeln!(out, "{:04x} {}", record.info.bits(), file_line(&record))?;
            } else {
                writeln!(out, "{}", file_line(&record))?;
            }
        }
        Ok(())
    }
}

fn list_header(out: &mut impl Write) -> Result<()> {
    writeln!(
        out,
        "{:<6} {:<36}  {:<20}  {}",
        "Serial", "UUID", "Date Installed", "Name"
    )?;
    writeln!(
        out,
        "====== ====================================  ====================  ================="
    )?;
    Ok(())
}

fn write_archive_line(out: &mut impl Write, archive: &ArchiveRecord) -> Result<()> {
    writeln!(
        out,
        "{:<6} {:<36}  {:<20}  {}",
        archive.serial,
        archive.uuid,
        format_date(archive.date_added),
        archive.name
    )?;
    Ok(())
}

fn format_date(epoch: i64) -> String {
    OffsetDateTime::from_unix_timestamp(epoch)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| epoch.to_string())
}

fn file_line(record: &FileRecord) -> String {
    let digest = record.digest.as_deref().unwrap_or("");
    format!(
        "{} {:>5} {:>5} {:<64} {}",
        mode_string(record),
        record.uid,
        record.gid,
        digest,
        record.path
    )
}

/// `ls -l` style mode column.
fn mode_string(record: &FileRecord) -> String {
    let type_char = match record.kind() {
        FileKind::Regular => '-',
        FileKind::Directory => 'd',
        FileKind::Symlink => 'l',
        FileKind::Fifo => 'p',
        FileKind::BlockDevice => 'b',
        FileKind::CharDevice => 'c',
        FileKind::Socket => 's',
        FileKind::NoEntry => '?',
    };
    let mut out = String::with_capacity(10);
    out.push(type_char);
    let perms = record.permissions();
    for shift in [6u32, 3, 0] {
        let bits = (perms >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Validate that a `-p` style prefix argument is usable before a depot is
/// opened for it.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if !prefix.starts_with('/') {
        return Err(DepotError::BadArgument(format!(
            "prefix must be an absolute path: {prefix}"
        ))
        .into());
    }
    Ok(())
}
