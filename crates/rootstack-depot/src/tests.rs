use super::*;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use rootstack_core::FileRecord;

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("must create parents");
    }
    fs::write(path, contents).expect("must write");
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).expect("must chmod");
}

/// Build a directory source holding `(relative path, contents, mode)` files.
fn dir_source(entries: &[(&str, &[u8], u32)]) -> TempDir {
    let tmp = TempDir::new().expect("tempdir");
    for (rel, contents, mode) in entries {
        write_with_mode(&tmp.path().join(rel), contents, *mode);
    }
    tmp
}

fn install_dir(depot: &mut Depot, source: &TempDir) -> InstallOutcome {
    depot
        .install(source.path().to_str().expect("utf-8 path"), InstallOptions::default())
        .expect("install must succeed")
}

fn uninstall_serial(depot: &mut Depot, serial: i64) -> UninstallOutcome {
    let archive = depot
        .catalog()
        .archive_by_serial(serial)
        .expect("catalog lookup")
        .expect("archive must exist");
    depot
        .uninstall(&archive, UninstallOptions::default())
        .expect("uninstall must succeed")
}

fn mode_of(path: &Path) -> u32 {
    fs::symlink_metadata(path).expect("must stat").permissions().mode() & 0o7777
}

// -- end-to-end scenarios --

#[test]
fn fresh_install_and_uninstall_round_trip() {
    let prefix = TempDir::new().expect("prefix");
    let source = dir_source(&[("hello", b"hi\n", 0o644)]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");

    let outcome = install_dir(&mut depot, &source);
    let hello = prefix.path().join("hello");
    assert_eq!(fs::read(&hello).expect("installed file"), b"hi\n");
    assert_eq!(mode_of(&hello), 0o644);
    assert_eq!(outcome.files_added, 1);

    // the rollback archive holds a single no-entry placeholder
    let rollback = outcome.rollback.as_ref().expect("rollback kept");
    let records = depot.catalog().files(rollback.serial).expect("rollback records");
    assert_eq!(records.len(), 1);
    assert!(records[0].is_no_entry());

    uninstall_serial(&mut depot, outcome.archive.serial);
    assert!(!hello.exists());
    // both the overlay and its emptied rollback are gone
    assert!(depot.catalog().archives(true).expect("archives").is_empty());
}

#[test]
fn base_system_file_is_restored_on_uninstall() {
    let prefix = TempDir::new().expect("prefix");
    write_with_mode(&prefix.path().join("conf"), b"orig", 0o640);
    let source = dir_source(&[("conf", b"new", 0o644)]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");

    let outcome = install_dir(&mut depot, &source);
    let conf = prefix.path().join("conf");
    assert_eq!(fs::read(&conf).expect("overwritten"), b"new");
    assert_eq!(mode_of(&conf), 0o644);

    uninstall_serial(&mut depot, outcome.archive.serial);
    assert_eq!(fs::read(&conf).expect("restored"), b"orig");
    assert_eq!(mode_of(&conf), 0o640);
    // no user-visible overlays remain; the base-system snapshot is retained
    assert!(depot.catalog().archives(false).expect("archives").is_empty());
}

#[test]
fn overlay_shadowing_restores_previous_overlay() {
    let prefix = TempDir::new().expect("prefix");
    let first = dir_source(&[("hello", b"hi\n", 0o644)]);
    let second = dir_source(&[("hello", b"bye\n", 0o644)]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");

    let a1 = install_dir(&mut depot, &first);
    let a2 = install_dir(&mut depot, &second);
    let hello = prefix.path().join("hello");
    assert_eq!(fs::read(&hello).expect("shadowed"), b"bye\n");

    // the second overlay's preceding record for the path is the first's
    let preceding = depot
        .catalog()
        .preceding(a2.archive.serial, "/hello")
        .expect("preceding query")
        .expect("must exist");
    assert_eq!(preceding.archive_serial, a1.archive.serial);

    uninstall_serial(&mut depot, a2.archive.serial);
    assert_eq!(fs::read(&hello).expect("restored"), b"hi\n");

    uninstall_serial(&mut depot, a1.archive.serial);
    assert!(!hello.exists());
}

#[test]
fn middle_layer_uninstall_leaves_shadowed_paths_alone() {
    let prefix = TempDir::new().expect("prefix");
    let first = dir_source(&[("hello", b"hi\n", 0o644)]);
    let second = dir_source(&[("hello", b"bye\n", 0o644)]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");

    let a1 = install_dir(&mut depot, &first);
    let a2 = install_dir(&mut depot, &second);

    uninstall_serial(&mut depot, a1.archive.serial);
    let hello = prefix.path().join("hello");
    assert_eq!(fs::read(&hello).expect("untouched"), b"bye\n");
    assert!(depot
        .catalog()
        .archive_by_serial(a1.archive.serial)
        .expect("lookup")
        .is_none());
    // the placeholder chain below the remaining overlay is consumed
    assert!(depot
        .catalog()
        .preceding(a2.archive.serial, "/hello")
        .expect("preceding query")
        .is_none());

    // uninstalling the survivor still restores pre-install absence
    uninstall_serial(&mut depot, a2.archive.serial);
    assert!(!hello.exists());
    assert!(depot.catalog().archives(true).expect("archives").is_empty());
}

#[test]
fn user_changes_block_restore_and_emit_warning() {
    let prefix = TempDir::new().expect("prefix");
    write_with_mode(&prefix.path().join("conf"), b"orig", 0o644);
    let source = dir_source(&[("conf", b"new", 0o644)]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");

    let outcome = install_dir(&mut depot, &source);
    write_with_mode(&prefix.path().join("conf"), b"edited", 0o644);

    let result = uninstall_serial(&mut depot, outcome.archive.serial);
    assert_eq!(result.files_skipped, 1);
    assert_eq!(result.files_restored, 0);
    assert_eq!(fs::read(prefix.path().join("conf")).expect("kept"), b"edited");
}

#[test]
fn stacked_round_trip_restores_base_state() {
    let prefix = TempDir::new().expect("prefix");
    write_with_mode(&prefix.path().join("etc/conf"), b"orig", 0o600);
    let x = dir_source(&[("etc/conf", b"v1", 0o644), ("bin/tool", b"#!x\n", 0o755)]);
    let y = dir_source(&[("etc/conf", b"v2", 0o664)]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");

    let ax = install_dir(&mut depot, &x);
    let ay = install_dir(&mut depot, &y);
    assert_eq!(fs::read(prefix.path().join("etc/conf")).expect("top"), b"v2");

    uninstall_serial(&mut depot, ay.archive.serial);
    let conf = prefix.path().join("etc/conf");
    assert_eq!(fs::read(&conf).expect("middle"), b"v1");
    assert_eq!(mode_of(&conf), 0o644);

    uninstall_serial(&mut depot, ax.archive.serial);
    assert_eq!(fs::read(&conf).expect("base"), b"orig");
    assert_eq!(mode_of(&conf), 0o600);
    assert!(!prefix.path().join("bin/tool").exists());
}

#[test]
fn metadata_only_difference_refreshes_without_copying() {
    let prefix = TempDir::new().expect("prefix");
    let first = dir_source(&[("conf", b"same", 0o600)]);
    let second = dir_source(&[("conf", b"same", 0o644)]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");

    install_dir(&mut depot, &first);
    let outcome = install_dir(&mut depot, &second);
    let conf = prefix.path().join("conf");
    assert_eq!(mode_of(&conf), 0o644);

    // content never differed from the preceding layer, so the second
    // overlay's record carries no install payload
    let records = depot.catalog().files(outcome.archive.serial).expect("records");
    assert!(!records[0].info.contains(rootstack_core::FileInfo::INSTALL_DATA));

    uninstall_serial(&mut depot, outcome.archive.serial);
    assert_eq!(mode_of(&conf), 0o600);
    assert_eq!(fs::read(&conf).expect("content intact"), b"same");
}

#[test]
fn dry_run_changes_nothing() {
    let prefix = TempDir::new().expect("prefix");
    let source = dir_source(&[("hello", b"hi\n", 0o644)]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");

    let outcome = depot
        .install(
            source.path().to_str().expect("utf-8"),
            InstallOptions {
                dry_run: true,
                force: false,
            },
        )
        .expect("dry run must succeed");

    assert_eq!(outcome.files_added, 1);
    assert!(!prefix.path().join("hello").exists());
    assert!(depot.catalog().archives(true).expect("archives").is_empty());
    // staging was discarded as well
    assert!(!DepotLayout::new(prefix.path())
        .archive_dir(&outcome.archive.uuid)
        .exists());
}

#[test]
fn crash_recovery_uninstalls_inactive_archives() {
    let prefix = TempDir::new().expect("prefix");
    write_with_mode(&prefix.path().join("conf"), b"orig", 0o644);
    let source = dir_source(&[("conf", b"new", 0o644)]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");

    let outcome = install_dir(&mut depot, &source);
    let rollback = outcome.rollback.as_ref().expect("rollback kept");

    // simulate a kill between the catalog commit and activation
    depot.catalog().deactivate(outcome.archive.serial).expect("deactivate");
    depot.catalog().deactivate(rollback.serial).expect("deactivate");

    let inactive = depot.inactive_archives().expect("inactive query");
    assert_eq!(inactive.len(), 2);

    depot.recover(UninstallOptions::default()).expect("recover");
    assert!(depot.inactive_archives().expect("inactive query").is_empty());
    assert_eq!(fs::read(prefix.path().join("conf")).expect("restored"), b"orig");
}

#[test]
fn verify_reports_modified_and_missing_files() {
    let prefix = TempDir::new().expect("prefix");
    let source = dir_source(&[
        ("keep", b"ok\n", 0o644),
        ("mutate", b"ok\n", 0o644),
        ("vanish", b"ok\n", 0o644),
    ]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");
    let outcome = install_dir(&mut depot, &source);

    write_with_mode(&prefix.path().join("mutate"), b"changed\n", 0o644);
    fs::remove_file(prefix.path().join("vanish")).expect("remove");

    let mut out = Vec::new();
    let flagged = depot
        .verify(&outcome.archive, &mut out)
        .expect("verify must succeed");
    let rendered = String::from_utf8(out).expect("utf-8");

    assert_eq!(flagged, 2);
    assert!(rendered.lines().any(|l| l.starts_with('M') && l.ends_with("/mutate")));
    assert!(rendered.lines().any(|l| l.starts_with('R') && l.ends_with("/vanish")));
    assert!(rendered.lines().any(|l| l.starts_with("  ") && l.ends_with("/keep")));
}

#[test]
fn files_listing_is_path_ordered() {
    let prefix = TempDir::new().expect("prefix");
    let source = dir_source(&[
        ("b/second", b"2", 0o644),
        ("a/first", b"1", 0o644),
    ]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");
    let outcome = install_dir(&mut depot, &source);

    let records = depot.catalog().files(outcome.archive.serial).expect("records");
    let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["/a", "/a/first", "/b", "/b/second"]);
}

#[test]
fn install_from_tar_gz_archive() {
    let prefix = TempDir::new().expect("prefix");
    let payload = dir_source(&[("opt/tool", b"bits", 0o755)]);

    let holder = TempDir::new().expect("tempdir");
    let tarball = holder.path().join("root.tar.gz");
    let out = fs::File::create(&tarball).expect("create tarball");
    let encoder = flate2::write::GzEncoder::new(out, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", payload.path())
        .expect("append payload");
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");

    let mut depot = Depot::open(prefix.path(), true).expect("open depot");
    let outcome = depot
        .install(tarball.to_str().expect("utf-8"), InstallOptions::default())
        .expect("install from tarball");

    assert_eq!(outcome.archive.name, "root.tar.gz");
    let tool = prefix.path().join("opt/tool");
    assert_eq!(fs::read(&tool).expect("extracted"), b"bits");
    assert_eq!(mode_of(&tool), 0o755);

    uninstall_serial(&mut depot, outcome.archive.serial);
    assert!(!tool.exists());
}

// -- archive reference resolution --

#[test]
fn resolve_archives_by_serial_uuid_name_and_keywords() {
    let prefix = TempDir::new().expect("prefix");
    let first = dir_source(&[("one", b"1", 0o644)]);
    let second = dir_source(&[("two", b"2", 0o644)]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");

    let a1 = install_dir(&mut depot, &first);
    let a2 = install_dir(&mut depot, &second);

    let by_serial = depot
        .resolve_archives(&a1.archive.serial.to_string())
        .expect("by serial");
    assert_eq!(by_serial[0].serial, a1.archive.serial);

    let by_uuid = depot.resolve_archives(&a2.archive.uuid).expect("by uuid");
    assert_eq!(by_uuid[0].serial, a2.archive.serial);

    let newest = depot.resolve_archives("newest").expect("newest");
    assert_eq!(newest[0].serial, a2.archive.serial);

    let oldest = depot.resolve_archives("oldest").expect("oldest");
    assert_eq!(oldest[0].serial, a1.archive.serial);

    let all = depot.resolve_archives("all").expect("all");
    assert_eq!(all.len(), 2);
    assert!(all[0].serial > all[1].serial);

    let err = depot.resolve_archives("no-such-archive").expect_err("unknown ref");
    let depot_err = err.downcast_ref::<DepotError>().expect("typed error");
    assert!(matches!(depot_err, DepotError::ArchiveNotFound { .. }));
}

#[test]
fn name_resolution_prefers_newest_match() {
    let prefix = TempDir::new().expect("prefix");
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");

    let holder = TempDir::new().expect("tempdir");
    let root = holder.path().join("root");
    write_with_mode(&root.join("a"), b"1", 0o644);
    let a1 = depot
        .install(root.to_str().expect("utf-8"), InstallOptions::default())
        .expect("first install");
    write_with_mode(&root.join("a"), b"2", 0o644);
    let a2 = depot
        .install(root.to_str().expect("utf-8"), InstallOptions::default())
        .expect("second install");
    assert_eq!(a1.archive.name, a2.archive.name);

    let resolved = depot.resolve_archives(&a2.archive.name).expect("by name");
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].serial, a2.archive.serial);
}

#[test]
fn superseded_keyword_selects_fully_shadowed_archives() {
    let prefix = TempDir::new().expect("prefix");
    let first = dir_source(&[("shared", b"old", 0o644)]);
    let second = dir_source(&[("shared", b"new", 0o644), ("extra", b"x", 0o644)]);
    let mut depot = Depot::open(prefix.path(), true).expect("open depot");

    let a1 = install_dir(&mut depot, &first);
    let a2 = install_dir(&mut depot, &second);

    let superseded = depot.resolve_archives("superseded").expect("superseded");
    assert_eq!(superseded.len(), 1);
    assert_eq!(superseded[0].serial, a1.archive.serial);
    assert_ne!(superseded[0].serial, a2.archive.serial);
}

// -- catalog primitives --

fn catalog_with_three_layers() -> (TempDir, Catalog, i64, i64, i64) {
    let tmp = TempDir::new().expect("tempdir");
    let mut catalog = Catalog::open(&tmp.path().join(DATABASE_FILE), true).expect("open catalog");

    let mut bottom = ArchiveRecord::new("bottom");
    let mut middle = ArchiveRecord::new("middle");
    let mut top = ArchiveRecord::new("top");
    catalog.begin().expect("begin");
    catalog.insert_archive(&mut bottom).expect("insert");
    catalog.insert_archive(&mut middle).expect("insert");
    catalog.insert_archive(&mut top).expect("insert");

    for serial in [bottom.serial, top.serial] {
        let mut record = FileRecord::no_entry("/shared");
        record.mode = 0o100644;
        catalog.insert_file(serial, &mut record).expect("insert file");
    }
    catalog.commit().expect("commit");
    (tmp, catalog, bottom.serial, middle.serial, top.serial)
}

#[test]
fn preceding_and_superseding_walk_the_stack() {
    let (_tmp, catalog, bottom, middle, top) = catalog_with_three_layers();

    let preceding = catalog
        .preceding(top, "/shared")
        .expect("query")
        .expect("must exist");
    assert_eq!(preceding.archive_serial, bottom);

    let preceding_of_middle = catalog
        .preceding(middle, "/shared")
        .expect("query")
        .expect("must exist");
    assert_eq!(preceding_of_middle.archive_serial, bottom);

    let superseding = catalog
        .superseding(bottom, "/shared")
        .expect("query")
        .expect("must exist");
    assert_eq!(superseding.archive_serial, top);

    assert!(catalog.preceding(bottom, "/shared").expect("query").is_none());
    assert!(catalog.superseding(top, "/shared").expect("query").is_none());
    assert!(catalog.preceding(top, "/other").expect("query").is_none());
}

#[test]
fn insert_file_upserts_on_archive_and_path() {
    let tmp = TempDir::new().expect("tempdir");
    let mut catalog = Catalog::open(&tmp.path().join(DATABASE_FILE), true).expect("open catalog");

    let mut archive = ArchiveRecord::new("layer");
    catalog.begin().expect("begin");
    catalog.insert_archive(&mut archive).expect("insert archive");

    let mut first = FileRecord::no_entry("/path");
    let first_serial = catalog.insert_file(archive.serial, &mut first).expect("insert");

    let mut second = FileRecord::no_entry("/path");
    second.uid = 12;
    let second_serial = catalog.insert_file(archive.serial, &mut second).expect("upsert");
    catalog.commit().expect("commit");

    assert_eq!(first_serial, second_serial);
    let records = catalog.files(archive.serial).expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].uid, 12);
}

#[test]
fn inactive_archives_surface_until_activated() {
    let tmp = TempDir::new().expect("tempdir");
    let mut catalog = Catalog::open(&tmp.path().join(DATABASE_FILE), true).expect("open catalog");

    let mut archive = ArchiveRecord::new("layer");
    catalog.begin().expect("begin");
    catalog.insert_archive(&mut archive).expect("insert");
    catalog.commit().expect("commit");

    assert_eq!(catalog.find_inactive().expect("inactive"), vec![archive.serial]);

    catalog.begin().expect("begin");
    catalog.activate(archive.serial).expect("activate");
    catalog.commit().expect("commit");
    assert!(catalog.find_inactive().expect("inactive").is_empty());
}

#[test]
fn transactions_are_single_level() {
    let tmp = TempDir::new().expect("tempdir");
    let mut catalog = Catalog::open(&tmp.path().join(DATABASE_FILE), true).expect("open catalog");

    catalog.begin().expect("begin");
    catalog.begin().expect_err("nested begin must fail");
    catalog.rollback().expect("rollback");
    assert!(!catalog.in_transaction());
}

#[test]
fn rolled_back_inserts_vanish() {
    let tmp = TempDir::new().expect("tempdir");
    let mut catalog = Catalog::open(&tmp.path().join(DATABASE_FILE), true).expect("open catalog");

    let mut archive = ArchiveRecord::new("doomed");
    catalog.begin().expect("begin");
    catalog.insert_archive(&mut archive).expect("insert");
    catalog.rollback().expect("rollback");

    assert!(catalog
        .archive_by_serial(archive.serial)
        .expect("lookup")
        .is_none());
    assert_eq!(catalog.count_archives().expect("count"), 0);
}

#[test]
fn catalog_survives_reopen() {
    let tmp = TempDir::new().expect("tempdir");
    let db = tmp.path().join(DATABASE_FILE);
    let serial = {
        let mut catalog = Catalog::open(&db, true).expect("open catalog");
        let mut archive = ArchiveRecord::new("persistent");
        catalog.begin().expect("begin");
        catalog.insert_archive(&mut archive).expect("insert");
        catalog.commit().expect("commit");
        archive.serial
    };

    let catalog = Catalog::open(&db, false).expect("reopen catalog");
    let archive = catalog
        .archive_by_serial(serial)
        .expect("lookup")
        .expect("persisted");
    assert_eq!(archive.name, "persistent");
}

#[test]
fn missing_catalog_without_create_is_an_error() {
    let tmp = TempDir::new().expect("tempdir");
    Catalog::open(&tmp.path().join(DATABASE_FILE), false).expect_err("must refuse");
}

// -- backing store --

#[test]
fn compact_prune_expand_round_trip() {
    let prefix = TempDir::new().expect("prefix");
    let layout = DepotLayout::new(prefix.path());
    layout.ensure_base_dirs().expect("layout");
    let store = BackingStore::new(layout.clone());
    let archive = ArchiveRecord::new("snapshot");

    let holder = TempDir::new().expect("tempdir");
    let original = holder.path().join("conf");
    write_with_mode(&original, b"payload", 0o640);
    store.save(&archive, "/etc/conf", &original).expect("save");

    store.compact(&archive).expect("compact");
    store.prune(&archive).expect("prune");
    assert!(!layout.archive_dir(&archive.uuid).exists());
    assert!(layout.archive_tarball(&archive.uuid).exists());

    store.expand(&archive).expect("expand");
    let restored = store.saved_path(&archive, "/etc/conf");
    assert_eq!(fs::read(&restored).expect("restored bytes"), b"payload");
    assert_eq!(mode_of(&restored), 0o640);
}

// -- locking --

#[test]
fn mutation_requires_an_uncontended_lock() {
    let prefix = TempDir::new().expect("prefix");
    let source = dir_source(&[("hello", b"hi\n", 0o644)]);

    let _reader = Depot::open(prefix.path(), true).expect("reader depot");
    let mut writer = Depot::open(prefix.path(), true).expect("writer depot");

    let err = writer
        .install(source.path().to_str().expect("utf-8"), InstallOptions::default())
        .expect_err("must refuse while a reader holds the lock");
    let depot_err = err.downcast_ref::<DepotError>().expect("typed error");
    assert!(matches!(depot_err, DepotError::LockBusy { .. }));
}

#[test]
fn relative_prefix_is_rejected() {
    let err = Depot::open(Path::new("relative/prefix"), true).expect_err("must reject");
    let depot_err = err.downcast_ref::<DepotError>().expect("typed error");
    assert!(matches!(depot_err, DepotError::BadArgument(_)));
    assert_eq!(depot_err.exit_code(), 4);
}

// -- symlinks --

#[test]
fn symlink_overlay_round_trip() {
    let prefix = TempDir::new().expect("prefix");
    write_with_mode(&prefix.path().join("target-a"), b"a", 0o644);
    write_with_mode(&prefix.path().join("target-b"), b"b", 0o644);
    std::os::unix::fs::symlink("target-a", prefix.path().join("link")).expect("symlink");

    let source = TempDir::new().expect("tempdir");
    std::os::unix::fs::symlink("target-b", source.path().join("link")).expect("symlink");

    let mut depot = Depot::open(prefix.path(), true).expect("open depot");
    let outcome = install_dir(&mut depot, &source);
    assert_eq!(
        fs::read_link(prefix.path().join("link")).expect("retargeted"),
        PathBuf::from("target-b")
    );

    uninstall_serial(&mut depot, outcome.archive.serial);
    assert_eq!(
        fs::read_link(prefix.path().join("link")).expect("restored"),
        PathBuf::from("target-a")
    );
}
