//! Transactional persistent store of archives and their file records,
//! backed by a single SQLite file. Every query runs through the
//! connection's prepared-statement cache.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rootstack_core::{FileInfo, FileRecord};

use crate::archive::{ArchiveInfo, ArchiveRecord, ROLLBACK_NAME};
use crate::error::DepotError;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub struct Catalog {
    conn: Connection,
    path: PathBuf,
    in_transaction: bool,
}

impl Catalog {
    pub fn open(path: &Path, create_if_missing: bool) -> Result<Catalog> {
        let exists = path.exists();
        if !exists && !create_if_missing {
            return Err(DepotError::Io {
                path: path.to_path_buf(),
                source: io::Error::from(io::ErrorKind::NotFound),
            }
            .into());
        }
        if exists {
            // surface unreadable catalogs as their own failure before SQLite
            // reports a generic open error
            if let Err(err) = fs::OpenOptions::new().read(true).open(path) {
                if err.kind() == io::ErrorKind::PermissionDenied {
                    return Err(DepotError::CatalogPermissionDenied {
                        path: path.to_path_buf(),
                    }
                    .into());
                }
            }
        }

        let conn = Connection::open(path).map_err(|err| open_error(err, path))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|err| sql_error(err, "PRAGMA foreign_keys"))?;

        let mut catalog = Catalog {
            conn,
            path: path.to_path_buf(),
            in_transaction: false,
        };
        catalog.init_schema()?;
        catalog.ensure_schema_version()?;
        Ok(catalog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(&self) -> Result<()> {
        const SCHEMA: &str = r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS archives (
                serial INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                date_added INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 0,
                info INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS files (
                serial INTEGER PRIMARY KEY AUTOINCREMENT,
                archive INTEGER NOT NULL REFERENCES archives(serial) ON DELETE CASCADE,
                info INTEGER NOT NULL DEFAULT 0,
                mode INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                gid INTEGER NOT NULL,
                size INTEGER NOT NULL,
                digest TEXT,
                path TEXT NOT NULL,
                UNIQUE (archive, path)
            );
            CREATE INDEX IF NOT EXISTS archives_uuid ON archives (uuid);
            CREATE INDEX IF NOT EXISTS files_path ON files (path);
        "#;
        self.conn
            .execute_batch(SCHEMA)
            .map_err(|err| sql_error(err, "CREATE TABLE"))?;
        Ok(())
    }

    fn ensure_schema_version(&mut self) -> Result<()> {
        self.conn
            .prepare_cached("INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)")
            .and_then(|mut stmt| stmt.execute(params![SCHEMA_VERSION.to_string()]))
            .map_err(|err| sql_error(err, "INSERT INTO meta"))?;

        let stored: String = self
            .conn
            .prepare_cached("SELECT value FROM meta WHERE key = 'schema_version'")
            .and_then(|mut stmt| stmt.query_row([], |row| row.get(0)))
            .map_err(|err| sql_error(err, "SELECT schema_version"))?;
        let stored: u32 = stored.parse().map_err(|_| DepotError::CorruptCatalog {
            detail: format!("non-numeric schema_version '{stored}'"),
        })?;

        match stored.cmp(&SCHEMA_VERSION) {
            std::cmp::Ordering::Equal => Ok(()),
            std::cmp::Ordering::Less => self.upgrade_schema(stored),
            std::cmp::Ordering::Greater => Err(DepotError::CorruptCatalog {
                detail: format!(
                    "catalog schema v{stored} is newer than this tool understands (v{SCHEMA_VERSION})"
                ),
            }
            .into()),
        }
    }

    fn upgrade_schema(&mut self, from: u32) -> Result<()> {
        // v1 is the first schema; migrations slot in here as versions grow
        let _ = from;
        self.conn
            .prepare_cached("UPDATE meta SET value = ?1 WHERE key = 'schema_version'")
            .and_then(|mut stmt| stmt.execute(params![SCHEMA_VERSION.to_string()]))
            .map_err(|err| sql_error(err, "UPDATE meta"))?;
        Ok(())
    }

    // -- transactions (single-level; every mutating op runs inside one) --

    pub fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(DepotError::Catalog {
                code: 0,
                statement: "BEGIN inside an open transaction".to_string(),
            }
            .into());
        }
        self.conn
            .execute_batch("BEGIN IMMEDIATE TRANSACTION")
            .map_err(|err| sql_error(err, "BEGIN IMMEDIATE TRANSACTION"))?;
        self.in_transaction = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT TRANSACTION")
            .map_err(|err| sql_error(err, "COMMIT TRANSACTION"))?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK TRANSACTION")
            .map_err(|err| sql_error(err, "ROLLBACK TRANSACTION"))?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    // -- archives --

    /// Insert a provisional (`active = 0`) archive, assigning its serial.
    pub fn insert_archive(&self, archive: &mut ArchiveRecord) -> Result<i64> {
        const SQL: &str =
            "INSERT INTO archives (uuid, name, date_added, active, info) VALUES (?1, ?2, ?3, 0, ?4)";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| {
                stmt.execute(params![
                    archive.uuid,
                    archive.name,
                    archive.date_added,
                    archive.info.bits() as i64,
                ])
            })
            .map_err(|err| sql_error(err, SQL))?;
        archive.serial = self.conn.last_insert_rowid();
        archive.active = false;
        Ok(archive.serial)
    }

    pub fn delete_archive(&self, serial: i64) -> Result<()> {
        // files cascade via the foreign key
        const SQL: &str = "DELETE FROM archives WHERE serial = ?1";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| stmt.execute(params![serial]))
            .map_err(|err| sql_error(err, SQL))?;
        Ok(())
    }

    pub fn activate(&self, serial: i64) -> Result<()> {
        const SQL: &str = "UPDATE archives SET active = 1 WHERE serial = ?1";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| stmt.execute(params![serial]))
            .map_err(|err| sql_error(err, SQL))?;
        Ok(())
    }

    pub fn deactivate(&self, serial: i64) -> Result<()> {
        const SQL: &str = "UPDATE archives SET active = 0 WHERE serial = ?1";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| stmt.execute(params![serial]))
            .map_err(|err| sql_error(err, SQL))?;
        Ok(())
    }

    /// All archives, newest first. Rollback archives are skipped unless
    /// requested.
    pub fn archives(&self, include_rollbacks: bool) -> Result<Vec<ArchiveRecord>> {
        let sql = if include_rollbacks {
            "SELECT serial, uuid, name, date_added, active, info FROM archives ORDER BY serial DESC"
        } else {
            "SELECT serial, uuid, name, date_added, active, info FROM archives \
             WHERE name != ?1 ORDER BY serial DESC"
        };
        let mut stmt = self.conn.prepare_cached(sql).map_err(|err| sql_error(err, sql))?;
        let rows = if include_rollbacks {
            stmt.query_map([], archive_from_row)
        } else {
            stmt.query_map(params![ROLLBACK_NAME], archive_from_row)
        };
        collect_rows(rows, sql)
    }

    pub fn archive_by_serial(&self, serial: i64) -> Result<Option<ArchiveRecord>> {
        const SQL: &str =
            "SELECT serial, uuid, name, date_added, active, info FROM archives WHERE serial = ?1";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| stmt.query_row(params![serial], archive_from_row).optional())
            .map_err(|err| sql_error(err, SQL))
            .map_err(Into::into)
    }

    pub fn archive_by_uuid(&self, uuid: &str) -> Result<Option<ArchiveRecord>> {
        const SQL: &str =
            "SELECT serial, uuid, name, date_added, active, info FROM archives WHERE uuid = ?1";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| {
                stmt.query_row(params![uuid.to_uppercase()], archive_from_row)
                    .optional()
            })
            .map_err(|err| sql_error(err, SQL))
            .map_err(Into::into)
    }

    /// Name lookups resolve to the newest matching archive.
    pub fn archive_by_name(&self, name: &str) -> Result<Option<ArchiveRecord>> {
        const SQL: &str = "SELECT serial, uuid, name, date_added, active, info FROM archives \
                           WHERE name = ?1 ORDER BY serial DESC LIMIT 1";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| stmt.query_row(params![name], archive_from_row).optional())
            .map_err(|err| sql_error(err, SQL))
            .map_err(Into::into)
    }

    pub fn newest_archive(&self) -> Result<Option<ArchiveRecord>> {
        const SQL: &str = "SELECT serial, uuid, name, date_added, active, info FROM archives \
                           WHERE name != ?1 ORDER BY serial DESC LIMIT 1";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| {
                stmt.query_row(params![ROLLBACK_NAME], archive_from_row)
                    .optional()
            })
            .map_err(|err| sql_error(err, SQL))
            .map_err(Into::into)
    }

    pub fn oldest_archive(&self) -> Result<Option<ArchiveRecord>> {
        const SQL: &str = "SELECT serial, uuid, name, date_added, active, info FROM archives \
                           WHERE name != ?1 ORDER BY serial ASC LIMIT 1";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| {
                stmt.query_row(params![ROLLBACK_NAME], archive_from_row)
                    .optional()
            })
            .map_err(|err| sql_error(err, SQL))
            .map_err(Into::into)
    }

    /// Serials of archives left `active = 0` by an interrupted operation,
    /// newest first.
    pub fn find_inactive(&self) -> Result<Vec<i64>> {
        const SQL: &str = "SELECT serial FROM archives WHERE active = 0 ORDER BY serial DESC";
        let mut stmt = self.conn.prepare_cached(SQL).map_err(|err| sql_error(err, SQL))?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0));
        collect_rows(rows, SQL)
    }

    pub fn count_archives(&self) -> Result<u64> {
        const SQL: &str = "SELECT count(*) FROM archives WHERE name != ?1";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| stmt.query_row(params![ROLLBACK_NAME], |row| row.get::<_, i64>(0)))
            .map(|n| n as u64)
            .map_err(|err| sql_error(err, SQL))
            .map_err(Into::into)
    }

    /// Archives with no remaining file records, rollbacks included.
    pub fn orphan_archives(&self) -> Result<Vec<ArchiveRecord>> {
        const SQL: &str = "SELECT serial, uuid, name, date_added, active, info FROM archives \
                           WHERE serial NOT IN (SELECT DISTINCT archive FROM files) \
                           ORDER BY serial DESC";
        let mut stmt = self.conn.prepare_cached(SQL).map_err(|err| sql_error(err, SQL))?;
        let rows = stmt.query_map([], archive_from_row);
        collect_rows(rows, SQL)
    }

    /// True when the archive has file records and every one of them is
    /// shadowed by a newer archive.
    pub fn is_superseded(&self, serial: i64) -> Result<bool> {
        const SQL: &str = "SELECT \
             (SELECT count(*) FROM files WHERE archive = ?1), \
             (SELECT count(*) FROM files f WHERE f.archive = ?1 AND NOT EXISTS \
                (SELECT 1 FROM files g WHERE g.path = f.path AND g.archive > ?1))";
        let (total, unshadowed): (i64, i64) = self
            .conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| {
                stmt.query_row(params![serial], |row| Ok((row.get(0)?, row.get(1)?)))
            })
            .map_err(|err| sql_error(err, SQL))?;
        Ok(total > 0 && unshadowed == 0)
    }

    // -- files --

    /// Insert a file record under an archive, assigning its serial. A second
    /// insert for the same `(archive, path)` updates the existing row.
    pub fn insert_file(&self, archive_serial: i64, record: &mut FileRecord) -> Result<i64> {
        const SQL: &str = "INSERT INTO files (archive, info, mode, uid, gid, size, digest, path) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT (archive, path) DO UPDATE SET \
                 info = excluded.info, mode = excluded.mode, uid = excluded.uid, \
                 gid = excluded.gid, size = excluded.size, digest = excluded.digest";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| {
                stmt.execute(params![
                    archive_serial,
                    record.info.bits(),
                    record.mode,
                    record.uid,
                    record.gid,
                    record.size as i64,
                    record.digest,
                    record.path,
                ])
            })
            .map_err(|err| sql_error(err, SQL))?;

        const SELECT: &str = "SELECT serial FROM files WHERE archive = ?1 AND path = ?2";
        let serial: i64 = self
            .conn
            .prepare_cached(SELECT)
            .and_then(|mut stmt| stmt.query_row(params![archive_serial, record.path], |row| row.get(0)))
            .map_err(|err| sql_error(err, SELECT))?;
        record.serial = serial;
        record.archive_serial = archive_serial;
        Ok(serial)
    }

    pub fn has_file(&self, archive_serial: i64, path: &str) -> Result<bool> {
        const SQL: &str = "SELECT count(*) FROM files WHERE archive = ?1 AND path = ?2";
        let count: i64 = self
            .conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| stmt.query_row(params![archive_serial, path], |row| row.get(0)))
            .map_err(|err| sql_error(err, SQL))?;
        Ok(count > 0)
    }

    pub fn delete_file(&self, serial: i64) -> Result<()> {
        const SQL: &str = "DELETE FROM files WHERE serial = ?1";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| stmt.execute(params![serial]))
            .map_err(|err| sql_error(err, SQL))?;
        Ok(())
    }

    /// All file records of an archive in ascending path order.
    pub fn files(&self, archive_serial: i64) -> Result<Vec<FileRecord>> {
        const SQL: &str = "SELECT serial, archive, info, mode, uid, gid, size, digest, path \
                           FROM files WHERE archive = ?1 ORDER BY path";
        let mut stmt = self.conn.prepare_cached(SQL).map_err(|err| sql_error(err, SQL))?;
        let rows = stmt.query_map(params![archive_serial], file_from_row);
        collect_rows(rows, SQL)
    }

    /// The record for `path` in the archive immediately below
    /// `archive_serial` in the stack, if any.
    pub fn preceding(&self, archive_serial: i64, path: &str) -> Result<Option<FileRecord>> {
        const SQL: &str = "SELECT serial, archive, info, mode, uid, gid, size, digest, path \
                           FROM files WHERE archive < ?1 AND path = ?2 \
                           ORDER BY archive DESC LIMIT 1";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| {
                stmt.query_row(params![archive_serial, path], file_from_row)
                    .optional()
            })
            .map_err(|err| sql_error(err, SQL))
            .map_err(Into::into)
    }

    /// The record for `path` in the archive immediately above
    /// `archive_serial` in the stack, if any.
    pub fn superseding(&self, archive_serial: i64, path: &str) -> Result<Option<FileRecord>> {
        const SQL: &str = "SELECT serial, archive, info, mode, uid, gid, size, digest, path \
                           FROM files WHERE archive > ?1 AND path = ?2 \
                           ORDER BY archive ASC LIMIT 1";
        self.conn
            .prepare_cached(SQL)
            .and_then(|mut stmt| {
                stmt.query_row(params![archive_serial, path], file_from_row)
                    .optional()
            })
            .map_err(|err| sql_error(err, SQL))
            .map_err(Into::into)
    }
}

fn archive_from_row(row: &Row<'_>) -> rusqlite::Result<ArchiveRecord> {
    Ok(ArchiveRecord {
        serial: row.get(0)?,
        uuid: row.get(1)?,
        name: row.get(2)?,
        date_added: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        info: ArchiveInfo::from_bits(row.get::<_, i64>(5)? as u64),
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        serial: row.get(0)?,
        archive_serial: row.get(1)?,
        info: FileInfo::from_bits(row.get::<_, i64>(2)? as u32),
        mode: row.get::<_, i64>(3)? as u32,
        uid: row.get::<_, i64>(4)? as u32,
        gid: row.get::<_, i64>(5)? as u32,
        size: row.get::<_, i64>(6)? as u64,
        digest: row.get(7)?,
        path: row.get(8)?,
    })
}

fn collect_rows<T>(
    rows: rusqlite::Result<rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> rusqlite::Result<T>>>,
    statement: &str,
) -> Result<Vec<T>> {
    let rows = rows.map_err(|err| sql_error(err, statement))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|err| sql_error(err, statement))?);
    }
    Ok(out)
}

fn sql_error(err: rusqlite::Error, statement: &str) -> DepotError {
    let code = match &err {
        rusqlite::Error::SqliteFailure(e, _) => e.extended_code,
        _ => -1,
    };
    DepotError::Catalog {
        code,
        statement: statement.to_string(),
    }
}

fn open_error(err: rusqlite::Error, path: &Path) -> anyhow::Error {
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        if e.code == rusqlite::ErrorCode::PermissionDenied {
            return DepotError::CatalogPermissionDenied {
                path: path.to_path_buf(),
            }
            .into();
        }
        if e.code == rusqlite::ErrorCode::NotADatabase {
            return DepotError::CorruptCatalog {
                detail: format!("{} is not a catalog", path.display()),
            }
            .into();
        }
    }
    sql_error(err, "open").into()
}
