//! File-backed relational store with a versioned schema
//!
//! Every store file carries a one-row `file_metadata` table:
//! ```text
//! id          INTEGER PRIMARY KEY (always 0)
//! major       INTEGER  ┐
//! minor       INTEGER  │ schema version
//! sub1        INTEGER  │
//! sub2        INTEGER  ┘
//! properties  BLOB     free-form, empty on creation
//! ```
//! Opening a file written by an older release migrates it forward one
//! released version at a time. All steps run inside one transaction, each in
//! its own savepoint, and the version row is rewritten last; a failure or a
//! crash at any point leaves the file exactly as it was before the open.

use crate::config::BusyPolicy;
use crate::model::SchemaVersion;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const METADATA_DDL: &str = "CREATE TABLE file_metadata (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    major INTEGER NOT NULL,
    minor INTEGER NOT NULL,
    sub1 INTEGER NOT NULL,
    sub2 INTEGER NOT NULL,
    properties BLOB NOT NULL DEFAULT x''
)";

/// One schema upgrade between two consecutive released versions
#[derive(Clone, Copy)]
pub struct Migration {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub apply: fn(&Connection) -> Result<()>,
    /// Relative cost estimate, reported in diagnostics
    pub cost: u32,
}

/// Schema description of one kind of store file
pub struct StoreDescriptor {
    /// Used in logs and error messages
    pub name: &'static str,
    /// Version written by this code
    pub current: SchemaVersion,
    /// Creates every table of the current schema in a fresh file
    pub create_tables: fn(&Connection) -> Result<()>,
    /// Upgrades from older releases, any order
    pub migrations: &'static [Migration],
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("cost", &self.cost)
            .finish()
    }
}

impl fmt::Debug for StoreDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreDescriptor")
            .field("name", &self.name)
            .field("current", &self.current)
            .field("migrations", &self.migrations)
            .finish()
    }
}

impl StoreDescriptor {
    /// The consecutive migrations leading from `from` to the current version
    pub fn migration_path(&self, from: SchemaVersion) -> Result<Vec<&Migration>> {
        let mismatch = || Error::SchemaMismatch {
            found: from,
            supported: self.current,
        };

        let mut path = Vec::new();
        let mut at = from;
        while at < self.current {
            let step = self
                .migrations
                .iter()
                .find(|m| m.from == at)
                .ok_or_else(mismatch)?;
            if step.to <= at || step.to > self.current {
                return Err(mismatch());
            }
            path.push(step);
            at = step.to;
        }
        if at != self.current {
            return Err(mismatch());
        }
        Ok(path)
    }
}

/// How a store file is opened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// A store file with its schema version, guarded by one mutex
///
/// All statements against the file run while holding the lock, so the store
/// can be shared between threads.
pub struct VersionedStore {
    path: PathBuf,
    descriptor: &'static StoreDescriptor,
    mode: OpenMode,
    version: SchemaVersion,
    conn: Mutex<Option<Connection>>,
}

impl VersionedStore {
    /// Create a new store file at the current schema version
    pub fn create(
        path: impl AsRef<Path>,
        descriptor: &'static StoreDescriptor,
        busy: BusyPolicy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }

        let mut conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_busy_policy(&conn, busy)?;

        let tx = conn.transaction()?;
        tx.execute_batch(METADATA_DDL)?;
        let v = descriptor.current;
        tx.execute(
            "INSERT INTO file_metadata (id, major, minor, sub1, sub2, properties)
             VALUES (0, ?1, ?2, ?3, ?4, ?5)",
            params![v.major, v.minor, v.sub1, v.sub2, Vec::<u8>::new()],
        )?;
        (descriptor.create_tables)(&*tx)?;
        tx.commit()?;

        info!(store = descriptor.name, path = %path.display(), version = %v, "versioned_store.create");

        Ok(VersionedStore {
            path,
            descriptor,
            mode: OpenMode::ReadWrite,
            version: v,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open an existing store file, migrating it when it is older than the code
    pub fn open(
        path: impl AsRef<Path>,
        descriptor: &'static StoreDescriptor,
        mode: OpenMode,
        busy: BusyPolicy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Error::NotFound(format!("{}", path.display())));
        }

        let mut conn = connect(&path, mode, busy)?;
        let found = read_version(&conn)?;

        if found > descriptor.current {
            warn!(
                store = descriptor.name,
                found = %found,
                supported = %descriptor.current,
                "versioned_store.open.too_new"
            );
            return Err(Error::SchemaMismatch {
                found,
                supported: descriptor.current,
            });
        }

        if found < descriptor.current {
            let steps = descriptor.migration_path(found)?;
            drop(conn);
            migrate(&path, descriptor, found, &steps, busy)?;
            conn = connect(&path, mode, busy)?;
            let migrated = read_version(&conn)?;
            if migrated != descriptor.current {
                return Err(Error::Corrupt(format!(
                    "{} reports {} after migration to {}",
                    path.display(),
                    migrated,
                    descriptor.current
                )));
            }
        }

        debug!(store = descriptor.name, path = %path.display(), ?mode, "versioned_store.open");

        Ok(VersionedStore {
            path,
            descriptor,
            mode,
            version: descriptor.current,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open the file read-write, creating it when absent
    pub fn open_or_create(
        path: impl AsRef<Path>,
        descriptor: &'static StoreDescriptor,
        busy: BusyPolicy,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path, descriptor, OpenMode::ReadWrite, busy)
        } else {
            Self::create(path, descriptor, busy)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> &'static StoreDescriptor {
        self.descriptor
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Schema version of the open file (always the current one)
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Run `f` against the connection while holding the store lock
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let guard = self.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("{} is closed", self.path.display())))?;
        f(conn)
    }

    /// Run a mutation inside a savepoint while holding the store lock
    ///
    /// The savepoint is released as soon as `f` returns; on error it is rolled
    /// back. Inside a write batch the changes become durable at the next
    /// [`commit_batch`](Self::commit_batch).
    pub fn with_write<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::Unsupported(format!(
                "{} is open read-only",
                self.path.display()
            )));
        }
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::NotFound(format!("{} is closed", self.path.display())))?;
        let sp = conn.savepoint()?;
        let out = f(&*sp)?;
        sp.commit()?;
        Ok(out)
    }

    /// Start a write batch unless one is already open
    pub fn begin_batch(&self) -> Result<()> {
        self.with_conn(|conn| {
            if conn.is_autocommit() {
                conn.execute_batch("BEGIN IMMEDIATE")?;
                trace!(store = self.descriptor.name, "versioned_store.batch.begin");
            }
            Ok(())
        })
    }

    /// Commit the open write batch, if any
    pub fn commit_batch(&self) -> Result<()> {
        self.with_conn(|conn| {
            if !conn.is_autocommit() {
                conn.execute_batch("COMMIT")?;
                trace!(store = self.descriptor.name, "versioned_store.batch.commit");
            }
            Ok(())
        })
    }

    /// Whether a write batch is open
    pub fn in_batch(&self) -> bool {
        self.with_conn(|conn| Ok(!conn.is_autocommit()))
            .unwrap_or(false)
    }

    /// Flush pending writes
    pub fn save(&self) -> Result<()> {
        self.commit_batch()
    }

    /// Flush pending writes and release the file handle
    pub fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock();
        if let Some(conn) = guard.take() {
            if !conn.is_autocommit() {
                conn.execute_batch("COMMIT")?;
            }
            conn.close().map_err(|(_, err)| Error::from(err))?;
            debug!(store = self.descriptor.name, path = %self.path.display(), "versioned_store.close");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    /// Check whether a table exists in the file
    pub fn has_table(&self, name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// The free-form properties blob
    pub fn properties(&self) -> Result<Vec<u8>> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT properties FROM file_metadata WHERE id = 0",
                [],
                |row| row.get(0),
            )?)
        })
    }

    pub fn set_properties(&self, properties: &[u8]) -> Result<()> {
        self.with_write(|conn| {
            conn.execute(
                "UPDATE file_metadata SET properties = ?1 WHERE id = 0",
                [properties],
            )?;
            Ok(())
        })
    }

    /// Decode the properties blob, `None` while it is empty
    pub fn load_properties_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let raw = self.properties()?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(bincode::deserialize(&raw)?))
    }

    pub fn store_properties_as<T: Serialize>(&self, value: &T) -> Result<()> {
        let raw = bincode::serialize(value)?;
        self.set_properties(&raw)
    }
}

impl Drop for VersionedStore {
    fn drop(&mut self) {
        // Best-effort flush of an open batch on drop
        if let Some(conn) = self.conn.get_mut().as_ref() {
            if !conn.is_autocommit() {
                let _ = conn.execute_batch("COMMIT");
            }
        }
    }
}

fn connect(path: &Path, mode: OpenMode, busy: BusyPolicy) -> Result<Connection> {
    let access = match mode {
        OpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
        OpenMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
    };
    let conn = Connection::open_with_flags(path, access | OpenFlags::SQLITE_OPEN_NO_MUTEX)?;
    apply_busy_policy(&conn, busy)?;
    Ok(conn)
}

fn apply_busy_policy(conn: &Connection, busy: BusyPolicy) -> Result<()> {
    match busy.timeout() {
        Some(timeout) => conn.busy_timeout(timeout)?,
        None => conn.busy_handler(Some(retry_forever))?,
    }
    Ok(())
}

fn retry_forever(attempt: i32) -> bool {
    let backoff = (attempt.max(0) as u64 + 1).min(50);
    std::thread::sleep(Duration::from_millis(backoff));
    true
}

fn read_version(conn: &Connection) -> Result<SchemaVersion> {
    let row = conn
        .query_row(
            "SELECT major, minor, sub1, sub2 FROM file_metadata WHERE id = 0",
            [],
            |row| {
                Ok(SchemaVersion::new(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                ))
            },
        )
        .optional();

    match row {
        Ok(Some(version)) => Ok(version),
        Ok(None) => Err(Error::Corrupt("file_metadata has no version row".into())),
        Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("no such table") => {
            Err(Error::Corrupt("missing file_metadata table".into()))
        }
        Err(err) => Err(err.into()),
    }
}

fn write_version(conn: &Connection, version: SchemaVersion) -> Result<()> {
    let changed = conn.execute(
        "UPDATE file_metadata SET major = ?1, minor = ?2, sub1 = ?3, sub2 = ?4 WHERE id = 0",
        params![version.major, version.minor, version.sub1, version.sub2],
    )?;
    if changed != 1 {
        return Err(Error::Corrupt("file_metadata has no version row".into()));
    }
    Ok(())
}

fn migrate(
    path: &Path,
    descriptor: &StoreDescriptor,
    found: SchemaVersion,
    steps: &[&Migration],
    busy: BusyPolicy,
) -> Result<()> {
    let started = Instant::now();
    info!(
        store = descriptor.name,
        path = %path.display(),
        from = %found,
        to = %descriptor.current,
        steps = steps.len(),
        "versioned_store.migrate.start"
    );

    let mut conn = connect(path, OpenMode::ReadWrite, busy)?;
    let mut tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    // Another process may have migrated the file since the version was read
    let at = read_version(&tx)?;
    if at != found {
        return Err(Error::Busy(format!(
            "{} changed from {} to {} while opening",
            path.display(),
            found,
            at
        )));
    }

    for step in steps {
        let step_started = Instant::now();
        let sp = tx.savepoint()?;
        if let Err(err) = (step.apply)(&*sp) {
            warn!(
                store = descriptor.name,
                from = %step.from,
                to = %step.to,
                error = %err,
                "versioned_store.migrate.failed"
            );
            return Err(err);
        }
        sp.commit()?;
        debug!(
            store = descriptor.name,
            from = %step.from,
            to = %step.to,
            cost = step.cost,
            elapsed_ms = step_started.elapsed().as_millis() as u64,
            "versioned_store.migrate.step"
        );
    }

    write_version(&tx, descriptor.current)?;
    tx.commit()?;

    info!(
        store = descriptor.name,
        version = %descriptor.current,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "versioned_store.migrate.done"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const V0: SchemaVersion = SchemaVersion::new(1, 0, 0, 0);
    const V1: SchemaVersion = SchemaVersion::new(1, 0, 0, 1);
    const V2: SchemaVersion = SchemaVersion::new(1, 1, 0, 0);

    fn create_v0(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, payload BLOB);
             CREATE TABLE migration_log (step TEXT NOT NULL);",
        )?;
        Ok(())
    }

    fn create_v2(conn: &Connection) -> Result<()> {
        create_v0(conn)?;
        conn.execute_batch(
            "ALTER TABLE items ADD COLUMN size INTEGER NOT NULL DEFAULT 0;
             CREATE TABLE labels (id INTEGER PRIMARY KEY, name TEXT);",
        )?;
        Ok(())
    }

    fn v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "ALTER TABLE items ADD COLUMN size INTEGER NOT NULL DEFAULT 0;
             INSERT INTO migration_log (step) VALUES ('v0->v1');",
        )?;
        Ok(())
    }

    fn v1_to_v2(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE labels (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO migration_log (step) VALUES ('v1->v2');",
        )?;
        Ok(())
    }

    fn failing_step(conn: &Connection) -> Result<()> {
        conn.execute_batch("INSERT INTO migration_log (step) VALUES ('v1->v2 partial');")?;
        Err(Error::Corrupt("simulated failure".into()))
    }

    static OLD: StoreDescriptor = StoreDescriptor {
        name: "test",
        current: V0,
        create_tables: create_v0,
        migrations: &[],
    };

    // Declared out of order on purpose
    static MIGRATIONS: [Migration; 2] = [
        Migration {
            from: V1,
            to: V2,
            apply: v1_to_v2,
            cost: 1,
        },
        Migration {
            from: V0,
            to: V1,
            apply: v0_to_v1,
            cost: 1,
        },
    ];

    static NEW: StoreDescriptor = StoreDescriptor {
        name: "test",
        current: V2,
        create_tables: create_v2,
        migrations: &MIGRATIONS,
    };

    static BROKEN: StoreDescriptor = StoreDescriptor {
        name: "test",
        current: V2,
        create_tables: create_v2,
        migrations: &[
            Migration {
                from: V0,
                to: V1,
                apply: v0_to_v1,
                cost: 1,
            },
            Migration {
                from: V1,
                to: V2,
                apply: failing_step,
                cost: 1,
            },
        ],
    };

    static GAP: StoreDescriptor = StoreDescriptor {
        name: "test",
        current: V2,
        create_tables: create_v2,
        migrations: &[Migration {
            from: V1,
            to: V2,
            apply: v1_to_v2,
            cost: 1,
        }],
    };

    fn log_steps(store: &VersionedStore) -> Vec<String> {
        store
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT step FROM migration_log ORDER BY rowid")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut steps = Vec::new();
                for row in rows {
                    steps.push(row?);
                }
                Ok(steps)
            })
            .unwrap()
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let store = VersionedStore::create(&path, &NEW, BusyPolicy::default()).unwrap();
            assert_eq!(store.version(), V2);
            assert!(store.properties().unwrap().is_empty());
            assert!(store.has_table("labels").unwrap());
        }

        let store =
            VersionedStore::open(&path, &NEW, OpenMode::ReadOnly, BusyPolicy::default()).unwrap();
        assert_eq!(store.version(), V2);
        assert!(log_steps(&store).is_empty());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        VersionedStore::create(&path, &NEW, BusyPolicy::default()).unwrap();
        assert!(matches!(
            VersionedStore::create(&path, &NEW, BusyPolicy::default()),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_migrates_each_step_once_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        VersionedStore::create(&path, &OLD, BusyPolicy::default())
            .unwrap()
            .close()
            .unwrap();

        let store =
            VersionedStore::open(&path, &NEW, OpenMode::ReadOnly, BusyPolicy::default()).unwrap();
        assert_eq!(store.version(), V2);
        assert_eq!(store.mode(), OpenMode::ReadOnly);
        assert_eq!(log_steps(&store), vec!["v0->v1", "v1->v2"]);
        assert!(store.has_table("labels").unwrap());
        drop(store);

        // Second open finds nothing left to do
        let store =
            VersionedStore::open(&path, &NEW, OpenMode::ReadWrite, BusyPolicy::default()).unwrap();
        assert_eq!(log_steps(&store).len(), 2);
    }

    #[test]
    fn test_newer_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        VersionedStore::create(&path, &NEW, BusyPolicy::default()).unwrap();

        match VersionedStore::open(&path, &OLD, OpenMode::ReadWrite, BusyPolicy::default()) {
            Err(Error::SchemaMismatch { found, supported }) => {
                assert_eq!(found, V2);
                assert_eq!(supported, V0);
            }
            other => panic!("expected SchemaMismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_missing_step_is_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        VersionedStore::create(&path, &OLD, BusyPolicy::default()).unwrap();

        assert!(matches!(
            VersionedStore::open(&path, &GAP, OpenMode::ReadWrite, BusyPolicy::default()),
            Err(Error::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_failed_migration_leaves_old_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        VersionedStore::create(&path, &OLD, BusyPolicy::default()).unwrap();

        assert!(VersionedStore::open(&path, &BROKEN, OpenMode::ReadWrite, BusyPolicy::default())
            .is_err());

        // The first step was rolled back together with the failing one
        let store =
            VersionedStore::open(&path, &OLD, OpenMode::ReadWrite, BusyPolicy::default()).unwrap();
        assert_eq!(store.version(), V0);
        assert!(log_steps(&store).is_empty());
        let size_column = store
            .with_conn(|conn| Ok(conn.prepare("SELECT size FROM items").is_ok()))
            .unwrap();
        assert!(!size_column);
    }

    #[test]
    fn test_properties_and_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let store = VersionedStore::create(&path, &NEW, BusyPolicy::default()).unwrap();

        store.store_properties_as(&("mesh", 3u32)).unwrap();
        assert_eq!(
            store.load_properties_as::<(String, u32)>().unwrap(),
            Some(("mesh".to_string(), 3))
        );

        store.begin_batch().unwrap();
        assert!(store.in_batch());
        store
            .with_write(|conn| {
                conn.execute("INSERT INTO labels (id, name) VALUES (1, 'a')", [])?;
                Ok(())
            })
            .unwrap();
        store.save().unwrap();
        assert!(!store.in_batch());

        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.properties(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        VersionedStore::create(&path, &NEW, BusyPolicy::default()).unwrap();
        let store =
            VersionedStore::open(&path, &NEW, OpenMode::ReadOnly, BusyPolicy::default()).unwrap();
        assert!(matches!(
            store.set_properties(b"x"),
            Err(Error::Unsupported(_))
        ));
    }
}
