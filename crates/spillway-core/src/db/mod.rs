//! Snapshot database bootstrap: connection pragmas and schema migrations.
//!
//! File-backed stores run in WAL mode so `spw snapshot list` can read while a
//! run writes, wait up to [`BUSY_TIMEOUT`] on a locked database, and enforce
//! foreign keys so membership rows always hang off a metadata row.
//!
//! The schema version lives in `PRAGMA user_version` and is mirrored into
//! `store_meta` for humans poking at the file with `sqlite3`.

pub mod schema;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::Connection;

pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "snapshot tables",
        sql: schema::MIGRATION_V1_SQL,
    },
    Migration {
        version: 2,
        name: "frozen snapshot guards",
        sql: schema::MIGRATION_V2_SQL,
    },
];

/// Schema version this build writes and expects.
pub const SCHEMA_VERSION: u32 = 2;

/// Open the snapshot database at `path`, creating parent directories and the
/// file as needed, and bring its schema up to date.
///
/// # Errors
///
/// Fails if the file cannot be created or opened, a pragma is rejected, a
/// migration fails, or the file was written by a newer schema.
pub fn open_store_db(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create directory {}", dir.display()))?;
    }
    let mut conn =
        Connection::open(path).with_context(|| format!("open {}", path.display()))?;

    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")
        .context("set connection pragmas")?;
    let mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .context("enable WAL")?;
    tracing::trace!(journal_mode = %mode, path = %path.display(), "snapshot db opened");
    conn.busy_timeout(BUSY_TIMEOUT).context("set busy timeout")?;

    migrate(&mut conn).with_context(|| format!("migrate {}", path.display()))?;
    Ok(conn)
}

/// A migrated database that lives only as long as the connection.
///
/// # Errors
///
/// Fails if the schema cannot be applied.
pub fn open_in_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory().context("open in-memory database")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .context("enable foreign keys")?;
    migrate(&mut conn)?;
    Ok(conn)
}

/// Current `user_version` of `conn`.
///
/// # Errors
///
/// Fails if the pragma cannot be read or holds a negative/oversized value.
pub fn schema_version(conn: &Connection) -> Result<u32> {
    let raw: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(raw).with_context(|| format!("user_version {raw} out of range"))
}

/// Apply pending migrations, each in its own transaction. Returns the
/// version the database ends at.
///
/// # Errors
///
/// Fails if a migration's SQL fails (that migration is rolled back) or the
/// database is newer than [`SCHEMA_VERSION`].
pub fn migrate(conn: &mut Connection) -> Result<u32> {
    let mut version = schema_version(conn)?;
    if version > SCHEMA_VERSION {
        bail!(
            "snapshot database is at schema v{version}, this build understands up to v{SCHEMA_VERSION}"
        );
    }

    let from = version;
    for migration in MIGRATIONS.iter().filter(|m| m.version > from) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)
            .with_context(|| format!("migration v{} ({})", migration.version, migration.name))?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.execute(
            "UPDATE store_meta SET schema_version = ?1 WHERE id = 1",
            [migration.version],
        )?;
        tx.commit()?;
        version = migration.version;
        tracing::debug!(version, name = migration.name, "applied migration");
    }
    Ok(version)
}
