//! SQLite derived index.
//!
//! The index is disposable: every row is reproducible from the record files
//! and the whole database can be deleted at any time.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so list queries never block a writer
//! - `busy_timeout = 5s` to absorb short contention between processes
//! - `foreign_keys = ON` so child rows follow their item

pub mod freshness;
pub mod incremental;
pub mod migrations;
pub mod query;
pub mod rebuild;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

/// Busy timeout used for index connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the index database, apply runtime pragmas, and migrate
/// the schema to the latest version.
///
/// # Errors
///
/// Returns an error if opening, configuring or migrating the database fails.
pub fn open_index(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create index directory {}", parent.display()))?;
    }

    let mut conn =
        Connection::open(path).with_context(|| format!("open index database {}", path.display()))?;

    configure_connection(&conn).context("configure sqlite pragmas")?;
    migrations::migrate(&mut conn).context("apply index migrations")?;

    Ok(conn)
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Delete the database file and its WAL/SHM siblings.
///
/// # Errors
///
/// Returns an error if the main database file exists but cannot be removed.
pub fn remove_index_files(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("remove index database {}", path.display()))?;
    }
    for suffix in ["-wal", "-shm"] {
        let _ = std::fs::remove_file(sibling(path, suffix));
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
