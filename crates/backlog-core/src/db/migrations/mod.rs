//! Versioned schema upgrades for the derived index.
//!
//! The schema version lives in `PRAGMA user_version` and is mirrored into
//! `index_meta.schema_version` so `index status` can show it without a
//! pragma. Because the index can always be rebuilt from records, there are
//! no data migrations: each step only creates tables or indexes.
//!
//! | version | adds |
//! |---------|------|
//! | 1 | `items`, the list-field tables, `record_files`, `index_meta` |
//! | 2 | lookup indexes for the `list` filters (state, kind, parent, owner, tag) |

use super::schema;
use rusqlite::{Connection, types::Type};
use tracing::debug;

/// One schema step.
struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "record tables",
        sql: schema::MIGRATION_V1_SQL,
    },
    Migration {
        version: 2,
        name: "list filter indexes",
        sql: schema::MIGRATION_V2_SQL,
    },
];

/// Schema version a freshly migrated index ends up at.
pub const LATEST_SCHEMA_VERSION: u32 = 2;

/// Version recorded in `PRAGMA user_version`; `0` for a new file.
///
/// # Errors
///
/// Returns an error if the pragma cannot be read or holds a negative or
/// oversized value.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let raw: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(e)))
}

/// Bring the index schema up to [`LATEST_SCHEMA_VERSION`].
///
/// Steps at or below the recorded version are skipped. Each remaining step
/// commits together with its version bump, so an interrupted upgrade
/// resumes at the first step that did not commit. Returns the final
/// version.
///
/// # Errors
///
/// Returns the first SQLite error; earlier steps stay committed.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let start = current_schema_version(conn)?;
    let mut version = start;

    for step in MIGRATIONS.iter().filter(|m| m.version > start) {
        let tx = conn.transaction()?;
        tx.execute_batch(step.sql)?;
        let stamp = i64::from(step.version);
        tx.pragma_update(None, "user_version", stamp)?;
        tx.execute("UPDATE index_meta SET schema_version = ?1 WHERE id = 1", [stamp])?;
        tx.commit()?;
        debug!(version = step.version, step = step.name, "index schema upgraded");
        version = step.version;
    }

    Ok(version)
}
