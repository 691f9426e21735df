//! Freshness of the derived index.
//!
//! Each record file contributes `(relative path, byte length, mtime ns)` to
//! a BLAKE3 fingerprint. The index is fresh when the fingerprint stored by
//! the last sync equals the fingerprint of the current directory walk. A
//! rewrite that keeps both size and mtime unchanged is not detected.

use crate::error::{Result as StoreResult, StoreError};
use crate::layout::Layout;
use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Stat marker of one record file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStat {
    pub path: PathBuf,
    /// Path relative to the product root, `/`-separated.
    pub rel: String,
    pub len: u64,
    pub mtime_ns: i64,
}

/// Result of comparing the index against the record files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale { reason: String },
}

impl Freshness {
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Stat one record file.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be stat'ed.
pub fn stat_file(layout: &Layout, path: &Path) -> StoreResult<RecordStat> {
    let meta = fs::metadata(path).map_err(|e| StoreError::io(path, e))?;
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX));
    Ok(RecordStat {
        path: path.to_path_buf(),
        rel: layout.relative(path),
        len: meta.len(),
        mtime_ns,
    })
}

/// Stat every record file, sorted by relative path.
///
/// Files that disappear between the walk and the stat are left out.
///
/// # Errors
///
/// Returns an I/O error if a directory cannot be listed.
pub fn stat_records(layout: &Layout) -> StoreResult<Vec<RecordStat>> {
    let mut out = Vec::new();
    for path in layout.record_files()? {
        match stat_file(layout, &path) {
            Ok(stat) => out.push(stat),
            Err(StoreError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    out.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(out)
}

/// Fingerprint over `(rel, len, mtime_ns)` triples in any order.
#[must_use]
pub fn fingerprint<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, u64, i64)>,
{
    let mut entries: Vec<_> = entries.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    let mut hasher = blake3::Hasher::new();
    for (rel, len, mtime_ns) in entries {
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update(len.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(mtime_ns.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

/// Fingerprint of a set of stats.
#[must_use]
pub fn fingerprint_stats(stats: &[RecordStat]) -> String {
    fingerprint(stats.iter().map(|s| (s.rel.as_str(), s.len, s.mtime_ns)))
}

/// Fingerprint of the stat markers recorded in `record_files`.
///
/// # Errors
///
/// Returns an error if the table cannot be read.
pub fn fingerprint_from_table(conn: &Connection) -> Result<String> {
    let mut stmt = conn
        .prepare_cached("SELECT path, len, mtime_ns FROM record_files")
        .context("prepare record_files scan")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read record_files")?;
    Ok(fingerprint(rows.iter().map(|(path, len, mtime)| {
        (path.as_str(), u64::try_from(*len).unwrap_or_default(), *mtime)
    })))
}

/// Fingerprint written by the last sync, if any.
///
/// # Errors
///
/// Returns an error if `index_meta` is missing or unreadable.
pub fn stored_fingerprint(conn: &Connection) -> Result<Option<String>> {
    let value: Option<Option<String>> = conn
        .query_row("SELECT fingerprint FROM index_meta WHERE id = 1", [], |row| row.get(0))
        .optional()
        .context("read index_meta fingerprint")?;
    Ok(value.flatten())
}

/// Store `fingerprint` as the index's freshness marker.
///
/// # Errors
///
/// Returns an error if `index_meta` cannot be updated.
pub fn store_fingerprint(conn: &Connection, fingerprint: &str) -> Result<()> {
    conn.execute(
        "UPDATE index_meta SET fingerprint = ?1 WHERE id = 1",
        [fingerprint],
    )
    .context("update index_meta fingerprint")?;
    Ok(())
}

/// Compare the stored fingerprint with `current`.
///
/// # Errors
///
/// Returns an error if `index_meta` cannot be read.
pub fn check(conn: &Connection, current: &str) -> Result<Freshness> {
    Ok(match stored_fingerprint(conn)? {
        None => Freshness::Stale {
            reason: "index has never been built".to_string(),
        },
        Some(stored) if stored == current => Freshness::Fresh,
        Some(_) => Freshness::Stale {
            reason: "record files changed since the last index sync".to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_index;
    use crate::model::item::Kind;

    #[test]
    fn fingerprint_ignores_input_order_but_not_content() {
        let a = fingerprint([("items/a.md", 10, 1), ("items/b.md", 20, 2)]);
        let b = fingerprint([("items/b.md", 20, 2), ("items/a.md", 10, 1)]);
        assert_eq!(a, b);

        let touched = fingerprint([("items/a.md", 10, 5), ("items/b.md", 20, 2)]);
        assert_ne!(a, touched);
        let grown = fingerprint([("items/a.md", 11, 1), ("items/b.md", 20, 2)]);
        assert_ne!(a, grown);
        let removed = fingerprint([("items/a.md", 10, 1)]);
        assert_ne!(a, removed);
    }

    #[test]
    fn stat_records_sorts_by_relative_path() -> StoreResult<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        layout.ensure_dirs()?;
        let first = layout.record_path(Kind::Task, "APP-TSK-0002", 2, "b");
        let second = layout.record_path(Kind::Bug, "APP-BUG-0001", 1, "a");
        crate::layout::write_atomic(&first, b"one")?;
        crate::layout::write_atomic(&second, b"three")?;

        let stats = stat_records(&layout)?;
        assert_eq!(stats.len(), 2);
        assert!(stats[0].rel.starts_with("items/bug/"));
        assert_eq!(stats[0].len, 5);
        assert!(stats[1].rel.starts_with("items/task/"));
        Ok(())
    }

    #[test]
    fn check_compares_with_stored_marker() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let conn = open_index(&dir.path().join("index.sqlite3"))?;

        assert!(!check(&conn, "abc")?.is_fresh());
        store_fingerprint(&conn, "abc")?;
        assert!(check(&conn, "abc")?.is_fresh());
        assert!(!check(&conn, "def")?.is_fresh());
        Ok(())
    }

    #[test]
    fn table_fingerprint_matches_stat_fingerprint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let conn = open_index(&dir.path().join("index.sqlite3"))?;
        conn.execute(
            "INSERT INTO record_files (path, len, mtime_ns) VALUES ('items/a.md', 3, 7)",
            [],
        )?;
        let stats = vec![RecordStat {
            path: PathBuf::from("/x/items/a.md"),
            rel: "items/a.md".into(),
            len: 3,
            mtime_ns: 7,
        }];
        assert_eq!(fingerprint_from_table(&conn)?, fingerprint_stats(&stats));
        Ok(())
    }
}
