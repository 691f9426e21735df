//! Single-record index maintenance.
//!
//! Every successful mutation upserts the touched record's row, its child
//! rows and its stat marker, then recomputes the stored fingerprint from
//! `record_files`. Files changed behind the store's back keep their old
//! markers, so the fingerprint still disagrees with the directory walk and
//! the index stays stale until the next rebuild.

use super::freshness::{self, RecordStat};
use crate::codec::format_timestamp;
use crate::error::StoreError;
use crate::model::row::DerivedIndexRow;
use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

/// Upsert one row and refresh the freshness marker.
///
/// Returns non-fatal findings; a worklog shorter than the indexed one is
/// reported as [`StoreError::WorklogRegression`] and the row is still
/// written, since the record file is authoritative.
///
/// # Errors
///
/// Returns an error if any statement fails; the transaction is rolled back.
pub fn apply(
    conn: &mut Connection,
    row: &DerivedIndexRow,
    stat: &RecordStat,
) -> Result<Vec<StoreError>> {
    let mut warnings = Vec::new();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin incremental index update")?;

    let previous: Option<(i64, String)> = tx
        .query_row(
            "SELECT worklog_len, path FROM items WHERE id = ?1",
            [&row.id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .context("read indexed row")?;

    if let Some((indexed_len, indexed_path)) = previous {
        let indexed_len = usize::try_from(indexed_len).unwrap_or_default();
        if row.worklog_len < indexed_len {
            tracing::warn!(
                item_id = %row.id,
                indexed = indexed_len,
                found = row.worklog_len,
                "record worklog is shorter than the indexed one"
            );
            warnings.push(StoreError::WorklogRegression {
                item_id: row.id.clone(),
                expected: indexed_len,
                found: row.worklog_len,
            });
        }
        if indexed_path != row.path {
            tx.execute("DELETE FROM record_files WHERE path = ?1", [&indexed_path])
                .context("drop moved record marker")?;
        }
    }

    upsert_item(&tx, row).context("upsert item row")?;
    upsert_record_file(&tx, stat, Some(&row.id), None).context("upsert record marker")?;

    let fingerprint = freshness::fingerprint_from_table(&tx)?;
    freshness::store_fingerprint(&tx, &fingerprint)?;
    tx.commit().context("commit incremental index update")?;

    debug!(item_id = %row.id, "index row updated");
    Ok(warnings)
}

/// Insert or replace one item row and all of its child rows.
pub(crate) fn upsert_item(conn: &Connection, row: &DerivedIndexRow) -> rusqlite::Result<()> {
    let synced = row
        .last_synced_at
        .map_or_else(|| format_timestamp(chrono::Utc::now()), format_timestamp);
    conn.execute(
        "INSERT INTO items (
            id, kind, title, state, owner, parent, priority, area, iteration,
            created, updated, worklog_len, path, last_synced_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
            kind = excluded.kind,
            title = excluded.title,
            state = excluded.state,
            owner = excluded.owner,
            parent = excluded.parent,
            priority = excluded.priority,
            area = excluded.area,
            iteration = excluded.iteration,
            created = excluded.created,
            updated = excluded.updated,
            worklog_len = excluded.worklog_len,
            path = excluded.path,
            last_synced_at = excluded.last_synced_at",
        params![
            row.id,
            row.kind.as_str(),
            row.title,
            row.state,
            row.owner,
            row.parent,
            row.priority,
            row.area,
            row.iteration,
            row.created.map(format_timestamp),
            row.updated.map(format_timestamp),
            i64::try_from(row.worklog_len).unwrap_or(i64::MAX),
            row.path,
            synced,
        ],
    )?;

    for table in ["item_tags", "item_links", "item_decisions"] {
        conn.execute(&format!("DELETE FROM {table} WHERE item_id = ?1"), [&row.id])?;
    }

    let mut tags =
        conn.prepare_cached("INSERT INTO item_tags (item_id, position, tag) VALUES (?1, ?2, ?3)")?;
    for (position, tag) in row.tags.iter().enumerate() {
        tags.execute(params![row.id, position_param(position), tag])?;
    }

    let mut links = conn.prepare_cached(
        "INSERT INTO item_links (item_id, relation, position, target) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (relation, targets) in &row.links {
        for (position, target) in targets.iter().enumerate() {
            links.execute(params![row.id, relation, position_param(position), target])?;
        }
    }

    let mut decisions = conn.prepare_cached(
        "INSERT INTO item_decisions (item_id, position, decision) VALUES (?1, ?2, ?3)",
    )?;
    for (position, decision) in row.decisions.iter().enumerate() {
        decisions.execute(params![row.id, position_param(position), decision])?;
    }
    Ok(())
}

/// Insert or replace the stat marker of one file.
pub(crate) fn upsert_record_file(
    conn: &Connection,
    stat: &RecordStat,
    item_id: Option<&str>,
    error: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO record_files (path, len, mtime_ns, item_id, error)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(path) DO UPDATE SET
            len = excluded.len,
            mtime_ns = excluded.mtime_ns,
            item_id = excluded.item_id,
            error = excluded.error",
        params![
            stat.rel,
            i64::try_from(stat.len).unwrap_or(i64::MAX),
            stat.mtime_ns,
            item_id,
            error,
        ],
    )?;
    Ok(())
}

fn position_param(position: usize) -> i64 {
    i64::try_from(position).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_index, query};
    use crate::model::item::{Kind, WorkItem, WorklogEntry};
    use crate::model::profile::ProcessProfile;
    use crate::model::row::ItemFilter;
    use chrono::Utc;
    use std::path::PathBuf;

    fn stat(rel: &str, len: u64) -> RecordStat {
        RecordStat {
            path: PathBuf::from(rel),
            rel: rel.to_string(),
            len,
            mtime_ns: 42,
        }
    }

    fn row_with_worklog(entries: usize, path: &str) -> DerivedIndexRow {
        let mut item = WorkItem::new(
            "APP-TSK-0001".into(),
            Kind::Task,
            "Index me".into(),
            "Proposed".into(),
            Utc::now(),
        );
        item.tags = vec!["db".into(), "auth".into()];
        for n in 0..entries {
            item.worklog.push(WorklogEntry {
                timestamp: Utc::now(),
                agent: "alice".into(),
                message: format!("entry {n}"),
            });
        }
        DerivedIndexRow::from_item(&item, path.to_string())
    }

    #[test]
    fn apply_upserts_row_and_marks_fresh() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut conn = open_index(&dir.path().join("index.sqlite3"))?;
        let path = "items/task/0000/APP-TSK-0001_index-me.md";

        let warnings = apply(&mut conn, &row_with_worklog(1, path), &stat(path, 100))?;
        assert!(warnings.is_empty());

        let stored = freshness::stored_fingerprint(&conn)?;
        assert_eq!(stored, Some(freshness::fingerprint([(path, 100, 42)])));

        let mut second = row_with_worklog(2, path);
        second.tags = vec!["auth".into()];
        apply(&mut conn, &second, &stat(path, 120))?;

        let rows = query::list_rows(&conn, &ItemFilter::all(), &ProcessProfile::azure_boards_agile())?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tags, vec!["auth".to_string()]);
        assert_eq!(rows[0].worklog_len, 2);
        Ok(())
    }

    #[test]
    fn shorter_worklog_is_reported_but_written() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut conn = open_index(&dir.path().join("index.sqlite3"))?;
        let path = "items/task/0000/APP-TSK-0001_index-me.md";

        apply(&mut conn, &row_with_worklog(3, path), &stat(path, 100))?;
        let warnings = apply(&mut conn, &row_with_worklog(1, path), &stat(path, 80))?;
        assert_eq!(warnings.len(), 1);
        assert!(matches!(
            warnings[0],
            StoreError::WorklogRegression { expected: 3, found: 1, .. }
        ));
        let len: i64 = conn.query_row("SELECT worklog_len FROM items", [], |r| r.get(0))?;
        assert_eq!(len, 1);
        Ok(())
    }

    #[test]
    fn moved_record_drops_old_marker() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut conn = open_index(&dir.path().join("index.sqlite3"))?;
        let old = "items/task/0000/APP-TSK-0001_index-me.md";
        let new = "items/task/0000/APP-TSK-0001_renamed.md";

        apply(&mut conn, &row_with_worklog(1, old), &stat(old, 100))?;
        apply(&mut conn, &row_with_worklog(1, new), &stat(new, 100))?;

        let paths: Vec<String> = conn
            .prepare("SELECT path FROM record_files")?
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        assert_eq!(paths, vec![new.to_string()]);
        Ok(())
    }
}
