//! Full index rebuild from the record files.
//!
//! `bkl index rebuild` replaces every row in one transaction, proving the
//! index is disposable and reproducible. Each file is stat'ed before it is
//! read, so a record rewritten mid-rebuild leaves an older marker behind and
//! the next freshness check reports the index as stale.

use std::collections::HashMap;
use std::fs;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use super::freshness::{self, RecordStat};
use super::incremental::{upsert_item, upsert_record_file};
use super::{open_index, remove_index_files};
use crate::codec::{self, format_timestamp};
use crate::error::StoreError;
use crate::layout::Layout;
use crate::model::row::DerivedIndexRow;
use crate::worklog;

/// Report returned after a full rebuild.
#[derive(Debug)]
pub struct RebuildReport {
    /// Items written to the index.
    pub item_count: usize,
    /// Files that were stat'ed but not indexed.
    pub skipped: usize,
    /// Malformed or duplicate records, one entry per skipped file.
    pub warnings: Vec<StoreError>,
    /// Whether a corrupt database had to be deleted first.
    pub recreated: bool,
    pub elapsed: Duration,
}

/// Rebuild the index of `layout` from scratch.
///
/// # Errors
///
/// Returns an error if the record directory cannot be walked or the
/// database cannot be written. Malformed records are not errors; they are
/// listed in [`RebuildReport::warnings`].
pub fn rebuild(layout: &Layout) -> Result<RebuildReport> {
    let start = Instant::now();
    let db_path = layout.index_path();

    let (mut conn, recreated) = open_or_recreate(&db_path)?;
    let stats = freshness::stat_records(layout).context("walk record files")?;
    let synced_at = worklog::now();

    let tx = conn.transaction().context("begin rebuild transaction")?;
    for table in ["item_tags", "item_links", "item_decisions", "items", "record_files"] {
        tx.execute(&format!("DELETE FROM {table}"), [])
            .with_context(|| format!("clear {table}"))?;
    }

    let mut warnings = Vec::new();
    let mut kept: Vec<&RecordStat> = Vec::with_capacity(stats.len());
    let mut first_path: HashMap<String, String> = HashMap::new();
    let mut item_count = 0;

    for stat in &stats {
        let text = match fs::read_to_string(&stat.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %stat.rel, "record vanished during rebuild");
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", stat.path.display())),
        };
        kept.push(stat);

        let item = match codec::decode(&text) {
            Ok(item) => item,
            Err(e) => {
                let message = e.to_string();
                warn!(path = %stat.rel, error = %message, "skipping malformed record");
                upsert_record_file(&tx, stat, None, Some(&message))?;
                warnings.push(StoreError::ParseError {
                    path: stat.rel.clone(),
                    message,
                });
                continue;
            }
        };

        if let Some(first) = first_path.get(&item.id) {
            let message = format!("duplicate id {} (first seen at {first})", item.id);
            warn!(path = %stat.rel, item_id = %item.id, "skipping duplicate record");
            upsert_record_file(&tx, stat, None, Some(&message))?;
            warnings.push(StoreError::ParseError {
                path: stat.rel.clone(),
                message,
            });
            continue;
        }
        first_path.insert(item.id.clone(), stat.rel.clone());

        let mut row = DerivedIndexRow::from_item(&item, stat.rel.clone());
        row.last_synced_at = Some(synced_at);
        upsert_item(&tx, &row).with_context(|| format!("index {}", item.id))?;
        upsert_record_file(&tx, stat, Some(&item.id), None)?;
        item_count += 1;
    }

    let fingerprint =
        freshness::fingerprint(kept.iter().map(|s| (s.rel.as_str(), s.len, s.mtime_ns)));
    freshness::store_fingerprint(&tx, &fingerprint)?;
    tx.execute(
        "UPDATE index_meta SET last_rebuild_at = ?1 WHERE id = 1",
        [format_timestamp(synced_at)],
    )
    .context("record rebuild time")?;
    tx.commit().context("commit rebuild transaction")?;

    let report = RebuildReport {
        item_count,
        skipped: warnings.len(),
        warnings,
        recreated,
        elapsed: start.elapsed(),
    };
    info!(
        items = report.item_count,
        skipped = report.skipped,
        recreated = report.recreated,
        elapsed_ms = report.elapsed.as_millis(),
        "index rebuild complete"
    );
    Ok(report)
}

/// Open the index, deleting and recreating it if it does not open cleanly.
fn open_or_recreate(path: &std::path::Path) -> Result<(Connection, bool)> {
    match open_index(path) {
        Ok(conn) if freshness::stored_fingerprint(&conn).is_ok() => return Ok((conn, false)),
        Ok(conn) => {
            drop(conn);
            warn!(path = %path.display(), "index metadata unreadable, recreating");
        }
        Err(e) => warn!(path = %path.display(), error = %e, "index unusable, recreating"),
    }
    remove_index_files(path)?;
    let conn = open_index(path).context("create fresh index database")?;
    Ok((conn, true))
}
