//! Read queries against the derived index.
//!
//! All functions take a shared `&Connection` and return typed rows, never
//! raw SQLite rows. Results are ordered by item id so index and scan
//! listings compare equal.

use crate::codec::parse_timestamp;
use crate::model::item::Kind;
use crate::model::profile::ProcessProfile;
use crate::model::row::{DerivedIndexRow, ItemFilter};
use anyhow::{Context, Result};
use rusqlite::{Connection, Row, params_from_iter, types::Type};
use std::collections::BTreeMap;

const ITEM_COLUMNS: &str = "i.id, i.kind, i.title, i.state, i.owner, i.parent, i.priority, \
     i.area, i.iteration, i.created, i.updated, i.worklog_len, i.path, i.last_synced_at";

/// A record file the last sync could not index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub path: String,
    pub error: String,
}

/// List rows matching `filter`, ordered by id.
///
/// # Errors
///
/// Returns an error if the query fails or a stored value cannot be decoded.
pub fn list_rows(
    conn: &Connection,
    filter: &ItemFilter,
    profile: &ProcessProfile,
) -> Result<Vec<DerivedIndexRow>> {
    let mut conditions: Vec<String> = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if !filter.include_terminal && !profile.terminal_states.is_empty() {
        let mut placeholders = Vec::new();
        for state in &profile.terminal_states {
            param_values.push(Box::new(state.clone()));
            placeholders.push(format!("?{}", param_values.len()));
        }
        conditions.push(format!("i.state NOT IN ({})", placeholders.join(", ")));
    }

    if let Some(kind) = filter.kind {
        param_values.push(Box::new(kind.as_str()));
        conditions.push(format!("i.kind = ?{}", param_values.len()));
    }

    if let Some(ref state) = filter.state {
        param_values.push(Box::new(state.clone()));
        conditions.push(format!("i.state = ?{}", param_values.len()));
    }

    if let Some(ref owner) = filter.owner {
        param_values.push(Box::new(owner.clone()));
        conditions.push(format!("i.owner = ?{}", param_values.len()));
    }

    if let Some(ref parent) = filter.parent {
        param_values.push(Box::new(parent.clone()));
        conditions.push(format!("i.parent = ?{}", param_values.len()));
    }

    if let Some(ref tag) = filter.tag {
        param_values.push(Box::new(tag.clone()));
        conditions.push(format!(
            "EXISTS (SELECT 1 FROM item_tags t WHERE t.item_id = i.id AND t.tag = ?{})",
            param_values.len()
        ));
    }

    if let Some(ref needle) = filter.title_contains {
        param_values.push(Box::new(needle.clone()));
        conditions.push(format!(
            "instr(lower(i.title), lower(?{})) > 0",
            param_values.len()
        ));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let limit_clause = match filter.limit {
        Some(limit) => {
            param_values.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));
            format!(" LIMIT ?{}", param_values.len())
        }
        None => String::new(),
    };

    let sql = format!("SELECT {ITEM_COLUMNS} FROM items i{where_clause} ORDER BY i.id ASC{limit_clause}");

    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("prepare list_rows: {sql}"))?;
    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(AsRef::as_ref).collect();
    let mut rows = stmt
        .query_map(params_from_iter(params_refs), row_to_item)
        .context("execute list_rows")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read list_rows results")?;

    for row in &mut rows {
        load_children(conn, row)?;
    }
    Ok(rows)
}

/// Files recorded by the last sync that failed to decode or were shadowed
/// by a duplicate id.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn skipped_records(conn: &Connection) -> Result<Vec<SkippedRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT path, error FROM record_files WHERE error IS NOT NULL ORDER BY path",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SkippedRecord {
                path: row.get(0)?,
                error: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read skipped records")?;
    Ok(rows)
}

/// Number of indexed items.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_items(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or_default())
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<DerivedIndexRow> {
    let kind_text: String = row.get(1)?;
    let kind: Kind = kind_text
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let worklog_len: i64 = row.get(11)?;
    Ok(DerivedIndexRow {
        id: row.get(0)?,
        kind,
        title: row.get(2)?,
        state: row.get(3)?,
        owner: row.get(4)?,
        parent: row.get(5)?,
        priority: row.get(6)?,
        area: row.get(7)?,
        iteration: row.get(8)?,
        tags: Vec::new(),
        links: BTreeMap::new(),
        decisions: Vec::new(),
        created: row.get::<_, Option<String>>(9)?.as_deref().and_then(parse_timestamp),
        updated: row.get::<_, Option<String>>(10)?.as_deref().and_then(parse_timestamp),
        worklog_len: usize::try_from(worklog_len).unwrap_or_default(),
        path: row.get(12)?,
        last_synced_at: row.get::<_, Option<String>>(13)?.as_deref().and_then(parse_timestamp),
    })
}

fn load_children(conn: &Connection, row: &mut DerivedIndexRow) -> Result<()> {
    let mut tags = conn.prepare_cached(
        "SELECT tag FROM item_tags WHERE item_id = ?1 ORDER BY position",
    )?;
    row.tags = tags
        .query_map([&row.id], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .with_context(|| format!("load tags for {}", row.id))?;

    let mut links = conn.prepare_cached(
        "SELECT relation, target FROM item_links WHERE item_id = ?1 ORDER BY relation, position",
    )?;
    let pairs = links
        .query_map([&row.id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("load links for {}", row.id))?;
    row.links.clear();
    for (relation, target) in pairs {
        row.links.entry(relation).or_default().push(target);
    }

    let mut decisions = conn.prepare_cached(
        "SELECT decision FROM item_decisions WHERE item_id = ?1 ORDER BY position",
    )?;
    row.decisions = decisions
        .query_map([&row.id], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .with_context(|| format!("load decisions for {}", row.id))?;
    Ok(())
}
