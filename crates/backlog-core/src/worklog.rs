//! Append-only audit trail.
//!
//! Entries are ordered by timestamp and every new entry is stamped strictly
//! after the previous one (`max(now, last + 1ms)`), so the on-disk order is
//! also the time order even when the clock steps backwards. Appends happen
//! under the item's mutation lock, and the write is refused unless the
//! record's current worklog is a prefix of the new one.

use crate::codec;
use crate::error::{Result, StoreError};
use crate::model::item::{WorkItem, WorklogEntry};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::path::Path;

/// Current time at the millisecond precision records are written with.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Timestamp for the next entry of `item`.
#[must_use]
pub fn next_timestamp(item: &WorkItem, now: DateTime<Utc>) -> DateTime<Utc> {
    match item.last_worklog_at() {
        Some(last) if now <= last => last + Duration::milliseconds(1),
        _ => now,
    }
}

/// Append one entry to `item` and bump its `updated` stamp.
///
/// # Errors
///
/// Returns [`StoreError::InvalidAgent`] if `agent` cannot be written into a
/// worklog line.
pub fn append(
    item: &mut WorkItem,
    agent: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<WorklogEntry> {
    codec::validate_agent(agent).map_err(|reason| StoreError::InvalidAgent {
        agent: agent.to_string(),
        reason,
    })?;
    let entry = WorklogEntry {
        timestamp: next_timestamp(item, now),
        agent: agent.to_string(),
        message: message.to_string(),
    };
    item.updated = Some(entry.timestamp);
    item.worklog.push(entry.clone());
    Ok(entry)
}

/// Verify that `next` only adds entries after `previous`.
///
/// # Errors
///
/// Returns [`StoreError::WorklogRegression`] if `next` is shorter than
/// `previous` or differs from it in any existing entry.
pub fn ensure_append_only(
    item_id: &str,
    previous: &[WorklogEntry],
    next: &[WorklogEntry],
) -> Result<()> {
    if next.len() < previous.len() || !next.starts_with(previous) {
        return Err(StoreError::WorklogRegression {
            item_id: item_id.to_string(),
            expected: previous.len(),
            found: next.len(),
        });
    }
    Ok(())
}

/// Write `item` to `path`, refusing to drop or rewrite history.
///
/// The record currently on disk is re-read first and its worklog must be a
/// prefix of `item.worklog`. Nothing is written if it does not decode.
///
/// # Errors
///
/// Returns [`StoreError::WorklogRegression`] when history would be lost,
/// [`StoreError::ParseError`] when the record on disk cannot be read back,
/// and I/O or encoding errors from the write.
pub fn persist(path: &Path, item: &WorkItem) -> Result<()> {
    if path.exists() {
        let on_disk = codec::read_record(path)?;
        ensure_append_only(&item.id, &on_disk.worklog, &item.worklog)?;
    }
    codec::write_record(path, item)
}
