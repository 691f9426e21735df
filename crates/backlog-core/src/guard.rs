//! Conflict Guard: single-owner mutation of items in active states.
//!
//! Ownership is a marker file at `_meta/locks/<ID>.lock` holding the owning
//! agent and acquisition time. The marker is written to a temporary file
//! and hard-linked into place, so it appears atomically with its contents
//! and creation fails if another marker already exists.
//!
//! Markers are cooperative and long-lived: they survive the process that
//! created them. A marker is never removed automatically unless its holder
//! leaves the active state; a marker left on an item that is no longer
//! active is reported as stale and must be removed with
//! [`ConflictGuard::break_lock`].

use crate::error::{Result, StoreError};
use crate::layout::Layout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Contents of an ownership marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub item_id: String,
    pub agent: String,
    pub acquired_at: DateTime<Utc>,
    /// Process that wrote the marker, for diagnostics only.
    #[serde(default)]
    pub pid: u32,
}

impl LockInfo {
    /// One-line description, e.g. `codex since 2026-03-01T09:30:00Z (3m ago)`.
    #[must_use]
    pub fn summary(&self, now: DateTime<Utc>) -> String {
        let age = now.signed_duration_since(self.acquired_at);
        let age = if age.num_hours() > 0 {
            format!("{}h {}m ago", age.num_hours(), age.num_minutes() % 60)
        } else if age.num_minutes() > 0 {
            format!("{}m {}s ago", age.num_minutes(), age.num_seconds() % 60)
        } else {
            format!("{}s ago", age.num_seconds().max(0))
        };
        format!(
            "{} since {} ({age})",
            self.agent,
            crate::codec::format_timestamp(self.acquired_at)
        )
    }
}

/// What a marker on disk looks like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LockStatus {
    Held(LockInfo),
    Unreadable {
        item_id: String,
        path: PathBuf,
        reason: String,
    },
}

impl LockStatus {
    #[must_use]
    pub fn item_id(&self) -> &str {
        match self {
            Self::Held(info) => &info.item_id,
            Self::Unreadable { item_id, .. } => item_id,
        }
    }
}

/// State of the locked item, as seen by the caller holding its mutation lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemActivity {
    /// The item is in one of the profile's active states.
    Active,
    /// The item exists but is not active.
    Idle,
    /// No record exists for the item.
    Missing,
}

impl ItemActivity {
    /// `Active` or `Idle` for an item that exists.
    #[must_use]
    pub const fn of(active: bool) -> Self {
        if active { Self::Active } else { Self::Idle }
    }
}

/// Ownership held by one agent on one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipLock {
    pub item_id: String,
    pub agent: String,
    /// False when the agent already held the marker before this call.
    pub fresh: bool,
}

/// Marker-file ownership for one product.
#[derive(Debug, Clone, Copy)]
pub struct ConflictGuard<'a> {
    layout: &'a Layout,
}

impl<'a> ConflictGuard<'a> {
    #[must_use]
    pub const fn new(layout: &'a Layout) -> Self {
        Self { layout }
    }

    /// Check whether `agent` may mutate `item_id`, without taking ownership.
    ///
    /// # Errors
    ///
    /// [`StoreError::OwnershipConflict`] when another agent holds the item
    /// and it is active; [`StoreError::StaleLockDetected`] when another
    /// agent's marker sits on an item that is idle or missing, or the
    /// marker cannot be read.
    pub fn check(&self, item_id: &str, agent: &str, activity: ItemActivity) -> Result<()> {
        match self.inspect(item_id)? {
            None => Ok(()),
            Some(status) => judge(status, agent, activity),
        }
    }

    /// Take ownership of `item_id` for `agent`.
    ///
    /// Re-acquiring a marker the agent already holds succeeds.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ConflictGuard::check`], plus I/O failures.
    pub fn acquire(
        &self,
        item_id: &str,
        agent: &str,
        activity: ItemActivity,
    ) -> Result<OwnershipLock> {
        let path = self.layout.owner_lock_path(item_id);
        let info = LockInfo {
            item_id: item_id.to_string(),
            agent: agent.to_string(),
            acquired_at: Utc::now(),
            pid: std::process::id(),
        };

        // A marker can vanish between a failed create and the read that
        // follows; retry a few times before giving up.
        for _ in 0..3 {
            if create_marker(&path, &info)? {
                info!(item_id, agent, "ownership acquired");
                return Ok(OwnershipLock {
                    item_id: item_id.to_string(),
                    agent: agent.to_string(),
                    fresh: true,
                });
            }
            if let Some(status) = self.inspect(item_id)? {
                judge(status, agent, activity)?;
                debug!(item_id, agent, "ownership already held by agent");
                return Ok(OwnershipLock {
                    item_id: item_id.to_string(),
                    agent: agent.to_string(),
                    fresh: false,
                });
            }
        }
        Err(StoreError::io(
            &path,
            io::Error::other("ownership marker kept changing during acquisition"),
        ))
    }

    /// Drop the marker if `lock.agent` still holds it. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the marker exists but cannot be removed.
    pub fn release(&self, lock: &OwnershipLock) -> Result<()> {
        self.release_for(&lock.item_id, &lock.agent)
    }

    /// Drop `item_id`'s marker if `agent` holds it. Idempotent; a marker
    /// held by someone else is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the marker exists but cannot be removed.
    pub fn release_for(&self, item_id: &str, agent: &str) -> Result<()> {
        match self.inspect(item_id)? {
            Some(LockStatus::Held(info)) if info.agent == agent => {
                remove_marker(&self.layout.owner_lock_path(item_id))?;
                info!(item_id, agent, "ownership released");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Current marker for `item_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the marker exists but cannot be read.
    pub fn inspect(&self, item_id: &str) -> Result<Option<LockStatus>> {
        read_marker(&self.layout.owner_lock_path(item_id), item_id)
    }

    /// Every marker in the product, sorted by item id.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the locks directory cannot be listed.
    pub fn list(&self) -> Result<Vec<LockStatus>> {
        let dir = self.layout.locks_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            let Some(item_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(status) = read_marker(&path, item_id)? {
                out.push(status);
            }
        }
        out.sort_by(|a, b| a.item_id().cmp(b.item_id()));
        Ok(out)
    }

    /// Remove `item_id`'s marker whoever holds it. Returns what was removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the marker cannot be removed.
    pub fn break_lock(&self, item_id: &str) -> Result<Option<LockStatus>> {
        let previous = self.inspect(item_id)?;
        if previous.is_some() {
            remove_marker(&self.layout.owner_lock_path(item_id))?;
        }
        Ok(previous)
    }
}

fn judge(status: LockStatus, agent: &str, activity: ItemActivity) -> Result<()> {
    let info = match status {
        LockStatus::Held(info) => info,
        LockStatus::Unreadable {
            item_id, reason, ..
        } => {
            return Err(StoreError::StaleLockDetected {
                item_id,
                holder: "<unknown>".to_string(),
                reason: format!("marker is unreadable ({reason})"),
            });
        }
    };
    if info.agent == agent {
        return Ok(());
    }
    match activity {
        ItemActivity::Active => Err(StoreError::OwnershipConflict {
            item_id: info.item_id,
            holder: info.agent,
            agent: agent.to_string(),
        }),
        ItemActivity::Idle => Err(StoreError::StaleLockDetected {
            reason: format!(
                "held by {} but the item is not in an active state",
                info.summary(Utc::now())
            ),
            item_id: info.item_id,
            holder: info.agent,
        }),
        ItemActivity::Missing => Err(StoreError::StaleLockDetected {
            reason: "the item's record no longer exists".to_string(),
            item_id: info.item_id,
            holder: info.agent,
        }),
    }
}

/// Atomically create the marker. Returns `false` if one already exists.
fn create_marker(path: &Path, info: &LockInfo) -> Result<bool> {
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let body = toml::to_string(info).map_err(|e| StoreError::io(path, io::Error::other(e)))?;
    let tmp = dir.join(format!(
        ".{}.{}-{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("marker"),
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let write_tmp = || -> io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(body.as_bytes())?;
        file.sync_data()
    };
    write_tmp().map_err(|e| StoreError::io(&tmp, e))?;

    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn read_marker(path: &Path, item_id: &str) -> Result<Option<LockStatus>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    Ok(Some(match toml::from_str::<LockInfo>(&text) {
        Ok(info) => LockStatus::Held(info),
        Err(e) => LockStatus::Unreadable {
            item_id: item_id.to_string(),
            path: path.to_path_buf(),
            reason: e.message().to_string(),
        },
    }))
}

fn remove_marker(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}
