//! Query Facade: one `list` over two interchangeable record sources.
//!
//! [`ScanSource`] decodes every record file and is always correct.
//! [`IndexSource`] answers from the derived SQLite index and is only
//! consulted when its stored fingerprint matches the current directory
//! walk. Anything else (a missing, stale, or unreadable index) falls back
//! to the scan and adds an `IndexStale` or `IndexCorrupt` warning; the
//! list itself never fails because of the index.

use crate::codec;
use crate::config::{AutoRefresh, IndexConfig};
use crate::db::{self, freshness, query, rebuild::RebuildReport};
use crate::error::{Result, StoreError};
use crate::layout::Layout;
use crate::model::profile::ProcessProfile;
use crate::model::row::{DerivedIndexRow, ItemFilter};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Where a listing was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Scan,
    Index,
}

impl SourceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Index => "index",
        }
    }
}

/// Rows plus every non-fatal finding made while producing them.
#[derive(Debug)]
pub struct ListOutcome {
    pub rows: Vec<DerivedIndexRow>,
    pub source: SourceKind,
    pub warnings: Vec<StoreError>,
}

/// A way of producing filtered rows.
pub trait RecordSource {
    fn kind(&self) -> SourceKind;

    /// Rows matching `filter`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the source as a whole cannot be read.
    fn list(&self, filter: &ItemFilter) -> Result<ListOutcome>;
}

/// Directory scan through the record codec.
#[derive(Debug, Clone, Copy)]
pub struct ScanSource<'a> {
    layout: &'a Layout,
    profile: &'a ProcessProfile,
}

impl<'a> ScanSource<'a> {
    #[must_use]
    pub const fn new(layout: &'a Layout, profile: &'a ProcessProfile) -> Self {
        Self { layout, profile }
    }

    /// Every decodable record, one row per id.
    ///
    /// Files are visited in relative-path order; when two files carry the
    /// same id the first one wins and the other is reported, which is also
    /// what an index rebuild does.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the record directories cannot be listed.
    pub fn rows(&self) -> Result<(Vec<DerivedIndexRow>, Vec<StoreError>)> {
        let mut paths: Vec<_> = self
            .layout
            .record_files()?
            .into_iter()
            .map(|path| (self.layout.relative(&path), path))
            .collect();
        paths.sort_by(|a, b| a.0.cmp(&b.0));

        let mut rows = Vec::with_capacity(paths.len());
        let mut warnings = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for (rel, path) in paths {
            let item = match codec::read_record(&path) {
                Ok(item) => item,
                Err(StoreError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    continue;
                }
                Err(StoreError::ParseError { message, .. }) => {
                    warn!(path = %rel, error = %message, "skipping malformed record");
                    warnings.push(StoreError::ParseError { path: rel, message });
                    continue;
                }
                Err(e) => {
                    warn!(path = %rel, error = %e, "skipping unreadable record");
                    warnings.push(e);
                    continue;
                }
            };
            if !seen.insert(item.id.clone()) {
                warn!(path = %rel, item_id = %item.id, "skipping duplicate record");
                warnings.push(StoreError::ParseError {
                    message: format!("duplicate id {}", item.id),
                    path: rel,
                });
                continue;
            }
            rows.push(DerivedIndexRow::from_item(&item, rel));
        }
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok((rows, warnings))
    }
}

impl RecordSource for ScanSource<'_> {
    fn kind(&self) -> SourceKind {
        SourceKind::Scan
    }

    fn list(&self, filter: &ItemFilter) -> Result<ListOutcome> {
        let (rows, warnings) = self.rows()?;
        let mut rows: Vec<_> = rows
            .into_iter()
            .filter(|row| filter.matches(row, self.profile))
            .collect();
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(ListOutcome {
            rows,
            source: SourceKind::Scan,
            warnings,
        })
    }
}

/// Queries against an open, fresh derived index.
pub struct IndexSource<'a> {
    conn: Connection,
    profile: &'a ProcessProfile,
}

impl<'a> IndexSource<'a> {
    /// Open the index of `layout` if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database exists but cannot be opened.
    pub fn open(layout: &Layout, profile: &'a ProcessProfile) -> anyhow::Result<Option<Self>> {
        let path = layout.index_path();
        if !path.exists() {
            return Ok(None);
        }
        let conn = db::open_index(&path)?;
        Ok(Some(Self { conn, profile }))
    }

    /// Compare the index against the record files of `layout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory walk or the metadata read fails.
    pub fn freshness(&self, layout: &Layout) -> anyhow::Result<freshness::Freshness> {
        let current = freshness::fingerprint_stats(&freshness::stat_records(layout)?);
        freshness::check(&self.conn, &current)
    }

    fn query(&self, filter: &ItemFilter) -> anyhow::Result<ListOutcome> {
        let rows = query::list_rows(&self.conn, filter, self.profile)?;
        let warnings = query::skipped_records(&self.conn)?
            .into_iter()
            .map(|skipped| StoreError::ParseError {
                path: skipped.path,
                message: skipped.error,
            })
            .collect();
        Ok(ListOutcome {
            rows,
            source: SourceKind::Index,
            warnings,
        })
    }
}

impl RecordSource for IndexSource<'_> {
    fn kind(&self) -> SourceKind {
        SourceKind::Index
    }

    fn list(&self, filter: &ItemFilter) -> Result<ListOutcome> {
        self.query(filter).map_err(|e| StoreError::IndexCorrupt {
            reason: format!("{e:#}"),
        })
    }
}

/// Summary of the derived index for `bkl index status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStatus {
    pub enabled: bool,
    pub exists: bool,
    pub fresh: bool,
    pub items: Option<usize>,
    pub reason: Option<String>,
}

type RefreshHandle = JoinHandle<anyhow::Result<RebuildReport>>;

enum IndexAttempt {
    Served(ListOutcome),
    Unusable(StoreError),
}

/// Entry point for listings, choosing the source per call.
pub struct QueryFacade<'a> {
    layout: &'a Layout,
    profile: &'a ProcessProfile,
    index: &'a IndexConfig,
    refresh: Mutex<Option<RefreshHandle>>,
}

impl<'a> QueryFacade<'a> {
    #[must_use]
    pub const fn new(
        layout: &'a Layout,
        profile: &'a ProcessProfile,
        index: &'a IndexConfig,
    ) -> Self {
        Self {
            layout,
            profile,
            index,
            refresh: Mutex::new(None),
        }
    }

    /// List rows matching `filter`.
    ///
    /// Served from the index when it is enabled and fresh, otherwise from a
    /// scan, after which the configured auto-refresh runs.
    ///
    /// # Errors
    ///
    /// Returns an error only when the record directories cannot be listed.
    pub fn list(&self, filter: &ItemFilter) -> Result<ListOutcome> {
        self.list_with(filter, true)
    }

    /// Same as [`QueryFacade::list`] but never triggers an index refresh.
    ///
    /// # Errors
    ///
    /// Returns an error only when the record directories cannot be listed.
    pub fn list_without_refresh(&self, filter: &ItemFilter) -> Result<ListOutcome> {
        self.list_with(filter, false)
    }

    fn list_with(&self, filter: &ItemFilter, refresh: bool) -> Result<ListOutcome> {
        let scan = ScanSource::new(self.layout, self.profile);
        if !self.index.enabled {
            return scan.list(filter);
        }

        let fallback = match self.try_index(filter) {
            IndexAttempt::Served(outcome) => {
                debug!(rows = outcome.rows.len(), "served listing from index");
                return Ok(outcome);
            }
            IndexAttempt::Unusable(reason) => reason,
        };
        warn!(reason = %fallback, "falling back to directory scan");

        let mut outcome = scan.list(filter)?;
        outcome.warnings.insert(0, fallback);
        if refresh {
            self.trigger_refresh(&mut outcome.warnings);
        }
        Ok(outcome)
    }

    fn try_index(&self, filter: &ItemFilter) -> IndexAttempt {
        let source = match IndexSource::open(self.layout, self.profile) {
            Ok(Some(source)) => source,
            Ok(None) => {
                return IndexAttempt::Unusable(StoreError::IndexStale {
                    reason: "index has not been built".to_string(),
                });
            }
            Err(e) => {
                return IndexAttempt::Unusable(StoreError::IndexCorrupt {
                    reason: format!("{e:#}"),
                });
            }
        };
        match source.freshness(self.layout) {
            Ok(freshness::Freshness::Fresh) => {}
            Ok(freshness::Freshness::Stale { reason }) => {
                return IndexAttempt::Unusable(StoreError::IndexStale { reason });
            }
            Err(e) => {
                return IndexAttempt::Unusable(StoreError::IndexCorrupt {
                    reason: format!("{e:#}"),
                });
            }
        }
        match source.list(filter) {
            Ok(outcome) => IndexAttempt::Served(outcome),
            Err(e) => IndexAttempt::Unusable(e),
        }
    }

    fn trigger_refresh(&self, warnings: &mut Vec<StoreError>) {
        match self.index.auto_refresh {
            AutoRefresh::Off => {}
            AutoRefresh::Inline => {
                if let Err(e) = db::rebuild::rebuild(self.layout) {
                    warn!(error = %e, "inline index refresh failed");
                    warnings.push(StoreError::IndexCorrupt {
                        reason: format!("refresh failed: {e:#}"),
                    });
                }
            }
            AutoRefresh::Background => {
                let mut slot = self.refresh.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
                    debug!("index refresh already running");
                    return;
                }
                let layout = self.layout.clone();
                *slot = Some(thread::spawn(move || db::rebuild::rebuild(&layout)));
                info!("started background index refresh");
            }
        }
    }

    /// Join the background refresh started by the last listing, if any.
    ///
    /// Returns `None` when no refresh was started.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IndexCorrupt`] if the rebuild failed or panicked.
    pub fn wait_for_refresh(&self) -> Option<Result<RebuildReport>> {
        let handle = self
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        Some(match handle.join() {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(StoreError::IndexCorrupt {
                reason: format!("background refresh failed: {e:#}"),
            }),
            Err(_) => Err(StoreError::IndexCorrupt {
                reason: "background refresh panicked".to_string(),
            }),
        })
    }

    /// Rebuild the index now, whether or not it is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IndexCorrupt`] if the rebuild cannot complete.
    pub fn rebuild(&self) -> Result<RebuildReport> {
        db::rebuild::rebuild(self.layout).map_err(|e| StoreError::IndexCorrupt {
            reason: format!("{e:#}"),
        })
    }

    /// Whether the index exists and matches the record files.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the record directories cannot be listed.
    pub fn status(&self) -> Result<IndexStatus> {
        let mut status = IndexStatus {
            enabled: self.index.enabled,
            exists: self.layout.index_path().exists(),
            fresh: false,
            items: None,
            reason: None,
        };
        if !status.exists {
            status.reason = Some("index has not been built".to_string());
            return Ok(status);
        }
        let source = match IndexSource::open(self.layout, self.profile) {
            Ok(Some(source)) => source,
            Ok(None) => return Ok(status),
            Err(e) => {
                status.reason = Some(format!("{e:#}"));
                return Ok(status);
            }
        };
        match source.freshness(self.layout) {
            Ok(freshness::Freshness::Fresh) => status.fresh = true,
            Ok(freshness::Freshness::Stale { reason }) => status.reason = Some(reason),
            Err(e) => status.reason = Some(format!("{e:#}")),
        }
        status.items = query::count_items(&source.conn).ok();
        Ok(status)
    }
}
