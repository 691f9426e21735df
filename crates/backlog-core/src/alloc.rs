//! Identifier allocation.
//!
//! Each `(product, kind)` pair owns a persisted counter at
//! `_meta/counters/<CODE>.counter` holding the last issued sequence number.
//! Allocation is read → increment → write under an exclusive
//! [`CounterLock`], so concurrent processes never receive the same id.

use crate::error::{Result, StoreError};
use crate::layout::{self, Layout};
use crate::lock::CounterLock;
use crate::model::item::{Kind, format_id, parse_id};
use std::fs;
use std::io;
use std::time::Duration;
use tracing::debug;

/// A freshly issued identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: String,
    pub seq: u64,
}

/// Issues identifiers for one product namespace.
#[derive(Debug, Clone)]
pub struct Allocator<'a> {
    layout: &'a Layout,
    prefix: &'a str,
    timeout: Duration,
}

impl<'a> Allocator<'a> {
    #[must_use]
    pub const fn new(layout: &'a Layout, prefix: &'a str, timeout: Duration) -> Self {
        Self {
            layout,
            prefix,
            timeout,
        }
    }

    /// Issue the next identifier for `kind` and persist the counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AllocationConflict`] when the counter is
    /// unreadable or non-numeric, or when the issued id already has a
    /// record on disk. Lock timeouts surface as
    /// [`StoreError::LockContention`].
    pub fn allocate(&self, kind: Kind) -> Result<Allocation> {
        let _lock = CounterLock::acquire(&self.layout.counter_lock_path(kind), self.timeout)?;

        let last = match self.read_counter(kind)? {
            Some(last) => last,
            None => {
                let seeded = self.highest_on_disk(kind)?;
                debug!(kind = %kind, seeded, "counter missing, seeded from records");
                seeded
            }
        };
        let seq = last.checked_add(1).ok_or_else(|| StoreError::AllocationConflict {
            scope: self.scope(kind),
            reason: "counter overflow".to_string(),
        })?;
        let id = format_id(self.prefix, kind, seq);

        if let Some(existing) = self.layout.find_in_bucket(&id)? {
            return Err(StoreError::AllocationConflict {
                scope: self.scope(kind),
                reason: format!(
                    "{id} already exists at {}; the counter is behind the records",
                    existing.display()
                ),
            });
        }

        layout::write_atomic(&self.layout.counter_path(kind), format!("{seq}\n").as_bytes())?;
        debug!(%id, "allocated identifier");
        Ok(Allocation { id, seq })
    }

    fn scope(&self, kind: Kind) -> String {
        format!("{}-{}", self.prefix, kind.code())
    }

    fn read_counter(&self, kind: Kind) -> Result<Option<u64>> {
        let path = self.layout.counter_path(kind);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::AllocationConflict {
                    scope: self.scope(kind),
                    reason: format!("counter {} is unreadable: {e}", path.display()),
                });
            }
        };
        text.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| StoreError::AllocationConflict {
                scope: self.scope(kind),
                reason: format!(
                    "counter {} holds '{}', expected a number",
                    path.display(),
                    text.trim()
                ),
            })
    }

    /// Highest sequence among existing records of `kind` with this prefix.
    fn highest_on_disk(&self, kind: Kind) -> Result<u64> {
        let mut highest = 0;
        for path in self.layout.record_files()? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let id = name.split_once('_').map_or(name, |(id, _)| id);
            if let Some((prefix, found_kind, seq)) = parse_id(id) {
                if prefix == self.prefix && found_kind == kind {
                    highest = highest.max(seq);
                }
            }
        }
        Ok(highest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::DEFAULT_LOCK_TIMEOUT;
    use std::collections::BTreeSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn setup() -> (tempfile::TempDir, Layout) {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path().join("products/app"));
        layout.ensure_dirs().expect("dirs");
        (dir, layout)
    }

    #[test]
    fn sequences_increase_per_kind() -> Result<()> {
        let (_dir, layout) = setup();
        let alloc = Allocator::new(&layout, "APP", DEFAULT_LOCK_TIMEOUT);

        assert_eq!(alloc.allocate(Kind::Task)?.id, "APP-TSK-0001");
        assert_eq!(alloc.allocate(Kind::Task)?.id, "APP-TSK-0002");
        assert_eq!(alloc.allocate(Kind::Bug)?.id, "APP-BUG-0001");
        let counter = fs::read_to_string(layout.counter_path(Kind::Task)).expect("counter");
        assert_eq!(counter.trim(), "2");
        Ok(())
    }

    #[test]
    fn missing_counter_is_seeded_from_records() -> Result<()> {
        let (_dir, layout) = setup();
        let existing = layout.record_path(Kind::Feature, "APP-FTR-0041", 41, "Old work");
        layout::write_atomic(&existing, b"---\n")?;
        let foreign = layout.record_path(Kind::Feature, "OLD-FTR-0090", 90, "Imported");
        layout::write_atomic(&foreign, b"---\n")?;

        let alloc = Allocator::new(&layout, "APP", DEFAULT_LOCK_TIMEOUT);
        assert_eq!(alloc.allocate(Kind::Feature)?.id, "APP-FTR-0042");
        Ok(())
    }

    #[test]
    fn corrupt_counter_is_never_reset() {
        let (_dir, layout) = setup();
        fs::write(layout.counter_path(Kind::Task), "twelve\n").expect("write");

        let alloc = Allocator::new(&layout, "APP", DEFAULT_LOCK_TIMEOUT);
        let err = alloc.allocate(Kind::Task).expect_err("corrupt counter");
        assert!(matches!(err, StoreError::AllocationConflict { .. }));
        assert!(err.to_string().contains("APP-TSK"));
        let counter = fs::read_to_string(layout.counter_path(Kind::Task)).expect("counter");
        assert_eq!(counter, "twelve\n");
    }

    #[test]
    fn counter_behind_records_is_a_conflict() -> Result<()> {
        let (_dir, layout) = setup();
        let existing = layout.record_path(Kind::Task, "APP-TSK-0005", 5, "Taken");
        layout::write_atomic(&existing, b"---\n")?;
        fs::write(layout.counter_path(Kind::Task), "4\n").expect("write");

        let alloc = Allocator::new(&layout, "APP", DEFAULT_LOCK_TIMEOUT);
        let err = alloc.allocate(Kind::Task).expect_err("duplicate id");
        assert!(matches!(err, StoreError::AllocationConflict { .. }));
        let counter = fs::read_to_string(layout.counter_path(Kind::Task)).expect("counter");
        assert_eq!(counter, "4\n");
        Ok(())
    }

    #[test]
    fn concurrent_allocations_are_unique_and_contiguous() {
        let (_dir, layout) = setup();
        let layout = Arc::new(layout);
        let workers = 8;
        let per_worker = 5;
        let barrier = Arc::new(Barrier::new(workers));

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let layout = Arc::clone(&layout);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let alloc = Allocator::new(&layout, "APP", DEFAULT_LOCK_TIMEOUT);
                    barrier.wait();
                    (0..per_worker)
                        .map(|_| alloc.allocate(Kind::Task).expect("allocate").seq)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().expect("worker"));
        }
        let unique: BTreeSet<u64> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
        let expected: BTreeSet<u64> = (1..=(workers * per_worker) as u64).collect();
        assert_eq!(unique, expected);
    }
}
