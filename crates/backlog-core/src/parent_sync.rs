//! Parent-Sync Propagator.
//!
//! After a child changes state, each ancestor is pulled forward to the
//! state its direct children imply:
//!
//! - children in terminal states that are not completed (Dropped) are ignored
//! - every remaining child completed implies `children_completed`
//! - any remaining child started (at or past the first active state,
//!   unranked like Blocked, or completed) implies `children_started`
//!
//! Parents only ever move forward along profile edges, one hop at a time,
//! and each hop honours the ready gate. A parent that is active, or a hop
//! into an active state, also needs the Conflict Guard to let the syncing
//! agent through, so another agent's item is never moved under them.
//! Terminal and unranked parents are left alone. Propagation never fails the triggering operation: dangling
//! references, cycles and blocked hops come back as warnings.

use crate::codec;
use crate::error::StoreError;
use crate::guard::ItemActivity;
use crate::model::profile::ProcessProfile;
use crate::model::row::ItemFilter;
use crate::store::Store;
use crate::worklog;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// One state change applied to an ancestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncMove {
    pub item_id: String,
    pub from: String,
    pub to: String,
}

/// Result of one propagation walk.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub moves: Vec<SyncMove>,
    pub warnings: Vec<StoreError>,
}

/// State implied for a parent by its children's states, if any.
#[must_use]
pub fn implied_state<'p, 'c>(
    profile: &'p ProcessProfile,
    child_states: impl IntoIterator<Item = &'c str>,
) -> Option<&'p str> {
    let counted: Vec<&str> = child_states
        .into_iter()
        .filter(|state| !(profile.is_terminal(state) && !profile.is_completed(state)))
        .collect();
    if counted.is_empty() {
        return None;
    }
    if counted.iter().all(|state| profile.is_completed(state)) {
        return Some(&profile.parent_sync.children_completed);
    }
    let first_active = profile.first_active_rank();
    let started = counted.iter().any(|state| {
        if profile.is_completed(state) {
            return true;
        }
        match profile.rank(state) {
            Some(rank) => first_active.is_some_and(|first| rank >= first),
            None => !profile.is_terminal(state),
        }
    });
    started.then_some(profile.parent_sync.children_started.as_str())
}

/// Lookup table entry: current state and parent of one item.
#[derive(Debug, Clone)]
struct Node {
    state: String,
    parent: Option<String>,
}

impl Store {
    /// Walk the ancestors of `child_id`, moving each forward to the state
    /// its children imply. Entries are written to the worklogs under
    /// `agent`, the agent whose change triggered the walk.
    #[must_use]
    pub fn propagate(&self, child_id: &str, agent: &str) -> SyncReport {
        let mut report = SyncReport::default();
        let rows = match self.query().list_without_refresh(&ItemFilter::all()) {
            Ok(outcome) => outcome.rows,
            Err(e) => {
                warn!(item_id = child_id, error = %e, "parent sync could not list items");
                report.warnings.push(e);
                return report;
            }
        };

        let mut table: HashMap<String, Node> = HashMap::with_capacity(rows.len());
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            if let Some(parent) = &row.parent {
                children.entry(parent.clone()).or_default().push(row.id.clone());
            }
            table.insert(
                row.id,
                Node {
                    state: row.state,
                    parent: row.parent,
                },
            );
        }

        let mut visited: HashSet<String> = HashSet::from([child_id.to_string()]);
        let mut current = child_id.to_string();
        loop {
            let Some(parent_id) = table.get(&current).and_then(|node| node.parent.clone()) else {
                break;
            };
            if !visited.insert(parent_id.clone()) {
                warn!(item_id = %current, parent_id = %parent_id, "parent chain forms a cycle");
                report.warnings.push(StoreError::DanglingParentReference {
                    item_id: current,
                    parent_id,
                    reason: "forms a cycle".to_string(),
                });
                break;
            }
            if !table.contains_key(&parent_id) {
                warn!(item_id = %current, parent_id = %parent_id, "parent does not exist");
                report.warnings.push(StoreError::DanglingParentReference {
                    item_id: current,
                    parent_id,
                    reason: "does not exist".to_string(),
                });
                break;
            }

            let states: Vec<&str> = children
                .get(&parent_id)
                .into_iter()
                .flatten()
                .filter_map(|id| table.get(id).map(|node| node.state.as_str()))
                .collect();
            if let Some(implied) = implied_state(self.profile(), states) {
                let implied = implied.to_string();
                let moved =
                    self.advance_parent(&parent_id, &implied, child_id, agent, &mut report);
                if let (Some(state), Some(node)) = (moved, table.get_mut(&parent_id)) {
                    node.state = state;
                }
            }
            current = parent_id;
        }
        report
    }

    /// Move `parent_id` towards `implied`. Returns the new state if it moved.
    fn advance_parent(
        &self,
        parent_id: &str,
        implied: &str,
        child_id: &str,
        agent: &str,
        report: &mut SyncReport,
    ) -> Option<String> {
        let profile = self.profile();
        let target_rank = profile.rank(implied)?;

        let _mutex = match self.mutation_lock(parent_id) {
            Ok(lock) => lock,
            Err(e) => {
                report.warnings.push(e);
                return None;
            }
        };
        let loaded = self
            .locate(parent_id)
            .and_then(|path| codec::read_record(&path).map(|item| (path, item)));
        let (path, mut parent) = match loaded {
            Ok(found) => found,
            Err(e) => {
                warn!(parent_id, error = %e, "parent sync could not read parent");
                report.warnings.push(e);
                return None;
            }
        };
        if profile.is_terminal(&parent.state) {
            return None;
        }
        let mut rank = profile.rank(&parent.state)?;
        if rank >= target_rank {
            return None;
        }

        let first_move = report.moves.len();
        while rank < target_rank {
            let next = profile
                .next_states(&parent.state)
                .filter_map(|state| profile.rank(state).map(|r| (r, state)))
                .filter(|(r, _)| *r > rank && *r <= target_rank)
                .max_by_key(|(r, _)| *r);
            let Some((next_rank, next)) = next else {
                debug!(parent_id, state = %parent.state, "no forward edge towards implied state");
                break;
            };
            if profile.gates(next) {
                let missing = profile.missing_sections(&parent);
                if !missing.is_empty() {
                    warn!(parent_id, state = next, "parent sync stopped at the ready gate");
                    report.warnings.push(StoreError::ReadyGateViolation {
                        item_id: parent_id.to_string(),
                        state: next.to_string(),
                        missing,
                    });
                    break;
                }
            }
            let parent_active = profile.is_active(&parent.state);
            let owned = if parent_active || profile.is_active(next) {
                self.guard()
                    .check(parent_id, agent, ItemActivity::of(parent_active))
            } else {
                Ok(())
            };
            if let Err(e) = owned {
                warn!(parent_id, state = next, error = %e, "parent sync stopped by ownership");
                report.warnings.push(e);
                break;
            }
            let from = std::mem::replace(&mut parent.state, next.to_string());
            let message = format!("State {from} -> {next} (parent sync from {child_id})");
            if let Err(e) = worklog::append(&mut parent, agent, &message, worklog::now()) {
                report.warnings.push(e);
                parent.state = from;
                break;
            }
            report.moves.push(SyncMove {
                item_id: parent_id.to_string(),
                from,
                to: next.to_string(),
            });
            rank = next_rank;
        }

        if report.moves.len() == first_move {
            return None;
        }
        if let Err(e) = worklog::persist(&path, &parent) {
            warn!(parent_id, error = %e, "parent sync could not write parent");
            report.moves.truncate(first_move);
            report.warnings.push(e);
            return None;
        }
        report.warnings.extend(self.sync_index(&parent, &path));
        info!(parent_id, state = %parent.state, child_id, "parent synced");
        Some(parent.state)
    }
}
