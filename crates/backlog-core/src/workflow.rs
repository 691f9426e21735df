//! Workflow Engine: state transitions, sections and worklog appends.
//!
//! A transition is evaluated in a fixed order, all under the item's
//! mutation lock:
//!
//! 1. ownership, when the item is or would become active
//! 2. no-op when the target equals the current state
//! 3. terminal states admit nothing
//! 4. the edge must exist in the profile
//! 5. the ready gate, for the ready state and every active state
//! 6. no backward move below the state implied by the item's children,
//!    unless forced
//!
//! Parent propagation runs after the item's own lock is released.

use crate::codec;
use crate::error::{Result, StoreError};
use crate::guard::{ItemActivity, LockStatus};
use crate::model::item::{Kind, WORKLOG_SECTION, WorkItem, WorklogEntry};
use crate::model::row::ItemFilter;
use crate::parent_sync::{self, SyncReport};
use crate::store::{Store, Written};
use crate::worklog;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Options for [`Store::transition`].
#[derive(Debug, Clone)]
pub struct TransitionOptions {
    /// Propagate the new state to the parent chain.
    pub sync_parent: bool,
    /// Allow moving back below the state implied by the item's children.
    pub force: bool,
    /// Free text appended to the worklog entry.
    pub note: Option<String>,
}

impl Default for TransitionOptions {
    fn default() -> Self {
        Self {
            sync_parent: true,
            force: false,
            note: None,
        }
    }
}

/// What a transition did.
#[derive(Debug)]
pub struct TransitionOutcome {
    pub item: WorkItem,
    pub from: String,
    /// False for the idempotent `target == current` case.
    pub changed: bool,
    /// A new ownership marker was created for the agent.
    pub lock_acquired: bool,
    /// The agent's ownership marker was removed.
    pub lock_released: bool,
    pub sync: Option<SyncReport>,
    pub warnings: Vec<StoreError>,
}

/// Ready-gate gaps of an item and, optionally, of its parent.
#[derive(Debug, Default, Serialize)]
pub struct ReadyReport {
    pub item_id: String,
    pub missing: Vec<String>,
    pub parent: Option<ParentReadiness>,
    #[serde(skip)]
    pub warnings: Vec<StoreError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentReadiness {
    pub id: String,
    pub missing: Vec<String>,
}

impl ReadyReport {
    /// True when neither the item nor its checked parent has gaps.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.missing.is_empty() && self.parent.as_ref().is_none_or(|p| p.missing.is_empty())
    }
}

fn transition_message(from: &str, target: &str, note: Option<&str>) -> String {
    let mut message = format!("State {from} -> {target}");
    if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
        message.push_str(": ");
        message.push_str(note);
    }
    message
}

fn invalid_agent(agent: &str, reason: String) -> StoreError {
    StoreError::InvalidAgent {
        agent: agent.to_string(),
        reason,
    }
}

impl Store {
    /// Move `item_id` to `target` on behalf of `agent`.
    ///
    /// Entering an active state sets `owner` only when the item has none, so
    /// it keeps naming the first agent to start work. After
    /// [`Store::break_lock`] and a takeover, the current holder is the agent
    /// [`Store::inspect_lock`] reports, not `owner`.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownState`], [`StoreError::ItemNotFound`],
    /// [`StoreError::OwnershipConflict`], [`StoreError::StaleLockDetected`],
    /// [`StoreError::TerminalStateViolation`],
    /// [`StoreError::InvalidTransition`] and
    /// [`StoreError::ReadyGateViolation`] as described in the module docs,
    /// plus lock contention and I/O errors. Nothing is written on error.
    pub fn transition(
        &self,
        item_id: &str,
        target: &str,
        agent: &str,
        options: &TransitionOptions,
    ) -> Result<TransitionOutcome> {
        codec::validate_agent(agent).map_err(|reason| invalid_agent(agent, reason))?;
        if !self.profile().has_state(target) {
            return Err(StoreError::UnknownState {
                item_id: item_id.to_string(),
                state: target.to_string(),
            });
        }
        let path = self.locate(item_id)?;

        let mutex = self.mutation_lock(item_id)?;
        let mut item = codec::read_record(&path)?;
        let from = item.state.clone();
        let profile = self.profile();
        let guard = self.guard();

        let from_active = profile.is_active(&from);
        let to_active = profile.is_active(target);
        if from_active || to_active {
            guard.check(item_id, agent, ItemActivity::of(from_active))?;
        }

        if target == from {
            debug!(item_id, state = %from, "transition is a no-op");
            return Ok(TransitionOutcome {
                item,
                from,
                changed: false,
                lock_acquired: false,
                lock_released: false,
                sync: None,
                warnings: Vec::new(),
            });
        }

        self.check_transition(&item, target, options.force)?;

        let mut lock_acquired = false;
        let mut fresh_lock = None;
        if to_active {
            let lock = guard.acquire(item_id, agent, ItemActivity::of(from_active))?;
            lock_acquired = lock.fresh;
            if lock.fresh {
                fresh_lock = Some(lock);
            }
            if item.owner.is_none() {
                item.owner = Some(agent.to_string());
            }
        }

        let message = transition_message(&from, target, options.note.as_deref());
        item.state = target.to_string();
        let written = worklog::append(&mut item, agent, &message, worklog::now())
            .and_then(|_| worklog::persist(&path, &item));
        if let Err(e) = written {
            if let Some(lock) = &fresh_lock {
                if let Err(release_err) = guard.release(lock) {
                    warn!(item_id, error = %release_err, "could not roll back ownership marker");
                }
            }
            return Err(e);
        }

        let mut warnings = Vec::new();
        let lock_released =
            from_active && !to_active && self.release_on_leave(item_id, agent, &mut warnings);
        warnings.extend(self.sync_index(&item, &path));
        drop(mutex);

        info!(item_id, from = %from, to = target, agent, "item transitioned");

        let sync = if options.sync_parent && item.parent.is_some() {
            Some(self.propagate(item_id, agent))
        } else {
            None
        };

        Ok(TransitionOutcome {
            item,
            from,
            changed: true,
            lock_acquired,
            lock_released,
            sync,
            warnings,
        })
    }

    /// Drop the agent's marker after leaving the active states. Returns
    /// whether a marker was removed; failures become warnings since the
    /// transition is already on disk.
    fn release_on_leave(
        &self,
        item_id: &str,
        agent: &str,
        warnings: &mut Vec<StoreError>,
    ) -> bool {
        let guard = self.guard();
        match guard.inspect(item_id) {
            Ok(Some(LockStatus::Held(info))) if info.agent == agent => {
                match guard.release_for(item_id, agent) {
                    Ok(()) => true,
                    Err(e) => {
                        warnings.push(e);
                        false
                    }
                }
            }
            Ok(_) => false,
            Err(e) => {
                warnings.push(e);
                false
            }
        }
    }

    /// Terminal, edge, gate and child checks for a non-trivial transition.
    fn check_transition(&self, item: &WorkItem, target: &str, force: bool) -> Result<()> {
        let profile = self.profile();
        let from = item.state.as_str();
        if profile.is_terminal(from) {
            return Err(StoreError::TerminalStateViolation {
                item_id: item.id.clone(),
                state: from.to_string(),
            });
        }
        if !profile.allows(from, target) {
            let allowed: Vec<&str> = profile.next_states(from).collect();
            return Err(StoreError::InvalidTransition {
                item_id: item.id.clone(),
                from: from.to_string(),
                to: target.to_string(),
                reason: format!(
                    "not an edge of profile {} (allowed: {})",
                    profile.name,
                    if allowed.is_empty() {
                        "none".to_string()
                    } else {
                        allowed.join(", ")
                    }
                ),
            });
        }
        if profile.gates(target) {
            let missing = profile.missing_sections(item);
            if !missing.is_empty() {
                return Err(StoreError::ReadyGateViolation {
                    item_id: item.id.clone(),
                    state: target.to_string(),
                    missing,
                });
            }
        }
        if force {
            return Ok(());
        }
        let Some(target_rank) = profile.rank(target) else {
            return Ok(());
        };
        // Forward moves pass; backward moves and moves out of an unranked
        // state answer to the children.
        if profile.rank(from).is_some_and(|from_rank| target_rank > from_rank) {
            return Ok(());
        }
        let filter = ItemFilter {
            parent: Some(item.id.clone()),
            ..ItemFilter::all()
        };
        let children = self.query().list_without_refresh(&filter)?.rows;
        let implied =
            parent_sync::implied_state(profile, children.iter().map(|c| c.state.as_str()));
        if let Some(implied) = implied {
            if profile.rank(implied).is_some_and(|rank| rank > target_rank) {
                return Err(StoreError::InvalidTransition {
                    item_id: item.id.clone(),
                    from: from.to_string(),
                    to: target.to_string(),
                    reason: format!("children imply at least {implied}; pass force to override"),
                });
            }
        }
        Ok(())
    }

    /// Append a free-text entry to an item's worklog.
    ///
    /// Permitted in every state, terminal ones included. Index update
    /// failures are returned as warnings.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidAgent`], [`StoreError::ItemNotFound`], an
    /// empty message as [`StoreError::InvalidSection`],
    /// [`StoreError::ParseError`] for a record that no longer decodes, lock
    /// contention and I/O errors.
    pub fn append_worklog(
        &self,
        item_id: &str,
        agent: &str,
        message: &str,
    ) -> Result<Written<WorklogEntry>> {
        codec::validate_agent(agent).map_err(|reason| invalid_agent(agent, reason))?;
        let message = message.trim();
        if message.is_empty() {
            return Err(StoreError::InvalidSection {
                item_id: item_id.to_string(),
                section: WORKLOG_SECTION.to_string(),
                reason: "message is empty".to_string(),
            });
        }
        let path = self.locate(item_id)?;

        let _mutex = self.mutation_lock(item_id)?;
        let mut item = codec::read_record(&path)?;
        let entry = worklog::append(&mut item, agent, message, worklog::now())?;
        worklog::persist(&path, &item)?;
        let warnings = self.sync_index(&item, &path);

        debug!(item_id, agent, "worklog entry appended");
        Ok(Written::new(entry, warnings))
    }

    /// Replace the text of one section. Index update failures are returned
    /// as warnings.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidSection`] for the worklog, a malformed name or
    /// a body with level-1 headings; [`StoreError::TerminalStateViolation`]
    /// on terminal items; [`StoreError::OwnershipConflict`] while another
    /// agent owns the active item.
    pub fn set_section(
        &self,
        item_id: &str,
        name: &str,
        text: &str,
        agent: &str,
    ) -> Result<Written<WorkItem>> {
        codec::validate_agent(agent).map_err(|reason| invalid_agent(agent, reason))?;
        let name = name.trim();
        let rejected = |reason: String| StoreError::InvalidSection {
            item_id: item_id.to_string(),
            section: name.to_string(),
            reason,
        };
        if name.is_empty() || name.contains(['\n', '\r']) || name.starts_with('#') {
            return Err(rejected("section names are a single line of plain text".to_string()));
        }
        if name.eq_ignore_ascii_case(WORKLOG_SECTION) {
            return Err(rejected("the worklog is append-only; use append_worklog".to_string()));
        }
        codec::validate_section_body(text).map_err(rejected)?;
        let path = self.locate(item_id)?;

        let _mutex = self.mutation_lock(item_id)?;
        let mut item = codec::read_record(&path)?;
        if self.profile().is_terminal(&item.state) {
            return Err(StoreError::TerminalStateViolation {
                item_id: item.id,
                state: item.state,
            });
        }
        if self.profile().is_active(&item.state) {
            self.guard().check(item_id, agent, ItemActivity::Active)?;
        }

        item.sections.insert(name.to_string(), codec::normalize_body(text));
        worklog::append(
            &mut item,
            agent,
            &format!("Updated section '{name}'"),
            worklog::now(),
        )?;
        worklog::persist(&path, &item)?;
        let warnings = self.sync_index(&item, &path);

        debug!(item_id, section = name, agent, "section updated");
        Ok(Written::new(item, warnings))
    }

    /// Ready-gate gaps of `item_id` and, with `check_parent`, of its parent.
    ///
    /// Epic and Feature parents are containers and are never checked.
    ///
    /// # Errors
    ///
    /// [`StoreError::ItemNotFound`] and [`StoreError::ParseError`] for the
    /// item itself; problems with the parent become warnings.
    pub fn check_ready(&self, item_id: &str, check_parent: bool) -> Result<ReadyReport> {
        let item = self.get(item_id)?;
        let mut report = ReadyReport {
            item_id: item.id.clone(),
            missing: self.profile().missing_sections(&item),
            ..ReadyReport::default()
        };
        if !check_parent {
            return Ok(report);
        }
        let Some(parent_id) = item.parent.as_deref() else {
            return Ok(report);
        };
        match self.get(parent_id) {
            Ok(parent) if matches!(parent.kind, Kind::Epic | Kind::Feature) => {}
            Ok(parent) => {
                report.parent = Some(ParentReadiness {
                    missing: self.profile().missing_sections(&parent),
                    id: parent.id,
                });
            }
            Err(StoreError::ItemNotFound { .. }) => {
                report.warnings.push(StoreError::DanglingParentReference {
                    item_id: item.id.clone(),
                    parent_id: parent_id.to_string(),
                    reason: "does not exist".to_string(),
                });
            }
            Err(e) => report.warnings.push(e),
        }
        Ok(report)
    }
}
