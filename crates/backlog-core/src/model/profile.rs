//! Process profiles: the pluggable workflow definition.
//!
//! A profile names the states, the allowed edges between them, which
//! states are terminal or require ownership, the ready gate per kind, and
//! the states parent items are pulled towards by their children. The
//! store is polymorphic over any profile that passes [`ProcessProfile::validate`].

use crate::error::{Result, StoreError};
use crate::model::item::{Kind, WorkItem};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Name of the profile used when the config does not choose one.
pub const DEFAULT_PROFILE: &str = "azure-boards-agile";

/// States implied for a parent by the aggregate state of its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentSyncRules {
    /// Implied once any child has started work.
    pub children_started: String,
    /// Implied once every counted child is completed.
    pub children_completed: String,
}

/// On-disk (TOML) shape of a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileFile {
    pub name: String,
    pub states: Vec<String>,
    pub default_state: String,
    pub terminal_states: Vec<String>,
    pub ready_state: String,
    pub active_states: Vec<String>,
    pub progression: Vec<String>,
    pub completed_states: Vec<String>,
    #[serde(default)]
    pub transitions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub required_sections_for_ready: BTreeMap<String, Vec<String>>,
    pub parent_sync: ParentSyncRules,
}

/// A validated workflow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessProfile {
    pub name: String,
    pub states: BTreeSet<String>,
    pub default_state: String,
    pub terminal_states: BTreeSet<String>,
    pub ready_state: String,
    pub active_states: BTreeSet<String>,
    pub progression: Vec<String>,
    pub completed_states: BTreeSet<String>,
    pub transitions: BTreeMap<String, BTreeSet<String>>,
    pub required_sections_for_ready: BTreeMap<Kind, Vec<String>>,
    pub parent_sync: ParentSyncRules,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| (*s).to_string()).collect()
}

impl ProcessProfile {
    /// Look up a profile shipped with the crate.
    #[must_use]
    pub fn builtin(name: &str) -> Option<Self> {
        let name = name.strip_prefix("builtin/").unwrap_or(name);
        match name {
            DEFAULT_PROFILE => Some(Self::azure_boards_agile()),
            _ => None,
        }
    }

    /// Proposed → Ready → InProgress → Review → Done, with Blocked and Dropped.
    #[must_use]
    pub fn azure_boards_agile() -> Self {
        let edges: [(&str, &[&str]); 6] = [
            ("Proposed", &["Planned", "Ready", "Dropped"]),
            ("Planned", &["Proposed", "Ready", "Dropped"]),
            ("Ready", &["Planned", "InProgress", "Blocked", "Dropped"]),
            (
                "InProgress",
                &["Ready", "Review", "Done", "Blocked", "Dropped"],
            ),
            ("Review", &["InProgress", "Done", "Blocked", "Dropped"]),
            ("Blocked", &["Ready", "InProgress", "Dropped"]),
        ];
        let gate = strings(&["Context", "Goal", "Acceptance Criteria"]);
        let file = ProfileFile {
            name: DEFAULT_PROFILE.to_string(),
            states: strings(&[
                "Proposed",
                "Planned",
                "Ready",
                "InProgress",
                "Review",
                "Blocked",
                "Done",
                "Dropped",
            ]),
            default_state: "Proposed".into(),
            terminal_states: strings(&["Done", "Dropped"]),
            ready_state: "Ready".into(),
            active_states: strings(&["InProgress", "Review"]),
            progression: strings(&["Proposed", "Planned", "Ready", "InProgress", "Review", "Done"]),
            completed_states: strings(&["Done"]),
            transitions: edges
                .into_iter()
                .map(|(from, to)| (from.to_string(), strings(to)))
                .collect(),
            required_sections_for_ready: [Kind::UserStory, Kind::Task, Kind::Bug]
                .into_iter()
                .map(|kind| (kind.as_str().to_string(), gate.clone()))
                .collect(),
            parent_sync: ParentSyncRules {
                children_started: "InProgress".into(),
                children_completed: "Review".into(),
            },
        };
        Self::from_parts(file)
    }

    /// Parse and validate a profile from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] on syntax errors or inconsistent definitions.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ProfileFile = toml::from_str(text)
            .map_err(|e| StoreError::Config(format!("process profile: {e}")))?;
        Self::from_file(file)
    }

    /// Read and validate a profile file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or
    /// [`StoreError::Config`] if it is invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Validate a deserialized profile.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] naming the first inconsistency found.
    pub fn from_file(file: ProfileFile) -> Result<Self> {
        let mut gates = BTreeMap::new();
        for (kind, sections) in &file.required_sections_for_ready {
            let kind: Kind = kind
                .parse()
                .map_err(|e| StoreError::Config(format!("required_sections_for_ready: {e}")))?;
            gates.insert(kind, sections.clone());
        }
        let profile = Self::from_parts_with_gates(file, gates);
        profile.validate()?;
        Ok(profile)
    }

    fn from_parts(file: ProfileFile) -> Self {
        let gates = file
            .required_sections_for_ready
            .iter()
            .filter_map(|(kind, sections)| Some((kind.parse().ok()?, sections.clone())))
            .collect();
        Self::from_parts_with_gates(file, gates)
    }

    fn from_parts_with_gates(file: ProfileFile, gates: BTreeMap<Kind, Vec<String>>) -> Self {
        Self {
            name: file.name,
            states: file.states.into_iter().collect(),
            default_state: file.default_state,
            terminal_states: file.terminal_states.into_iter().collect(),
            ready_state: file.ready_state,
            active_states: file.active_states.into_iter().collect(),
            progression: file.progression,
            completed_states: file.completed_states.into_iter().collect(),
            transitions: file
                .transitions
                .into_iter()
                .map(|(from, to)| (from, to.into_iter().collect()))
                .collect(),
            required_sections_for_ready: gates,
            parent_sync: file.parent_sync,
        }
    }

    /// Check that every referenced state exists and terminal states are closed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] naming the first inconsistency found.
    pub fn validate(&self) -> Result<()> {
        let unknown = |what: &str, state: &str| {
            StoreError::Config(format!(
                "profile {}: {what} references unknown state '{state}'",
                self.name
            ))
        };
        if self.states.is_empty() {
            return Err(StoreError::Config(format!("profile {}: no states", self.name)));
        }
        for (what, state) in [
            ("default_state", &self.default_state),
            ("ready_state", &self.ready_state),
            ("parent_sync.children_started", &self.parent_sync.children_started),
            ("parent_sync.children_completed", &self.parent_sync.children_completed),
        ] {
            if !self.states.contains(state) {
                return Err(unknown(what, state));
            }
        }
        for (what, set) in [
            ("terminal_states", &self.terminal_states),
            ("active_states", &self.active_states),
            ("completed_states", &self.completed_states),
        ] {
            if let Some(state) = set.iter().find(|s| !self.states.contains(*s)) {
                return Err(unknown(what, state));
            }
        }
        if let Some(state) = self.progression.iter().find(|s| !self.states.contains(*s)) {
            return Err(unknown("progression", state));
        }
        for (from, targets) in &self.transitions {
            if !self.states.contains(from) {
                return Err(unknown("transitions", from));
            }
            if let Some(to) = targets.iter().find(|s| !self.states.contains(*s)) {
                return Err(unknown("transitions", to));
            }
            if self.terminal_states.contains(from) && !targets.is_empty() {
                return Err(StoreError::Config(format!(
                    "profile {}: terminal state '{from}' has outgoing transitions",
                    self.name
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn has_state(&self, state: &str) -> bool {
        self.states.contains(state)
    }

    #[must_use]
    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal_states.contains(state)
    }

    #[must_use]
    pub fn is_active(&self, state: &str) -> bool {
        self.active_states.contains(state)
    }

    #[must_use]
    pub fn is_completed(&self, state: &str) -> bool {
        self.completed_states.contains(state)
    }

    /// Whether `from -> to` is an edge of the profile.
    #[must_use]
    pub fn allows(&self, from: &str, to: &str) -> bool {
        self.transitions
            .get(from)
            .is_some_and(|targets| targets.contains(to))
    }

    /// States reachable in one step from `from`.
    pub fn next_states<'a>(&'a self, from: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        self.transitions
            .get(from)
            .into_iter()
            .flat_map(|targets| targets.iter().map(String::as_str))
    }

    /// Position of `state` along the forward progression, if it has one.
    #[must_use]
    pub fn rank(&self, state: &str) -> Option<usize> {
        self.progression.iter().position(|s| s == state)
    }

    /// Lowest progression rank among the active states.
    #[must_use]
    pub fn first_active_rank(&self) -> Option<usize> {
        self.active_states.iter().filter_map(|s| self.rank(s)).min()
    }

    /// Sections the ready gate requires for `kind`.
    #[must_use]
    pub fn required_sections(&self, kind: Kind) -> &[String] {
        self.required_sections_for_ready
            .get(&kind)
            .map_or(&[], Vec::as_slice)
    }

    /// Required sections of `item` that are still empty, in profile order.
    #[must_use]
    pub fn missing_sections(&self, item: &WorkItem) -> Vec<String> {
        self.required_sections(item.kind)
            .iter()
            .filter(|name| item.section_text(name).is_none())
            .cloned()
            .collect()
    }

    /// Whether entering `state` is subject to the ready gate.
    #[must_use]
    pub fn gates(&self, state: &str) -> bool {
        state == self.ready_state || self.is_active(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn builtin_profile_is_valid() {
        let profile = ProcessProfile::builtin("builtin/azure-boards-agile").expect("builtin");
        profile.validate().expect("valid");
        assert_eq!(profile.default_state, "Proposed");
        assert!(profile.is_terminal("Done"));
        assert!(profile.is_active("InProgress"));
        assert!(profile.allows("Ready", "InProgress"));
        assert!(!profile.allows("Proposed", "Done"));
        assert_eq!(profile.next_states("Done").count(), 0);
        assert!(profile.rank("Review") > profile.rank("InProgress"));
        assert_eq!(profile.rank("Blocked"), None);
        assert_eq!(profile.first_active_rank(), profile.rank("InProgress"));
    }

    #[test]
    fn ready_gate_depends_on_kind() {
        let profile = ProcessProfile::azure_boards_agile();
        let mut task = WorkItem::new(
            "APP-TSK-0001".into(),
            Kind::Task,
            "t".into(),
            "Proposed".into(),
            Utc::now(),
        );
        assert_eq!(
            profile.missing_sections(&task),
            vec!["Context", "Goal", "Acceptance Criteria"]
        );
        task.sections.insert("Goal".into(), "ship it".into());
        assert_eq!(profile.missing_sections(&task), vec!["Context", "Acceptance Criteria"]);

        let feature = WorkItem::new(
            "APP-FTR-0001".into(),
            Kind::Feature,
            "f".into(),
            "Proposed".into(),
            Utc::now(),
        );
        assert!(profile.missing_sections(&feature).is_empty());
    }

    #[test]
    fn custom_profile_round_trips_through_toml() {
        let text = r#"
name = "kanban"
states = ["Todo", "Doing", "Done"]
default_state = "Todo"
terminal_states = ["Done"]
ready_state = "Todo"
active_states = ["Doing"]
progression = ["Todo", "Doing", "Done"]
completed_states = ["Done"]

[transitions]
Todo = ["Doing"]
Doing = ["Todo", "Done"]

[required_sections_for_ready]
task = ["Goal"]

[parent_sync]
children_started = "Doing"
children_completed = "Done"
"#;
        let profile = ProcessProfile::from_toml_str(text).expect("parse");
        assert_eq!(profile.name, "kanban");
        assert_eq!(profile.required_sections(Kind::Task), ["Goal".to_string()]);
        assert!(profile.required_sections(Kind::Bug).is_empty());
        assert!(profile.allows("Doing", "Done"));
    }

    #[test]
    fn profile_with_unknown_state_is_rejected() {
        let text = r#"
name = "broken"
states = ["Todo", "Done"]
default_state = "Todo"
terminal_states = ["Done"]
ready_state = "Todo"
active_states = ["Doing"]
progression = ["Todo", "Done"]
completed_states = ["Done"]

[parent_sync]
children_started = "Todo"
children_completed = "Done"
"#;
        let err = ProcessProfile::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("Doing"), "{err}");
    }

    #[test]
    fn terminal_state_with_edges_is_rejected() {
        let text = r#"
name = "reopen"
states = ["Todo", "Done"]
default_state = "Todo"
terminal_states = ["Done"]
ready_state = "Todo"
active_states = []
progression = ["Todo", "Done"]
completed_states = ["Done"]

[transitions]
Todo = ["Done"]
Done = ["Todo"]

[parent_sync]
children_started = "Todo"
children_completed = "Done"
"#;
        let err = ProcessProfile::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("terminal"), "{err}");
    }
}
