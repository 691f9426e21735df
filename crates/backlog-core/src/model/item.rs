use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

/// The five kinds of work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kind {
    Epic,
    Feature,
    UserStory,
    Task,
    Bug,
}

impl Kind {
    /// Every kind, in hierarchy order.
    pub const ALL: [Self; 5] = [
        Self::Epic,
        Self::Feature,
        Self::UserStory,
        Self::Task,
        Self::Bug,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Epic => "Epic",
            Self::Feature => "Feature",
            Self::UserStory => "UserStory",
            Self::Task => "Task",
            Self::Bug => "Bug",
        }
    }

    /// Code embedded in identifiers, e.g. `TSK` in `APP-TSK-0007`.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Epic => "EPIC",
            Self::Feature => "FTR",
            Self::UserStory => "USR",
            Self::Task => "TSK",
            Self::Bug => "BUG",
        }
    }

    /// Directory under `items/` holding records of this kind.
    #[must_use]
    pub const fn folder(self) -> &'static str {
        match self {
            Self::Epic => "epic",
            Self::Feature => "feature",
            Self::UserStory => "userstory",
            Self::Task => "task",
            Self::Bug => "bug",
        }
    }

    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a kind from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid kind '{got}': expected epic, feature, userstory, task or bug")]
pub struct ParseKindError {
    pub got: String,
}

impl FromStr for Kind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "epic" => Ok(Self::Epic),
            "feature" | "ftr" => Ok(Self::Feature),
            "userstory" | "story" | "usr" => Ok(Self::UserStory),
            "task" | "tsk" => Ok(Self::Task),
            "bug" => Ok(Self::Bug),
            _ => Err(ParseKindError { got: s.to_string() }),
        }
    }
}

/// Sections every new record starts with, in the order they are written.
pub const STANDARD_SECTIONS: [&str; 7] = [
    "Context",
    "Goal",
    "Non-Goals",
    "Approach",
    "Alternatives",
    "Acceptance Criteria",
    "Risks / Dependencies",
];

/// Heading of the append-only history block at the end of a record.
pub const WORKLOG_SECTION: &str = "Worklog";

/// One immutable line of an item's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorklogEntry {
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub message: String,
}

/// A backlog record as held in memory.
///
/// `extra` carries header keys this crate does not model so they survive
/// a read-modify-write cycle untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkItem {
    pub id: String,
    pub kind: Kind,
    pub title: String,
    pub state: String,
    pub priority: String,
    pub parent: Option<String>,
    pub area: String,
    pub iteration: Option<String>,
    pub tags: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub links: BTreeMap<String, Vec<String>>,
    pub decisions: Vec<String>,
    pub extra: BTreeMap<String, serde_yaml::Value>,
    pub sections: BTreeMap<String, String>,
    pub worklog: Vec<WorklogEntry>,
}

impl WorkItem {
    /// A fresh record with the standard empty sections and link slots.
    #[must_use]
    pub fn new(id: String, kind: Kind, title: String, state: String, now: DateTime<Utc>) -> Self {
        let links = ["relates", "blocks", "blocked_by"]
            .into_iter()
            .map(|name| (name.to_string(), Vec::new()))
            .collect();
        let sections = STANDARD_SECTIONS
            .into_iter()
            .map(|name| (name.to_string(), String::new()))
            .collect();
        Self {
            id,
            kind,
            title,
            state,
            priority: default_priority(),
            parent: None,
            area: default_area(),
            iteration: None,
            tags: Vec::new(),
            created: Some(now),
            updated: Some(now),
            owner: None,
            links,
            decisions: Vec::new(),
            extra: BTreeMap::new(),
            sections,
            worklog: Vec::new(),
        }
    }

    /// Text of a section, treating absent and whitespace-only as empty.
    #[must_use]
    pub fn section_text(&self, name: &str) -> Option<&str> {
        self.sections
            .get(name)
            .map(String::as_str)
            .filter(|text| !text.trim().is_empty())
    }

    /// Timestamp of the newest worklog entry.
    #[must_use]
    pub fn last_worklog_at(&self) -> Option<DateTime<Utc>> {
        self.worklog.last().map(|entry| entry.timestamp)
    }

    /// Sequence number parsed from the identifier's last segment.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        parse_id(&self.id).map(|(_, _, seq)| seq)
    }
}

pub(crate) fn default_priority() -> String {
    "P2".to_string()
}

pub(crate) fn default_area() -> String {
    "general".to_string()
}

/// Format an identifier: `<PREFIX>-<CODE>-<NNNN>`.
#[must_use]
pub fn format_id(prefix: &str, kind: Kind, seq: u64) -> String {
    format!("{prefix}-{}-{seq:04}", kind.code())
}

/// Split an identifier into prefix, kind and sequence number.
///
/// Returns `None` for anything that does not look like `<PREFIX>-<CODE>-<digits>`.
#[must_use]
pub fn parse_id(id: &str) -> Option<(&str, Kind, u64)> {
    let mut parts = id.rsplitn(3, '-');
    let seq = parts.next()?;
    let code = parts.next()?;
    let prefix = parts.next()?;
    if prefix.is_empty() || seq.is_empty() || !seq.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let kind = Kind::from_code(code)?;
    Some((prefix, kind, seq.parse().ok()?))
}
