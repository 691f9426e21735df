use crate::model::item::{Kind, WorkItem};
use crate::model::profile::ProcessProfile;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Flattened, queryable view of one record.
///
/// Every field comes from the record itself. `last_synced_at` is only set
/// on rows served by the derived index and records when the row was
/// written there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedIndexRow {
    pub id: String,
    pub kind: Kind,
    pub title: String,
    pub state: String,
    pub owner: Option<String>,
    pub parent: Option<String>,
    pub priority: String,
    pub area: String,
    pub iteration: Option<String>,
    pub tags: Vec<String>,
    /// Named relations with at least one target.
    pub links: BTreeMap<String, Vec<String>>,
    pub decisions: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub worklog_len: usize,
    /// Record path relative to the product root.
    pub path: String,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl DerivedIndexRow {
    #[must_use]
    pub fn from_item(item: &WorkItem, path: String) -> Self {
        Self {
            id: item.id.clone(),
            kind: item.kind,
            title: item.title.clone(),
            state: item.state.clone(),
            owner: item.owner.clone(),
            parent: item.parent.clone(),
            priority: item.priority.clone(),
            area: item.area.clone(),
            iteration: item.iteration.clone(),
            tags: item.tags.clone(),
            links: item
                .links
                .iter()
                .filter(|(_, targets)| !targets.is_empty())
                .map(|(name, targets)| (name.clone(), targets.clone()))
                .collect(),
            decisions: item.decisions.clone(),
            created: item.created,
            updated: item.updated,
            worklog_len: item.worklog.len(),
            path,
            last_synced_at: None,
        }
    }
}

/// Row selection shared by the scan and index sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    pub kind: Option<Kind>,
    pub state: Option<String>,
    pub owner: Option<String>,
    pub parent: Option<String>,
    /// Item must carry this tag.
    pub tag: Option<String>,
    /// ASCII case-insensitive substring of the title.
    pub title_contains: Option<String>,
    /// Include items in terminal states (default: false).
    pub include_terminal: bool,
    pub limit: Option<usize>,
}

impl ItemFilter {
    /// Every item, terminal ones included.
    #[must_use]
    pub fn all() -> Self {
        Self {
            include_terminal: true,
            ..Self::default()
        }
    }

    /// Whether `row` passes every condition except `limit`.
    #[must_use]
    pub fn matches(&self, row: &DerivedIndexRow, profile: &ProcessProfile) -> bool {
        if !self.include_terminal && profile.is_terminal(&row.state) {
            return false;
        }
        if self.kind.is_some_and(|kind| kind != row.kind) {
            return false;
        }
        if self.state.as_ref().is_some_and(|s| *s != row.state) {
            return false;
        }
        if self.owner.is_some() && self.owner != row.owner {
            return false;
        }
        if self.parent.is_some() && self.parent != row.parent {
            return false;
        }
        if self.tag.as_ref().is_some_and(|tag| !row.tags.contains(tag)) {
            return false;
        }
        if let Some(needle) = &self.title_contains {
            let haystack = row.title.to_ascii_lowercase();
            if !haystack.contains(&needle.to_ascii_lowercase()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, state: &str, title: &str) -> DerivedIndexRow {
        let mut item = WorkItem::new(id.into(), Kind::Task, title.into(), state.into(), Utc::now());
        item.tags = vec!["auth".into()];
        item.links.get_mut("relates").expect("slot").push("APP-TSK-0009".into());
        DerivedIndexRow::from_item(&item, format!("items/task/0000/{id}_x.md"))
    }

    #[test]
    fn from_item_keeps_only_populated_links() {
        let row = row("APP-TSK-0001", "Proposed", "Login");
        assert_eq!(row.links.len(), 1);
        assert_eq!(row.links["relates"], vec!["APP-TSK-0009".to_string()]);
        assert_eq!(row.worklog_len, 0);
        assert!(row.last_synced_at.is_none());
    }

    #[test]
    fn filter_conditions_combine() {
        let profile = ProcessProfile::azure_boards_agile();
        let open = row("APP-TSK-0001", "InProgress", "Fix Login timeout");
        let done = row("APP-TSK-0002", "Done", "Login copy");

        let default = ItemFilter::default();
        assert!(default.matches(&open, &profile));
        assert!(!default.matches(&done, &profile));
        assert!(ItemFilter::all().matches(&done, &profile));

        let by_title = ItemFilter {
            title_contains: Some("LOGIN".into()),
            tag: Some("auth".into()),
            ..ItemFilter::default()
        };
        assert!(by_title.matches(&open, &profile));

        let by_owner = ItemFilter {
            owner: Some("alice".into()),
            ..ItemFilter::all()
        };
        assert!(!by_owner.matches(&open, &profile));

        let by_kind = ItemFilter {
            kind: Some(Kind::Bug),
            ..ItemFilter::all()
        };
        assert!(!by_kind.matches(&open, &profile));
    }
}
