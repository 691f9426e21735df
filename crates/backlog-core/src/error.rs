use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    AllocationConflict,
    RecordParseError,
    ItemNotFound,
    InvalidStateTransition,
    ReadyGateViolation,
    TerminalStateViolation,
    UnknownState,
    InvalidSection,
    InvalidAgent,
    OwnershipConflict,
    StaleLockDetected,
    LockContention,
    DanglingParentReference,
    WorklogRegression,
    IndexStale,
    IndexCorrupt,
    RecordWriteFailed,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::AllocationConflict => "E1101",
            Self::RecordParseError => "E1201",
            Self::ItemNotFound => "E2001",
            Self::InvalidStateTransition => "E2002",
            Self::ReadyGateViolation => "E2003",
            Self::TerminalStateViolation => "E2004",
            Self::UnknownState => "E2005",
            Self::InvalidSection => "E2006",
            Self::InvalidAgent => "E2007",
            Self::OwnershipConflict => "E3001",
            Self::StaleLockDetected => "E3002",
            Self::LockContention => "E3003",
            Self::DanglingParentReference => "E4001",
            Self::WorklogRegression => "E4002",
            Self::IndexStale => "E6001",
            Self::IndexCorrupt => "E6002",
            Self::RecordWriteFailed => "E5001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Backlog product not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::AllocationConflict => "Identifier allocation conflict",
            Self::RecordParseError => "Malformed work-item record",
            Self::ItemNotFound => "Item not found",
            Self::InvalidStateTransition => "Invalid state transition",
            Self::ReadyGateViolation => "Ready gate violation",
            Self::TerminalStateViolation => "Item is in a terminal state",
            Self::UnknownState => "Unknown workflow state",
            Self::InvalidSection => "Invalid section content",
            Self::InvalidAgent => "Invalid agent identity",
            Self::OwnershipConflict => "Item is owned by another agent",
            Self::StaleLockDetected => "Stale ownership lock",
            Self::LockContention => "Lock contention",
            Self::DanglingParentReference => "Dangling parent reference",
            Self::WorklogRegression => "Worklog shrank or was rewritten",
            Self::IndexStale => "Derived index is stale",
            Self::IndexCorrupt => "Derived index is corrupt",
            Self::RecordWriteFailed => "Record file write failed",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `bkl init` to create the product layout."),
            Self::ConfigParseError => Some("Fix syntax in _config/config.toml and retry."),
            Self::AllocationConflict => {
                Some("Inspect _meta/counters; restore the counter file from version control.")
            }
            Self::RecordParseError => Some("Fix the record's front matter by hand and retry."),
            Self::ItemNotFound | Self::UnknownState => None,
            Self::InvalidStateTransition => {
                Some("Follow an allowed edge of the process profile, or pass --force.")
            }
            Self::ReadyGateViolation => Some("Fill the listed sections before moving the item."),
            Self::TerminalStateViolation => Some("Create a new item instead of reopening."),
            Self::InvalidSection => Some("Use `##` or deeper headings inside section text."),
            Self::InvalidAgent => Some("Agent names must be non-empty and single-line."),
            Self::OwnershipConflict => {
                Some("Retry later or coordinate with the agent holding the item.")
            }
            Self::StaleLockDetected => {
                Some("Confirm the holder is gone, then run `bkl lock break <id>`.")
            }
            Self::LockContention => Some("Retry after the other process releases its lock."),
            Self::DanglingParentReference => Some("Point `parent` at an existing item."),
            Self::WorklogRegression => {
                Some("Restore the record from version control; worklogs are append-only.")
            }
            Self::IndexStale | Self::IndexCorrupt => {
                Some("Run `bkl index rebuild` to refresh the derived index.")
            }
            Self::RecordWriteFailed => Some("Check disk space and write permissions."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Every failure the store can report.
///
/// Workflow and ownership variants are caller mistakes and are returned
/// unmodified. Parse, dangling-parent, index and worklog variants also
/// appear as warnings inside reports when the operation degrades instead
/// of failing.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("allocation conflict for {scope}: {reason}")]
    AllocationConflict { scope: String, reason: String },

    #[error("malformed record {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("{item_id}: item not found")]
    ItemNotFound { item_id: String },

    #[error("{item_id}: invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        item_id: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("{item_id}: cannot enter {state}, required sections empty: {}", missing.join(", "))]
    ReadyGateViolation {
        item_id: String,
        state: String,
        missing: Vec<String>,
    },

    #[error("{item_id}: state {state} is terminal, no further transitions allowed")]
    TerminalStateViolation { item_id: String, state: String },

    #[error("{item_id}: state '{state}' is not defined by the process profile")]
    UnknownState { item_id: String, state: String },

    #[error("{item_id}: section '{section}' rejected: {reason}")]
    InvalidSection {
        item_id: String,
        section: String,
        reason: String,
    },

    #[error("invalid agent '{agent}': {reason}")]
    InvalidAgent { agent: String, reason: String },

    #[error("{item_id}: locked by {holder}, {agent} cannot take ownership")]
    OwnershipConflict {
        item_id: String,
        holder: String,
        agent: String,
    },

    #[error("{item_id}: stale lock held by {holder}: {reason}")]
    StaleLockDetected {
        item_id: String,
        holder: String,
        reason: String,
    },

    #[error("lock timed out after {waited:?} at {}", path.display())]
    LockContention { path: PathBuf, waited: Duration },

    #[error("{item_id}: parent reference {parent_id} {reason}")]
    DanglingParentReference {
        item_id: String,
        parent_id: String,
        reason: String,
    },

    #[error("{item_id}: worklog has {found} entries, expected at least {expected}")]
    WorklogRegression {
        item_id: String,
        expected: usize,
        found: usize,
    },

    #[error("derived index is stale: {reason}")]
    IndexStale { reason: String },

    #[error("derived index is corrupt: {reason}")]
    IndexCorrupt { reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("product not initialized at {}", path.display())]
    NotInitialized { path: PathBuf },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    /// Wrap an I/O error with the path it happened at.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::AllocationConflict { .. } => ErrorCode::AllocationConflict,
            Self::ParseError { .. } => ErrorCode::RecordParseError,
            Self::ItemNotFound { .. } => ErrorCode::ItemNotFound,
            Self::InvalidTransition { .. } => ErrorCode::InvalidStateTransition,
            Self::ReadyGateViolation { .. } => ErrorCode::ReadyGateViolation,
            Self::TerminalStateViolation { .. } => ErrorCode::TerminalStateViolation,
            Self::UnknownState { .. } => ErrorCode::UnknownState,
            Self::InvalidSection { .. } => ErrorCode::InvalidSection,
            Self::InvalidAgent { .. } => ErrorCode::InvalidAgent,
            Self::OwnershipConflict { .. } => ErrorCode::OwnershipConflict,
            Self::StaleLockDetected { .. } => ErrorCode::StaleLockDetected,
            Self::LockContention { .. } => ErrorCode::LockContention,
            Self::DanglingParentReference { .. } => ErrorCode::DanglingParentReference,
            Self::WorklogRegression { .. } => ErrorCode::WorklogRegression,
            Self::IndexStale { .. } => ErrorCode::IndexStale,
            Self::IndexCorrupt { .. } => ErrorCode::IndexCorrupt,
            Self::Config(_) => ErrorCode::ConfigParseError,
            Self::NotInitialized { .. } => ErrorCode::NotInitialized,
            Self::Io { .. } => ErrorCode::RecordWriteFailed,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// True for the variants that represent a caller mistake against the
    /// workflow rules. These must not be retried automatically.
    #[must_use]
    pub const fn is_rule_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::ReadyGateViolation { .. }
                | Self::TerminalStateViolation { .. }
                | Self::OwnershipConflict { .. }
        )
    }
}

impl From<crate::lock::LockError> for StoreError {
    fn from(err: crate::lock::LockError) -> Self {
        match err {
            crate::lock::LockError::Timeout { path, waited } => {
                Self::LockContention { path, waited }
            }
            crate::lock::LockError::Io { path, source } => Self::Io { path, source },
        }
    }
}

/// Result alias used across the store.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::{ErrorCode, StoreError};
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::NotInitialized,
            ErrorCode::ConfigParseError,
            ErrorCode::AllocationConflict,
            ErrorCode::RecordParseError,
            ErrorCode::ItemNotFound,
            ErrorCode::InvalidStateTransition,
            ErrorCode::ReadyGateViolation,
            ErrorCode::TerminalStateViolation,
            ErrorCode::UnknownState,
            ErrorCode::InvalidSection,
            ErrorCode::InvalidAgent,
            ErrorCode::OwnershipConflict,
            ErrorCode::StaleLockDetected,
            ErrorCode::LockContention,
            ErrorCode::DanglingParentReference,
            ErrorCode::WorklogRegression,
            ErrorCode::IndexStale,
            ErrorCode::IndexCorrupt,
            ErrorCode::RecordWriteFailed,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::OwnershipConflict.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn messages_name_item_and_rule() {
        let err = StoreError::ReadyGateViolation {
            item_id: "APP-TSK-0001".into(),
            state: "Ready".into(),
            missing: vec!["Context".into(), "Goal".into()],
        };
        let text = err.to_string();
        assert!(text.contains("APP-TSK-0001"));
        assert!(text.contains("Ready"));
        assert!(text.contains("Context, Goal"));
        assert!(err.is_rule_violation());
        assert_eq!(err.code(), ErrorCode::ReadyGateViolation);
    }

    #[test]
    fn degradations_are_not_rule_violations() {
        let err = StoreError::IndexStale {
            reason: "fingerprint mismatch".into(),
        };
        assert!(!err.is_rule_violation());
        assert!(err.hint().is_some());
    }
}
