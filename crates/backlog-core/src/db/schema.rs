//! Derived index schema.
//!
//! - `items` holds the scalar fields of each record
//! - `item_tags`, `item_links` and `item_decisions` hold the list fields,
//!   with a `position` column so record order survives
//! - `record_files` holds the stat marker (`len`, `mtime_ns`) of every record
//!   file seen by the last sync, including files that failed to decode
//! - `index_meta` holds the schema version and the freshness fingerprint

/// Migration v1: core tables plus index metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS items (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    state TEXT NOT NULL,
    owner TEXT,
    parent TEXT,
    priority TEXT NOT NULL,
    area TEXT NOT NULL,
    iteration TEXT,
    created TEXT,
    updated TEXT,
    worklog_len INTEGER NOT NULL CHECK (worklog_len >= 0),
    path TEXT NOT NULL,
    last_synced_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS item_tags (
    item_id TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (item_id, position)
);

CREATE TABLE IF NOT EXISTS item_links (
    item_id TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    relation TEXT NOT NULL,
    position INTEGER NOT NULL,
    target TEXT NOT NULL,
    PRIMARY KEY (item_id, relation, position)
);

CREATE TABLE IF NOT EXISTS item_decisions (
    item_id TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    decision TEXT NOT NULL,
    PRIMARY KEY (item_id, position)
);

CREATE TABLE IF NOT EXISTS record_files (
    path TEXT PRIMARY KEY,
    len INTEGER NOT NULL,
    mtime_ns INTEGER NOT NULL,
    item_id TEXT,
    error TEXT
);

CREATE TABLE IF NOT EXISTS index_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    fingerprint TEXT,
    last_rebuild_at TEXT
);

INSERT OR IGNORE INTO index_meta (id, schema_version, fingerprint, last_rebuild_at)
VALUES (1, 1, NULL, NULL);
";

/// Migration v2: read-path indexes for the list filters.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_items_state ON items(state);
CREATE INDEX IF NOT EXISTS idx_items_kind_state ON items(kind, state);
CREATE INDEX IF NOT EXISTS idx_items_parent ON items(parent);
CREATE INDEX IF NOT EXISTS idx_items_owner ON items(owner);
CREATE INDEX IF NOT EXISTS idx_item_tags_tag ON item_tags(tag, item_id);
CREATE INDEX IF NOT EXISTS idx_record_files_item ON record_files(item_id);
";

/// Indexes created by [`MIGRATION_V2_SQL`].
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_items_state",
    "idx_items_kind_state",
    "idx_items_parent",
    "idx_items_owner",
    "idx_item_tags_tag",
    "idx_record_files_item",
];
