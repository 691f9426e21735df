//! Derived index behaviour seen through `Store`.

use backlog_core::codec;
use backlog_core::facade::{IndexSource, ScanSource};
use backlog_core::{
    CreateOptions, DerivedIndexRow, InitOptions, ItemFilter, Kind, RecordSource, SourceKind, Store,
    StoreError, TransitionOptions,
};
use std::fs;
use std::path::Path;

fn indexed_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let options = InitOptions {
        index: true,
        ..InitOptions::default()
    };
    let store = Store::init(dir.path(), "app", &options).expect("init");
    store.rebuild_index().expect("initial rebuild");
    (dir, store)
}

fn strip_sync(mut rows: Vec<DerivedIndexRow>) -> Vec<DerivedIndexRow> {
    for row in &mut rows {
        row.last_synced_at = None;
    }
    rows
}

fn populate(store: &Store) {
    let feature = store
        .create(Kind::Feature, "Reporting", "alice", CreateOptions::default())
        .expect("feature")
        .value;
    for (n, title) in ["Export CSV", "Export PDF", "Schedule reports"].iter().enumerate() {
        let task = store
            .create(
                Kind::Task,
                title,
                "alice",
                CreateOptions {
                    parent: Some(feature.id.clone()),
                    tags: vec!["reports".into(), format!("batch-{}", n % 2)],
                    ..CreateOptions::default()
                },
            )
            .expect("task")
            .value;
        for section in ["Context", "Goal", "Acceptance Criteria"] {
            store
                .set_section(&task.id, section, "filled in", "alice")
                .expect("section");
        }
        if n > 0 {
            store
                .transition(&task.id, "Ready", "alice", &TransitionOptions::default())
                .expect("ready");
        }
        if n > 1 {
            store
                .transition(&task.id, "InProgress", "bob", &TransitionOptions::default())
                .expect("start");
        }
    }
    store
        .create(Kind::Bug, "Totals are off by one", "carol", CreateOptions::default())
        .expect("bug");
}

fn filters() -> Vec<ItemFilter> {
    vec![
        ItemFilter::default(),
        ItemFilter::all(),
        ItemFilter {
            kind: Some(Kind::Task),
            ..ItemFilter::default()
        },
        ItemFilter {
            state: Some("InProgress".into()),
            ..ItemFilter::default()
        },
        ItemFilter {
            owner: Some("bob".into()),
            ..ItemFilter::default()
        },
        ItemFilter {
            parent: Some("A-FTR-0001".into()),
            ..ItemFilter::default()
        },
        ItemFilter {
            tag: Some("batch-1".into()),
            ..ItemFilter::default()
        },
        ItemFilter {
            title_contains: Some("EXPORT".into()),
            limit: Some(1),
            ..ItemFilter::default()
        },
    ]
}

fn assert_index_matches_scan(store: &Store) {
    let scan = ScanSource::new(store.layout(), store.profile());
    for filter in filters() {
        let indexed = store.list(&filter).expect("indexed list");
        assert_eq!(indexed.source, SourceKind::Index, "filter {filter:?}");
        assert!(indexed.warnings.is_empty(), "{:?}", indexed.warnings);
        let scanned = scan.list(&filter).expect("scan list");
        assert_eq!(strip_sync(indexed.rows), scanned.rows, "filter {filter:?}");
    }
}

#[test]
fn incremental_updates_keep_index_equal_to_scan() {
    let (_dir, store) = indexed_store();
    populate(&store);
    assert_index_matches_scan(&store);

    store
        .append_worklog("A-TSK-0003", "bob", "halfway there")
        .expect("append");
    store
        .transition("A-TSK-0003", "Review", "bob", &TransitionOptions::default())
        .expect("review");
    assert_index_matches_scan(&store);

    let feature = store
        .list(&ItemFilter {
            kind: Some(Kind::Feature),
            ..ItemFilter::default()
        })
        .expect("feature")
        .rows;
    assert_eq!(feature.len(), 1);
    assert_eq!(feature[0].state, "InProgress");
}

#[test]
fn rebuild_from_records_matches_incremental_index() {
    let (_dir, store) = indexed_store();
    populate(&store);
    let before = strip_sync(store.list(&ItemFilter::all()).expect("list").rows);

    let report = store.rebuild_index().expect("rebuild");
    assert_eq!(report.item_count, 5);
    assert_eq!(report.skipped, 0);

    let after = store.list(&ItemFilter::all()).expect("list");
    assert_eq!(after.source, SourceKind::Index);
    assert_eq!(strip_sync(after.rows), before);
}

#[test]
fn hand_edit_makes_index_stale_until_rebuilt() {
    let (_dir, store) = indexed_store();
    populate(&store);

    let path = store.locate("A-BUG-0001").expect("bug");
    let text = fs::read_to_string(&path).expect("read");
    fs::write(&path, text.replace("Totals are off by one", "Totals are wrong")).expect("edit");

    let outcome = store.list(&ItemFilter::default()).expect("list");
    assert_eq!(outcome.source, SourceKind::Scan);
    assert!(matches!(outcome.warnings[0], StoreError::IndexStale { .. }));
    assert!(outcome.rows.iter().any(|row| row.title == "Totals are wrong"));

    store.rebuild_index().expect("rebuild");
    assert_index_matches_scan(&store);
}

#[test]
fn deleted_index_falls_back_to_scan() {
    let (_dir, store) = indexed_store();
    populate(&store);
    fs::remove_file(store.layout().index_path()).expect("delete index");

    let outcome = store.list(&ItemFilter::all()).expect("list");
    assert_eq!(outcome.source, SourceKind::Scan);
    assert_eq!(outcome.rows.len(), 5);
    assert!(matches!(outcome.warnings[0], StoreError::IndexStale { .. }));

    // Mutations keep working without an index and do not recreate it.
    store
        .append_worklog("A-BUG-0001", "carol", "reproduced")
        .expect("append");
    assert!(!store.layout().index_path().exists());
}

fn write_config(root: &Path, body: &str) {
    let config_dir = root.join("products/app/_config");
    fs::create_dir_all(&config_dir).expect("mkdir");
    fs::write(config_dir.join("config.toml"), body).expect("config");
}

#[test]
fn rebuild_mode_leaves_index_alone_on_mutation() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_config(
        dir.path(),
        "[index]\nenabled = true\nmode = \"rebuild\"\nauto_refresh = \"inline\"\n",
    );
    let store = Store::init(dir.path(), "app", &InitOptions::default()).expect("init");
    store.rebuild_index().expect("rebuild");

    store
        .create(Kind::Task, "Only on disk", "alice", CreateOptions::default())
        .expect("create");

    let first = store.list(&ItemFilter::default()).expect("list");
    assert_eq!(first.source, SourceKind::Scan);
    assert_eq!(first.rows.len(), 1);
    assert!(matches!(first.warnings[0], StoreError::IndexStale { .. }));

    // The inline refresh after the fallback brought the index up to date.
    let second = store.list(&ItemFilter::default()).expect("list");
    assert_eq!(second.source, SourceKind::Index);
    assert_eq!(strip_sync(second.rows), first.rows);
}

#[test]
fn index_status_reports_freshness() {
    let (_dir, store) = indexed_store();
    let status = store.query().status().expect("status");
    assert!(status.enabled && status.exists && status.fresh);
    assert_eq!(status.items, Some(0));

    populate(&store);
    let status = store.query().status().expect("status");
    assert!(status.fresh);
    assert_eq!(status.items, Some(5));
}

/// `populate` plus links, decisions and a dropped item, written by hand
/// and then indexed.
fn populate_mixed(store: &Store) {
    populate(store);
    let dropped = store
        .create(
            Kind::Task,
            "Archive old exports",
            "carol",
            CreateOptions {
                tags: vec!["reports".into()],
                ..CreateOptions::default()
            },
        )
        .expect("task")
        .value;
    store
        .transition(&dropped.id, "Dropped", "carol", &TransitionOptions::default())
        .expect("drop");

    let path = store.locate("A-TSK-0001").expect("task");
    let mut item = codec::read_record(&path).expect("read");
    item.links.insert("relates".into(), vec!["A-BUG-0001".into()]);
    item.links
        .insert("blocks".into(), vec!["A-TSK-0002".into(), "A-TSK-0003".into()]);
    codec::write_record(&path, &item).expect("write");

    let path = store.locate("A-BUG-0001").expect("bug");
    let mut item = codec::read_record(&path).expect("read");
    item.decisions = vec!["Round half up".into(), "Fix in the exporter".into()];
    item.links.insert("blocked_by".into(), vec!["A-TSK-0001".into()]);
    codec::write_record(&path, &item).expect("write");

    store.rebuild_index().expect("rebuild");
}

#[test]
fn index_and_scan_agree_on_every_filter_field() {
    let (_dir, store) = indexed_store();
    populate_mixed(&store);
    let scan = ScanSource::new(store.layout(), store.profile());
    let index = IndexSource::open(store.layout(), store.profile())
        .expect("open index")
        .expect("index exists");

    let all = scan.list(&ItemFilter::all()).expect("scan").rows;
    assert_eq!(all.len(), 6);
    assert!(all.iter().any(|row| row.links.len() == 2));
    assert!(all.iter().any(|row| row.decisions.len() == 2));

    let cases = [
        ("defaults", ItemFilter::default()),
        ("everything", ItemFilter::all()),
        (
            "kind",
            ItemFilter {
                kind: Some(Kind::Task),
                ..ItemFilter::default()
            },
        ),
        (
            "kind without items",
            ItemFilter {
                kind: Some(Kind::Epic),
                ..ItemFilter::all()
            },
        ),
        (
            "state",
            ItemFilter {
                state: Some("Ready".into()),
                ..ItemFilter::default()
            },
        ),
        (
            "terminal state hidden",
            ItemFilter {
                state: Some("Dropped".into()),
                ..ItemFilter::default()
            },
        ),
        (
            "terminal state shown",
            ItemFilter {
                state: Some("Dropped".into()),
                ..ItemFilter::all()
            },
        ),
        (
            "owner",
            ItemFilter {
                owner: Some("bob".into()),
                ..ItemFilter::default()
            },
        ),
        (
            "unknown owner",
            ItemFilter {
                owner: Some("nobody".into()),
                ..ItemFilter::all()
            },
        ),
        (
            "parent",
            ItemFilter {
                parent: Some("A-FTR-0001".into()),
                ..ItemFilter::default()
            },
        ),
        (
            "tag",
            ItemFilter {
                tag: Some("reports".into()),
                ..ItemFilter::default()
            },
        ),
        (
            "tag with terminal",
            ItemFilter {
                tag: Some("reports".into()),
                ..ItemFilter::all()
            },
        ),
        (
            "title ignores case",
            ItemFilter {
                title_contains: Some("EXPORTS".into()),
                ..ItemFilter::all()
            },
        ),
        (
            "limit",
            ItemFilter {
                limit: Some(2),
                ..ItemFilter::all()
            },
        ),
        (
            "limit zero",
            ItemFilter {
                limit: Some(0),
                ..ItemFilter::all()
            },
        ),
        (
            "every field",
            ItemFilter {
                kind: Some(Kind::Task),
                state: Some("InProgress".into()),
                owner: Some("bob".into()),
                parent: Some("A-FTR-0001".into()),
                tag: Some("batch-0".into()),
                title_contains: Some("schedule".into()),
                include_terminal: false,
                limit: Some(5),
            },
        ),
    ];

    for (name, filter) in &cases {
        let indexed = index.list(filter).expect("index list");
        let scanned = scan.list(filter).expect("scan list");
        assert!(indexed.warnings.is_empty(), "{name}: {:?}", indexed.warnings);
        assert_eq!(strip_sync(indexed.rows), scanned.rows, "{name}");
    }
}
