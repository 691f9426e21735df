//! Multi-agent tests: several threads acting on one product directory.
//!
//! Covers:
//! - exclusive ownership when two agents start the same item at once
//! - unique, contiguous ids from concurrent `create`
//! - worklog entries never lost or reordered under concurrent appends
//! - parents only ever move forward while children move around

use backlog_core::{
    CreateOptions, InitOptions, Kind, Store, StoreError, TransitionOptions, WorkItem,
};
use std::collections::BTreeSet;
use std::sync::Barrier;
use std::thread;

fn init() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::init(dir.path(), "app", &InitOptions::default()).expect("init");
    (dir, store)
}

fn ready_task(store: &Store, title: &str, parent: Option<&str>) -> WorkItem {
    let task = store
        .create(
            Kind::Task,
            title,
            "setup",
            CreateOptions {
                parent: parent.map(str::to_string),
                ..CreateOptions::default()
            },
        )
        .expect("create")
        .value;
    for section in ["Context", "Goal", "Acceptance Criteria"] {
        store
            .set_section(&task.id, section, "filled in", "setup")
            .expect("section");
    }
    let quiet = TransitionOptions {
        sync_parent: false,
        ..TransitionOptions::default()
    };
    store
        .transition(&task.id, "Ready", "setup", &quiet)
        .expect("ready")
        .item
}

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

#[test]
fn only_one_agent_wins_a_concurrent_start() {
    let (_dir, store) = init();
    for round in 0..5 {
        let task = ready_task(&store, &format!("Contended {round}"), None);
        let barrier = Barrier::new(2);

        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = ["codex", "claude"]
                .into_iter()
                .map(|agent| {
                    let (store, barrier, id) = (&store, &barrier, task.id.as_str());
                    s.spawn(move || {
                        barrier.wait();
                        (
                            agent,
                            store.transition(id, "InProgress", agent, &TransitionOptions::default()),
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("worker"))
                .collect()
        });

        let winners: Vec<_> = results.iter().filter(|(_, r)| r.is_ok()).collect();
        assert_eq!(winners.len(), 1, "round {round}");
        let winner = winners[0].0;
        let (_, loser) = results
            .iter()
            .find(|(agent, _)| *agent != winner)
            .expect("loser");
        assert!(matches!(
            loser,
            Err(StoreError::OwnershipConflict { holder, .. }) if holder == winner
        ));

        let item = store.get(&task.id).expect("get");
        assert_eq!(item.state, "InProgress");
        assert_eq!(item.owner.as_deref(), Some(winner));
        assert_eq!(store.list_locks().expect("locks").len(), round + 1);
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

#[test]
fn concurrent_creates_get_unique_contiguous_ids() {
    let (dir, _store) = init();
    let workers = 6;
    let per_worker = 4;
    let barrier = Barrier::new(workers);

    let ids: Vec<String> = thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|w| {
                let (barrier, root) = (&barrier, dir.path());
                s.spawn(move || {
                    // Each worker opens its own handle, like separate processes.
                    let store = Store::open(root, Some("app")).expect("open");
                    barrier.wait();
                    (0..per_worker)
                        .map(|i| {
                            store
                                .create(
                                    Kind::Bug,
                                    &format!("Bug {w}-{i}"),
                                    &format!("agent-{w}"),
                                    CreateOptions::default(),
                                )
                                .expect("create")
                                .value
                                .id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().expect("worker"))
            .collect()
    });

    let unique: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
    assert_eq!(unique.len(), workers * per_worker);
    let expected: BTreeSet<String> = (1..=workers * per_worker)
        .map(|n| format!("A-BUG-{n:04}"))
        .collect();
    assert_eq!(
        unique,
        expected.iter().map(String::as_str).collect::<BTreeSet<_>>()
    );
}

// ---------------------------------------------------------------------------
// Worklog
// ---------------------------------------------------------------------------

#[test]
fn concurrent_appends_keep_every_entry_in_time_order() {
    let (_dir, store) = init();
    let item = store
        .create(Kind::Task, "Busy item", "setup", CreateOptions::default())
        .expect("create")
        .value;
    let workers = 4;
    let per_worker = 8;

    thread::scope(|s| {
        for w in 0..workers {
            let (store, id) = (&store, item.id.as_str());
            s.spawn(move || {
                for i in 0..per_worker {
                    store
                        .append_worklog(id, &format!("agent-{w}"), &format!("note {i}"))
                        .expect("append");
                }
            });
        }
    });

    let item = store.get(&item.id).expect("get");
    assert_eq!(item.worklog.len(), 1 + workers * per_worker);
    assert!(
        item.worklog
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp)
    );
    for w in 0..workers {
        let agent = format!("agent-{w}");
        let notes: Vec<&str> = item
            .worklog
            .iter()
            .filter(|e| e.agent == agent)
            .map(|e| e.message.as_str())
            .collect();
        let expected: Vec<String> = (0..per_worker).map(|i| format!("note {i}")).collect();
        assert_eq!(notes, expected, "{agent} entries out of order");
    }
}

// ---------------------------------------------------------------------------
// Parent sync
// ---------------------------------------------------------------------------

#[test]
fn parent_never_moves_backwards_while_children_churn() {
    let (_dir, store) = init();
    let feature = store
        .create(Kind::Feature, "Checkout", "setup", CreateOptions::default())
        .expect("feature")
        .value;
    let a = ready_task(&store, "Payment form", Some(&feature.id));
    let b = ready_task(&store, "Receipt email", Some(&feature.id));
    let opts = TransitionOptions::default();

    thread::scope(|s| {
        let (store, opts) = (&store, &opts);
        let a_id = a.id.as_str();
        let b_id = b.id.as_str();
        s.spawn(move || {
            for target in ["InProgress", "Review", "Done"] {
                store.transition(a_id, target, "codex", opts).expect("a moves");
            }
        });
        s.spawn(move || {
            for target in ["InProgress", "Blocked", "Ready", "Blocked"] {
                store.transition(b_id, target, "claude", opts).expect("b moves");
            }
        });
    });

    let profile = store.profile();
    let feature = store.get(&feature.id).expect("feature");
    assert_eq!(feature.state, "InProgress");
    let mut last_rank = profile.rank("Proposed").expect("rank");
    for entry in &feature.worklog {
        let Some(transition) = entry.message.strip_prefix("State ") else {
            continue;
        };
        let to = transition
            .split(" -> ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .expect("target state");
        let rank = profile.rank(to).expect("ranked target");
        assert!(rank > last_rank, "feature moved backwards to {to}");
        last_rank = rank;
    }
    assert_eq!(store.get(&b.id).expect("b").state, "Blocked");
}
