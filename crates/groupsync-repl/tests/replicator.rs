//! Replication cycle scenarios against in-memory collaborators.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{source_group, Harness, PENDING_SETTINGS};
use groupsync_core::{Difference, Group, Role};
use groupsync_repl::{CycleOutcome, Failure, ReplicatorSettings, TargetStore};
use tokio::sync::watch;

fn backoff_settings(allowable_failures: u64, failure_penalty: u64) -> ReplicatorSettings {
    ReplicatorSettings {
        poll_interval_ms: 1_000,
        allowable_failures,
        failure_penalty,
    }
}

#[tokio::test]
async fn test_new_group_is_created_and_populated() {
    let mut h = Harness::default();
    let g1 = source_group("g1", "Group one").with_member("alice@example.edu", Role::Member);
    h.source.set_groups(vec![g1.clone()]);

    let outcome = h.replicator.run_cycle().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Synced {
            synced: vec!["g1".to_string()],
            failed: vec![],
        }
    );

    assert_eq!(h.target.created(), vec!["g1".to_string()]);
    assert_eq!(
        h.target.applied(),
        vec![Difference::member_add(&g1, "alice@example.edu", Role::Member)]
    );
    assert!(h.state.last_sync_time_for_group("db", "g1").unwrap() > 0);
    assert!(h.state.last_update_for_source("db").unwrap() > 0);
    assert_eq!(h.source.synced(), vec!["g1".to_string()]);
    assert!(h.state.read_set("dir", PENDING_SETTINGS).unwrap().is_empty());

    let mirrored = h.state.remote_memberships("dir", "g1").unwrap();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].user_id, "alice@example.edu");
    assert_eq!(mirrored[0].role, Role::Member);
}

#[tokio::test]
async fn test_role_change_and_drop_reach_target() {
    let mut h = Harness::default();
    h.target.set_groups(vec![Group::new("g1", "Group one")
        .with_member("alice@example.edu", Role::Member)
        .with_member("bob@example.edu", Role::Manager)]);
    let g1 = source_group("g1", "Group one").with_member("alice@example.edu", Role::Manager);
    h.source.set_groups(vec![g1.clone()]);

    h.replicator.run_cycle().await.unwrap();

    let applied: HashSet<Difference> = h.target.applied().into_iter().collect();
    let expected: HashSet<Difference> = [
        Difference::member_role_change(&g1, "alice@example.edu", Role::Manager),
        Difference::member_drop(&g1, "bob@example.edu"),
    ]
    .into_iter()
    .collect();
    assert_eq!(applied, expected);
    assert!(h.target.created().is_empty());

    let remote = h.target.group("g1").unwrap();
    assert_eq!(remote.members().len(), 1);
    assert_eq!(
        remote.member("alice@example.edu").unwrap().role,
        Role::Manager
    );

    let mirrored = h.state.remote_memberships("dir", "g1").unwrap();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].role, Role::Manager);
}

#[tokio::test]
async fn test_description_change_is_applied() {
    let mut h = Harness::default();
    h.target.set_groups(vec![Group::new("g1", "Old")]);
    let g1 = source_group("g1", "New");
    h.source.set_groups(vec![g1.clone()]);

    h.replicator.run_cycle().await.unwrap();

    assert_eq!(h.target.applied(), vec![Difference::metadata_change(&g1)]);
    assert_eq!(h.target.group("g1").unwrap().description(), "New");
}

#[tokio::test]
async fn test_failing_group_backs_off_then_retries() {
    let mut h = Harness::new(backoff_settings(3, 2));
    h.source.set_groups(vec![
        source_group("g1", "").with_member("alice@example.edu", Role::Member)
    ]);
    h.target.fail_group("g1");

    for cycle in 1..=4u64 {
        let outcome = h.replicator.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Synced {
                synced: vec![],
                failed: vec!["g1".to_string()],
            },
            "cycle {}",
            cycle
        );
    }
    assert_eq!(
        h.replicator.failure("g1"),
        Some(Failure {
            failure_count: 4,
            current_penalty: 2,
        })
    );

    for rounds_left in [1u64, 0] {
        let outcome = h.replicator.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::AllPenalized {
                skipped: vec!["g1".to_string()],
            }
        );
        assert_eq!(h.replicator.failure("g1").unwrap().current_penalty, rounds_left);
    }

    let outcome = h.replicator.run_cycle().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Synced {
            synced: vec![],
            failed: vec!["g1".to_string()],
        }
    );
    assert_eq!(
        h.replicator.failure("g1"),
        Some(Failure {
            failure_count: 5,
            current_penalty: 2,
        })
    );

    assert_eq!(h.state.failure_count("db", "g1").unwrap(), 5);
    assert_eq!(h.state.last_update_for_source("db").unwrap(), 0);
    assert!(h.source.synced().is_empty());
}

#[tokio::test]
async fn test_recovery_clears_failure() {
    let mut h = Harness::new(backoff_settings(3, 2));
    h.source.set_groups(vec![
        source_group("g1", "").with_member("alice@example.edu", Role::Member)
    ]);
    h.target.fail_group("g1");
    h.replicator.run_cycle().await.unwrap();
    assert_eq!(h.replicator.failure("g1").unwrap().failure_count, 1);

    h.target.heal_group("g1");
    h.replicator.run_cycle().await.unwrap();

    assert!(h.replicator.failure("g1").is_none());
    assert!(h.state.last_update_for_source("db").unwrap() > 0);
}

#[tokio::test]
async fn test_source_checkpoint_waits_for_clean_cycle() {
    let mut h = Harness::default();
    h.source.set_groups(vec![
        source_group("g1", "").with_member("alice@example.edu", Role::Member),
        source_group("g2", "").with_member("bob@example.edu", Role::Member),
    ]);
    h.target.fail_group("g1");

    let outcome = h.replicator.run_cycle().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Synced {
            synced: vec!["g2".to_string()],
            failed: vec!["g1".to_string()],
        }
    );
    assert_eq!(h.state.last_update_for_source("db").unwrap(), 0);
    assert!(h.state.last_sync_time_for_group("db", "g2").unwrap() > 0);
    assert_eq!(h.state.last_sync_time_for_group("db", "g1").unwrap(), 0);

    h.target.heal_group("g1");
    let outcome = h.replicator.run_cycle().await.unwrap();

    // g2 was synced after its last modification, so only g1 is worked on.
    assert_eq!(
        outcome,
        CycleOutcome::Synced {
            synced: vec!["g1".to_string()],
            failed: vec![],
        }
    );
    let g2_edits = h
        .target
        .applied()
        .iter()
        .filter(|d| d.group_name() == "g2")
        .count();
    assert_eq!(g2_edits, 1);
    assert!(h.state.last_update_for_source("db").unwrap() > 0);
}

#[tokio::test]
async fn test_penalized_group_holds_source_checkpoint() {
    let mut h = Harness::new(backoff_settings(0, 5));
    h.source.set_groups(vec![
        source_group("g1", "").with_member("alice@example.edu", Role::Member)
    ]);
    h.target.fail_group("g1");
    h.replicator.run_cycle().await.unwrap();
    assert_eq!(h.replicator.failure("g1").unwrap().current_penalty, 5);

    h.source.set_groups(vec![
        source_group("g1", "").with_member("alice@example.edu", Role::Member),
        source_group("g2", "").with_member("bob@example.edu", Role::Member),
    ]);
    let outcome = h.replicator.run_cycle().await.unwrap();

    // Nothing failed this cycle, but g1 is still outstanding.
    assert_eq!(
        outcome,
        CycleOutcome::Synced {
            synced: vec!["g2".to_string()],
            failed: vec![],
        }
    );
    assert_eq!(h.replicator.failure("g1").unwrap().current_penalty, 4);
    assert!(h.state.last_sync_time_for_group("db", "g2").unwrap() > 0);
    assert_eq!(h.state.last_update_for_source("db").unwrap(), 0);
}

#[tokio::test]
async fn test_quiet_source_advances_checkpoint() {
    let mut h = Harness::default();
    h.source.set_groups(vec![source_group("g1", "")]);
    h.replicator.run_cycle().await.unwrap();
    let first = h.state.last_update_for_source("db").unwrap();
    assert!(first > 0);

    let outcome = h.replicator.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::NoUpdates);

    let queries = h.source.queries();
    assert_eq!(queries[0], 0);
    assert_eq!(queries[1], first - 5_000);
    assert!(h.state.last_update_for_source("db").unwrap() >= first);
}

#[tokio::test]
async fn test_transient_errors_are_not_reported() {
    let mut h = Harness::default();
    h.source.set_groups(vec![source_group("g1", "")]);

    h.target.fail_fetch(Some((Some(503), "unavailable".to_string())));
    assert!(h.replicator.tick().await.is_none());
    h.target.fail_fetch(Some((None, "backendError from upstream".to_string())));
    assert!(h.replicator.tick().await.is_none());
    assert!(h.monitor.failures().is_empty());

    h.target.fail_fetch(Some((Some(500), "boom".to_string())));
    assert!(h.replicator.tick().await.is_none());
    let failures = h.monitor.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].starts_with("db -> dir"));
    assert!(failures[0].contains("boom"));

    assert_eq!(h.state.last_update_for_source("db").unwrap(), 0);

    h.target.fail_fetch(None);
    assert!(h.replicator.tick().await.is_some());
    assert!(h.state.last_update_for_source("db").unwrap() > 0);
}

#[tokio::test]
async fn test_unconfigured_groups_are_resumed() {
    let mut h = Harness::default();
    h.source.set_groups(vec![
        source_group("g1", "").with_member("alice@example.edu", Role::Member)
    ]);
    h.target.fail_settings(true);

    assert!(h.replicator.tick().await.is_none());
    assert_eq!(h.monitor.failures().len(), 1);
    assert!(h
        .state
        .read_set("dir", PENDING_SETTINGS)
        .unwrap()
        .contains("g1"));
    assert!(h.target.configured().is_empty());

    h.target.fail_settings(false);
    h.replicator.run_cycle().await.unwrap();

    // The group already exists now, so it is not created twice.
    assert_eq!(h.target.created(), vec!["g1".to_string()]);
    assert!(h.target.configured().contains("g1"));
    assert!(h.state.read_set("dir", PENDING_SETTINGS).unwrap().is_empty());
}

#[tokio::test]
async fn test_zero_poll_interval_uses_default() {
    let h = Harness::new(ReplicatorSettings {
        poll_interval_ms: 0,
        ..ReplicatorSettings::default()
    });
    assert_eq!(h.replicator.settings().poll_interval_ms, 60_000);
    assert_eq!(h.replicator.name(), "db -> dir");
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown() {
    let h = Harness::new(backoff_settings(3, 30));
    h.source.set_groups(vec![source_group("g1", "")]);
    let source = h.source.clone();

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(h.replicator.run(rx));

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(source.queries().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_when_sender_dropped() {
    let h = Harness::new(backoff_settings(3, 30));
    let source = h.source.clone();

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(h.replicator.run(rx));
    drop(tx);
    handle.await.unwrap();

    assert!(source.queries().is_empty());
}
