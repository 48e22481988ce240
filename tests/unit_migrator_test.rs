// tests/unit_migrator_test.rs

//! Slot-migration protocol against the in-memory cluster double: the
//! redis-trib step order and the per-error-class recovery.

#[path = "support/mock_cluster.rs"]
mod mock_cluster;

use mock_cluster::{MockCluster, master, slot_range};
use shepherd::core::ShepherdError;
use shepherd::core::cluster::client::{ClusterClient, ConnectionCache};
use shepherd::core::cluster::topology::{RedisUri, masters};
use shepherd::core::reshard::SlotMigrator;
use std::sync::Arc;
use std::time::Duration;

const SLOT: u16 = 5;

async fn migrator_for(mock: &Arc<MockCluster>) -> SlotMigrator {
    let client: Arc<dyn ClusterClient> = mock.clone();
    let nodes = mock.topology_now();
    let cache = Arc::new(ConnectionCache::build(&client, &nodes).await.unwrap());
    SlotMigrator::new(cache, masters(&nodes), Duration::from_secs(1))
}

fn two_masters() -> Arc<MockCluster> {
    MockCluster::new(vec![
        master("m1", "10.0.0.1", 6379, slot_range(0, 99)),
        master("m2", "10.0.0.2", 6379, slot_range(100, 199)),
    ])
}

fn destination() -> RedisUri {
    RedisUri::new("10.0.0.2", 6379)
}

#[tokio::test]
async fn test_happy_path_moves_keys_and_notifies_owners() {
    let mock = two_masters();
    mock.set_keys("m1", SLOT, vec!["a", "b", "c"]);
    let migrator = migrator_for(&mock).await;

    migrator
        .migrate_slot(SLOT, "m1", "m2", &destination())
        .await
        .unwrap();

    // Assignment pair lands on both sides before the keys move.
    assert!(mock
        .commands_for("m2")
        .contains(&format!("setslot_importing {SLOT} m1")));
    assert!(mock
        .commands_for("m1")
        .contains(&format!("setslot_migrating {SLOT} m2")));

    assert!(mock.keys_of("m1", SLOT).is_empty());
    assert_eq!(mock.keys_of("m2", SLOT).len(), 3);

    // Every master hears about the new owner.
    assert!(mock
        .commands_for("m1")
        .contains(&format!("setslot_node {SLOT} m2")));
    assert!(mock
        .commands_for("m2")
        .contains(&format!("setslot_node {SLOT} m2")));
}

#[tokio::test]
async fn test_empty_slot_skips_the_migrate_call() {
    let mock = two_masters();
    let migrator = migrator_for(&mock).await;

    migrator
        .migrate_slot(SLOT, "m1", "m2", &destination())
        .await
        .unwrap();

    assert_eq!(mock.count_commands("migrate"), 0);
    assert_eq!(mock.count_commands("setslot_node"), 2);
}

#[tokio::test]
async fn test_same_source_and_destination_is_a_noop() {
    let mock = two_masters();
    let migrator = migrator_for(&mock).await;

    migrator
        .migrate_slot(SLOT, "m1", "m1", &destination())
        .await
        .unwrap();

    assert!(mock.log().is_empty());
}

#[tokio::test]
async fn test_busykey_reissues_migrate_with_replace() {
    let mock = two_masters();
    mock.set_keys("m1", SLOT, vec!["a", "b"]);
    mock.inject_failure(
        "m1",
        "migrate",
        ShepherdError::ClusterClient("BUSYKEY Target key name already exists.".to_string()),
    );
    let migrator = migrator_for(&mock).await;

    migrator
        .migrate_slot(SLOT, "m1", "m2", &destination())
        .await
        .unwrap();

    let migrates: Vec<String> = mock
        .commands_for("m1")
        .into_iter()
        .filter(|cmd| cmd.starts_with("migrate"))
        .collect();
    assert_eq!(migrates.len(), 2);
    assert!(migrates[0].ends_with("replace=false"));
    assert!(migrates[1].ends_with("replace=true"));
    assert_eq!(mock.keys_of("m2", SLOT).len(), 2);
}

#[tokio::test]
async fn test_moved_is_absorbed_without_retry() {
    let mock = two_masters();
    mock.set_keys("m1", SLOT, vec!["a"]);
    mock.inject_failure(
        "m1",
        "migrate",
        ShepherdError::ClusterClient("MOVED 5 10.0.0.2:6379".to_string()),
    );
    let migrator = migrator_for(&mock).await;

    migrator
        .migrate_slot(SLOT, "m1", "m2", &destination())
        .await
        .unwrap();

    assert_eq!(mock.count_commands("migrate"), 1);
    // Already-moved slots skip the owner broadcast.
    assert_eq!(mock.count_commands("setslot_node"), 0);
}

#[tokio::test]
async fn test_clusterdown_reissues_the_whole_step() {
    let mock = two_masters();
    mock.set_keys("m1", SLOT, vec!["a", "b"]);
    mock.inject_failure(
        "m1",
        "countkeys",
        ShepherdError::ClusterClient("CLUSTERDOWN The cluster is down".to_string()),
    );
    let migrator = migrator_for(&mock).await;

    migrator
        .migrate_slot(SLOT, "m1", "m2", &destination())
        .await
        .unwrap();

    // The COUNT runs again after the cluster recovers.
    assert_eq!(mock.count_commands("countkeys"), 2);
    assert_eq!(mock.keys_of("m2", SLOT).len(), 2);
}

#[tokio::test]
async fn test_unclassified_failure_is_absorbed() {
    let mock = two_masters();
    mock.set_keys("m1", SLOT, vec!["a"]);
    mock.inject_failure(
        "m1",
        "migrate",
        ShepherdError::ClusterClient("ERR something odd happened".to_string()),
    );
    let migrator = migrator_for(&mock).await;

    migrator
        .migrate_slot(SLOT, "m1", "m2", &destination())
        .await
        .unwrap();

    assert_eq!(mock.count_commands("migrate"), 1);
    assert_eq!(mock.count_commands("setslot_node"), 0);
    // The keys stay put; the outer loop reconciles later.
    assert_eq!(mock.keys_of("m1", SLOT).len(), 1);
}

#[tokio::test]
async fn test_slot_migration_errors_propagate_unclassified() {
    let mock = two_masters();
    mock.set_keys("m1", SLOT, vec!["a"]);
    mock.inject_failure(
        "m1",
        "migrate",
        ShepherdError::SlotMigration(
            "MIGRATE to 10.0.0.2:6379 did not finish within 1s".to_string(),
        ),
    );
    let migrator = migrator_for(&mock).await;

    let result = migrator.migrate_slot(SLOT, "m1", "m2", &destination()).await;
    assert!(matches!(result, Err(ShepherdError::SlotMigration(_))));
}

#[tokio::test]
async fn test_connection_cache_miss_fails_the_slot() {
    let mock = two_masters();
    let migrator = migrator_for(&mock).await;

    let result = migrator
        .migrate_slot(SLOT, "ghost", "m2", &destination())
        .await;
    match result {
        Err(ShepherdError::SlotMigration(reason)) => assert!(reason.contains("ghost")),
        other => panic!("expected SlotMigration error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_slot_assignment_retries_until_it_lands() {
    let mock = two_masters();
    mock.inject_failure(
        "m2",
        "setslot_importing",
        ShepherdError::ClusterClient("connection reset".to_string()),
    );
    let migrator = migrator_for(&mock).await;

    migrator
        .migrate_slot(SLOT, "m1", "m2", &destination())
        .await
        .unwrap();

    assert_eq!(mock.count_commands("setslot_importing"), 2);
    assert_eq!(mock.count_commands("setslot_migrating"), 1);
}
