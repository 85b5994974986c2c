//! Error handling and edge case tests.

use serde_json::json;
use shardfeed::{
    Bucket, ChangeVector, Cluster, ClusterCommand, Database, NodeTag, RaftIndex, Result, ServerConfig,
    ShardNumber, ShardedDatabase, SubscriptionBatch, SubscriptionCreationOptions, SubscriptionError,
    SubscriptionWorkerOptions,
};
use std::sync::Arc;
use std::time::Duration;

fn cluster_with(name: &str, members: &[&str], shard_count: Option<u32>) -> Arc<Cluster> {
    let cluster = Arc::new(Cluster::new("A"));
    cluster
        .execute(ClusterCommand::PutDatabase {
            name: name.into(),
            members: members.iter().map(|m| NodeTag::from(*m)).collect(),
            shard_count,
        })
        .unwrap();
    cluster
}

fn quick_options(name: &str) -> SubscriptionWorkerOptions {
    let mut options = SubscriptionWorkerOptions::new(name);
    options.time_to_wait_before_connection_retry = Duration::from_millis(20);
    options.max_erroneous_period = Duration::from_millis(300);
    options
}

fn noop(_: &SubscriptionBatch) -> Result<()> {
    Ok(())
}

// --- Opening Databases ---

#[test]
fn test_open_missing_database() {
    let cluster = Arc::new(Cluster::new("A"));
    let err = Database::open("nowhere", cluster.clone(), ServerConfig::default()).err().unwrap();
    assert!(matches!(err, SubscriptionError::DatabaseDoesNotExist(_)));

    let err = ShardedDatabase::open("nowhere", cluster, ServerConfig::default()).err().unwrap();
    assert!(matches!(err, SubscriptionError::DatabaseDoesNotExist(_)));
}

#[test]
fn test_open_with_wrong_layout() {
    let cluster = cluster_with("sharded", &["A"], Some(2));
    let err = Database::open("sharded", cluster, ServerConfig::default()).err().unwrap();
    assert!(matches!(err, SubscriptionError::InvalidOperation(_)));

    let cluster = cluster_with("plain", &["A"], None);
    let err = ShardedDatabase::open("plain", cluster, ServerConfig::default()).err().unwrap();
    assert!(matches!(err, SubscriptionError::InvalidOperation(_)));
}

#[test]
fn test_open_deleted_database() {
    let cluster = cluster_with("db", &["A"], None);
    cluster
        .execute(ClusterCommand::DeleteDatabase { name: "db".into() })
        .unwrap();
    let err = Database::open("db", cluster, ServerConfig::default()).err().unwrap();
    assert!(matches!(err, SubscriptionError::DatabaseDoesNotExist(_)));
}

#[test]
fn test_invalid_database_names() {
    let cluster = Arc::new(Cluster::new("A"));
    for name in ["", "  ", "db$1"] {
        let result = cluster.execute(ClusterCommand::PutDatabase {
            name: name.into(),
            members: vec![NodeTag::from("A")],
            shard_count: None,
        });
        assert!(matches!(result, Err(SubscriptionError::InvalidOperation(_))), "{:?}", name);
    }
    assert_eq!(cluster.last_committed_index().0, 0);
}

// --- Change Vectors ---

#[test]
fn test_malformed_change_vectors() {
    for text in ["A", "A:1", "A:one-db", ":1-db", "A:1-", "A:1-db|B"] {
        let result = text.parse::<ChangeVector>();
        assert!(
            matches!(result, Err(SubscriptionError::InvalidChangeVector(_))),
            "{:?} parsed as {:?}",
            text,
            result
        );
    }
}

// --- Subscriptions ---

#[test]
fn test_subscription_with_unregistered_filter() {
    let db = Database::open("db", cluster_with("db", &["A"], None), ServerConfig::default()).unwrap();
    let err = db
        .create_subscription(SubscriptionCreationOptions {
            name: Some("filtered".into()),
            filter: Some("missing".into()),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::InvalidOperation(_)));
    assert!(db.subscription("filtered").is_none());
}

#[test]
fn test_delete_and_toggle_missing_subscription() {
    let db = Database::open("db", cluster_with("db", &["A"], None), ServerConfig::default()).unwrap();
    assert!(matches!(
        db.delete_subscription("ghost"),
        Err(SubscriptionError::DoesNotExist(_))
    ));
    assert!(matches!(
        db.set_subscription_disabled("ghost", true),
        Err(SubscriptionError::DoesNotExist(_))
    ));
}

#[test]
fn test_worker_on_disabled_subscription_stops() {
    let db = Database::open("db", cluster_with("db", &["A"], None), ServerConfig::default()).unwrap();
    db.create_subscription(SubscriptionCreationOptions {
        name: Some("off".into()),
        disabled: true,
        ..Default::default()
    })
    .unwrap();

    let worker = db.worker(quick_options("off")).unwrap();
    let err = worker.run(&mut noop).unwrap_err();
    assert!(matches!(
        err,
        SubscriptionError::Closed {
            can_reconnect: false,
            ..
        }
    ));
}

#[test]
fn test_worker_redirected_to_mentor_gives_up() {
    let db = Database::open("db", cluster_with("db", &["A", "B"], None), ServerConfig::default()).unwrap();
    db.create_subscription(SubscriptionCreationOptions {
        name: Some("elsewhere".into()),
        mentor_node: Some(NodeTag::from("B")),
        ..Default::default()
    })
    .unwrap();

    let worker = db.worker(quick_options("elsewhere")).unwrap();
    match worker.run(&mut noop).unwrap_err() {
        SubscriptionError::DoesNotBelongToNode { appropriate_node, .. } => {
            assert_eq!(appropriate_node, Some(NodeTag::from("B")));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_failing_handler_stops_worker() {
    let db = Database::open("db", cluster_with("db", &["A"], None), ServerConfig::default()).unwrap();
    db.create_subscription(SubscriptionCreationOptions {
        name: Some("fragile".into()),
        ..Default::default()
    })
    .unwrap();
    db.put("users/1", "Users", json!({ "name": "a" })).unwrap();

    let worker = db.worker(quick_options("fragile")).unwrap();
    let mut failing = |_: &SubscriptionBatch| -> Result<()> {
        Err(SubscriptionError::InvalidOperation("handler failed".into()))
    };
    let err = worker.run(&mut failing).unwrap_err();
    assert!(matches!(err, SubscriptionError::Subscriber(_)));

    // The batch was never acknowledged: it is still active or queued for resend.
    let state = db.subscription("fragile").unwrap();
    let pending = state
        .active_batches
        .values()
        .flat_map(|batch| batch.documents.iter().map(|doc| doc.id.as_str().to_lowercase()))
        .chain(state.resend.keys().map(|id| id.as_str().to_lowercase()))
        .any(|id| id == "users/1");
    assert!(pending);
}

// --- Bucket Migrations ---

#[test]
fn test_invalid_migrations_are_rejected() {
    let db = ShardedDatabase::open("shop", cluster_with("shop", &["A"], Some(2)), ServerConfig::default())
        .unwrap();
    let bucket = db.bucket_of("orders/1");
    let owner = db.write_shard_for(bucket).unwrap();
    let other = ShardNumber(1 - owner.0);

    let same = db.cluster().execute(ClusterCommand::StartBucketMigration {
        database: "shop".into(),
        bucket,
        destination: owner,
    });
    assert!(matches!(same, Err(SubscriptionError::InvalidOperation(_))));

    let missing = db.cluster().execute(ClusterCommand::StartBucketMigration {
        database: "shop".into(),
        bucket,
        destination: ShardNumber(7),
    });
    assert!(matches!(missing, Err(SubscriptionError::InvalidOperation(_))));

    db.cluster()
        .execute(ClusterCommand::StartBucketMigration {
            database: "shop".into(),
            bucket,
            destination: other,
        })
        .unwrap();
    let duplicate = db.cluster().execute(ClusterCommand::StartBucketMigration {
        database: "shop".into(),
        bucket,
        destination: other,
    });
    assert!(matches!(duplicate, Err(SubscriptionError::InvalidOperation(_))));
}

#[test]
fn test_migration_on_plain_database() {
    let cluster = cluster_with("db", &["A"], None);
    let result = cluster.execute(ClusterCommand::StartBucketMigration {
        database: "db".into(),
        bucket: Bucket(1),
        destination: ShardNumber(1),
    });
    assert!(matches!(result, Err(SubscriptionError::InvalidOperation(_))));
}

#[test]
fn test_stale_migration_steps_are_rejected() {
    let db = ShardedDatabase::open("shop", cluster_with("shop", &["A"], Some(2)), ServerConfig::default())
        .unwrap();
    let bucket = db.bucket_of("orders/1");

    let result = db.cluster().execute(ClusterCommand::SourceMigrationCompleted {
        database: "shop".into(),
        bucket,
        migration_index: RaftIndex(99),
        last_source_change_vector: ChangeVector::empty(),
    });
    assert!(result.is_err());

    // Cleanup of a migration that no longer exists is a no-op.
    db.cluster()
        .execute(ClusterCommand::SourceMigrationCleanup {
            database: "shop".into(),
            bucket,
            migration_index: RaftIndex(99),
        })
        .unwrap();
}
