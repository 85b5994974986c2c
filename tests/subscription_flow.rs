//! End-to-end subscription delivery on a single database.

use parking_lot::Mutex;
use serde_json::json;
use shardfeed::{
    BatchItem, Cluster, ClusterCommand, Database, Document, FilterOutcome, NodeTag, OpeningStrategy,
    Result, ScriptError, ServerConfig, StartingPoint, SubscriptionBatch, SubscriptionCreationOptions,
    SubscriptionError, SubscriptionWorkerOptions,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(15);

fn database() -> Arc<Database> {
    let cluster = Arc::new(Cluster::new("A"));
    cluster
        .execute(ClusterCommand::PutDatabase {
            name: "db".into(),
            members: vec![NodeTag::from("A")],
            shard_count: None,
        })
        .unwrap();
    Database::open("db", cluster, ServerConfig::default()).unwrap()
}

fn subscription(db: &Database, name: &str, collection: Option<&str>) {
    db.create_subscription(SubscriptionCreationOptions {
        name: Some(name.into()),
        collection: collection.map(String::from),
        ..Default::default()
    })
    .unwrap();
}

fn options(name: &str) -> SubscriptionWorkerOptions {
    let mut options = SubscriptionWorkerOptions::new(name);
    options.time_to_wait_before_connection_retry = Duration::from_millis(50);
    options
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Every item a worker handled, in order.
#[derive(Clone, Default)]
struct Received(Arc<Mutex<Vec<BatchItem>>>);

impl Received {
    fn handler(&self) -> impl FnMut(&SubscriptionBatch) -> Result<()> + Send + 'static {
        let items = self.0.clone();
        move |batch: &SubscriptionBatch| {
            items.lock().extend(batch.items.iter().cloned());
            Ok(())
        }
    }

    fn items(&self) -> Vec<BatchItem> {
        self.0.lock().clone()
    }

    fn ids(&self) -> BTreeSet<String> {
        self.0.lock().iter().map(|item| item.id.as_str().to_lowercase()).collect()
    }
}

fn settled(db: &Database, name: &str) -> bool {
    db.subscription(name)
        .map(|state| state.resend.is_empty() && state.active_batches.is_empty())
        .unwrap_or(false)
}

// --- Delivery ---

#[test]
fn test_delivers_existing_and_new_documents() {
    let db = database();
    for i in 0..3 {
        db.put(&format!("users/{}", i), "Users", json!({ "n": i })).unwrap();
    }
    subscription(&db, "sub", None);

    let received = Received::default();
    let handle = db.worker(options("sub")).unwrap().spawn(received.handler()).unwrap();
    assert!(wait_until(|| received.ids().len() == 3));

    db.put("users/3", "Users", json!({ "n": 3 })).unwrap();
    db.put("users/0", "Users", json!({ "n": 10 })).unwrap();
    assert!(wait_until(|| received.items().len() == 5));

    let latest = received
        .items()
        .into_iter()
        .filter(|item| item.id.as_str() == "users/0")
        .last()
        .unwrap();
    assert_eq!(latest.body, Some(json!({ "n": 10 })));
    assert!(wait_until(|| settled(&db, "sub")));

    handle.cancel();
    handle.join().unwrap();
}

#[test]
fn test_collection_subscription_skips_other_collections() {
    let db = database();
    db.put("users/1", "Users", json!({})).unwrap();
    db.put("orders/1", "Orders", json!({})).unwrap();
    db.put("orders/2", "orders", json!({})).unwrap();
    subscription(&db, "orders", Some("Orders"));

    let mut options = options("orders");
    options.close_when_no_docs_left = true;
    let received = Received::default();
    let mut handler = received.handler();
    db.worker(options).unwrap().run(&mut handler).unwrap();

    let expected: BTreeSet<String> = ["orders/1", "orders/2"].iter().map(|s| s.to_string()).collect();
    assert_eq!(received.ids(), expected);
}

#[test]
fn test_small_batches_deliver_everything_once() {
    let db = database();
    for i in 0..25 {
        db.put(&format!("items/{}", i), "Items", json!({ "i": i })).unwrap();
    }
    subscription(&db, "sub", None);

    let mut options = options("sub");
    options.max_docs_per_batch = 4;
    options.close_when_no_docs_left = true;
    let batches = Arc::new(Mutex::new(Vec::new()));
    let recorded = batches.clone();
    let mut handler = move |batch: &SubscriptionBatch| -> Result<()> {
        recorded.lock().push(batch.items.len());
        Ok(())
    };
    db.worker(options).unwrap().run(&mut handler).unwrap();

    let sizes = batches.lock().clone();
    assert!(sizes.iter().all(|size| *size <= 4));
    assert_eq!(sizes.iter().sum::<usize>(), 25);
    assert!(settled(&db, "sub"));
}

#[test]
fn test_last_document_starts_after_existing_documents() {
    let db = database();
    db.put("users/old", "Users", json!({})).unwrap();
    db.create_subscription(SubscriptionCreationOptions {
        name: Some("recent".into()),
        starting_point: StartingPoint::LastDocument,
        ..Default::default()
    })
    .unwrap();
    db.put("users/new", "Users", json!({})).unwrap();

    let mut options = options("recent");
    options.close_when_no_docs_left = true;
    let received = Received::default();
    let mut handler = received.handler();
    db.worker(options).unwrap().run(&mut handler).unwrap();

    assert_eq!(received.ids().into_iter().collect::<Vec<_>>(), vec!["users/new".to_string()]);
}

// --- Filters ---

#[test]
fn test_filter_projects_rejects_and_reports_errors() {
    let db = database();
    db.register_filter(
        "adults",
        Arc::new(|doc: &Document| -> std::result::Result<FilterOutcome, ScriptError> {
            let data = doc.data.clone().unwrap_or_default();
            if data.get("broken").is_some() {
                return Err(ScriptError("age is not readable".into()));
            }
            match data.get("age").and_then(|age| age.as_i64()) {
                Some(age) if age >= 18 => Ok(FilterOutcome::Accepted(Some(json!({ "name": data["name"] })))),
                _ => Ok(FilterOutcome::Rejected),
            }
        }),
    );
    db.put("users/1", "Users", json!({ "name": "ann", "age": 30 })).unwrap();
    db.put("users/2", "Users", json!({ "name": "bob", "age": 12 })).unwrap();
    db.put("users/3", "Users", json!({ "name": "cid", "broken": true })).unwrap();
    db.create_subscription(SubscriptionCreationOptions {
        name: Some("adults".into()),
        filter: Some("adults".into()),
        ..Default::default()
    })
    .unwrap();

    let mut options = options("adults");
    options.close_when_no_docs_left = true;
    let received = Received::default();
    let mut handler = received.handler();
    db.worker(options).unwrap().run(&mut handler).unwrap();

    let items = received.items();
    assert_eq!(items.len(), 2);
    let ann = items.iter().find(|item| item.id.as_str() == "users/1").unwrap();
    assert_eq!(ann.body, Some(json!({ "name": "ann" })));
    assert!(ann.exception.is_none());
    let broken = items.iter().find(|item| item.id.as_str() == "users/3").unwrap();
    assert!(broken.exception.as_deref().unwrap().contains("not readable"));
}

// --- Acknowledgement ---

#[test]
fn test_unacknowledged_batch_is_redelivered() {
    let db = database();
    db.put("users/1", "Users", json!({})).unwrap();
    subscription(&db, "sub", None);

    let mut failing = |_: &SubscriptionBatch| -> Result<()> {
        Err(SubscriptionError::InvalidOperation("handler crashed".into()))
    };
    let result = db.worker(options("sub")).unwrap().run(&mut failing);
    assert!(matches!(result, Err(SubscriptionError::Subscriber(_))));

    // Nothing was acknowledged, so progress did not move past the document.
    assert!(wait_until(|| db.subscription_connections("sub").is_empty()));
    let state = db.subscription("sub").unwrap();
    assert!(state.active_batches.is_empty());

    let mut options = options("sub");
    options.close_when_no_docs_left = true;
    let received = Received::default();
    let mut handler = received.handler();
    db.worker(options).unwrap().run(&mut handler).unwrap();
    assert!(received.ids().contains("users/1"));
    assert!(settled(&db, "sub"));
}

#[test]
fn test_deleted_document_is_not_resent() {
    let db = database();
    db.put("users/1", "Users", json!({})).unwrap();
    db.put("users/2", "Users", json!({})).unwrap();
    db.delete("users/1").unwrap();
    subscription(&db, "sub", None);

    let mut options = options("sub");
    options.close_when_no_docs_left = true;
    let received = Received::default();
    let mut handler = received.handler();
    db.worker(options).unwrap().run(&mut handler).unwrap();
    assert_eq!(received.ids().into_iter().collect::<Vec<_>>(), vec!["users/2".to_string()]);
}

// --- Opening Strategies ---

#[test]
fn test_open_if_free_rejects_second_connection() {
    let db = database();
    subscription(&db, "sub", None);

    let first = db.worker(options("sub")).unwrap().spawn(Received::default().handler()).unwrap();
    assert!(wait_until(|| db.subscription_connections("sub").len() == 1));

    let mut handler = Received::default().handler();
    let second = db.worker(options("sub")).unwrap().run(&mut handler);
    assert!(matches!(second, Err(SubscriptionError::InUse(_))));

    first.cancel();
    first.join().unwrap();
}

#[test]
fn test_take_over_replaces_running_connection() {
    let db = database();
    db.put("users/1", "Users", json!({})).unwrap();
    subscription(&db, "sub", None);

    let first = db.worker(options("sub")).unwrap().spawn(Received::default().handler()).unwrap();
    assert!(wait_until(|| db.subscription_connections("sub").len() == 1));

    let mut take_over = options("sub");
    take_over.strategy = OpeningStrategy::TakeOver;
    let received = Received::default();
    let second = db.worker(take_over).unwrap().spawn(received.handler()).unwrap();

    assert!(matches!(first.join(), Err(SubscriptionError::InUse(_))));
    db.put("users/2", "Users", json!({})).unwrap();
    assert!(wait_until(|| received.ids().contains("users/2")));

    second.cancel();
    second.join().unwrap();
}

#[test]
fn test_wait_for_free_connects_after_release() {
    let db = database();
    db.put("users/1", "Users", json!({})).unwrap();
    subscription(&db, "sub", None);

    let first = db.worker(options("sub")).unwrap().spawn(Received::default().handler()).unwrap();
    assert!(wait_until(|| db.subscription_connections("sub").len() == 1));

    let mut waiting = options("sub");
    waiting.strategy = OpeningStrategy::WaitForFree;
    let received = Received::default();
    let second = db.worker(waiting).unwrap().spawn(received.handler()).unwrap();

    thread::sleep(Duration::from_millis(200));
    assert_eq!(db.subscription_connections("sub").len(), 1);

    first.cancel();
    first.join().unwrap();
    db.put("users/2", "Users", json!({})).unwrap();
    assert!(wait_until(|| received.ids().contains("users/2")));

    second.cancel();
    second.join().unwrap();
}

#[test]
fn test_concurrent_workers_share_the_feed() {
    let db = database();
    subscription(&db, "sub", None);

    let mut concurrent = options("sub");
    concurrent.strategy = OpeningStrategy::Concurrent;
    concurrent.max_docs_per_batch = 2;
    let (left, right) = (Received::default(), Received::default());
    let first = db.worker(concurrent.clone()).unwrap().spawn(left.handler()).unwrap();
    let second = db.worker(concurrent).unwrap().spawn(right.handler()).unwrap();
    assert!(wait_until(|| db.subscription_connections("sub").len() == 2));

    for i in 0..20 {
        db.put(&format!("users/{}", i), "Users", json!({ "i": i })).unwrap();
    }
    assert!(wait_until(|| left.ids().union(&right.ids()).count() == 20));

    first.cancel();
    second.cancel();
    first.join().unwrap();
    second.join().unwrap();
}

// --- Subscription Lifecycle ---

#[test]
fn test_deleting_subscription_stops_worker() {
    let db = database();
    subscription(&db, "sub", None);
    let handle = db.worker(options("sub")).unwrap().spawn(Received::default().handler()).unwrap();
    assert!(wait_until(|| db.subscription_connections("sub").len() == 1));

    db.delete_subscription("sub").unwrap();
    assert!(matches!(handle.join(), Err(SubscriptionError::DoesNotExist(_))));
}

#[test]
fn test_disabling_subscription_closes_worker() {
    let db = database();
    subscription(&db, "sub", None);
    let handle = db.worker(options("sub")).unwrap().spawn(Received::default().handler()).unwrap();
    assert!(wait_until(|| db.subscription_connections("sub").len() == 1));

    db.set_subscription_disabled("sub", true).unwrap();
    assert!(matches!(
        handle.join(),
        Err(SubscriptionError::Closed {
            can_reconnect: false,
            ..
        })
    ));

    let mut handler = Received::default().handler();
    let reconnect = db.worker(options("sub")).unwrap().run(&mut handler);
    assert!(matches!(reconnect, Err(SubscriptionError::Closed { .. })));
}

#[test]
fn test_dropped_connection_reconnects_and_resumes() {
    let db = database();
    subscription(&db, "sub", None);
    let received = Received::default();
    let handle = db.worker(options("sub")).unwrap().spawn(received.handler()).unwrap();
    assert!(wait_until(|| db.subscription_connections("sub").len() == 1));

    assert!(db.drop_subscription_connections("sub", || {
        SubscriptionError::ChangeVectorUpdateConcurrency("dropped by test".into())
    }));
    db.put("users/1", "Users", json!({})).unwrap();
    assert!(wait_until(|| received.ids().contains("users/1")));
    assert!(!handle.is_finished());

    handle.cancel();
    handle.join().unwrap();
}

#[test]
fn test_connection_stats_track_batches() {
    let db = database();
    for i in 0..3 {
        db.put(&format!("users/{}", i), "Users", json!({ "i": i })).unwrap();
    }
    subscription(&db, "sub", None);
    let received = Received::default();
    let handle = db.worker(options("sub")).unwrap().spawn(received.handler()).unwrap();
    assert!(wait_until(|| received.ids().len() == 3));

    let connections = db.subscription_connections("sub");
    assert_eq!(connections.len(), 1);
    let stats = connections[0].stats();
    assert!(stats.batch_count >= 1);
    assert_eq!(stats.documents_sent, 3);
    assert!(stats.total_batch_bytes > 0);
    assert!(connections[0].history().iter().any(|entry| entry.contains("accepted")));

    handle.cancel();
    handle.join().unwrap();
}

#[test]
fn test_unknown_subscription_is_not_found() {
    let db = database();
    let mut handler = Received::default().handler();
    let result = db.worker(options("missing")).unwrap().run(&mut handler);
    assert!(matches!(result, Err(SubscriptionError::DoesNotExist(_))));
}
