//! Property tests for delivery decisions while documents change and buckets move.
//!
//! Each shard is served by one processor at a time. Operations interleave
//! writes, bucket moves, fetches, acknowledgements and dropped connections.
//! Once every shard drains, each live document has been delivered at its
//! latest version and no acknowledged version was delivered twice.

use proptest::prelude::*;
use serde_json::json;
use shardfeed::subscriptions::{ProcessedItem, SubscriptionHost, SubscriptionProcessor};
use shardfeed::{
    BatchId, CancellationToken, ChangeVector, Cluster, ClusterCommand, NodeTag, ServerConfig, ShardNumber,
    ShardedDatabase, SubscriptionCreationOptions, SubscriptionWorkerOptions,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

const SHARDS: u32 = 2;
const KEYS: u8 = 4;
const TENANTS: u8 = 2;
const SETTLE_ROUNDS: usize = 64;

#[derive(Clone, Debug)]
enum Op {
    Put(u8, u8),
    Delete(u8, u8),
    Move(u8),
    Fetch(u8),
    Ack(u8),
    Drop(u8),
}

fn op() -> impl Strategy<Value = Op> {
    let shard = 0..SHARDS as u8;
    prop_oneof![
        4 => (0..KEYS, 0..TENANTS).prop_map(|(key, tenant)| Op::Put(key, tenant)),
        1 => (0..KEYS, 0..TENANTS).prop_map(|(key, tenant)| Op::Delete(key, tenant)),
        1 => (0..TENANTS).prop_map(Op::Move),
        3 => shard.clone().prop_map(Op::Fetch),
        2 => shard.clone().prop_map(Op::Ack),
        1 => shard.prop_map(Op::Drop),
    ]
}

/// Documents of one tenant share a bucket.
fn doc_id(key: u8, tenant: u8) -> String {
    format!("users/{}$tenant-{}", key, tenant)
}

struct Connection {
    processor: SubscriptionProcessor,
    in_flight: VecDeque<(BatchId, Vec<ProcessedItem>)>,
}

struct Harness {
    db: Arc<ShardedDatabase>,
    connections: BTreeMap<ShardNumber, Connection>,
    next_connection: u64,
    received: Vec<(String, ChangeVector)>,
}

impl Harness {
    fn new() -> Self {
        let cluster = Arc::new(Cluster::new("A"));
        cluster
            .execute(ClusterCommand::PutDatabase {
                name: "db".into(),
                members: vec![NodeTag::from("A")],
                shard_count: Some(SHARDS),
            })
            .unwrap();
        let db = ShardedDatabase::open("db", cluster, ServerConfig::default()).unwrap();
        db.create_subscription(SubscriptionCreationOptions {
            name: Some("sub".into()),
            ..Default::default()
        })
        .unwrap();

        let mut harness = Self {
            db,
            connections: BTreeMap::new(),
            next_connection: 1,
            received: Vec::new(),
        };
        for shard in 0..SHARDS {
            harness.connect(ShardNumber(shard));
        }
        harness
    }

    fn connect(&mut self, shard: ShardNumber) {
        let mut options = SubscriptionWorkerOptions::new("sub");
        options.max_docs_per_batch = 2;
        let state = self.db.subscription("sub").unwrap();
        let processor = self
            .db
            .shard(shard)
            .unwrap()
            .create_processor(&state, &options, self.next_connection, &CancellationToken::new())
            .unwrap();
        self.next_connection += 1;
        self.connections.insert(
            shard,
            Connection {
                processor,
                in_flight: VecDeque::new(),
            },
        );
    }

    fn connection(&mut self, shard: u8) -> &mut Connection {
        self.connections.get_mut(&ShardNumber(shard as u32)).unwrap()
    }

    fn apply(&mut self, op: &Op) {
        match *op {
            Op::Put(key, tenant) => {
                self.db
                    .put(&doc_id(key, tenant), "Users", json!({ "key": key }))
                    .unwrap();
            }
            Op::Delete(key, tenant) => {
                self.db.delete(&doc_id(key, tenant)).unwrap();
            }
            Op::Move(tenant) => {
                let bucket = self.db.bucket_of(&format!("tenant-{}", tenant));
                let owner = self.db.write_shard_for(bucket).unwrap();
                self.db
                    .move_bucket(bucket, ShardNumber((owner.0 + 1) % SHARDS))
                    .unwrap();
            }
            Op::Fetch(shard) => {
                self.fetch(shard);
            }
            Op::Ack(shard) => {
                self.ack(shard);
            }
            Op::Drop(shard) => {
                let connection = self.connection(shard);
                while let Some((batch, _)) = connection.in_flight.pop_front() {
                    connection.processor.drop_batch(batch).unwrap();
                }
                self.connect(ShardNumber(shard as u32));
            }
        }
    }

    /// Returns whether a batch with documents was recorded.
    fn fetch(&mut self, shard: u8) -> bool {
        let connection = self.connection(shard);
        let items = connection.processor.get_batch().unwrap();
        match connection.processor.record_batch().unwrap() {
            Some(batch) => {
                connection.in_flight.push_back((batch, items));
                true
            }
            None => {
                assert!(items.is_empty());
                false
            }
        }
    }

    fn ack(&mut self, shard: u8) -> bool {
        let connection = self.connection(shard);
        let (batch, items) = match connection.in_flight.pop_front() {
            Some(next) => next,
            None => return false,
        };
        connection.processor.acknowledge_batch(batch).unwrap();
        self.received.extend(
            items
                .into_iter()
                .map(|item| (item.document.id.as_str().to_lowercase(), item.document.change_vector.version())),
        );
        true
    }

    /// Acknowledge everything and keep fetching until no shard has work left.
    fn settle(&mut self) -> bool {
        for _ in 0..SETTLE_ROUNDS {
            let mut busy = false;
            for shard in 0..SHARDS as u8 {
                while self.ack(shard) {
                    busy = true;
                }
                if self.fetch(shard) {
                    busy = true;
                    self.ack(shard);
                }
            }
            let state = self.db.subscription("sub").unwrap();
            if !busy && state.resend.is_empty() && state.active_batches.is_empty() {
                return true;
            }
        }
        false
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_every_live_version_is_delivered_once(ops in prop::collection::vec(op(), 1..40)) {
        let mut harness = Harness::new();
        for op in &ops {
            harness.apply(op);
        }
        prop_assert!(harness.settle(), "subscription did not drain after {:?}", ops);

        let mut seen = HashSet::new();
        for pair in &harness.received {
            prop_assert!(seen.insert(pair.clone()), "{:?} delivered twice after {:?}", pair, ops);
        }

        for key in 0..KEYS {
            for tenant in 0..TENANTS {
                let id = doc_id(key, tenant);
                if let Some(document) = harness.db.get(&id).unwrap() {
                    let latest = (id.to_lowercase(), document.change_vector.version());
                    prop_assert!(seen.contains(&latest), "{:?} never delivered after {:?}", latest, ops);
                }
            }
        }
    }
}
