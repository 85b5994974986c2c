//! Performance benchmarks for change vectors, document writes and subscription catch-up.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use shardfeed::{
    bucket_for, conflict_status, ChangeVector, ChangeVectorEntry, ChangeVectorMode, Cluster, ClusterCommand,
    Database, DatabaseId, Etag, NodeTag, ServerConfig, ShardNumber, ShardedDatabase, SubscriptionBatch,
    SubscriptionCreationOptions, SubscriptionWorkerOptions,
};
use std::sync::Arc;

fn vector(width: u64, offset: u64) -> ChangeVector {
    ChangeVector::from_entries((0..width).map(|i| ChangeVectorEntry {
        node_tag: format!("N{}", i % 3),
        etag: i * 7 + offset,
        db_id: DatabaseId(format!("db{}", i)),
    }))
}

fn cluster(shard_count: Option<u32>) -> Arc<Cluster> {
    let cluster = Arc::new(Cluster::new("A"));
    cluster
        .execute(ClusterCommand::PutDatabase {
            name: "bench".into(),
            members: vec![NodeTag::from("A")],
            shard_count,
        })
        .unwrap();
    cluster
}

/// Benchmark merging vectors of varying width
fn bench_change_vector_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("change_vector_merge");

    for width in [3, 30, 300] {
        let a = vector(width, 0);
        let b = vector(width, 5);
        group.bench_with_input(BenchmarkId::new("entries", width), &width, |bench, _| {
            bench.iter(|| black_box(a.merge(&b)));
        });
    }

    group.finish();
}

/// Benchmark comparisons in both modes, including a migrated copy
fn bench_conflict_status(c: &mut Criterion) {
    let local = vector(30, 5);
    let remote = vector(30, 0);
    let position = ChangeVector::new("A", Etag(900), &DatabaseId("dest".into()));
    let migrated = ChangeVector::with_order(&remote, &position);

    c.bench_function("conflict_status_version", |b| {
        b.iter(|| black_box(conflict_status(&remote, &local, ChangeVectorMode::Version)));
    });
    c.bench_function("conflict_status_order", |b| {
        b.iter(|| black_box(conflict_status(&migrated, &local, ChangeVectorMode::Order)));
    });
    c.bench_function("change_vector_parse", |b| {
        let text = migrated.to_string();
        b.iter(|| black_box(text.parse::<ChangeVector>().unwrap()));
    });
}

/// Benchmark document writes through the transaction merger
fn bench_document_put(c: &mut Criterion) {
    let db = Database::open("bench", cluster(None), ServerConfig::default()).unwrap();
    let mut i = 0u64;

    c.bench_function("document_put", |b| {
        b.iter(|| {
            i += 1;
            black_box(db.put(&format!("users/{}", i), "Users", json!({ "seq": i })).unwrap());
        });
    });

    c.bench_function("bucket_for", |b| {
        b.iter(|| black_box(bucket_for("orders/1234$users/1")));
    });
}

/// Benchmark a fresh subscription reading an existing database to the end
fn bench_subscription_catch_up(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscription_catch_up");
    group.sample_size(10);

    for docs in [100, 1000] {
        group.bench_with_input(BenchmarkId::new("documents", docs), &docs, |b, &docs| {
            let db = Database::open("bench", cluster(None), ServerConfig::default()).unwrap();
            for i in 0..docs {
                db.put(&format!("users/{}", i), "Users", json!({ "seq": i })).unwrap();
            }

            let mut run = 0u64;
            b.iter(|| {
                run += 1;
                let name = db
                    .create_subscription(SubscriptionCreationOptions {
                        name: Some(format!("catch-up-{}", run)),
                        ..Default::default()
                    })
                    .unwrap();
                let mut options = SubscriptionWorkerOptions::new(name);
                options.close_when_no_docs_left = true;
                options.max_docs_per_batch = 256;

                let mut seen = 0usize;
                let mut handler = |batch: &SubscriptionBatch| -> shardfeed::Result<()> {
                    seen += batch.items.len();
                    Ok(())
                };
                db.worker(options).unwrap().run(&mut handler).unwrap();
                black_box(seen);
            });
        });
    }

    group.finish();
}

/// Benchmark moving a populated bucket back and forth between two shards
fn bench_bucket_migration(c: &mut Criterion) {
    let mut group = c.benchmark_group("bucket_migration");
    group.sample_size(10);

    for docs in [10, 200] {
        group.bench_with_input(BenchmarkId::new("documents", docs), &docs, |b, &docs| {
            let db = ShardedDatabase::open("bench", cluster(Some(2)), ServerConfig::default()).unwrap();
            for i in 0..docs {
                db.put(&format!("orders/{}$tenant", i), "Orders", json!({ "seq": i })).unwrap();
            }
            let bucket = db.bucket_of("tenant");

            b.iter(|| {
                let owner = db.write_shard_for(bucket).unwrap();
                let destination = ShardNumber(1 - owner.0);
                black_box(db.move_bucket(bucket, destination).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_change_vector_merge,
    bench_conflict_status,
    bench_document_put,
    bench_subscription_catch_up,
    bench_bucket_migration,
);

criterion_main!(benches);
