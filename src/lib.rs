//! # Shardfeed
//!
//! Durable document subscriptions over sharded databases.
//!
//! A subscription is a server-side cursor that pushes documents to a worker
//! in batches and only moves forward once the worker acknowledges a batch.
//! Buckets of documents can migrate between shards while subscriptions run;
//! every document version is still delivered, and none is delivered twice
//! within a connection.
//!
//! ## Core Concepts
//!
//! - **Change vectors**: per-database etags ordering document versions
//! - **Cluster**: the replicated record of databases, subscriptions and migrations
//! - **Databases and shards**: document storage behind a transaction merger
//! - **Subscriptions**: connections, batch decisions, the resend queue
//!
//! ## Example
//!
//! ```ignore
//! use shardfeed::{Cluster, ClusterCommand, ServerConfig, ShardedDatabase};
//!
//! let cluster = Arc::new(Cluster::new("A"));
//! cluster.execute(ClusterCommand::PutDatabase {
//!     name: "shop".into(),
//!     members: vec!["A".into()],
//!     shard_count: Some(3),
//! })?;
//! let db = ShardedDatabase::open("shop", cluster, ServerConfig::default())?;
//!
//! db.create_subscription(SubscriptionCreationOptions {
//!     name: Some("orders".into()),
//!     collection: Some("Orders".into()),
//!     ..Default::default()
//! })?;
//! let handle = db
//!     .worker(SubscriptionWorkerOptions::new("orders"))?
//!     .spawn(|batch: &SubscriptionBatch| -> Result<()> {
//!         for item in &batch.items {
//!             println!("{}", item.id);
//!         }
//!         Ok(())
//!     })?;
//!
//! db.put("orders/1", "Orders", json!({ "total": 12 }))?;
//! db.move_bucket(db.bucket_of("orders/1"), ShardNumber(2))?;
//! ```

pub mod change_vector;
pub mod cluster;
pub mod config;
pub mod database;
pub mod documents;
pub mod error;
pub mod journal;
pub mod sharding;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use change_vector::{conflict_status, ChangeVector, ChangeVectorEntry, ChangeVectorMode, ConflictStatus};
pub use cluster::{
    bucket_for, Cluster, ClusterCommand, CommitIndexModification, DatabaseRecord, MigrationStatus,
    ShardBucketMigration, ShardingConfiguration, SubscriptionId, SubscriptionQuery, SubscriptionState,
};
pub use config::{JournalConfig, ServerConfig};
pub use database::Database;
pub use documents::{DeleteBucketResult, DocumentsStorage, StoredItem, TransactionMerger};
pub use error::{Result, SubscriptionError};
pub use sharding::{BucketMigrator, MigrationWatcher, ShardDirectory, ShardedDatabase};
pub use subscriptions::{
    BatchHandler, BatchItem, CancellationToken, ConnectionInfo, ConnectionPhase, ConnectionStats,
    DocumentFilter, FilterOutcome, OpeningStrategy, ScriptError, StartingPoint, SubscriptionBatch,
    SubscriptionCreationOptions, SubscriptionWorker, SubscriptionWorkerOptions, WorkerHandle,
};
pub use types::*;
