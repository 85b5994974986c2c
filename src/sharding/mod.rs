//! Sharded databases.
//!
//! A sharded database runs one [`Database`] per shard. Writes are routed by
//! bucket; subscription clients connect to the sharded database and are served
//! by an orchestrator that merges one subscription connection per shard.
//!
//! Buckets move between shards through [`ShardedDatabase::move_bucket`] or,
//! reactively, through a [`MigrationWatcher`].

mod migrator;

pub use migrator::{BucketMigrator, MigrationStep, MigrationWatcher};

use crate::change_vector::ChangeVector;
use crate::cluster::{
    bucket_for, shard_database_name, Cluster, ClusterCommand, SubscriptionId, SubscriptionState,
};
use crate::config::ServerConfig;
use crate::database::{put_subscription, Database, Placement};
use crate::documents::DocumentsStorage;
use crate::error::{Result, SubscriptionError};
use crate::subscriptions::{
    accept, duplex, invalidated_by, CancellationToken, ConnectionCoordination, ConnectionInfo,
    Connector, DocumentFilter, FilterRegistry, Invalidation, OrchestratedProcessor, RedeliveryGuard,
    ShardFeed, StartingPoint, SubscriptionCreationOptions, SubscriptionHost, SubscriptionProcessor,
    SubscriptionWorker, SubscriptionWorkerOptions, Transport,
};
use crate::types::{Bucket, Document, DocumentId, RaftIndex, ShardNumber, Tombstone};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Steps `move_bucket` runs before giving up on a migration.
const MAX_MIGRATION_ATTEMPTS: usize = 200;

/// Pause between migration steps that could not advance.
const MIGRATION_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Storage of every shard of one database, for lookups across shards.
pub struct ShardDirectory {
    database: String,
    shards: BTreeMap<ShardNumber, Arc<DocumentsStorage>>,
}

impl ShardDirectory {
    pub fn new(database: impl Into<String>, shards: BTreeMap<ShardNumber, Arc<DocumentsStorage>>) -> Self {
        Self {
            database: database.into(),
            shards,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn storage(&self, shard: ShardNumber) -> Option<&Arc<DocumentsStorage>> {
        self.shards.get(&shard)
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardNumber> + '_ {
        self.shards.keys().copied()
    }
}

/// Orchestrator-side state of one subscription.
struct Orchestration {
    name: String,
    coordination: Arc<ConnectionCoordination>,
    guard: Arc<RedeliveryGuard>,
}

pub struct ShardedDatabase {
    name: String,
    cluster: Arc<Cluster>,
    config: ServerConfig,
    shards: BTreeMap<ShardNumber, Arc<Database>>,
    directory: Arc<ShardDirectory>,
    filters: Arc<FilterRegistry>,
    orchestrations: RwLock<HashMap<SubscriptionId, Arc<Orchestration>>>,
    /// Buckets of recently written ids.
    bucket_cache: Mutex<LruCache<String, Bucket>>,
    /// Held shared by writes across routing and applying; held exclusively
    /// while a migration switches a bucket's write shard.
    write_gate: Arc<RwLock<()>>,
    migrator: Arc<BucketMigrator>,
    watcher: Mutex<Option<MigrationWatcher>>,
    shutdown: CancellationToken,
    self_ref: Weak<ShardedDatabase>,
}

impl ShardedDatabase {
    pub fn open(name: &str, cluster: Arc<Cluster>, config: ServerConfig) -> Result<Arc<Self>> {
        let record = cluster
            .database(name)
            .filter(|db| !db.deleted)
            .ok_or_else(|| SubscriptionError::DatabaseDoesNotExist(name.to_string()))?;
        let sharding = record.sharding.clone().ok_or_else(|| {
            SubscriptionError::InvalidOperation(format!("database '{}' is not sharded", name))
        })?;

        let storages: BTreeMap<ShardNumber, Arc<DocumentsStorage>> = sharding
            .shards
            .iter()
            .map(|(shard, db_id)| {
                let storage = DocumentsStorage::new(
                    shard_database_name(&record.name, *shard),
                    db_id.clone(),
                    cluster.node_tag().clone(),
                );
                (*shard, Arc::new(storage))
            })
            .collect();
        let directory = Arc::new(ShardDirectory::new(record.name.clone(), storages.clone()));
        let filters = Arc::new(FilterRegistry::new());
        let shutdown = CancellationToken::new();

        let mut shards = BTreeMap::new();
        for (shard, storage) in storages {
            let db = Database::start(
                storage,
                Placement {
                    database: record.name.clone(),
                    shard,
                    directory: Some(directory.clone()),
                    filters: filters.clone(),
                    shutdown: shutdown.child(),
                },
                cluster.clone(),
                config.clone(),
            )?;
            shards.insert(shard, db);
        }

        let write_gate = Arc::new(RwLock::new(()));
        let migrator = Arc::new(BucketMigrator::new(
            record.name.clone(),
            cluster.clone(),
            shards.clone(),
            write_gate.clone(),
            config.delete_bucket_batch_size,
        ));
        let cache_size = NonZeroUsize::new(config.bucket_cache_size).unwrap_or(NonZeroUsize::MIN);

        let db = Arc::new_cyclic(|self_ref| Self {
            name: record.name.clone(),
            cluster: cluster.clone(),
            config,
            shards,
            directory,
            filters,
            orchestrations: RwLock::new(HashMap::new()),
            bucket_cache: Mutex::new(LruCache::new(cache_size)),
            write_gate,
            migrator,
            watcher: Mutex::new(None),
            shutdown,
            self_ref: self_ref.clone(),
        });

        let listener = Arc::downgrade(&db);
        cluster.add_listener(Arc::new(move |command, index| {
            if let Some(db) = listener.upgrade() {
                db.on_cluster_command(command, index);
            }
        }));

        info!(database = %db.name, shards = db.shards.len(), "sharded database started");
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn shard(&self, shard: ShardNumber) -> Option<&Arc<Database>> {
        self.shards.get(&shard)
    }

    pub fn shards(&self) -> impl Iterator<Item = (ShardNumber, &Arc<Database>)> + '_ {
        self.shards.iter().map(|(shard, db)| (*shard, db))
    }

    pub fn directory(&self) -> &Arc<ShardDirectory> {
        &self.directory
    }

    pub fn migrator(&self) -> &Arc<BucketMigrator> {
        &self.migrator
    }

    pub fn bucket_of(&self, id: &str) -> Bucket {
        let key = id.to_lowercase();
        let mut cache = self.bucket_cache.lock();
        if let Some(bucket) = cache.get(&key) {
            return *bucket;
        }
        let bucket = bucket_for(&key);
        cache.put(key, bucket);
        bucket
    }

    /// The shard a write for `bucket` goes to right now.
    pub fn write_shard_for(&self, bucket: Bucket) -> Result<ShardNumber> {
        self.cluster
            .sharding(&self.name)
            .map(|sharding| sharding.write_shard_for(bucket))
            .ok_or_else(|| SubscriptionError::DatabaseDoesNotExist(self.name.clone()))
    }

    fn shard_db(&self, shard: ShardNumber) -> Result<&Arc<Database>> {
        self.shards.get(&shard).ok_or_else(|| {
            SubscriptionError::InvalidState(format!("shard {} of '{}' is not open", shard, self.name))
        })
    }

    // --- Documents ---

    pub fn put(&self, id: &str, collection: &str, data: serde_json::Value) -> Result<Document> {
        let bucket = self.bucket_of(id);
        let _gate = self.write_gate.read();
        let shard = self.write_shard_for(bucket)?;
        self.shard_db(shard)?
            .merger()
            .put(DocumentId::new(id), collection, data, bucket)
    }

    pub fn delete(&self, id: &str) -> Result<Option<Tombstone>> {
        let bucket = self.bucket_of(id);
        let _gate = self.write_gate.read();
        let shard = self.write_shard_for(bucket)?;
        self.shard_db(shard)?.merger().delete(DocumentId::new(id))
    }

    pub fn get(&self, id: &str) -> Result<Option<Document>> {
        let bucket = self.bucket_of(id);
        let shard = self.write_shard_for(bucket)?;
        Ok(self.shard_db(shard)?.storage().get_document(&DocumentId::new(id)))
    }

    // --- Subscriptions ---

    pub fn register_filter(&self, name: &str, filter: Arc<dyn DocumentFilter>) {
        self.filters.register(name, filter);
    }

    /// Create (or update) a subscription on every shard. Returns its name.
    pub fn create_subscription(&self, options: SubscriptionCreationOptions) -> Result<String> {
        let mut initial_progress = BTreeMap::new();
        if options.starting_point == StartingPoint::LastDocument {
            for (shard, db) in &self.shards {
                let etag = db.storage().last_etag();
                if etag.is_zero() {
                    continue;
                }
                initial_progress.insert(
                    *shard,
                    ChangeVector::new(self.cluster.node_tag().as_str(), etag, db.storage().db_id()),
                );
            }
        }
        put_subscription(&self.cluster, &self.name, &self.filters, options, initial_progress)
    }

    pub fn subscription(&self, name: &str) -> Option<SubscriptionState> {
        self.cluster.subscription(&self.name, name)
    }

    pub fn delete_subscription(&self, name: &str) -> Result<RaftIndex> {
        self.cluster.execute(ClusterCommand::DeleteSubscription {
            database: self.name.clone(),
            name: name.to_string(),
        })
    }

    pub fn set_subscription_disabled(&self, name: &str, disabled: bool) -> Result<RaftIndex> {
        self.cluster.execute(ClusterCommand::ToggleSubscription {
            database: self.name.clone(),
            name: name.to_string(),
            disabled,
        })
    }

    /// Cancel every client connection of `name`. Shard connections end with them.
    pub fn drop_subscription_connections(
        &self,
        name: &str,
        reason: impl Fn() -> SubscriptionError,
    ) -> bool {
        let matching: Vec<Arc<Orchestration>> = self
            .orchestrations
            .read()
            .values()
            .filter(|orchestration| orchestration.name.eq_ignore_ascii_case(name))
            .cloned()
            .collect();
        for orchestration in &matching {
            orchestration.coordination.drop_connections(&reason);
        }
        !matching.is_empty()
    }

    /// Diagnostics of the client connections of `name`.
    pub fn subscription_connections(&self, name: &str) -> Vec<Arc<ConnectionInfo>> {
        self.orchestrations
            .read()
            .values()
            .filter(|orchestration| orchestration.name.eq_ignore_ascii_case(name))
            .flat_map(|orchestration| orchestration.coordination.connections())
            .map(|entry| entry.info)
            .collect()
    }

    pub fn worker(&self, options: SubscriptionWorkerOptions) -> Result<SubscriptionWorker> {
        let connector: Arc<dyn Connector> = self.self_arc()?;
        Ok(SubscriptionWorker::new(options, connector))
    }

    fn self_arc(&self) -> Result<Arc<ShardedDatabase>> {
        self.self_ref.upgrade().ok_or_else(|| {
            SubscriptionError::InvalidState(format!("database '{}' is shutting down", self.name))
        })
    }

    fn orchestration(&self, subscription: &SubscriptionState) -> Arc<Orchestration> {
        if let Some(orchestration) = self.orchestrations.read().get(&subscription.id) {
            return orchestration.clone();
        }
        self.orchestrations
            .write()
            .entry(subscription.id)
            .or_insert_with(|| {
                Arc::new(Orchestration {
                    name: subscription.name.clone(),
                    coordination: Arc::new(ConnectionCoordination::new()),
                    guard: Arc::new(RedeliveryGuard::new()),
                })
            })
            .clone()
    }

    // --- Resharding ---

    /// Move `bucket` to `destination` and wait until the source copy is gone.
    pub fn move_bucket(&self, bucket: Bucket, destination: ShardNumber) -> Result<RaftIndex> {
        let index = self.cluster.execute(ClusterCommand::StartBucketMigration {
            database: self.name.clone(),
            bucket,
            destination,
        })?;
        info!(database = %self.name, bucket = bucket.0, destination = destination.0, index = index.0, "bucket migration started");

        for _ in 0..MAX_MIGRATION_ATTEMPTS {
            let migration = match self.migrator.migration(bucket, index) {
                Some(migration) => migration,
                None => {
                    info!(database = %self.name, bucket = bucket.0, index = index.0, "bucket migration finished");
                    return Ok(index);
                }
            };
            if !self.migrator.advance(&migration)? && self.shutdown.sleep(MIGRATION_RETRY_DELAY) {
                return Err(SubscriptionError::Cancelled);
            }
        }
        Err(SubscriptionError::InvalidState(format!(
            "migration of bucket {} (index {}) did not complete",
            bucket, index
        )))
    }

    /// Advance migrations in the background whenever the cluster changes.
    pub fn start_migration_watcher(&self) -> Result<()> {
        let mut watcher = self.watcher.lock();
        if watcher.is_none() {
            *watcher = Some(MigrationWatcher::start(
                self.migrator.clone(),
                &self.cluster,
                self.config.heartbeat_interval,
                self.shutdown.child(),
            )?);
        }
        Ok(())
    }

    fn on_cluster_command(&self, command: &ClusterCommand, index: RaftIndex) {
        if !command.database().eq_ignore_ascii_case(&self.name) {
            return;
        }
        let orchestrations: Vec<(SubscriptionId, Arc<Orchestration>)> = self
            .orchestrations
            .read()
            .iter()
            .map(|(id, orchestration)| (*id, orchestration.clone()))
            .collect();

        for (id, orchestration) in orchestrations {
            if settles_batches(command, id) {
                if let Some(state) = self.cluster.subscription_by_id(&self.name, id) {
                    orchestration.guard.prune(&state);
                }
            }
            let invalidation =
                match invalidated_by(command, index, &self.cluster, &self.name, &orchestration.name) {
                    Some(invalidation) => invalidation,
                    None => continue,
                };
            debug!(
                database = %self.name,
                subscription = %orchestration.name,
                reason = ?invalidation,
                "dropping orchestrated connections"
            );
            if matches!(
                invalidation,
                Invalidation::SubscriptionDeleted(_) | Invalidation::DatabaseDeleted(_)
            ) {
                self.orchestrations.write().remove(&id);
            }
            orchestration
                .coordination
                .drop_connections(|| invalidation.to_error());
        }

        if command.affects_eligibility() {
            for orchestration in self.orchestrations.read().values() {
                orchestration.coordination.notify_has_more_docs();
            }
        }
    }
}

/// Whether `command` may have committed or requeued batches of `subscription`.
fn settles_batches(command: &ClusterCommand, subscription: SubscriptionId) -> bool {
    match command {
        ClusterCommand::AcknowledgeBatch { subscription: id, .. }
        | ClusterCommand::DropBatch { subscription: id, .. } => *id == subscription,
        ClusterCommand::RecoverActiveBatches { .. } => true,
        _ => false,
    }
}

impl Connector for ShardedDatabase {
    fn connect(&self) -> Result<Transport> {
        let host: Arc<dyn SubscriptionHost> = self.self_arc()?;
        let (client, server) = duplex();
        accept(host, server)?;
        Ok(client)
    }
}

impl SubscriptionHost for ShardedDatabase {
    fn database_name(&self) -> &str {
        &self.name
    }

    fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn coordination(&self, subscription: &SubscriptionState) -> Result<Arc<ConnectionCoordination>> {
        Ok(self.orchestration(subscription).coordination.clone())
    }

    fn create_processor(
        &self,
        subscription: &SubscriptionState,
        options: &SubscriptionWorkerOptions,
        connection: u64,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionProcessor> {
        let orchestration = self.orchestration(subscription);
        let feeds = self
            .shards
            .iter()
            .map(|(shard, db)| {
                let connector: Arc<dyn Connector> = db.clone();
                ShardFeed {
                    shard: *shard,
                    connector,
                }
            })
            .collect();

        let processor = OrchestratedProcessor::start(
            options,
            feeds,
            orchestration.coordination.clone(),
            orchestration.guard.clone(),
            connection,
            cancel,
            self.config.heartbeat_interval,
        )?;
        Ok(SubscriptionProcessor::Orchestrated(processor))
    }
}

impl Drop for ShardedDatabase {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(watcher) = self.watcher.lock().take() {
            if let Err(e) = watcher.stop() {
                warn!(database = %self.name, error = %e, "migration watcher failed");
            }
        }
        debug!(database = %self.name, "sharded database stopped");
    }
}
