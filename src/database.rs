//! A database, or one shard of a sharded database, serving subscriptions.
//!
//! Writes go through the shard's [`TransactionMerger`]; every committed
//! merge wakes the subscription connections waiting for documents.

use crate::change_vector::ChangeVector;
use crate::cluster::{bucket_for, Cluster, ClusterCommand, SubscriptionQuery, SubscriptionState};
use crate::config::ServerConfig;
use crate::documents::{DocumentsStorage, TransactionMerger};
use crate::error::{Result, SubscriptionError};
use crate::sharding::ShardDirectory;
use crate::subscriptions::{
    accept, duplex, invalidated_by, BatchLimits, CancellationToken, ConnectionCoordination, ConnectionInfo,
    Connector, DocumentFilter, DocumentsProcessor, FilterRegistry, Invalidation, StartingPoint,
    SubscriptionCreationOptions, SubscriptionHost, SubscriptionManager, SubscriptionProcessor,
    SubscriptionWorker, SubscriptionWorkerOptions, Transport,
};
use crate::types::{Document, DocumentId, RaftIndex, ShardNumber, Tombstone};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Where a database instance sits: alone, or as one shard of a sharded database.
pub(crate) struct Placement {
    /// Name in the cluster record; shards share their sharded database's name.
    pub database: String,
    pub shard: ShardNumber,
    pub directory: Option<Arc<ShardDirectory>>,
    pub filters: Arc<FilterRegistry>,
    pub shutdown: CancellationToken,
}

pub struct Database {
    name: String,
    shard: ShardNumber,
    cluster: Arc<Cluster>,
    config: ServerConfig,
    storage: Arc<DocumentsStorage>,
    merger: TransactionMerger,
    manager: Arc<SubscriptionManager>,
    filters: Arc<FilterRegistry>,
    directory: Option<Arc<ShardDirectory>>,
    shutdown: CancellationToken,
    self_ref: Weak<Database>,
}

impl Database {
    /// Open a non-sharded database that already exists in the cluster record.
    pub fn open(name: &str, cluster: Arc<Cluster>, config: ServerConfig) -> Result<Arc<Self>> {
        let record = cluster
            .database(name)
            .filter(|db| !db.deleted)
            .ok_or_else(|| SubscriptionError::DatabaseDoesNotExist(name.to_string()))?;
        if record.is_sharded() {
            return Err(SubscriptionError::InvalidOperation(format!(
                "database '{}' is sharded; open it as a sharded database",
                name
            )));
        }

        let storage = Arc::new(DocumentsStorage::new(
            record.name.clone(),
            record.database_id.clone(),
            cluster.node_tag().clone(),
        ));
        Self::start(
            storage,
            Placement {
                database: record.name.clone(),
                shard: ShardNumber(0),
                directory: None,
                filters: Arc::new(FilterRegistry::new()),
                shutdown: CancellationToken::new(),
            },
            cluster,
            config,
        )
    }

    pub(crate) fn start(
        storage: Arc<DocumentsStorage>,
        placement: Placement,
        cluster: Arc<Cluster>,
        config: ServerConfig,
    ) -> Result<Arc<Self>> {
        let name = placement.database;
        let manager = Arc::new(SubscriptionManager::new(
            name.clone(),
            placement.shard,
            cluster.clone(),
        ));
        let on_commit = manager.clone();
        let merger = TransactionMerger::start(
            storage.clone(),
            config.merger_batch_limit,
            Arc::new(move || on_commit.notify_all()),
        )?;

        let db = Arc::new_cyclic(|self_ref| Self {
            name,
            shard: placement.shard,
            cluster: cluster.clone(),
            config,
            storage,
            merger,
            manager,
            filters: placement.filters,
            directory: placement.directory,
            shutdown: placement.shutdown,
            self_ref: self_ref.clone(),
        });

        let listener = Arc::downgrade(&db);
        cluster.add_listener(Arc::new(move |command, index| {
            if let Some(db) = listener.upgrade() {
                db.on_cluster_command(command, index);
            }
        }));

        info!(database = %db.name, shard = db.shard.0, "database started");
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn shard(&self) -> ShardNumber {
        self.shard
    }

    pub fn storage(&self) -> &Arc<DocumentsStorage> {
        &self.storage
    }

    pub(crate) fn merger(&self) -> &TransactionMerger {
        &self.merger
    }

    pub fn manager(&self) -> &Arc<SubscriptionManager> {
        &self.manager
    }

    // --- Documents ---

    pub fn put(&self, id: &str, collection: &str, data: serde_json::Value) -> Result<Document> {
        self.merger
            .put(DocumentId::new(id), collection, data, bucket_for(id))
    }

    pub fn delete(&self, id: &str) -> Result<Option<Tombstone>> {
        self.merger.delete(DocumentId::new(id))
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.storage.get_document(&DocumentId::new(id))
    }

    // --- Subscriptions ---

    pub fn register_filter(&self, name: &str, filter: Arc<dyn DocumentFilter>) {
        self.filters.register(name, filter);
    }

    /// Create (or update) a subscription. Returns its name.
    pub fn create_subscription(&self, options: SubscriptionCreationOptions) -> Result<String> {
        let mut initial_progress = BTreeMap::new();
        if options.starting_point == StartingPoint::LastDocument {
            let etag = self.storage.last_etag();
            if !etag.is_zero() {
                initial_progress.insert(
                    self.shard,
                    ChangeVector::new(self.cluster.node_tag().as_str(), etag, self.storage.db_id()),
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

    /// Cancel every open connection of `name`, each ending with the error `reason` builds.
    pub fn drop_subscription_connections(
        &self,
        name: &str,
        reason: impl Fn() -> SubscriptionError,
    ) -> bool {
        let mut dropped = false;
        for state in self.manager.states() {
            if state.subscription_name().eq_ignore_ascii_case(name) {
                dropped |= self.manager.drop_connections(state.subscription_id(), &reason);
            }
        }
        dropped
    }

    /// Diagnostics of the open connections of `name`.
    pub fn subscription_connections(&self, name: &str) -> Vec<Arc<ConnectionInfo>> {
        self.manager
            .states()
            .into_iter()
            .filter(|state| state.subscription_name().eq_ignore_ascii_case(name))
            .flat_map(|state| state.coordination().connections())
            .map(|entry| entry.info)
            .collect()
    }

    /// A worker connected to this database.
    pub fn worker(&self, options: SubscriptionWorkerOptions) -> Result<SubscriptionWorker> {
        let connector: Arc<dyn Connector> = self.self_arc()?;
        Ok(SubscriptionWorker::new(options, connector))
    }

    fn self_arc(&self) -> Result<Arc<Database>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| SubscriptionError::InvalidState(format!("database '{}' is shutting down", self.name)))
    }

    fn on_cluster_command(&self, command: &ClusterCommand, index: RaftIndex) {
        if !command.database().eq_ignore_ascii_case(&self.name) {
            return;
        }
        for state in self.manager.states() {
            let invalidation = match invalidated_by(
                command,
                index,
                &self.cluster,
                &self.name,
                state.subscription_name(),
            ) {
                Some(invalidation) => invalidation,
                None => continue,
            };
            debug!(
                database = %self.name,
                shard = self.shard.0,
                subscription = %state.subscription_name(),
                reason = ?invalidation,
                "dropping subscription connections"
            );
            match &invalidation {
                Invalidation::SubscriptionDeleted(_) | Invalidation::DatabaseDeleted(_) => {
                    self.manager
                        .remove(state.subscription_id(), || invalidation.to_error());
                }
                _ => {
                    self.manager
                        .drop_connections(state.subscription_id(), || invalidation.to_error());
                }
            }
        }
        if command.affects_eligibility() {
            self.manager.notify_all();
        }
    }
}

/// Validate and apply a subscription definition for `database`.
pub(crate) fn put_subscription(
    cluster: &Cluster,
    database: &str,
    filters: &FilterRegistry,
    options: SubscriptionCreationOptions,
    initial_progress: BTreeMap<ShardNumber, ChangeVector>,
) -> Result<String> {
    if let Some(filter) = &options.filter {
        if filters.get(filter).is_none() {
            return Err(SubscriptionError::InvalidOperation(format!(
                "filter '{}' is not registered",
                filter
            )));
        }
    }
    let name = options
        .name
        .unwrap_or_else(|| (cluster.last_committed_index().0 + 1).to_string());

    cluster.execute(ClusterCommand::PutSubscription {
        database: database.to_string(),
        name: name.clone(),
        query: SubscriptionQuery {
            collection: options.collection,
            filter: options.filter,
        },
        mentor_node: options.mentor_node,
        disabled: options.disabled,
        initial_progress,
    })?;
    info!(database, subscription = %name, "subscription stored");
    Ok(name)
}

impl Connector for Database {
    fn connect(&self) -> Result<Transport> {
        let host: Arc<dyn SubscriptionHost> = self.self_arc()?;
        let (client, server) = duplex();
        accept(host, server)?;
        Ok(client)
    }
}

impl SubscriptionHost for Database {
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
        Ok(self.manager.get_or_create(subscription).coordination().clone())
    }

    fn create_processor(
        &self,
        subscription: &SubscriptionState,
        options: &SubscriptionWorkerOptions,
        connection: u64,
        _cancel: &CancellationToken,
    ) -> Result<SubscriptionProcessor> {
        let state = self.manager.get_or_create(subscription);
        state.initialize()?;
        Ok(SubscriptionProcessor::Documents(DocumentsProcessor::new(
            self.storage.clone(),
            state,
            self.filters.clone(),
            self.directory.clone(),
            self.cluster.node_tag().clone(),
            connection,
            BatchLimits {
                max_docs: options.max_docs_per_batch.max(1),
                max_memory: self.config.max_batch_memory,
                page_size: self.config.fetch_page_size,
            },
        )))
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown.cancel();
        debug!(database = %self.name, shard = self.shard.0, "database stopped");
    }
}
