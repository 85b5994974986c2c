//! Batch production: which candidates to send, defer or drop.
//!
//! A processor builds one batch at a time. [`SubscriptionProcessor::get_batch`]
//! decides, [`SubscriptionProcessor::record_batch`] persists the decisions
//! before anything reaches the client, and the batch is then either
//! acknowledged or dropped.

use super::fetcher::{DocumentFetcher, FetchedItem};
use super::filter::{DocumentFilter, FilterOutcome, FilterRegistry};
use super::orchestrator::OrchestratedProcessor;
use super::state::{BatchRecord, SubscriptionConnectionsState};
use super::types::{FetchOrigin, ProcessedItem};
use crate::change_vector::{conflict_status, ChangeVector, ChangeVectorMode, ConflictStatus};
use crate::cluster::{
    BatchDocument, BucketOwnership, DeferredItem, OwnerPosition, ResendItem, ShardingConfiguration,
    SubscriptionState,
};
use crate::documents::DocumentsStorage;
use crate::error::{Result, SubscriptionError};
use crate::sharding::ShardDirectory;
use crate::types::{BatchId, Bucket, DatabaseId, Document, DocumentId, Etag, NodeTag, RaftIndex, ShardNumber};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Bounds on one batch.
#[derive(Clone, Copy, Debug)]
pub struct BatchLimits {
    pub max_docs: usize,
    pub max_memory: usize,
    pub page_size: usize,
}

/// The capability a connection drives, selected when the connection is built.
pub enum SubscriptionProcessor {
    /// Reads a database or shard directly.
    Documents(DocumentsProcessor),
    /// Forwards batches produced by shard workers.
    Orchestrated(OrchestratedProcessor),
}

impl SubscriptionProcessor {
    pub fn get_batch(&mut self) -> Result<Vec<ProcessedItem>> {
        match self {
            SubscriptionProcessor::Documents(processor) => processor.get_batch(),
            SubscriptionProcessor::Orchestrated(processor) => processor.get_batch(),
        }
    }

    /// Persist the batch just produced. Returns its id when it sends documents.
    pub fn record_batch(&mut self) -> Result<Option<BatchId>> {
        match self {
            SubscriptionProcessor::Documents(processor) => processor.record_batch(),
            SubscriptionProcessor::Orchestrated(processor) => processor.record_batch(),
        }
    }

    pub fn acknowledge_batch(&mut self, batch: BatchId) -> Result<()> {
        match self {
            SubscriptionProcessor::Documents(processor) => processor.acknowledge_batch(batch),
            SubscriptionProcessor::Orchestrated(processor) => processor.acknowledge_batch(batch),
        }
    }

    pub fn drop_batch(&mut self, batch: BatchId) -> Result<()> {
        match self {
            SubscriptionProcessor::Documents(processor) => processor.drop_batch(batch),
            SubscriptionProcessor::Orchestrated(processor) => processor.drop_batch(batch),
        }
    }

    /// Merged storage progress of the current batch.
    pub fn last_change_vector_in_batch(&self) -> ChangeVector {
        match self {
            SubscriptionProcessor::Documents(processor) => processor.last_change_vector_in_batch(),
            SubscriptionProcessor::Orchestrated(processor) => processor.last_change_vector_in_batch(),
        }
    }

    /// After an empty cycle: did documents arrive past the scan position?
    pub fn found_about_more_docs(&self) -> bool {
        match self {
            SubscriptionProcessor::Documents(processor) => processor.found_about_more_docs(),
            SubscriptionProcessor::Orchestrated(_) => false,
        }
    }

    /// After an empty cycle: is there nothing left that could ever be sent?
    pub fn no_docs_left(&self) -> bool {
        match self {
            SubscriptionProcessor::Documents(_) => true,
            SubscriptionProcessor::Orchestrated(processor) => processor.no_docs_left(),
        }
    }

    /// Called when a heartbeat goes out instead of a batch.
    pub fn noop_ack(&self) -> Result<()> {
        match self {
            SubscriptionProcessor::Documents(processor) => processor.state.touch(),
            SubscriptionProcessor::Orchestrated(_) => Ok(()),
        }
    }
}

/// What to do with one candidate.
enum Decision {
    Send {
        document: Document,
        error: Option<String>,
    },
    Skip(&'static str),
    /// Queue for resend; `owner` lets the record drop it if the owner already passed its copy.
    Defer {
        owner: Option<OwnerPosition>,
        reason: &'static str,
    },
    /// Drop the resend entry that produced this candidate.
    Remove(&'static str),
    /// Leave the resend entry for a later cycle.
    Keep(&'static str),
}

/// Everything a cycle needs to know about the subscription, read in one go.
struct Snapshot {
    subscription: SubscriptionState,
    sharding: Option<ShardingConfiguration>,
    db_ids: BTreeMap<ShardNumber, DatabaseId>,
}

impl Snapshot {
    fn ownership(&self, bucket: Bucket, shard: ShardNumber) -> BucketOwnership {
        match &self.sharding {
            Some(sharding) => sharding.ownership(bucket, shard),
            None => BucketOwnership::Owned,
        }
    }

    fn observed_sharding_index(&self) -> RaftIndex {
        self.sharding
            .as_ref()
            .map(|sharding| sharding.last_migration_change)
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct BatchBuilder {
    items: Vec<ProcessedItem>,
    record: BatchRecord,
    /// Version placed in this batch per id.
    in_batch: HashMap<DocumentId, ChangeVector>,
    size: usize,
}

impl BatchBuilder {
    fn is_full(&self, limits: &BatchLimits) -> bool {
        self.items.len() >= limits.max_docs || self.size >= limits.max_memory
    }

    fn push(&mut self, document: Document, error: Option<String>, origin: FetchOrigin) {
        self.size += document.size();
        self.in_batch
            .insert(document.id.clone(), document.change_vector.clone());
        self.record.documents.push(BatchDocument {
            id: document.id.clone(),
            change_vector: document.change_vector.clone(),
            bucket: document.bucket,
        });
        self.items.push(ProcessedItem {
            document,
            error,
            origin,
        });
    }
}

/// Produces batches from one database or shard.
pub struct DocumentsProcessor {
    storage: Arc<DocumentsStorage>,
    state: Arc<SubscriptionConnectionsState>,
    filters: Arc<FilterRegistry>,
    directory: Option<Arc<ShardDirectory>>,
    node: NodeTag,
    connection: u64,
    limits: BatchLimits,
    pending: Option<BatchRecord>,
    last_change_vector_in_batch: ChangeVector,
}

impl DocumentsProcessor {
    pub fn new(
        storage: Arc<DocumentsStorage>,
        state: Arc<SubscriptionConnectionsState>,
        filters: Arc<FilterRegistry>,
        directory: Option<Arc<ShardDirectory>>,
        node: NodeTag,
        connection: u64,
        limits: BatchLimits,
    ) -> Self {
        Self {
            storage,
            state,
            filters,
            directory,
            node,
            connection,
            limits,
            pending: None,
            last_change_vector_in_batch: ChangeVector::empty(),
        }
    }

    pub fn state(&self) -> &Arc<SubscriptionConnectionsState> {
        &self.state
    }

    fn shard(&self) -> ShardNumber {
        self.state.shard()
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let id = self.state.subscription_id();
        let (subscription, sharding) = self
            .state
            .cluster()
            .read(|record| {
                let db = record.database(self.state.database()).filter(|db| !db.deleted)?;
                Some((db.subscription_by_id(id)?.clone(), db.sharding.clone()))
            })
            .ok_or_else(|| SubscriptionError::DoesNotExist(self.state.subscription_name().to_string()))?;

        let db_ids = match &sharding {
            Some(sharding) => sharding.shards.clone(),
            None => {
                if self.directory.is_some() {
                    return Err(SubscriptionError::InvalidState(format!(
                        "database '{}' is no longer sharded",
                        self.state.database()
                    )));
                }
                let mut ids = BTreeMap::new();
                ids.insert(self.shard(), self.storage.db_id().clone());
                ids
            }
        };

        Ok(Snapshot {
            subscription,
            sharding,
            db_ids,
        })
    }

    fn filter(&self, subscription: &SubscriptionState) -> Result<Option<Arc<dyn DocumentFilter>>> {
        match &subscription.query.filter {
            Some(name) => self
                .filters
                .get(name)
                .map(Some)
                .ok_or_else(|| SubscriptionError::InvalidState(format!("filter '{}' is not registered", name))),
            None => Ok(None),
        }
    }

    pub fn get_batch(&mut self) -> Result<Vec<ProcessedItem>> {
        let snapshot = self.snapshot()?;
        let filter = self.filter(&snapshot.subscription)?;
        let shard = self.shard();
        let positions = snapshot.subscription.positions(&snapshot.db_ids);
        let start_after = snapshot
            .subscription
            .progress_with_pending(shard)
            .etag_for(self.storage.db_id());
        let resend: Vec<ResendItem> = snapshot
            .subscription
            .resend
            .values()
            .filter(|entry| snapshot.ownership(entry.bucket, shard) == BucketOwnership::Owned)
            .cloned()
            .collect();

        let mut batch = BatchBuilder::default();
        let mut storage_progress = ChangeVector::empty();

        let ctx = self.storage.open_read();
        {
            let fetcher = DocumentFetcher::new(
                &self.storage,
                &ctx,
                snapshot.subscription.query.collection.clone(),
                start_after,
                resend,
                self.limits.page_size,
            );
            for fetched in fetcher {
                if batch.is_full(&self.limits) {
                    break;
                }
                match fetched {
                    FetchedItem::Storage(document) => {
                        storage_progress = storage_progress
                            .merge(&ChangeVector::new(self.node.as_str(), document.etag, self.storage.db_id()))
                            .merge(&document.change_vector);
                        let decision =
                            self.decide_storage(&snapshot, &positions, &batch, filter.as_deref(), &document);
                        self.apply_storage(&mut batch, document, decision);
                    }
                    FetchedItem::Resend { entry, current } => {
                        let decision = self.decide_resend(
                            &snapshot,
                            &positions,
                            filter.as_deref(),
                            &entry,
                            current.document,
                        );
                        self.apply_resend(&mut batch, entry, decision);
                    }
                }
            }
        }
        ctx.commit();

        batch.record.last_change_vector = storage_progress.clone();
        batch.record.observed_sharding_index = snapshot.observed_sharding_index();
        self.last_change_vector_in_batch = storage_progress;

        debug!(
            subscription = %self.state.subscription_name(),
            shard = shard.0,
            connection = self.connection,
            documents = batch.items.len(),
            deferred = batch.record.deferred.len(),
            removed = batch.record.removed_from_resend.len(),
            "batch prepared"
        );
        self.pending = Some(batch.record);
        Ok(batch.items)
    }

    fn decide_storage(
        &self,
        snapshot: &Snapshot,
        positions: &ChangeVector,
        batch: &BatchBuilder,
        filter: Option<&dyn DocumentFilter>,
        document: &Document,
    ) -> Decision {
        if conflict_status(&document.change_vector.version(), positions, ChangeVectorMode::Order)
            == ConflictStatus::AlreadyMerged
        {
            return Decision::Skip("already scanned by the shard that wrote it");
        }

        if let Some(sent) = batch.in_batch.get(&document.id) {
            if *sent == document.change_vector {
                return Decision::Skip("already in this batch");
            }
            return Decision::Defer {
                owner: None,
                reason: "another version is in this batch",
            };
        }

        match snapshot.ownership(document.bucket, self.shard()) {
            BucketOwnership::ActiveMigration => {
                return Decision::Defer {
                    owner: None,
                    reason: "bucket is migrating",
                }
            }
            BucketOwnership::NotOwned(owner) => {
                return Decision::Defer {
                    owner: self.owner_position(owner, &document.id),
                    reason: "bucket belongs to another shard",
                }
            }
            BucketOwnership::Owned => {}
        }

        if snapshot.subscription.in_active_batch(&document.id) {
            return Decision::Defer {
                owner: None,
                reason: "in another connection's active batch",
            };
        }

        match run_filter(filter, document) {
            FilterResult::Rejected => Decision::Skip("rejected by filter"),
            FilterResult::Send { document, error } => Decision::Send { document, error },
        }
    }

    fn decide_resend(
        &self,
        snapshot: &Snapshot,
        positions: &ChangeVector,
        filter: Option<&dyn DocumentFilter>,
        entry: &ResendItem,
        current: Option<Document>,
    ) -> Decision {
        if snapshot.subscription.in_active_batch(&entry.id) {
            return Decision::Keep("in an active batch");
        }

        let current = match current {
            Some(document) => document,
            None => return Decision::Remove("document was deleted"),
        };
        if !current.in_collection(snapshot.subscription.query.collection.as_deref()) {
            return Decision::Remove("document left the collection");
        }

        match conflict_status(&current.change_vector, &entry.change_vector, ChangeVectorMode::Version) {
            ConflictStatus::AlreadyMerged => {}
            ConflictStatus::Conflict => {
                warn!(
                    subscription = %self.state.subscription_name(),
                    shard = self.shard().0,
                    id = %entry.id,
                    current = %current.change_vector,
                    queued = %entry.change_vector,
                    "resend entry conflicts with the stored document"
                );
                return Decision::Keep("conflicts with the stored document");
            }
            ConflictStatus::Update => {
                let status = conflict_status(
                    &current.change_vector.version(),
                    positions,
                    ChangeVectorMode::Order,
                );
                if status == ConflictStatus::Update {
                    return Decision::Remove("newer version is ahead of the scan");
                }
            }
        }

        match run_filter(filter, &current) {
            FilterResult::Rejected => Decision::Remove("rejected by filter"),
            FilterResult::Send { mut document, error } => {
                document.etag = Etag(0);
                Decision::Send { document, error }
            }
        }
    }

    fn owner_position(&self, owner: ShardNumber, id: &DocumentId) -> Option<OwnerPosition> {
        let storage = self.directory.as_ref()?.storage(owner)?;
        let current = storage.get_document_or_tombstone(id);
        let etag = current
            .document
            .map(|doc| doc.etag)
            .or_else(|| current.tombstone.map(|tombstone| tombstone.etag))?;
        Some(OwnerPosition { shard: owner, etag })
    }

    fn apply_storage(&self, batch: &mut BatchBuilder, document: Document, decision: Decision) {
        match decision {
            Decision::Send { document, error } => batch.push(document, error, FetchOrigin::Storage),
            Decision::Defer { owner, reason } => {
                trace!(
                    subscription = %self.state.subscription_name(),
                    shard = self.shard().0,
                    id = %document.id,
                    reason,
                    "deferred to resend"
                );
                batch.record.deferred.push(DeferredItem {
                    item: ResendItem {
                        id: document.id,
                        change_vector: document.change_vector,
                        bucket: document.bucket,
                    },
                    owner,
                });
            }
            Decision::Skip(reason) | Decision::Remove(reason) | Decision::Keep(reason) => {
                trace!(
                    subscription = %self.state.subscription_name(),
                    shard = self.shard().0,
                    id = %document.id,
                    reason,
                    "skipped"
                );
            }
        }
    }

    fn apply_resend(&self, batch: &mut BatchBuilder, entry: ResendItem, decision: Decision) {
        match decision {
            Decision::Send { document, error } => batch.push(document, error, FetchOrigin::Resend),
            Decision::Remove(reason) => {
                debug!(
                    subscription = %self.state.subscription_name(),
                    shard = self.shard().0,
                    id = %entry.id,
                    reason,
                    "removed from resend"
                );
                batch.record.removed_from_resend.push(entry);
            }
            Decision::Skip(reason) | Decision::Keep(reason) | Decision::Defer { reason, .. } => {
                trace!(
                    subscription = %self.state.subscription_name(),
                    shard = self.shard().0,
                    id = %entry.id,
                    reason,
                    "kept in resend"
                );
            }
        }
    }

    pub fn record_batch(&mut self) -> Result<Option<BatchId>> {
        let record = match self.pending.take() {
            Some(record) if !record.is_empty() => record,
            _ => return Ok(None),
        };
        self.state.record_batch(self.connection, &self.node, record)
    }

    pub fn acknowledge_batch(&mut self, batch: BatchId) -> Result<()> {
        self.state.acknowledge_batch(batch)
    }

    pub fn drop_batch(&mut self, batch: BatchId) -> Result<()> {
        self.state.drop_batch(batch)
    }

    pub fn last_change_vector_in_batch(&self) -> ChangeVector {
        self.last_change_vector_in_batch.clone()
    }

    pub fn found_about_more_docs(&self) -> bool {
        let collection = self
            .state
            .subscription()
            .ok()
            .and_then(|subscription| subscription.query.collection);
        let last = self.storage.read_last_document_etag(collection.as_deref());
        last > self.state.last_etag_sent(self.storage.db_id())
    }
}

enum FilterResult {
    Rejected,
    Send {
        document: Document,
        error: Option<String>,
    },
}

/// A failing filter still sends the document, as an error item without payload.
fn run_filter(filter: Option<&dyn DocumentFilter>, document: &Document) -> FilterResult {
    let filter = match filter {
        Some(filter) => filter,
        None => {
            return FilterResult::Send {
                document: document.clone(),
                error: None,
            }
        }
    };

    match filter.apply(document) {
        Ok(FilterOutcome::Rejected) => FilterResult::Rejected,
        Ok(FilterOutcome::Accepted(projection)) => {
            let mut document = document.clone();
            if projection.is_some() {
                document.data = projection;
            }
            FilterResult::Send {
                document,
                error: None,
            }
        }
        Err(e) => {
            let error = SubscriptionError::Script {
                id: document.id.clone(),
                message: e.to_string(),
            };
            let mut document = document.clone();
            document.data = None;
            FilterResult::Send {
                document,
                error: Some(error.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{bucket_for, Cluster, ClusterCommand, SubscriptionQuery};
    use crate::subscriptions::filter::ScriptError;
    use crate::types::DocumentId;
    use serde_json::json;

    struct Fixture {
        cluster: Arc<Cluster>,
        storage: Arc<DocumentsStorage>,
        filters: Arc<FilterRegistry>,
    }

    impl Fixture {
        fn new(query: SubscriptionQuery) -> Self {
            let cluster = Arc::new(Cluster::new("A"));
            cluster
                .execute(ClusterCommand::PutDatabase {
                    name: "db".into(),
                    members: vec![NodeTag::from("A")],
                    shard_count: None,
                })
                .unwrap();
            cluster
                .execute(ClusterCommand::PutSubscription {
                    database: "db".into(),
                    name: "sub".into(),
                    query,
                    mentor_node: None,
                    disabled: false,
                    initial_progress: BTreeMap::new(),
                })
                .unwrap();
            let storage = Arc::new(DocumentsStorage::new(
                "db",
                DatabaseId::for_name("db"),
                NodeTag::from("A"),
            ));
            Self {
                cluster,
                storage,
                filters: Arc::new(FilterRegistry::new()),
            }
        }

        fn put(&self, id: &str, collection: &str, data: serde_json::Value) -> Document {
            self.storage
                .put(DocumentId::new(id), collection.into(), data, bucket_for(id))
        }

        fn processor(&self, connection: u64, max_docs: usize) -> DocumentsProcessor {
            let subscription = self.cluster.subscription("db", "sub").unwrap();
            let state = Arc::new(SubscriptionConnectionsState::new(
                "db",
                ShardNumber(0),
                &subscription,
                self.cluster.clone(),
            ));
            DocumentsProcessor::new(
                self.storage.clone(),
                state,
                self.filters.clone(),
                None,
                NodeTag::from("A"),
                connection,
                BatchLimits {
                    max_docs,
                    max_memory: usize::MAX,
                    page_size: 2,
                },
            )
        }

        fn subscription(&self) -> SubscriptionState {
            self.cluster.subscription("db", "sub").unwrap()
        }
    }

    fn ids(items: &[ProcessedItem]) -> Vec<String> {
        items.iter().map(|item| item.document.id.to_string()).collect()
    }

    #[test]
    fn test_batches_follow_scan_and_ack() {
        let fixture = Fixture::new(SubscriptionQuery::default());
        for i in 1..=3 {
            fixture.put(&format!("users/{}", i), "Users", json!({ "n": i }));
        }

        let mut processor = fixture.processor(1, 2);
        let items = processor.get_batch().unwrap();
        assert_eq!(ids(&items), vec!["users/1", "users/2"]);
        let batch = processor.record_batch().unwrap().unwrap();

        // The pending batch already moves the scan position.
        let items = processor.get_batch().unwrap();
        assert_eq!(ids(&items), vec!["users/3"]);
        let second = processor.record_batch().unwrap().unwrap();

        processor.acknowledge_batch(batch).unwrap();
        processor.acknowledge_batch(second).unwrap();
        assert!(processor.get_batch().unwrap().is_empty());
        assert_eq!(processor.record_batch().unwrap(), None);
        assert!(fixture.subscription().active_batches.is_empty());
        assert!(!processor.found_about_more_docs());

        fixture.put("users/4", "Users", json!({}));
        assert!(processor.found_about_more_docs());
    }

    #[test]
    fn test_dropped_batch_is_resent() {
        let fixture = Fixture::new(SubscriptionQuery::default());
        fixture.put("users/1", "Users", json!({}));

        let mut processor = fixture.processor(1, 10);
        assert_eq!(processor.get_batch().unwrap().len(), 1);
        let batch = processor.record_batch().unwrap().unwrap();
        processor.drop_batch(batch).unwrap();
        assert_eq!(fixture.subscription().resend.len(), 1);

        let items = processor.get_batch().unwrap();
        assert_eq!(ids(&items), vec!["users/1"]);
        assert_eq!(items[0].origin, FetchOrigin::Resend);
        assert!(items[0].document.etag.is_zero());
        let batch = processor.record_batch().unwrap().unwrap();
        processor.acknowledge_batch(batch).unwrap();
        assert!(fixture.subscription().resend.is_empty());
    }

    #[test]
    fn test_concurrent_connection_defers_active_documents() {
        let fixture = Fixture::new(SubscriptionQuery::default());
        fixture.put("users/1", "Users", json!({}));

        let mut first = fixture.processor(1, 10);
        first.get_batch().unwrap();
        let batch = first.record_batch().unwrap().unwrap();

        // Updated while the first connection holds the old version.
        fixture.put("users/1", "Users", json!({ "v": 2 }));
        let mut second = fixture.processor(2, 10);
        assert!(second.get_batch().unwrap().is_empty());
        second.record_batch().unwrap();
        assert_eq!(fixture.subscription().resend.len(), 1);

        first.acknowledge_batch(batch).unwrap();
        let items = second.get_batch().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].document.data, Some(json!({ "v": 2 })));
    }

    #[test]
    fn test_deleted_resend_entry_is_removed() {
        let fixture = Fixture::new(SubscriptionQuery::default());
        fixture.put("users/1", "Users", json!({}));

        let mut processor = fixture.processor(1, 10);
        processor.get_batch().unwrap();
        let batch = processor.record_batch().unwrap().unwrap();
        processor.drop_batch(batch).unwrap();
        fixture.storage.delete(&DocumentId::new("users/1"));

        assert!(processor.get_batch().unwrap().is_empty());
        processor.record_batch().unwrap();
        assert!(fixture.subscription().resend.is_empty());
    }

    #[test]
    fn test_filter_rejection_and_errors() {
        let fixture = Fixture::new(SubscriptionQuery {
            collection: Some("users".into()),
            filter: Some("adults".into()),
        });
        fixture.filters.register(
            "adults",
            Arc::new(|doc: &Document| -> std::result::Result<FilterOutcome, ScriptError> {
                match doc.data.as_ref().and_then(|data| data["age"].as_i64()) {
                    Some(age) if age >= 18 => Ok(FilterOutcome::Accepted(Some(json!({ "age": age })))),
                    Some(_) => Ok(FilterOutcome::Rejected),
                    None => Err(ScriptError("age missing".into())),
                }
            }),
        );
        fixture.put("users/1", "Users", json!({ "age": 30, "name": "a" }));
        fixture.put("users/2", "Users", json!({ "age": 3 }));
        fixture.put("users/3", "Users", json!({ "name": "c" }));
        fixture.put("orders/1", "Orders", json!({ "age": 40 }));

        let mut processor = fixture.processor(1, 10);
        let items = processor.get_batch().unwrap();
        assert_eq!(ids(&items), vec!["users/1", "users/3"]);
        assert_eq!(items[0].document.data, Some(json!({ "age": 30 })));
        assert!(items[1].document.data.is_none());
        assert!(items[1].error.as_deref().unwrap().contains("age missing"));
        assert!(!processor.last_change_vector_in_batch().is_empty());
    }

    #[test]
    fn test_missing_filter_is_invalid_state() {
        let fixture = Fixture::new(SubscriptionQuery {
            collection: None,
            filter: Some("nope".into()),
        });
        let mut processor = fixture.processor(1, 10);
        assert!(matches!(
            processor.get_batch(),
            Err(SubscriptionError::InvalidState(_))
        ));
    }
}
