//! Replicated state of one subscription.

use crate::change_vector::{conflict_status, ChangeVector, ChangeVectorMode, ConflictStatus};
use crate::types::{BatchId, Bucket, DatabaseId, DocumentId, NodeTag, RaftIndex, ShardNumber, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Subscription identifier: the index of the command that created it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a subscription selects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionQuery {
    /// Collection to read from; `None` reads every collection.
    pub collection: Option<String>,
    /// Name of a registered filter applied to each candidate document.
    pub filter: Option<String>,
}

/// A document that must be delivered again, keyed by id in the resend queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResendItem {
    pub id: DocumentId,
    pub change_vector: ChangeVector,
    pub bucket: Bucket,
}

/// A document inside an unacknowledged batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchDocument {
    pub id: DocumentId,
    pub change_vector: ChangeVector,
    pub bucket: Bucket,
}

impl From<BatchDocument> for ResendItem {
    fn from(doc: BatchDocument) -> Self {
        ResendItem {
            id: doc.id,
            change_vector: doc.change_vector,
            bucket: doc.bucket,
        }
    }
}

/// A recorded batch waiting for the client's acknowledgement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveBatch {
    pub id: BatchId,
    pub shard: ShardNumber,
    pub connection: u64,
    pub node: NodeTag,
    pub documents: Vec<BatchDocument>,
    /// Scan progress that becomes committed once the batch is acked or dropped.
    pub pending_progress: ChangeVector,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub id: SubscriptionId,
    pub name: String,
    pub query: SubscriptionQuery,
    pub disabled: bool,
    pub mentor_node: Option<NodeTag>,
    /// Committed scan progress per shard. Non-sharded databases use shard 0.
    pub progress: BTreeMap<ShardNumber, ChangeVector>,
    pub resend: BTreeMap<DocumentId, ResendItem>,
    pub active_batches: BTreeMap<BatchId, ActiveBatch>,
    pub last_client_activity: Option<Timestamp>,
    pub last_batch_ack_time: Option<Timestamp>,
    pub created_at: Timestamp,
    /// Index of the last command that changed this subscription.
    pub raft_index: RaftIndex,
}

impl SubscriptionState {
    pub fn new(
        id: SubscriptionId,
        name: impl Into<String>,
        query: SubscriptionQuery,
        mentor_node: Option<NodeTag>,
        progress: BTreeMap<ShardNumber, ChangeVector>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            query,
            disabled: false,
            mentor_node,
            progress,
            resend: BTreeMap::new(),
            active_batches: BTreeMap::new(),
            last_client_activity: None,
            last_batch_ack_time: None,
            created_at: Timestamp::now(),
            raft_index: RaftIndex(id.0),
        }
    }

    /// Committed progress of one shard merged with its unacknowledged batches.
    pub fn progress_with_pending(&self, shard: ShardNumber) -> ChangeVector {
        let committed = self.progress.get(&shard).cloned().unwrap_or_default();
        self.active_batches
            .values()
            .filter(|batch| batch.shard == shard)
            .fold(committed, |acc, batch| acc.merge(&batch.pending_progress))
    }

    /// Scan position of every shard as one vector: each shard contributes the
    /// entry for its own database id.
    ///
    /// An item whose version this vector already covers was scanned by some
    /// shard, so it was either delivered or deferred there.
    pub fn positions(&self, db_ids: &BTreeMap<ShardNumber, DatabaseId>) -> ChangeVector {
        let entries = db_ids.iter().filter_map(|(shard, db_id)| {
            self.progress_with_pending(*shard).entry_for(db_id)
        });
        ChangeVector::from_entries(entries)
    }

    pub fn in_active_batch(&self, id: &DocumentId) -> bool {
        self.active_batches
            .values()
            .any(|batch| batch.documents.iter().any(|doc| &doc.id == id))
    }

    /// Insert into the resend queue unless an existing entry already covers it.
    pub(crate) fn add_to_resend(&mut self, item: ResendItem) {
        if let Some(existing) = self.resend.get(&item.id) {
            let status = conflict_status(
                &item.change_vector,
                &existing.change_vector,
                ChangeVectorMode::Version,
            );
            if status == ConflictStatus::AlreadyMerged {
                return;
            }
        }
        self.resend.insert(item.id.clone(), item);
    }

    pub(crate) fn commit_progress(&mut self, shard: ShardNumber, change_vector: &ChangeVector) {
        if change_vector.is_empty() {
            return;
        }
        let entry = self.progress.entry(shard).or_default();
        *entry = entry.merge(change_vector);
    }

    /// Fold a batch back into committed state and remove it.
    pub(crate) fn take_batch(&mut self, batch: BatchId) -> Option<ActiveBatch> {
        let batch = self.active_batches.remove(&batch)?;
        self.commit_progress(batch.shard, &batch.pending_progress);
        Some(batch)
    }
}
