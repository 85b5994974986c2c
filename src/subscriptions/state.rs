//! State shared by all connections of one subscription on one host.
//!
//! [`ConnectionCoordination`] arbitrates between connections: which ones may
//! be open, which one may produce a batch right now, and who to wake when
//! documents arrive. [`SubscriptionConnectionsState`] adds the durable side:
//! every mutation of the subscription's progress and resend queue goes
//! through a cluster command from here.

use super::cancel::CancellationToken;
use super::connection::ConnectionInfo;
use super::types::OpeningStrategy;
use crate::change_vector::ChangeVector;
use crate::cluster::{
    BatchDocument, Cluster, ClusterCommand, DeferredItem, RecordBatch, ResendItem, SubscriptionId,
    SubscriptionState,
};
use crate::error::{Result, SubscriptionError};
use crate::types::{BatchId, DatabaseId, Etag, NodeTag, RaftIndex, ShardNumber};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Wakes connections waiting for new documents. Notifications coalesce: a
/// waiter sees at most one pending wake-up.
#[derive(Default)]
pub struct MoreDocsSignal {
    waiters: Mutex<Vec<Sender<()>>>,
}

impl MoreDocsSignal {
    pub fn subscribe(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        self.waiters.lock().push(tx);
        rx
    }

    pub fn notify(&self) {
        self.waiters.lock().retain(|tx| match tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

struct ActiveLease {
    owner: u64,
    expires_at: Instant,
}

/// A registered connection.
#[derive(Clone, Debug)]
pub struct ConnectionEntry {
    pub id: u64,
    pub strategy: OpeningStrategy,
    pub worker_id: Option<String>,
    pub cancel: CancellationToken,
    pub info: Arc<ConnectionInfo>,
}

/// Slice of the wait used by `WaitForFree` so cancellation is noticed.
const FREE_WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct ConnectionCoordination {
    lease: Mutex<Option<ActiveLease>>,
    lease_released: Condvar,
    connections: Mutex<Vec<ConnectionEntry>>,
    connections_changed: Condvar,
    more_docs: MoreDocsSignal,
}

impl ConnectionCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Active lock ---

    /// Take the batch-production lock for `owner`, waiting up to `timeout`.
    ///
    /// The lock is a lease: a holder that stops renewing loses it after
    /// `lease`, so a dead connection cannot block the others forever.
    pub fn wait_for_subscription_active_lock(
        &self,
        owner: u64,
        timeout: Duration,
        lease: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.lease.lock();
        loop {
            let now = Instant::now();
            let free = match current.as_ref() {
                None => true,
                Some(held) => held.owner == owner || held.expires_at <= now,
            };
            if free {
                *current = Some(ActiveLease {
                    owner,
                    expires_at: now + lease,
                });
                return true;
            }
            if now >= deadline {
                return false;
            }
            let expires_at = current.as_ref().map(|held| held.expires_at).unwrap_or(deadline);
            let wake_at = deadline.min(expires_at);
            self.lease_released
                .wait_for(&mut current, wake_at.saturating_duration_since(now));
        }
    }

    pub fn release_subscription_active_lock(&self, owner: u64) {
        let mut current = self.lease.lock();
        if current.as_ref().map(|held| held.owner == owner).unwrap_or(false) {
            *current = None;
            self.lease_released.notify_all();
        }
    }

    /// Extend the lease if `owner` still holds it.
    pub fn renew_subscription_active_lock(&self, owner: u64, lease: Duration) {
        if let Some(held) = self.lease.lock().as_mut() {
            if held.owner == owner {
                held.expires_at = Instant::now() + lease;
            }
        }
    }

    // --- Connections ---

    /// Register a connection according to its opening strategy.
    pub fn register(
        &self,
        entry: ConnectionEntry,
        wait_for_free: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + wait_for_free;
        let mut connections = self.connections.lock();
        loop {
            if connections.is_empty() {
                break;
            }
            match entry.strategy {
                OpeningStrategy::OpenIfFree => {
                    return Err(SubscriptionError::InUse(
                        "subscription is in use by another connection".into(),
                    ));
                }
                OpeningStrategy::TakeOver => {
                    for existing in connections.drain(..) {
                        debug!(
                            connection = existing.id,
                            by = entry.id,
                            "connection taken over"
                        );
                        existing.cancel.cancel_with(SubscriptionError::InUse(format!(
                            "connection {} was taken over by connection {}",
                            existing.id, entry.id
                        )));
                    }
                    self.connections_changed.notify_all();
                    break;
                }
                OpeningStrategy::Concurrent => {
                    if connections
                        .iter()
                        .all(|existing| existing.strategy == OpeningStrategy::Concurrent)
                    {
                        break;
                    }
                    return Err(SubscriptionError::InUse(
                        "subscription is held by a non-concurrent connection".into(),
                    ));
                }
                OpeningStrategy::WaitForFree => {
                    cancel.check()?;
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SubscriptionError::InUse(
                            "timed out waiting for the subscription to become free".into(),
                        ));
                    }
                    let slice = FREE_WAIT_SLICE.min(deadline - now);
                    self.connections_changed.wait_for(&mut connections, slice);
                }
            }
        }
        trace!(connection = entry.id, strategy = ?entry.strategy, "connection registered");
        connections.push(entry);
        Ok(())
    }

    pub fn unregister(&self, id: u64) {
        let mut connections = self.connections.lock();
        connections.retain(|entry| entry.id != id);
        self.connections_changed.notify_all();
    }

    pub fn connections(&self) -> Vec<ConnectionEntry> {
        self.connections.lock().clone()
    }

    /// Cancel every connection, each with the error `reason` builds.
    pub fn drop_connections(&self, reason: impl Fn() -> SubscriptionError) {
        for entry in self.connections.lock().iter() {
            entry.cancel.cancel_with(reason());
        }
    }

    // --- More docs ---

    pub fn subscribe_more_docs(&self) -> Receiver<()> {
        self.more_docs.subscribe()
    }

    pub fn notify_has_more_docs(&self) {
        self.more_docs.notify();
    }
}

/// What one fetch cycle decided, ready to be recorded.
#[derive(Debug, Default)]
pub struct BatchRecord {
    pub documents: Vec<BatchDocument>,
    pub deferred: Vec<DeferredItem>,
    pub removed_from_resend: Vec<ResendItem>,
    pub last_change_vector: ChangeVector,
    pub observed_sharding_index: RaftIndex,
}

impl BatchRecord {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
            && self.deferred.is_empty()
            && self.removed_from_resend.is_empty()
            && self.last_change_vector.is_empty()
    }
}

/// One subscription as served by one database or shard.
pub struct SubscriptionConnectionsState {
    database: String,
    shard: ShardNumber,
    subscription_id: SubscriptionId,
    subscription_name: String,
    cluster: Arc<Cluster>,
    coordination: Arc<ConnectionCoordination>,
    last_change_vector_sent: Mutex<ChangeVector>,
}

impl SubscriptionConnectionsState {
    pub fn new(
        database: impl Into<String>,
        shard: ShardNumber,
        subscription: &SubscriptionState,
        cluster: Arc<Cluster>,
    ) -> Self {
        Self {
            database: database.into(),
            shard,
            subscription_id: subscription.id,
            subscription_name: subscription.name.clone(),
            cluster,
            coordination: Arc::new(ConnectionCoordination::new()),
            last_change_vector_sent: Mutex::new(subscription.progress_with_pending(shard)),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn shard(&self) -> ShardNumber {
        self.shard
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn coordination(&self) -> &Arc<ConnectionCoordination> {
        &self.coordination
    }

    /// Current replicated state of the subscription.
    pub fn subscription(&self) -> Result<SubscriptionState> {
        self.cluster
            .subscription_by_id(&self.database, self.subscription_id)
            .ok_or_else(|| SubscriptionError::DoesNotExist(self.subscription_name.clone()))
    }

    /// Re-read progress at the start of a connection.
    pub fn initialize(&self) -> Result<()> {
        let state = self.subscription()?;
        *self.last_change_vector_sent.lock() = state.progress_with_pending(self.shard);
        Ok(())
    }

    pub fn last_change_vector_sent(&self) -> ChangeVector {
        self.last_change_vector_sent.lock().clone()
    }

    /// Last etag this shard has scanned, acknowledged or not.
    pub fn last_etag_sent(&self, db_id: &DatabaseId) -> Etag {
        self.last_change_vector_sent.lock().etag_for(db_id)
    }

    /// Persist a fetch cycle. Returns the batch id when documents were sent.
    pub fn record_batch(
        &self,
        connection: u64,
        node: &NodeTag,
        record: BatchRecord,
    ) -> Result<Option<BatchId>> {
        let has_documents = !record.documents.is_empty();
        let last_change_vector = record.last_change_vector.clone();

        let index = self.cluster.execute(ClusterCommand::RecordBatch(RecordBatch {
            database: self.database.clone(),
            subscription: self.subscription_id,
            shard: self.shard,
            connection,
            node: node.clone(),
            documents: record.documents,
            deferred: record.deferred,
            removed_from_resend: record.removed_from_resend,
            last_change_vector: record.last_change_vector,
            observed_sharding_index: record.observed_sharding_index,
        }))?;

        if !last_change_vector.is_empty() {
            let mut sent = self.last_change_vector_sent.lock();
            *sent = sent.merge(&last_change_vector);
        }

        Ok(has_documents.then_some(BatchId(index.0)))
    }

    pub fn acknowledge_batch(&self, batch: BatchId) -> Result<()> {
        self.cluster.execute(ClusterCommand::AcknowledgeBatch {
            database: self.database.clone(),
            subscription: self.subscription_id,
            batch,
        })?;
        Ok(())
    }

    /// The batch will never be acknowledged; queue its documents for resend.
    pub fn drop_batch(&self, batch: BatchId) -> Result<()> {
        self.cluster.execute(ClusterCommand::DropBatch {
            database: self.database.clone(),
            subscription: self.subscription_id,
            batch,
        })?;
        Ok(())
    }

    /// Record client activity without acknowledging anything.
    pub fn touch(&self) -> Result<()> {
        self.cluster.execute(ClusterCommand::TouchSubscription {
            database: self.database.clone(),
            subscription: self.subscription_id,
        })?;
        Ok(())
    }

    pub fn notify_has_more_docs(&self) {
        self.coordination.notify_has_more_docs();
    }
}
