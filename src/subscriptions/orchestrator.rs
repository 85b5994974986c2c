//! Aggregation of shard subscriptions for a client of a sharded database.
//!
//! Each shard is consumed by a regular [`SubscriptionWorker`] on its own
//! thread. Its batches are queued for the client connection as they are;
//! the shards already decided what to send. A shard batch is acknowledged
//! to its shard only after the client acknowledged it.

use super::cancel::CancellationToken;
use super::state::ConnectionCoordination;
use super::types::{BatchItem, OpeningStrategy, ProcessedItem, SubscriptionWorkerOptions};
use super::worker::{BatchHandler, Connector, SubscriptionBatch, SubscriptionWorker};
use crate::change_vector::ChangeVector;
use crate::cluster::SubscriptionState;
use crate::error::{Result, SubscriptionError};
use crate::types::{BatchId, DocumentId, ShardNumber};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A batch received from one shard, waiting for the client.
pub struct ShardBatch {
    pub shard: ShardNumber,
    pub items: Vec<BatchItem>,
    reply: Sender<Result<()>>,
}

impl ShardBatch {
    fn complete(self, outcome: Result<()>) {
        // The shard connection may already be gone; its batch then returns
        // through the shard's resend queue.
        let _ = self.reply.send(outcome);
    }
}

/// Versions the client acknowledged but whose shard has not confirmed yet.
///
/// If a shard connection dies in that window, the shard resends the batch.
/// Those copies are acknowledged to the shard without reaching the client twice.
/// Entries are keyed on the version part only: a copy migrated to another shard
/// carries a new order part but is the same version of the document.
#[derive(Default)]
pub struct RedeliveryGuard {
    delivered: Mutex<HashMap<DocumentId, ChangeVector>>,
}

impl RedeliveryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_delivered(&self, item: &BatchItem) -> bool {
        self.delivered
            .lock()
            .get(&item.id)
            .map(|delivered| *delivered == item.change_vector.version())
            .unwrap_or(false)
    }

    pub(crate) fn remember(&self, items: &[BatchItem]) {
        let mut delivered = self.delivered.lock();
        for item in items {
            delivered.insert(item.id.clone(), item.change_vector.version());
        }
    }

    fn forget(&self, items: &[BatchItem]) {
        let mut delivered = self.delivered.lock();
        for item in items {
            if delivered.get(&item.id) == Some(&item.change_vector.version()) {
                delivered.remove(&item.id);
            }
        }
    }

    /// Drop entries the subscription can no longer send again.
    ///
    /// A version can only come back while its document sits in an active batch
    /// or in the resend queue at that same version. Anything else was committed.
    pub(crate) fn prune(&self, state: &SubscriptionState) {
        let mut delivered = self.delivered.lock();
        let before = delivered.len();
        delivered.retain(|id, version| {
            state.in_active_batch(id)
                || state
                    .resend
                    .get(id)
                    .map(|pending| pending.change_vector.version() == *version)
                    .unwrap_or(false)
        });
        if delivered.len() < before {
            trace!(subscription = %state.name, pruned = before - delivered.len(), "pruned redelivery guard");
        }
    }

    pub fn len(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where one shard's subscription is served.
#[derive(Clone)]
pub struct ShardFeed {
    pub shard: ShardNumber,
    pub connector: Arc<dyn Connector>,
}

struct ForwardedBatch {
    batch: ShardBatch,
    forwarded: Vec<BatchItem>,
}

/// Produces client batches out of shard batches.
pub struct OrchestratedProcessor {
    connection: u64,
    queue: Receiver<ShardBatch>,
    guard: Arc<RedeliveryGuard>,
    pending: Option<ForwardedBatch>,
    current: Option<(BatchId, ForwardedBatch)>,
    next_batch: u64,
    last_change_vector: ChangeVector,
    finished_workers: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl OrchestratedProcessor {
    /// Start one worker per shard.
    ///
    /// A shard worker failing for good cancels `connection_cancel` with its error.
    pub fn start(
        options: &SubscriptionWorkerOptions,
        feeds: Vec<ShardFeed>,
        coordination: Arc<ConnectionCoordination>,
        guard: Arc<RedeliveryGuard>,
        connection: u64,
        connection_cancel: &CancellationToken,
        heartbeat: Duration,
    ) -> Result<Self> {
        let (tx, queue) = unbounded();
        let mut processor = Self {
            connection,
            queue,
            guard: guard.clone(),
            pending: None,
            current: None,
            next_batch: 1,
            last_change_vector: ChangeVector::empty(),
            finished_workers: Arc::new(AtomicUsize::new(0)),
            workers: Vec::with_capacity(feeds.len()),
            cancel: connection_cancel.child(),
        };

        for feed in feeds {
            let mut shard_options = options.clone();
            shard_options.worker_id = Some(format!("orchestrator-{}-shard-{}", connection, feed.shard.0));
            shard_options.strategy = match options.strategy {
                OpeningStrategy::Concurrent => OpeningStrategy::Concurrent,
                _ => OpeningStrategy::TakeOver,
            };

            let worker = SubscriptionWorker::with_cancellation(
                shard_options,
                feed.connector,
                processor.cancel.child(),
            );
            let mut forwarder = ShardBatchForwarder {
                shard: feed.shard,
                queue: tx.clone(),
                guard: guard.clone(),
                coordination: coordination.clone(),
                cancel: processor.cancel.clone(),
                heartbeat,
            };
            let connection_cancel = connection_cancel.clone();
            let coordination = coordination.clone();
            let finished = processor.finished_workers.clone();
            let shard = feed.shard;

            let thread = thread::Builder::new()
                .name(format!("orchestrator-{}-shard-{}", connection, shard.0))
                .spawn(move || {
                    match worker.run(&mut forwarder) {
                        Ok(()) => debug!(connection, shard = shard.0, "shard worker finished"),
                        Err(e) if e.is_transport() => {
                            debug!(connection, shard = shard.0, error = %e, "shard worker stopped")
                        }
                        Err(e) => {
                            warn!(connection, shard = shard.0, error = %e, "shard worker failed");
                            connection_cancel.cancel_with(e);
                        }
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                    coordination.notify_has_more_docs();
                })?;
            processor.workers.push(thread);
        }

        debug!(connection, shards = processor.workers.len(), "orchestrator started");
        Ok(processor)
    }

    /// Next queued shard batch, minus copies the client already acknowledged.
    pub fn get_batch(&mut self) -> Result<Vec<ProcessedItem>> {
        self.cancel.check()?;
        loop {
            let batch = match self.queue.try_recv() {
                Ok(batch) => batch,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(Vec::new()),
            };

            let (forwarded, redelivered): (Vec<BatchItem>, Vec<BatchItem>) = batch
                .items
                .iter()
                .cloned()
                .partition(|item| !self.guard.is_delivered(item));
            if !redelivered.is_empty() {
                debug!(
                    connection = self.connection,
                    shard = batch.shard.0,
                    count = redelivered.len(),
                    "suppressed redelivered documents"
                );
            }
            if forwarded.is_empty() {
                batch.complete(Ok(()));
                continue;
            }

            self.last_change_vector =
                ChangeVector::merge_all(forwarded.iter().map(|item| &item.change_vector));
            let items = forwarded.iter().cloned().map(BatchItem::into_processed).collect();
            trace!(
                connection = self.connection,
                shard = batch.shard.0,
                count = forwarded.len(),
                "forwarding shard batch"
            );
            self.pending = Some(ForwardedBatch { batch, forwarded });
            return Ok(items);
        }
    }

    pub fn record_batch(&mut self) -> Result<Option<BatchId>> {
        match self.pending.take() {
            Some(pending) => {
                let id = BatchId(self.next_batch);
                self.next_batch += 1;
                self.current = Some((id, pending));
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    pub fn acknowledge_batch(&mut self, batch: BatchId) -> Result<()> {
        let forwarded = self.take_current(batch)?;
        self.guard.remember(&forwarded.forwarded);
        forwarded.batch.complete(Ok(()));
        Ok(())
    }

    pub fn drop_batch(&mut self, batch: BatchId) -> Result<()> {
        let forwarded = self.take_current(batch)?;
        forwarded.batch.complete(Err(SubscriptionError::Cancelled));
        Ok(())
    }

    fn take_current(&mut self, batch: BatchId) -> Result<ForwardedBatch> {
        match self.current.take() {
            Some((id, forwarded)) if id == batch => Ok(forwarded),
            other => {
                self.current = other;
                Err(SubscriptionError::InvalidState(format!(
                    "batch {} is not the active batch of connection {}",
                    batch.0, self.connection
                )))
            }
        }
    }

    pub fn last_change_vector_in_batch(&self) -> ChangeVector {
        self.last_change_vector.clone()
    }

    /// Every shard worker ended and nothing is left to forward.
    pub fn no_docs_left(&self) -> bool {
        self.finished_workers.load(Ordering::SeqCst) == self.workers.len()
            && self.queue.is_empty()
            && self.pending.is_none()
            && self.current.is_none()
    }
}

impl Drop for OrchestratedProcessor {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(pending) = self.pending.take() {
            pending.batch.complete(Err(SubscriptionError::Cancelled));
        }
        if let Some((_, current)) = self.current.take() {
            current.batch.complete(Err(SubscriptionError::Cancelled));
        }
        while let Ok(batch) = self.queue.try_recv() {
            batch.complete(Err(SubscriptionError::Cancelled));
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Hands shard batches to the client connection and waits for its verdict.
struct ShardBatchForwarder {
    shard: ShardNumber,
    queue: Sender<ShardBatch>,
    guard: Arc<RedeliveryGuard>,
    coordination: Arc<ConnectionCoordination>,
    cancel: CancellationToken,
    heartbeat: Duration,
}

impl BatchHandler for ShardBatchForwarder {
    fn handle(&mut self, batch: &SubscriptionBatch) -> Result<()> {
        if batch.items.is_empty() {
            return Ok(());
        }
        let (reply, replied) = bounded(1);
        self.queue
            .send(ShardBatch {
                shard: self.shard,
                items: batch.items.clone(),
                reply,
            })
            .map_err(|_| SubscriptionError::Cancelled)?;
        self.coordination.notify_has_more_docs();

        let cancelled = self.cancel.receiver();
        loop {
            select! {
                recv(replied) -> outcome => {
                    return outcome.unwrap_or(Err(SubscriptionError::Cancelled));
                },
                recv(cancelled) -> _ => return Err(SubscriptionError::Cancelled),
                default(self.heartbeat) => {
                    trace!(shard = self.shard.0, "waiting for the client to acknowledge");
                }
            }
        }
    }

    fn confirmed(&mut self, batch: &SubscriptionBatch) {
        self.guard.forget(&batch.items);
    }
}
