//! Single-writer transaction merger for one shard.
//!
//! Writes are queued on a channel and applied by one thread in batches. After
//! each batch the commit hook runs, which wakes the shard's subscription
//! connections.

use super::storage::{DeleteBucketResult, DocumentsStorage, StoredItem};
use crate::change_vector::ChangeVector;
use crate::error::{Result, SubscriptionError};
use crate::types::{Bucket, Document, DocumentId, Tombstone};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// Hook run after every applied batch.
pub type CommitHook = Arc<dyn Fn() + Send + Sync>;

/// A write to apply.
#[derive(Debug)]
pub enum MergerCommand {
    Put {
        id: DocumentId,
        collection: String,
        data: serde_json::Value,
        bucket: Bucket,
    },
    Delete {
        id: DocumentId,
    },
    /// Copies shipped by a bucket migration.
    ImportMigrated(Vec<StoredItem>),
    DeleteBucket {
        bucket: Bucket,
        upto: ChangeVector,
        limit: usize,
    },
}

/// Result of an applied command.
#[derive(Debug)]
pub enum MergerReply {
    Put(Document),
    Delete(Option<Tombstone>),
    Imported(usize),
    DeleteBucket(DeleteBucketResult),
}

struct PendingCommand {
    command: MergerCommand,
    reply: Sender<MergerReply>,
}

pub struct TransactionMerger {
    name: String,
    tx: Mutex<Option<Sender<PendingCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionMerger {
    pub fn start(
        storage: Arc<DocumentsStorage>,
        batch_limit: usize,
        on_commit: CommitHook,
    ) -> Result<Self> {
        let name = format!("merger-{}", storage.database());
        let (tx, rx) = unbounded();

        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_merger_loop(storage, rx, batch_limit.max(1), on_commit))?;

        Ok(Self {
            name,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a command and wait for it to be applied.
    pub fn enqueue(&self, command: MergerCommand) -> Result<MergerReply> {
        let (reply_tx, reply_rx) = bounded(1);
        {
            let tx = self.tx.lock();
            let tx = tx
                .as_ref()
                .ok_or_else(|| SubscriptionError::InvalidOperation(format!("{} is stopped", self.name)))?;
            tx.send(PendingCommand {
                command,
                reply: reply_tx,
            })
            .map_err(|_| SubscriptionError::InvalidOperation(format!("{} is stopped", self.name)))?;
        }
        reply_rx
            .recv()
            .map_err(|_| SubscriptionError::Storage(format!("{} dropped the command", self.name)))
    }

    pub fn put(
        &self,
        id: DocumentId,
        collection: impl Into<String>,
        data: serde_json::Value,
        bucket: Bucket,
    ) -> Result<Document> {
        match self.enqueue(MergerCommand::Put {
            id,
            collection: collection.into(),
            data,
            bucket,
        })? {
            MergerReply::Put(doc) => Ok(doc),
            other => Err(unexpected_reply(&other)),
        }
    }

    pub fn delete(&self, id: DocumentId) -> Result<Option<Tombstone>> {
        match self.enqueue(MergerCommand::Delete { id })? {
            MergerReply::Delete(tombstone) => Ok(tombstone),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Returns how many of the items were newer than what the shard holds.
    pub fn import_migrated(&self, items: Vec<StoredItem>) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        match self.enqueue(MergerCommand::ImportMigrated(items))? {
            MergerReply::Imported(count) => Ok(count),
            other => Err(unexpected_reply(&other)),
        }
    }

    pub fn delete_bucket(
        &self,
        bucket: Bucket,
        upto: ChangeVector,
        limit: usize,
    ) -> Result<DeleteBucketResult> {
        match self.enqueue(MergerCommand::DeleteBucket { bucket, upto, limit })? {
            MergerReply::DeleteBucket(result) => Ok(result),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Stop accepting commands and wait for the queue to drain.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(merger = %self.name, "merger thread panicked");
            }
        }
    }
}

impl Drop for TransactionMerger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn unexpected_reply(reply: &MergerReply) -> SubscriptionError {
    SubscriptionError::Storage(format!("unexpected merger reply: {:?}", reply))
}

fn run_merger_loop(
    storage: Arc<DocumentsStorage>,
    rx: Receiver<PendingCommand>,
    batch_limit: usize,
    on_commit: CommitHook,
) {
    while let Ok(first) = rx.recv() {
        let mut batch = vec![first];
        while batch.len() < batch_limit {
            match rx.try_recv() {
                Ok(pending) => batch.push(pending),
                Err(_) => break,
            }
        }

        let size = batch.len();
        let mut replies = Vec::with_capacity(size);
        for pending in batch {
            let reply = apply(&storage, pending.command);
            replies.push((pending.reply, reply));
        }
        trace!(database = storage.database(), commands = size, "merged transaction");

        on_commit();

        for (reply_tx, reply) in replies {
            // The caller may have given up waiting.
            let _ = reply_tx.send(reply);
        }
    }
    debug!(database = storage.database(), "merger stopped");
}

fn apply(storage: &DocumentsStorage, command: MergerCommand) -> MergerReply {
    match command {
        MergerCommand::Put {
            id,
            collection,
            data,
            bucket,
        } => MergerReply::Put(storage.put(id, collection, data, bucket)),
        MergerCommand::Delete { id } => MergerReply::Delete(storage.delete(&id)),
        MergerCommand::ImportMigrated(items) => {
            let imported = items
                .into_iter()
                .filter_map(|item| storage.import_migrated(item))
                .count();
            MergerReply::Imported(imported)
        }
        MergerCommand::DeleteBucket {
            bucket,
            upto,
            limit,
        } => MergerReply::DeleteBucket(storage.delete_bucket(bucket, &upto, limit)),
    }
}
