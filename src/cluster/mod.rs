//! Local stand-in for the replicated cluster state machine.
//!
//! Commands are applied one at a time in index order, appended to an optional
//! journal, and then published: the commit index advances, waiters wake up
//! and listeners see the command.

pub mod commands;
pub mod record;
pub mod sharding;
pub mod subscription_state;

pub use commands::{ClusterCommand, DeferredItem, OwnerPosition, RecordBatch};
pub use record::{ClusterRecord, DatabaseRecord};
pub use sharding::{
    bucket_for, shard_database_name, BucketOwnership, MigrationStatus, ShardBucketMigration,
    ShardBucketRange, ShardingConfiguration, NUMBER_OF_BUCKETS,
};
pub use subscription_state::{
    ActiveBatch, BatchDocument, ResendItem, SubscriptionId, SubscriptionQuery, SubscriptionState,
};

use crate::config::JournalConfig;
use crate::error::{Result, SubscriptionError};
use crate::journal::{Journal, JournalEntry};
use crate::subscriptions::CancellationToken;
use crate::types::{NodeTag, RaftIndex, Timestamp};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Called after every applied command.
pub type ClusterListener = Arc<dyn Fn(&ClusterCommand, RaftIndex) + Send + Sync>;

/// How [`Cluster::wait_for_commit_index_change`] compares indexes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitIndexModification {
    GreaterOrEqual,
    Greater,
}

/// Granularity of commit-index waits, so cancellation is noticed promptly.
const COMMIT_WAIT_SLICE: Duration = Duration::from_millis(100);

pub struct Cluster {
    node_tag: NodeTag,
    record: RwLock<ClusterRecord>,
    /// Serializes command application.
    write_lock: Mutex<()>,
    commit_index: Mutex<RaftIndex>,
    committed: Condvar,
    journal: Option<Journal>,
    listeners: RwLock<Vec<ClusterListener>>,
}

impl Cluster {
    /// A cluster without a journal.
    pub fn new(node_tag: impl Into<String>) -> Self {
        Self {
            node_tag: NodeTag(node_tag.into()),
            record: RwLock::new(ClusterRecord::default()),
            write_lock: Mutex::new(()),
            commit_index: Mutex::new(RaftIndex(0)),
            committed: Condvar::new(),
            journal: None,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Open a journaled cluster, replaying every entry already in the journal.
    ///
    /// Batches that were active when the previous run stopped can never be
    /// acknowledged, so their documents are moved to the resend queue.
    pub fn open(node_tag: impl Into<String>, config: &JournalConfig) -> Result<Self> {
        let (journal, entries) = Journal::open::<ClusterCommand>(config)?;

        let mut record = ClusterRecord::default();
        let mut last_index = RaftIndex(0);
        for entry in entries {
            if let Err(e) = entry.command.apply(&mut record, entry.index, entry.timestamp) {
                warn!(index = entry.index.0, error = %e, "journal entry failed to replay");
            }
            last_index = entry.index;
        }

        let cluster = Self {
            node_tag: NodeTag(node_tag.into()),
            record: RwLock::new(record),
            write_lock: Mutex::new(()),
            commit_index: Mutex::new(last_index),
            committed: Condvar::new(),
            journal: Some(journal),
            listeners: RwLock::new(Vec::new()),
        };
        info!(node = %cluster.node_tag, index = last_index.0, "cluster state restored");

        let stale: Vec<String> = cluster
            .record
            .read()
            .databases
            .values()
            .filter(|db| {
                !db.deleted
                    && db
                        .subscriptions
                        .values()
                        .any(|state| !state.active_batches.is_empty())
            })
            .map(|db| db.name.clone())
            .collect();
        for database in stale {
            cluster.execute(ClusterCommand::RecoverActiveBatches { database })?;
        }

        Ok(cluster)
    }

    pub fn node_tag(&self) -> &NodeTag {
        &self.node_tag
    }

    /// Apply a command and publish it. Returns the command's index.
    pub fn execute(&self, command: ClusterCommand) -> Result<RaftIndex> {
        let _guard = self.write_lock.lock();
        let index = RaftIndex(self.last_committed_index().0 + 1);
        let at = Timestamp::now();

        let mut updated = self.record.read().clone_database_for(&command);
        command.apply(&mut updated, index, at)?;

        if let Some(journal) = &self.journal {
            journal.append(&JournalEntry {
                index,
                timestamp: at,
                command: command.clone(),
            })?;
        }

        {
            let mut record = self.record.write();
            for (key, db) in updated.databases {
                record.databases.insert(key, db);
            }
        }

        {
            let mut commit_index = self.commit_index.lock();
            *commit_index = index;
        }
        self.committed.notify_all();
        debug!(index = index.0, database = command.database(), "applied cluster command");

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(&command, index);
        }
        Ok(index)
    }

    pub fn last_committed_index(&self) -> RaftIndex {
        *self.commit_index.lock()
    }

    /// Block until the commit index reaches `index` (or passes it, per `mode`).
    pub fn wait_for_commit_index_change(
        &self,
        mode: CommitIndexModification,
        index: RaftIndex,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let reached = |current: RaftIndex| match mode {
            CommitIndexModification::GreaterOrEqual => current >= index,
            CommitIndexModification::Greater => current > index,
        };

        let mut current = self.commit_index.lock();
        while !reached(*current) {
            if cancel.is_cancelled() {
                return Err(SubscriptionError::Cancelled);
            }
            self.committed.wait_for(&mut current, COMMIT_WAIT_SLICE);
        }
        Ok(())
    }

    pub fn add_listener(&self, listener: ClusterListener) {
        self.listeners.write().push(listener);
    }

    /// Run `f` against the current record under a read lock.
    pub fn read<R>(&self, f: impl FnOnce(&ClusterRecord) -> R) -> R {
        f(&self.record.read())
    }

    pub fn database(&self, name: &str) -> Option<DatabaseRecord> {
        self.record.read().database(name).cloned()
    }

    pub fn subscription(&self, database: &str, name: &str) -> Option<SubscriptionState> {
        self.read(|record| {
            record
                .database(database)
                .filter(|db| !db.deleted)
                .and_then(|db| db.subscription(name))
                .cloned()
        })
    }

    pub fn subscription_by_id(&self, database: &str, id: SubscriptionId) -> Option<SubscriptionState> {
        self.read(|record| {
            record
                .database(database)
                .filter(|db| !db.deleted)
                .and_then(|db| db.subscription_by_id(id))
                .cloned()
        })
    }

    pub fn sharding(&self, database: &str) -> Option<ShardingConfiguration> {
        self.read(|record| record.database(database).and_then(|db| db.sharding.clone()))
    }

    pub fn whose_task_is_it(&self, database: &str, subscription: &str) -> Option<NodeTag> {
        self.read(|record| {
            let db = record.database(database)?;
            let state = db.subscription(subscription)?;
            db.whose_task_is_it(state)
        })
    }
}

impl ClusterRecord {
    /// A record holding only the database a command touches.
    fn clone_database_for(&self, command: &ClusterCommand) -> ClusterRecord {
        let key = command.database().to_lowercase();
        let mut partial = ClusterRecord::default();
        if let Some(db) = self.databases.get(&key) {
            partial.databases.insert(key, db.clone());
        }
        partial
    }
}
