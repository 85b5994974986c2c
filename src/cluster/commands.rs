//! Commands applied to the cluster record.
//!
//! Each command validates against the current record before changing
//! anything, so a rejected command leaves no trace. Applying the same journal
//! twice produces the same record.

use super::record::{ClusterRecord, DatabaseRecord};
use super::sharding::{MigrationStatus, ShardBucketMigration};
use super::subscription_state::{
    ActiveBatch, BatchDocument, ResendItem, SubscriptionId, SubscriptionQuery, SubscriptionState,
};
use crate::change_vector::{conflict_status, ChangeVector, ChangeVectorMode, ConflictStatus};
use crate::error::{Result, SubscriptionError};
use crate::types::{BatchId, Bucket, Etag, NodeTag, RaftIndex, ShardNumber, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Where the owner of a bucket holds its copy of a deferred document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OwnerPosition {
    pub shard: ShardNumber,
    pub etag: Etag,
}

/// A document a shard passed over without delivering, to be retried from the resend queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeferredItem {
    pub item: ResendItem,
    /// Set when the bucket already belongs to another shard. If that shard's
    /// scan has passed its copy, the copy was handled there and the deferral
    /// is dropped.
    pub owner: Option<OwnerPosition>,
}

/// Outcome of one fetch cycle on one shard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub database: String,
    pub subscription: SubscriptionId,
    pub shard: ShardNumber,
    pub connection: u64,
    pub node: NodeTag,
    pub documents: Vec<BatchDocument>,
    pub deferred: Vec<DeferredItem>,
    /// Removed only if the queued change vector is still the one that was examined.
    pub removed_from_resend: Vec<ResendItem>,
    pub last_change_vector: ChangeVector,
    /// `last_migration_change` of the sharding layout the decisions were made against.
    pub observed_sharding_index: RaftIndex,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClusterCommand {
    PutDatabase {
        name: String,
        members: Vec<NodeTag>,
        shard_count: Option<u32>,
    },
    DeleteDatabase {
        name: String,
    },
    UpdateTopology {
        database: String,
        members: Vec<NodeTag>,
    },
    PutSubscription {
        database: String,
        name: String,
        query: SubscriptionQuery,
        mentor_node: Option<NodeTag>,
        disabled: bool,
        initial_progress: BTreeMap<ShardNumber, ChangeVector>,
    },
    ToggleSubscription {
        database: String,
        name: String,
        disabled: bool,
    },
    DeleteSubscription {
        database: String,
        name: String,
    },
    RecordBatch(RecordBatch),
    AcknowledgeBatch {
        database: String,
        subscription: SubscriptionId,
        batch: BatchId,
    },
    DropBatch {
        database: String,
        subscription: SubscriptionId,
        batch: BatchId,
    },
    TouchSubscription {
        database: String,
        subscription: SubscriptionId,
    },
    /// Turn batches left active by a previous run into resend entries.
    RecoverActiveBatches {
        database: String,
    },
    StartBucketMigration {
        database: String,
        bucket: Bucket,
        destination: ShardNumber,
    },
    SourceMigrationCompleted {
        database: String,
        bucket: Bucket,
        migration_index: RaftIndex,
        last_source_change_vector: ChangeVector,
    },
    DestinationMigrationConfirm {
        database: String,
        bucket: Bucket,
        migration_index: RaftIndex,
        node: NodeTag,
    },
    SourceMigrationCleanup {
        database: String,
        bucket: Bucket,
        migration_index: RaftIndex,
    },
}

impl ClusterCommand {
    pub fn database(&self) -> &str {
        match self {
            ClusterCommand::PutDatabase { name, .. } | ClusterCommand::DeleteDatabase { name } => {
                name
            }
            ClusterCommand::RecordBatch(record) => &record.database,
            ClusterCommand::UpdateTopology { database, .. }
            | ClusterCommand::PutSubscription { database, .. }
            | ClusterCommand::ToggleSubscription { database, .. }
            | ClusterCommand::DeleteSubscription { database, .. }
            | ClusterCommand::AcknowledgeBatch { database, .. }
            | ClusterCommand::DropBatch { database, .. }
            | ClusterCommand::TouchSubscription { database, .. }
            | ClusterCommand::RecoverActiveBatches { database }
            | ClusterCommand::StartBucketMigration { database, .. }
            | ClusterCommand::SourceMigrationCompleted { database, .. }
            | ClusterCommand::DestinationMigrationConfirm { database, .. }
            | ClusterCommand::SourceMigrationCleanup { database, .. } => database,
        }
    }

    /// Commands that can make a waiting connection eligible to fetch again.
    pub fn affects_eligibility(&self) -> bool {
        !matches!(
            self,
            ClusterCommand::PutDatabase { .. }
                | ClusterCommand::RecordBatch(_)
                | ClusterCommand::TouchSubscription { .. }
        )
    }

    pub fn is_migration(&self) -> bool {
        matches!(
            self,
            ClusterCommand::StartBucketMigration { .. }
                | ClusterCommand::SourceMigrationCompleted { .. }
                | ClusterCommand::DestinationMigrationConfirm { .. }
                | ClusterCommand::SourceMigrationCleanup { .. }
        )
    }

    /// Apply to `record` as the command with index `index`.
    pub(crate) fn apply(&self, record: &mut ClusterRecord, index: RaftIndex, at: Timestamp) -> Result<()> {
        if let ClusterCommand::PutDatabase {
            name,
            members,
            shard_count,
        } = self
        {
            return put_database(record, name, members, *shard_count);
        }

        let key = self.database().to_lowercase();
        let current = record
            .databases
            .get(&key)
            .filter(|db| !db.deleted)
            .ok_or_else(|| SubscriptionError::DatabaseDoesNotExist(self.database().to_string()))?;

        // Work on a copy so a failed command leaves the record untouched.
        let mut db = current.clone();
        self.apply_to_database(&mut db, index, at)?;
        record.databases.insert(key, db);
        Ok(())
    }

    fn apply_to_database(&self, db: &mut DatabaseRecord, index: RaftIndex, at: Timestamp) -> Result<()> {
        match self {
            ClusterCommand::PutDatabase { .. } => Ok(()),
            ClusterCommand::DeleteDatabase { .. } => {
                db.deleted = true;
                Ok(())
            }
            ClusterCommand::UpdateTopology { members, .. } => {
                db.members = members.clone();
                Ok(())
            }
            ClusterCommand::PutSubscription {
                name,
                query,
                mentor_node,
                disabled,
                initial_progress,
                ..
            } => {
                if name.trim().is_empty() {
                    return Err(SubscriptionError::InvalidOperation(
                        "subscription name cannot be empty".into(),
                    ));
                }
                let key = name.to_lowercase();
                match db.subscriptions.get_mut(&key) {
                    Some(existing) => {
                        existing.query = query.clone();
                        existing.mentor_node = mentor_node.clone();
                        existing.disabled = *disabled;
                        existing.raft_index = index;
                    }
                    None => {
                        let mut state = SubscriptionState::new(
                            SubscriptionId(index.0),
                            name.clone(),
                            query.clone(),
                            mentor_node.clone(),
                            initial_progress.clone(),
                        );
                        state.disabled = *disabled;
                        state.created_at = at;
                        db.subscriptions.insert(key, state);
                    }
                }
                Ok(())
            }
            ClusterCommand::ToggleSubscription { name, disabled, .. } => {
                let state = db
                    .subscriptions
                    .get_mut(&name.to_lowercase())
                    .ok_or_else(|| SubscriptionError::DoesNotExist(name.clone()))?;
                state.disabled = *disabled;
                state.raft_index = index;
                Ok(())
            }
            ClusterCommand::DeleteSubscription { name, .. } => db
                .subscriptions
                .remove(&name.to_lowercase())
                .map(|_| ())
                .ok_or_else(|| SubscriptionError::DoesNotExist(name.clone())),
            ClusterCommand::RecordBatch(record) => record_batch(db, record, index),
            ClusterCommand::AcknowledgeBatch {
                subscription,
                batch,
                ..
            } => {
                let state = subscription_mut(db, *subscription)?;
                if let Some(batch) = state.take_batch(*batch) {
                    for doc in &batch.documents {
                        let covered = state.resend.get(&doc.id).map(|entry| {
                            conflict_status(
                                &entry.change_vector,
                                &doc.change_vector,
                                ChangeVectorMode::Version,
                            ) == ConflictStatus::AlreadyMerged
                        });
                        if covered == Some(true) {
                            state.resend.remove(&doc.id);
                        }
                    }
                }
                state.last_batch_ack_time = Some(at);
                state.last_client_activity = Some(at);
                state.raft_index = index;
                Ok(())
            }
            ClusterCommand::DropBatch {
                subscription, batch, ..
            } => {
                let state = subscription_mut(db, *subscription)?;
                if let Some(batch) = state.take_batch(*batch) {
                    for doc in batch.documents {
                        state.add_to_resend(doc.into());
                    }
                }
                state.raft_index = index;
                Ok(())
            }
            ClusterCommand::TouchSubscription { subscription, .. } => {
                let state = subscription_mut(db, *subscription)?;
                state.last_client_activity = Some(at);
                Ok(())
            }
            ClusterCommand::RecoverActiveBatches { .. } => {
                for state in db.subscriptions.values_mut() {
                    let batches: Vec<BatchId> = state.active_batches.keys().copied().collect();
                    for batch in batches {
                        if let Some(batch) = state.take_batch(batch) {
                            for doc in batch.documents {
                                state.add_to_resend(doc.into());
                            }
                        }
                    }
                }
                Ok(())
            }
            ClusterCommand::StartBucketMigration {
                bucket,
                destination,
                ..
            } => start_migration(db, *bucket, *destination, index),
            ClusterCommand::SourceMigrationCompleted {
                bucket,
                migration_index,
                last_source_change_vector,
                ..
            } => {
                let sharding = db
                    .sharding
                    .as_mut()
                    .ok_or_else(|| not_sharded(&db.name))?;
                let migration = sharding
                    .bucket_migrations
                    .get_mut(bucket)
                    .filter(|m| m.migration_index == *migration_index)
                    .ok_or_else(|| no_migration(*bucket, *migration_index))?;
                if migration.status == MigrationStatus::Moving {
                    migration.status = MigrationStatus::Moved;
                    migration.last_source_change_vector = Some(last_source_change_vector.clone());
                    sharding.last_migration_change = index;
                }
                Ok(())
            }
            ClusterCommand::DestinationMigrationConfirm {
                bucket,
                migration_index,
                node,
                ..
            } => {
                let members: BTreeSet<NodeTag> = db.members.iter().cloned().collect();
                let sharding = db
                    .sharding
                    .as_mut()
                    .ok_or_else(|| not_sharded(&db.name))?;
                let migration = sharding
                    .bucket_migrations
                    .get_mut(bucket)
                    .filter(|m| m.migration_index == *migration_index)
                    .ok_or_else(|| no_migration(*bucket, *migration_index))?;
                if migration.status != MigrationStatus::Moved {
                    return Ok(());
                }
                migration.confirmed_destinations.insert(node.clone());
                if !migration.confirmed_destinations.is_superset(&members) {
                    return Ok(());
                }
                migration.status = MigrationStatus::OwnershipTransferred;
                migration.confirmation_index = Some(index);
                let destination = migration.destination_shard;
                sharding.move_bucket(*bucket, destination);
                sharding.last_migration_change = index;
                debug!(bucket = bucket.0, shard = destination.0, "bucket ownership transferred");
                Ok(())
            }
            ClusterCommand::SourceMigrationCleanup {
                bucket,
                migration_index,
                ..
            } => {
                let sharding = db
                    .sharding
                    .as_mut()
                    .ok_or_else(|| not_sharded(&db.name))?;
                let done = match sharding.bucket_migrations.get(bucket) {
                    Some(m) if m.migration_index == *migration_index => {
                        m.status == MigrationStatus::OwnershipTransferred
                    }
                    // Already cleaned up.
                    _ => return Ok(()),
                };
                if done {
                    sharding.bucket_migrations.remove(bucket);
                    sharding.last_migration_change = index;
                }
                Ok(())
            }
        }
    }
}

fn put_database(
    record: &mut ClusterRecord,
    name: &str,
    members: &[NodeTag],
    shard_count: Option<u32>,
) -> Result<()> {
    if name.trim().is_empty() || name.contains('$') {
        return Err(SubscriptionError::InvalidOperation(format!(
            "invalid database name '{}'",
            name
        )));
    }
    let key = name.to_lowercase();
    match record.databases.get_mut(&key) {
        Some(existing) if !existing.deleted => {
            existing.members = members.to_vec();
        }
        _ => {
            record
                .databases
                .insert(key, DatabaseRecord::new(name, members.to_vec(), shard_count));
        }
    }
    Ok(())
}

fn record_batch(db: &mut DatabaseRecord, record: &RecordBatch, index: RaftIndex) -> Result<()> {
    let db_ids = db.database_ids();
    let last_migration_change = db.sharding.as_ref().map(|s| s.last_migration_change);
    let state = subscription_mut(db, record.subscription)?;

    if let Some(last_change) = last_migration_change {
        let decided = !record.documents.is_empty() || !record.deferred.is_empty();
        if decided && last_change > record.observed_sharding_index {
            return Err(SubscriptionError::ChangeVectorUpdateConcurrency(format!(
                "bucket layout changed at index {} after the batch was built against index {}",
                last_change, record.observed_sharding_index
            )));
        }
    }

    for removed in &record.removed_from_resend {
        let unchanged = state
            .resend
            .get(&removed.id)
            .map(|entry| entry.change_vector == removed.change_vector)
            .unwrap_or(false);
        if unchanged {
            state.resend.remove(&removed.id);
        }
    }

    for deferred in &record.deferred {
        if let Some(owner) = &deferred.owner {
            let passed = db_ids
                .get(&owner.shard)
                .map(|db_id| state.progress_with_pending(owner.shard).etag_for(db_id) >= owner.etag)
                .unwrap_or(false);
            if passed {
                continue;
            }
        }
        state.add_to_resend(deferred.item.clone());
    }

    if record.documents.is_empty() {
        state.commit_progress(record.shard, &record.last_change_vector);
    } else {
        let id = BatchId(index.0);
        state.active_batches.insert(
            id,
            ActiveBatch {
                id,
                shard: record.shard,
                connection: record.connection,
                node: record.node.clone(),
                documents: record.documents.clone(),
                pending_progress: record.last_change_vector.clone(),
            },
        );
    }
    state.raft_index = index;
    Ok(())
}

fn start_migration(
    db: &mut DatabaseRecord,
    bucket: Bucket,
    destination: ShardNumber,
    index: RaftIndex,
) -> Result<()> {
    let name = db.name.clone();
    let sharding = db.sharding.as_mut().ok_or_else(|| not_sharded(&name))?;
    if !sharding.shards.contains_key(&destination) {
        return Err(SubscriptionError::InvalidOperation(format!(
            "shard {} does not exist in '{}'",
            destination, name
        )));
    }
    if sharding.bucket_migrations.contains_key(&bucket) {
        return Err(SubscriptionError::InvalidOperation(format!(
            "bucket {} is already being migrated",
            bucket
        )));
    }
    let source = sharding.shard_for(bucket);
    if source == destination {
        return Err(SubscriptionError::InvalidOperation(format!(
            "bucket {} already belongs to shard {}",
            bucket, destination
        )));
    }

    sharding.bucket_migrations.insert(
        bucket,
        ShardBucketMigration {
            bucket,
            source_shard: source,
            destination_shard: destination,
            migration_index: index,
            status: MigrationStatus::Moving,
            last_source_change_vector: None,
            confirmed_destinations: BTreeSet::new(),
            confirmation_index: None,
        },
    );
    sharding.last_migration_change = index;
    Ok(())
}

fn subscription_mut(db: &mut DatabaseRecord, id: SubscriptionId) -> Result<&mut SubscriptionState> {
    db.subscription_by_id_mut(id)
        .ok_or_else(|| SubscriptionError::DoesNotExist(id.to_string()))
}

fn not_sharded(name: &str) -> SubscriptionError {
    SubscriptionError::InvalidOperation(format!("database '{}' is not sharded", name))
}

fn no_migration(bucket: Bucket, migration_index: RaftIndex) -> SubscriptionError {
    SubscriptionError::InvalidOperation(format!(
        "bucket {} has no migration with index {}",
        bucket, migration_index
    ))
}
