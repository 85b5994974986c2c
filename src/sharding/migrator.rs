//! Bucket migration steps.
//!
//! A migration advances one step at a time:
//! - `Moving`: copy the bucket to the destination, then, with writes held
//!   off, copy what changed meanwhile and record the source's last vector.
//! - `Moved`: once the destination's copy covers that vector, every member
//!   confirms and ownership transfers.
//! - `OwnershipTransferred`: the source deletes its copy through its merger
//!   and the migration record is removed.

use crate::change_vector::{conflict_status, ChangeVector, ChangeVectorMode, ConflictStatus};
use crate::cluster::{Cluster, ClusterCommand, MigrationStatus, ShardBucketMigration};
use crate::database::Database;
use crate::documents::DeleteBucketResult;
use crate::error::{Result, SubscriptionError};
use crate::subscriptions::CancellationToken;
use crate::types::{Bucket, RaftIndex, ShardNumber};
use crossbeam_channel::{bounded, select, Receiver};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MigrationStep {
    Copy,
    Confirm,
    Cleanup,
}

impl MigrationStep {
    fn for_status(status: MigrationStatus) -> Self {
        match status {
            MigrationStatus::Moving => MigrationStep::Copy,
            MigrationStatus::Moved => MigrationStep::Confirm,
            MigrationStatus::OwnershipTransferred => MigrationStep::Cleanup,
        }
    }
}

type StepKey = (Bucket, RaftIndex, MigrationStep);

pub struct BucketMigrator {
    database: String,
    cluster: Arc<Cluster>,
    shards: BTreeMap<ShardNumber, Arc<Database>>,
    write_gate: Arc<RwLock<()>>,
    delete_batch_size: usize,
    /// Steps currently running, so each runs once at a time.
    in_flight: Mutex<HashSet<StepKey>>,
}

/// Releases a step claim when dropped.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<StepKey>>,
    key: StepKey,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

impl BucketMigrator {
    pub(crate) fn new(
        database: String,
        cluster: Arc<Cluster>,
        shards: BTreeMap<ShardNumber, Arc<Database>>,
        write_gate: Arc<RwLock<()>>,
        delete_batch_size: usize,
    ) -> Self {
        Self {
            database,
            cluster,
            shards,
            write_gate,
            delete_batch_size: delete_batch_size.max(1),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// The migration of `bucket` started at `index`, if it is still recorded.
    pub fn migration(&self, bucket: Bucket, index: RaftIndex) -> Option<ShardBucketMigration> {
        self.cluster
            .sharding(&self.database)?
            .migration(bucket)
            .filter(|migration| migration.migration_index == index)
            .cloned()
    }

    pub fn pending(&self) -> Vec<ShardBucketMigration> {
        self.cluster
            .sharding(&self.database)
            .map(|sharding| sharding.bucket_migrations.into_values().collect())
            .unwrap_or_default()
    }

    /// Try one step of every recorded migration. Returns how many advanced.
    pub fn process_pending(&self) -> Result<usize> {
        let mut advanced = 0;
        for migration in self.pending() {
            if self.advance(&migration)? {
                advanced += 1;
            }
        }
        Ok(advanced)
    }

    /// Run the step `migration`'s status calls for.
    ///
    /// Returns false when the step could not make progress yet, or another
    /// caller is running it.
    pub fn advance(&self, migration: &ShardBucketMigration) -> Result<bool> {
        let step = MigrationStep::for_status(migration.status);
        let key = (migration.bucket, migration.migration_index, step);
        let _claim = match self.claim(key) {
            Some(claim) => claim,
            None => return Ok(false),
        };

        let current = match self.migration(migration.bucket, migration.migration_index) {
            Some(current) if current.status == migration.status => current,
            // Someone else already ran this step.
            _ => return Ok(true),
        };

        debug!(
            database = %self.database,
            bucket = current.bucket.0,
            index = current.migration_index.0,
            ?step,
            "running migration step"
        );
        match step {
            MigrationStep::Copy => self.copy(&current),
            MigrationStep::Confirm => self.confirm(&current),
            MigrationStep::Cleanup => self.cleanup(&current),
        }
    }

    fn claim(&self, key: StepKey) -> Option<Claim<'_>> {
        if !self.in_flight.lock().insert(key) {
            return None;
        }
        Some(Claim {
            in_flight: &self.in_flight,
            key,
        })
    }

    fn shard(&self, shard: ShardNumber) -> Result<&Arc<Database>> {
        self.shards.get(&shard).ok_or_else(|| {
            SubscriptionError::InvalidState(format!("shard {} of '{}' is not open", shard, self.database))
        })
    }

    fn copy(&self, migration: &ShardBucketMigration) -> Result<bool> {
        let source = self.shard(migration.source_shard)?;
        let destination = self.shard(migration.destination_shard)?;

        let copied = destination
            .merger()
            .import_migrated(source.storage().items_in_bucket(migration.bucket))?;

        // Writes to the bucket switch shards with the status change.
        let _gate = self.write_gate.write();
        let caught_up = destination
            .merger()
            .import_migrated(source.storage().items_in_bucket(migration.bucket))?;
        let last_source_change_vector = source.storage().merged_change_vector_in_bucket(migration.bucket);

        self.cluster.execute(ClusterCommand::SourceMigrationCompleted {
            database: self.database.clone(),
            bucket: migration.bucket,
            migration_index: migration.migration_index,
            last_source_change_vector: last_source_change_vector.clone(),
        })?;
        info!(
            database = %self.database,
            bucket = migration.bucket.0,
            source = migration.source_shard.0,
            destination = migration.destination_shard.0,
            copied = copied + caught_up,
            last = %last_source_change_vector,
            "bucket copied"
        );
        Ok(true)
    }

    fn confirm(&self, migration: &ShardBucketMigration) -> Result<bool> {
        let last = migration.last_source_change_vector.clone().unwrap_or_default();
        let destination = self.shard(migration.destination_shard)?;

        if !self.covers(destination, migration.bucket, &last) {
            let source = self.shard(migration.source_shard)?;
            let imported = destination
                .merger()
                .import_migrated(source.storage().items_in_bucket(migration.bucket))?;
            debug!(
                database = %self.database,
                bucket = migration.bucket.0,
                imported,
                "catch-up copy"
            );
            if !self.covers(destination, migration.bucket, &last) {
                return Ok(false);
            }
        }

        let members = self
            .cluster
            .database(&self.database)
            .map(|db| db.members)
            .unwrap_or_default();
        for node in members {
            if migration.confirmed_destinations.contains(&node) {
                continue;
            }
            self.cluster.execute(ClusterCommand::DestinationMigrationConfirm {
                database: self.database.clone(),
                bucket: migration.bucket,
                migration_index: migration.migration_index,
                node,
            })?;
        }
        info!(
            database = %self.database,
            bucket = migration.bucket.0,
            destination = migration.destination_shard.0,
            "bucket ownership transferred"
        );
        Ok(true)
    }

    fn covers(&self, destination: &Database, bucket: Bucket, last: &ChangeVector) -> bool {
        let merged = destination.storage().merged_change_vector_in_bucket(bucket);
        conflict_status(last, &merged, ChangeVectorMode::Version) == ConflictStatus::AlreadyMerged
    }

    fn cleanup(&self, migration: &ShardBucketMigration) -> Result<bool> {
        let last = migration.last_source_change_vector.clone().unwrap_or_default();
        let source = self.shard(migration.source_shard)?;

        loop {
            match source
                .merger()
                .delete_bucket(migration.bucket, last.clone(), self.delete_batch_size)?
            {
                DeleteBucketResult::FullBatch => continue,
                DeleteBucketResult::Empty => break,
                DeleteBucketResult::Skipped => {
                    debug!(
                        database = %self.database,
                        bucket = migration.bucket.0,
                        "source bucket holds newer items; cleanup postponed"
                    );
                    return Ok(false);
                }
            }
        }

        self.cluster.execute(ClusterCommand::SourceMigrationCleanup {
            database: self.database.clone(),
            bucket: migration.bucket,
            migration_index: migration.migration_index,
        })?;
        info!(
            database = %self.database,
            bucket = migration.bucket.0,
            source = migration.source_shard.0,
            "source bucket deleted"
        );
        Ok(true)
    }
}

/// Advances migrations on its own thread whenever a migration command
/// commits, and at every interval.
pub struct MigrationWatcher {
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl MigrationWatcher {
    pub fn start(
        migrator: Arc<BucketMigrator>,
        cluster: &Cluster,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        // Listeners run under the cluster's write lock, so the listener only
        // signals; the commands are executed from the watcher thread.
        let (signal_tx, signal_rx) = bounded(1);
        let database = migrator.database().to_string();
        cluster.add_listener(Arc::new(move |command, _| {
            if command.is_migration() && command.database().eq_ignore_ascii_case(&database) {
                // A full channel already has a wakeup queued.
                let _ = signal_tx.try_send(());
            }
        }));

        let thread_cancel = cancel.clone();
        let thread = thread::Builder::new()
            .name(format!("migration-watcher-{}", migrator.database()))
            .spawn(move || watch(&migrator, &signal_rx, interval, &thread_cancel))?;

        Ok(Self {
            cancel,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) -> Result<()> {
        self.cancel.cancel();
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| SubscriptionError::InvalidState("migration watcher panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for MigrationWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Err(e) = self.join() {
            warn!(error = %e, "migration watcher stopped abnormally");
        }
    }
}

fn watch(migrator: &BucketMigrator, signal: &Receiver<()>, interval: Duration, cancel: &CancellationToken) {
    let cancelled = cancel.receiver();
    debug!(database = migrator.database(), "migration watcher started");
    loop {
        select! {
            recv(signal) -> _ => {}
            recv(cancelled) -> _ => break,
            default(interval) => {}
        }
        if cancel.is_cancelled() {
            break;
        }
        match migrator.process_pending() {
            Ok(0) => {}
            Ok(advanced) => debug!(database = migrator.database(), advanced, "migration steps applied"),
            Err(e) => warn!(database = migrator.database(), error = %e, "migration step failed"),
        }
    }
    debug!(database = migrator.database(), "migration watcher stopped");
}
