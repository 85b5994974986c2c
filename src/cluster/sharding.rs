//! Bucket hashing, bucket-to-shard ranges and migration records.

use crate::change_vector::ChangeVector;
use crate::types::{Bucket, DatabaseId, NodeTag, RaftIndex, ShardNumber};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Total number of buckets in a sharded database.
pub const NUMBER_OF_BUCKETS: u32 = 1024 * 1024;

/// Bucket for a document id.
///
/// Ids of the form `prefix$suffix` hash only the text after the last `$`, so
/// documents sharing a suffix land in the same bucket.
pub fn bucket_for(id: &str) -> Bucket {
    let hashed = match id.rfind('$') {
        Some(pos) if pos + 1 < id.len() => &id[pos + 1..],
        _ => id,
    };

    let mut hasher = Sha256::new();
    hasher.update(hashed.to_lowercase().as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    Bucket((u64::from_le_bytes(prefix) % NUMBER_OF_BUCKETS as u64) as u32)
}

/// Buckets from `bucket_range_start` up to the next range start belong to `shard`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardBucketRange {
    pub bucket_range_start: Bucket,
    pub shard: ShardNumber,
}

/// Migration progress of one bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Source owns the bucket and is copying it to the destination.
    Moving,
    /// Destination has a full copy; source keeps the deletion bookkeeping.
    Moved,
    /// Destination is authoritative; the source copy awaits deletion.
    OwnershipTransferred,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardBucketMigration {
    pub bucket: Bucket,
    pub source_shard: ShardNumber,
    pub destination_shard: ShardNumber,
    pub migration_index: RaftIndex,
    pub status: MigrationStatus,
    pub last_source_change_vector: Option<ChangeVector>,
    pub confirmed_destinations: BTreeSet<NodeTag>,
    pub confirmation_index: Option<RaftIndex>,
}

impl ShardBucketMigration {
    /// Moving or Moved: both shards may hold data and neither delivers it.
    pub fn is_active(&self) -> bool {
        matches!(self.status, MigrationStatus::Moving | MigrationStatus::Moved)
    }
}

/// How a shard relates to a bucket right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketOwnership {
    Owned,
    NotOwned(ShardNumber),
    ActiveMigration,
}

/// Shard layout of one sharded database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardingConfiguration {
    pub shards: BTreeMap<ShardNumber, DatabaseId>,
    /// Sorted by `bucket_range_start`; the first range starts at bucket 0.
    pub bucket_ranges: Vec<ShardBucketRange>,
    pub bucket_migrations: BTreeMap<Bucket, ShardBucketMigration>,
    /// Index of the last command that changed a migration or a range.
    pub last_migration_change: RaftIndex,
}

impl ShardingConfiguration {
    /// Split the bucket space evenly between `shard_count` shards.
    pub fn new(database: &str, shard_count: u32) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard = NUMBER_OF_BUCKETS / shard_count;

        let mut shards = BTreeMap::new();
        let mut bucket_ranges = Vec::new();
        for n in 0..shard_count {
            let shard = ShardNumber(n);
            shards.insert(shard, DatabaseId::for_name(&shard_database_name(database, shard)));
            bucket_ranges.push(ShardBucketRange {
                bucket_range_start: Bucket(n * per_shard),
                shard,
            });
        }

        Self {
            shards,
            bucket_ranges,
            bucket_migrations: BTreeMap::new(),
            last_migration_change: RaftIndex(0),
        }
    }

    /// The shard whose range contains `bucket`.
    pub fn shard_for(&self, bucket: Bucket) -> ShardNumber {
        let pos = self
            .bucket_ranges
            .partition_point(|range| range.bucket_range_start <= bucket);
        match pos {
            0 => self
                .bucket_ranges
                .first()
                .map(|range| range.shard)
                .unwrap_or_default(),
            n => self.bucket_ranges[n - 1].shard,
        }
    }

    /// Where a write for `bucket` must go.
    pub fn write_shard_for(&self, bucket: Bucket) -> ShardNumber {
        match self.bucket_migrations.get(&bucket) {
            Some(migration) if migration.status != MigrationStatus::Moving => {
                migration.destination_shard
            }
            Some(migration) => migration.source_shard,
            None => self.shard_for(bucket),
        }
    }

    pub fn migration(&self, bucket: Bucket) -> Option<&ShardBucketMigration> {
        self.bucket_migrations.get(&bucket)
    }

    pub fn ownership(&self, bucket: Bucket, shard: ShardNumber) -> BucketOwnership {
        if self
            .bucket_migrations
            .get(&bucket)
            .map(|migration| migration.is_active())
            .unwrap_or(false)
        {
            return BucketOwnership::ActiveMigration;
        }
        let owner = self.shard_for(bucket);
        if owner == shard {
            BucketOwnership::Owned
        } else {
            BucketOwnership::NotOwned(owner)
        }
    }

    pub fn database_id(&self, shard: ShardNumber) -> Option<&DatabaseId> {
        self.shards.get(&shard)
    }

    /// Reassign a single bucket to `to`, splitting the surrounding range.
    pub(crate) fn move_bucket(&mut self, bucket: Bucket, to: ShardNumber) {
        let owner = self.shard_for(bucket);
        if owner == to {
            return;
        }

        let pos = self
            .bucket_ranges
            .partition_point(|range| range.bucket_range_start <= bucket);
        let index = pos.saturating_sub(1);
        let next_start = self
            .bucket_ranges
            .get(index + 1)
            .map(|range| range.bucket_range_start.0)
            .unwrap_or(NUMBER_OF_BUCKETS);

        let mut replacement = Vec::with_capacity(3);
        let current = &self.bucket_ranges[index];
        if current.bucket_range_start < bucket {
            replacement.push(current.clone());
        }
        replacement.push(ShardBucketRange {
            bucket_range_start: bucket,
            shard: to,
        });
        if bucket.0 + 1 < next_start {
            replacement.push(ShardBucketRange {
                bucket_range_start: Bucket(bucket.0 + 1),
                shard: owner,
            });
        }
        self.bucket_ranges.splice(index..=index, replacement);

        self.bucket_ranges
            .dedup_by(|later, earlier| later.shard == earlier.shard);
    }
}

/// Name of the per-shard database, `name$shard`.
pub fn shard_database_name(database: &str, shard: ShardNumber) -> String {
    format!("{}${}", database, shard.0)
}
