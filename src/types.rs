//! Core types shared by storage, the cluster record and subscriptions.

use crate::change_vector::ChangeVector;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// Document identifier.
///
/// Ids keep the casing they were written with, but equality, ordering and
/// hashing are case-insensitive.
#[derive(Clone)]
pub struct DocumentId {
    id: String,
    key: String,
}

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let key = id.to_lowercase();
        Self { id, key }
    }

    /// The id as originally written.
    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Lower-cased lookup key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl PartialEq for DocumentId {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for DocumentId {}

impl Hash for DocumentId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for DocumentId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.id)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        DocumentId::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        DocumentId::new(id)
    }
}

impl Serialize for DocumentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.id)
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(DocumentId::new)
    }
}

/// Local storage position of an item on one shard. Zero means "not from storage".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Etag(pub u64);

impl Etag {
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Etag({})", self.0)
    }
}

/// Shard number inside a sharded database.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ShardNumber(pub u32);

impl fmt::Debug for ShardNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shard({})", self.0)
    }
}

impl fmt::Display for ShardNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash-range unit of sharding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Bucket(pub u32);

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bucket({})", self.0)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster node tag ("A", "B", ...).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeTag(pub String);

impl NodeTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

impl fmt::Display for NodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeTag {
    fn from(tag: &str) -> Self {
        NodeTag(tag.to_string())
    }
}

/// Identity of one database replica (or one shard). Appears in change vectors.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatabaseId(pub String);

impl DatabaseId {
    /// Derive a stable id from a database name.
    pub fn for_name(name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.to_lowercase().as_bytes());
        let digest = hasher.finalize();
        DatabaseId(hex::encode(&digest[..11]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatabaseId({})", self.0)
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index of an applied cluster command.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct RaftIndex(pub u64);

impl fmt::Debug for RaftIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RaftIndex({})", self.0)
    }
}

impl fmt::Display for RaftIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a recorded subscription batch (the index that recorded it).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl fmt::Debug for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchId({})", self.0)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp in microseconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A stored document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub collection: String,
    /// Payload. `None` marks a document whose payload was dropped (skipped or errored).
    pub data: Option<serde_json::Value>,
    pub change_vector: ChangeVector,
    pub etag: Etag,
    pub bucket: Bucket,
    pub last_modified: Timestamp,
}

impl Document {
    /// Approximate in-memory size, used for batch memory limits.
    pub fn size(&self) -> usize {
        let payload = self
            .data
            .as_ref()
            .and_then(|data| serde_json::to_vec(data).ok())
            .map(|bytes| bytes.len())
            .unwrap_or(0);
        self.id.as_str().len() + self.collection.len() + payload + 64
    }

    /// Whether this document belongs to a collection (case-insensitive).
    pub fn in_collection(&self, collection: Option<&str>) -> bool {
        match collection {
            Some(name) => self.collection.eq_ignore_ascii_case(name),
            None => true,
        }
    }
}

/// Deletion marker left behind by a document delete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: DocumentId,
    pub collection: String,
    pub change_vector: ChangeVector,
    pub etag: Etag,
    pub bucket: Bucket,
    pub deleted_at: Timestamp,
}

/// Result of looking up an id: at most one of the two is set.
#[derive(Clone, Debug, Default)]
pub struct DocumentOrTombstone {
    pub document: Option<Document>,
    pub tombstone: Option<Tombstone>,
}

impl DocumentOrTombstone {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn exists(&self) -> bool {
        self.document.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_document_id_case_insensitive() {
        let a = DocumentId::new("Users/1-A");
        let b = DocumentId::new("users/1-a");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "Users/1-A");

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_document_id_serializes_original_casing() {
        let id = DocumentId::new("Orders/7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"Orders/7\"");
        let back: DocumentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_str(), "Orders/7");
    }

    #[test]
    fn test_database_id_is_stable() {
        let a = DatabaseId::for_name("orders$0");
        let b = DatabaseId::for_name("Orders$0");
        let c = DatabaseId::for_name("orders$1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 22);
    }
}
