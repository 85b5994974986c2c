//! Per-shard document storage ordered by etag.
//!
//! Every write takes the next etag, so a scan from a given etag sees each
//! document once, at its latest position. Writes are crate-private: they are
//! only applied by the shard's [`TransactionMerger`](super::TransactionMerger).

use crate::change_vector::{conflict_status, ChangeVector, ChangeVectorMode, ConflictStatus};
use crate::types::{
    Bucket, DatabaseId, Document, DocumentId, DocumentOrTombstone, Etag, NodeTag, Timestamp,
    Tombstone,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// A stored document or tombstone.
#[derive(Clone, Debug, PartialEq)]
pub enum StoredItem {
    Document(Document),
    Tombstone(Tombstone),
}

impl StoredItem {
    pub fn id(&self) -> &DocumentId {
        match self {
            StoredItem::Document(doc) => &doc.id,
            StoredItem::Tombstone(tombstone) => &tombstone.id,
        }
    }

    pub fn change_vector(&self) -> &ChangeVector {
        match self {
            StoredItem::Document(doc) => &doc.change_vector,
            StoredItem::Tombstone(tombstone) => &tombstone.change_vector,
        }
    }

    pub fn etag(&self) -> Etag {
        match self {
            StoredItem::Document(doc) => doc.etag,
            StoredItem::Tombstone(tombstone) => tombstone.etag,
        }
    }

    pub fn bucket(&self) -> Bucket {
        match self {
            StoredItem::Document(doc) => doc.bucket,
            StoredItem::Tombstone(tombstone) => tombstone.bucket,
        }
    }

    fn set_position(&mut self, etag: Etag, change_vector: ChangeVector) {
        match self {
            StoredItem::Document(doc) => {
                doc.etag = etag;
                doc.change_vector = change_vector;
            }
            StoredItem::Tombstone(tombstone) => {
                tombstone.etag = etag;
                tombstone.change_vector = change_vector;
            }
        }
    }
}

/// Outcome of one bucket-deletion pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteBucketResult {
    /// Nothing of the bucket is left.
    Empty,
    /// Some items were newer than the bound and were kept.
    Skipped,
    /// The batch limit was reached; run again.
    FullBatch,
}

/// Upper bound of a read. Items written after the context was opened sit
/// past `upper` and are left for the next read.
#[derive(Clone, Copy, Debug)]
pub struct ReadContext {
    upper: Etag,
}

impl ReadContext {
    pub fn upper(&self) -> Etag {
        self.upper
    }

    /// End the read. Reads hold no locks between calls, so this only consumes the context.
    pub fn commit(self) {}
}

#[derive(Default)]
struct StorageInner {
    last_etag: u64,
    items: BTreeMap<u64, StoredItem>,
    by_id: HashMap<DocumentId, u64>,
    last_document_etag: HashMap<String, u64>,
}

impl StorageInner {
    fn next_etag(&mut self) -> Etag {
        self.last_etag += 1;
        Etag(self.last_etag)
    }

    fn current(&self, id: &DocumentId) -> Option<&StoredItem> {
        self.by_id.get(id).and_then(|etag| self.items.get(etag))
    }

    fn remove(&mut self, id: &DocumentId) -> Option<StoredItem> {
        let etag = self.by_id.remove(id)?;
        self.items.remove(&etag)
    }

    fn place(&mut self, item: StoredItem) {
        let etag = item.etag().0;
        if let StoredItem::Document(doc) = &item {
            self.last_document_etag
                .insert(doc.collection.to_lowercase(), etag);
        }
        self.by_id.insert(item.id().clone(), etag);
        self.items.insert(etag, item);
    }
}

/// Documents and tombstones of one database or shard.
pub struct DocumentsStorage {
    database: String,
    db_id: DatabaseId,
    node_tag: NodeTag,
    inner: RwLock<StorageInner>,
}

impl DocumentsStorage {
    pub fn new(database: impl Into<String>, db_id: DatabaseId, node_tag: NodeTag) -> Self {
        Self {
            database: database.into(),
            db_id,
            node_tag,
            inner: RwLock::new(StorageInner::default()),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn db_id(&self) -> &DatabaseId {
        &self.db_id
    }

    pub fn node_tag(&self) -> &NodeTag {
        &self.node_tag
    }

    // --- Reads ---

    /// Open a read bounded by the current last etag.
    pub fn open_read(&self) -> ReadContext {
        ReadContext {
            upper: Etag(self.inner.read().last_etag),
        }
    }

    pub fn get_document_or_tombstone(&self, id: &DocumentId) -> DocumentOrTombstone {
        let inner = self.inner.read();
        match inner.current(id) {
            Some(StoredItem::Document(doc)) => DocumentOrTombstone {
                document: Some(doc.clone()),
                tombstone: None,
            },
            Some(StoredItem::Tombstone(tombstone)) => DocumentOrTombstone {
                document: None,
                tombstone: Some(tombstone.clone()),
            },
            None => DocumentOrTombstone::missing(),
        }
    }

    pub fn get_document(&self, id: &DocumentId) -> Option<Document> {
        self.get_document_or_tombstone(id).document
    }

    /// Up to `limit` documents with etag in `(after, ctx.upper]`, in etag order.
    pub fn documents_after(
        &self,
        ctx: &ReadContext,
        collection: Option<&str>,
        after: Etag,
        limit: usize,
    ) -> Vec<Document> {
        if after >= ctx.upper {
            return Vec::new();
        }
        let inner = self.inner.read();
        inner
            .items
            .range(after.0 + 1..=ctx.upper.0)
            .filter_map(|(_, item)| match item {
                StoredItem::Document(doc) if doc.in_collection(collection) => Some(doc.clone()),
                _ => None,
            })
            .take(limit)
            .collect()
    }

    /// Etag of the newest document in a collection (all collections if `None`).
    pub fn read_last_document_etag(&self, collection: Option<&str>) -> Etag {
        let inner = self.inner.read();
        match collection {
            Some(name) => Etag(
                inner
                    .last_document_etag
                    .get(&name.to_lowercase())
                    .copied()
                    .unwrap_or(0),
            ),
            None => Etag(inner.last_document_etag.values().copied().max().unwrap_or(0)),
        }
    }

    pub fn last_etag(&self) -> Etag {
        Etag(self.inner.read().last_etag)
    }

    pub fn document_count(&self) -> usize {
        self.inner
            .read()
            .items
            .values()
            .filter(|item| matches!(item, StoredItem::Document(_)))
            .count()
    }

    /// Documents and tombstones currently stored for a bucket.
    pub fn items_in_bucket(&self, bucket: Bucket) -> Vec<StoredItem> {
        self.inner
            .read()
            .items
            .values()
            .filter(|item| item.bucket() == bucket)
            .cloned()
            .collect()
    }

    /// Merge of the version parts of everything stored for a bucket.
    pub fn merged_change_vector_in_bucket(&self, bucket: Bucket) -> ChangeVector {
        let inner = self.inner.read();
        inner
            .items
            .values()
            .filter(|item| item.bucket() == bucket)
            .fold(ChangeVector::empty(), |acc, item| {
                acc.merge(&item.change_vector().version())
            })
    }

    // --- Writes (merger thread only) ---

    pub(crate) fn put(
        &self,
        id: DocumentId,
        collection: String,
        data: serde_json::Value,
        bucket: Bucket,
    ) -> Document {
        let mut inner = self.inner.write();
        let previous = inner.remove(&id);
        let etag = inner.next_etag();

        let mut change_vector = ChangeVector::new(self.node_tag.as_str(), etag, &self.db_id);
        if let Some(previous) = &previous {
            change_vector = change_vector.merge(&previous.change_vector().version());
        }

        let document = Document {
            id,
            collection,
            data: Some(data),
            change_vector,
            etag,
            bucket,
            last_modified: Timestamp::now(),
        };
        trace!(
            database = %self.database,
            id = %document.id,
            etag = etag.0,
            "stored document"
        );
        inner.place(StoredItem::Document(document.clone()));
        document
    }

    pub(crate) fn delete(&self, id: &DocumentId) -> Option<Tombstone> {
        let mut inner = self.inner.write();
        let previous = match inner.current(id) {
            Some(StoredItem::Document(doc)) => doc.clone(),
            _ => return None,
        };
        inner.remove(id);
        let etag = inner.next_etag();

        let change_vector = ChangeVector::new(self.node_tag.as_str(), etag, &self.db_id)
            .merge(&previous.change_vector.version());
        let tombstone = Tombstone {
            id: previous.id,
            collection: previous.collection,
            change_vector,
            etag,
            bucket: previous.bucket,
            deleted_at: Timestamp::now(),
        };
        inner.place(StoredItem::Tombstone(tombstone.clone()));
        Some(tombstone)
    }

    /// Store a copy produced by another shard. The copy keeps its version and
    /// gains this shard's storage position in its order part.
    ///
    /// Returns `None` when the stored item already covers the incoming version.
    pub(crate) fn import_migrated(&self, item: StoredItem) -> Option<Etag> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.current(item.id()) {
            let status = conflict_status(
                item.change_vector(),
                existing.change_vector(),
                ChangeVectorMode::Version,
            );
            if status != ConflictStatus::Update {
                return None;
            }
        }

        inner.remove(item.id());
        let etag = inner.next_etag();
        let position = ChangeVector::new(self.node_tag.as_str(), etag, &self.db_id);
        let change_vector = ChangeVector::with_order(
            item.change_vector(),
            &item.change_vector().order().merge(&position),
        );

        let mut item = item;
        item.set_position(etag, change_vector);
        inner.place(item);
        Some(etag)
    }

    /// Physically remove up to `limit` items of a bucket whose version is covered by `upto`.
    pub(crate) fn delete_bucket(
        &self,
        bucket: Bucket,
        upto: &ChangeVector,
        limit: usize,
    ) -> DeleteBucketResult {
        let mut inner = self.inner.write();
        let candidates: Vec<(DocumentId, bool)> = inner
            .items
            .values()
            .filter(|item| item.bucket() == bucket)
            .map(|item| {
                let covered = conflict_status(
                    &item.change_vector().version(),
                    upto,
                    ChangeVectorMode::Version,
                ) == ConflictStatus::AlreadyMerged;
                (item.id().clone(), covered)
            })
            .collect();

        let mut deleted = 0usize;
        let mut skipped = 0usize;
        for (id, covered) in candidates {
            if !covered {
                skipped += 1;
                continue;
            }
            if deleted == limit {
                return DeleteBucketResult::FullBatch;
            }
            inner.remove(&id);
            deleted += 1;
        }

        debug!(
            database = %self.database,
            bucket = bucket.0,
            deleted,
            skipped,
            "deleted bucket items"
        );

        if skipped > 0 {
            DeleteBucketResult::Skipped
        } else {
            DeleteBucketResult::Empty
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage() -> DocumentsStorage {
        DocumentsStorage::new("db", DatabaseId("db0".into()), NodeTag::from("A"))
    }

    #[test]
    fn test_put_moves_document_to_new_etag() {
        let storage = storage();
        let id = DocumentId::new("users/1");
        let first = storage.put(id.clone(), "Users".into(), json!({"n": 1}), Bucket(1));
        let second = storage.put(id.clone(), "Users".into(), json!({"n": 2}), Bucket(1));

        assert_eq!(first.etag, Etag(1));
        assert_eq!(second.etag, Etag(2));
        assert_eq!(second.change_vector.to_string(), "A:2-db0");

        let ctx = storage.open_read();
        let docs = storage.documents_after(&ctx, Some("users"), Etag(0), 10);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].data, Some(json!({"n": 2})));
        assert_eq!(storage.read_last_document_etag(Some("Users")), Etag(2));
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let storage = storage();
        let id = DocumentId::new("users/1");
        storage.put(id.clone(), "Users".into(), json!({}), Bucket(1));

        let tombstone = storage.delete(&id).unwrap();
        assert_eq!(tombstone.etag, Etag(2));

        let lookup = storage.get_document_or_tombstone(&id);
        assert!(lookup.document.is_none());
        assert!(lookup.tombstone.is_some());
        assert!(storage.delete(&id).is_none());
    }

    #[test]
    fn test_read_context_bounds_scan() {
        let storage = storage();
        storage.put("a".into(), "Users".into(), json!({}), Bucket(1));
        let ctx = storage.open_read();
        storage.put("b".into(), "Users".into(), json!({}), Bucket(1));

        let docs = storage.documents_after(&ctx, None, Etag(0), 10);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, DocumentId::new("a"));
        ctx.commit();
    }

    #[test]
    fn test_import_migrated_keeps_version() {
        let source = storage();
        let destination =
            DocumentsStorage::new("db", DatabaseId("db1".into()), NodeTag::from("A"));

        let doc = source.put("users/1".into(), "Users".into(), json!({}), Bucket(3));
        let etag = destination
            .import_migrated(StoredItem::Document(doc.clone()))
            .unwrap();

        let copy = destination.get_document(&doc.id).unwrap();
        assert_eq!(copy.change_vector.version(), doc.change_vector);
        assert_eq!(copy.change_vector.etag_for(&DatabaseId("db1".into())), etag);

        // Importing the same version again is a no-op.
        assert!(destination.import_migrated(StoredItem::Document(doc)).is_none());
    }

    #[test]
    fn test_delete_bucket_respects_bound() {
        let storage = storage();
        let old = storage.put("users/1".into(), "Users".into(), json!({}), Bucket(5));
        storage.put("users/2".into(), "Users".into(), json!({}), Bucket(5));
        storage.put("users/3".into(), "Users".into(), json!({}), Bucket(6));

        let result = storage.delete_bucket(Bucket(5), &old.change_vector, 10);
        assert_eq!(result, DeleteBucketResult::Skipped);
        assert!(storage.get_document(&"users/1".into()).is_none());
        assert!(storage.get_document(&"users/2".into()).is_some());

        let upto = storage.merged_change_vector_in_bucket(Bucket(5));
        assert_eq!(storage.delete_bucket(Bucket(5), &upto, 10), DeleteBucketResult::Empty);
        assert_eq!(storage.document_count(), 1);
    }

    #[test]
    fn test_delete_bucket_full_batch() {
        let storage = storage();
        for i in 0..5 {
            storage.put(format!("users/{}", i).into(), "Users".into(), json!({}), Bucket(9));
        }
        let upto = storage.merged_change_vector_in_bucket(Bucket(9));
        assert_eq!(storage.delete_bucket(Bucket(9), &upto, 2), DeleteBucketResult::FullBatch);
        assert_eq!(storage.delete_bucket(Bucket(9), &upto, 2), DeleteBucketResult::FullBatch);
        assert_eq!(storage.delete_bucket(Bucket(9), &upto, 2), DeleteBucketResult::Empty);
    }
}
