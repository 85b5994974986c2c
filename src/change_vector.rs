//! Change vectors: mergeable causal ordering tokens.
//!
//! A change vector maps a database id to the highest etag produced by that
//! database, tagged with the node that produced it. It renders as
//! `A:5-<dbid>, B:3-<dbid>`.
//!
//! A document copied to another shard by a bucket migration carries two parts:
//! - the **version**: the causal content history, copied unchanged;
//! - the **order**: the version plus the storage position on the shard now
//!   holding the copy.
//!
//! Such vectors render as `version|order`. Vectors produced by local writes
//! have a single part.
//!
//! Comparison comes in two modes that answer different questions:
//! - [`ChangeVectorMode::Version`]: is the remote a strict causal successor of
//!   the local vector? Entries the local side has but the remote lacks count
//!   as local progress, so divergent histories report `Conflict`.
//! - [`ChangeVectorMode::Order`]: has the local position passed every entry of
//!   the remote? Only the remote's entries are consulted, and the answer is
//!   either `Update` (not yet passed) or `AlreadyMerged`.

use crate::error::{Result, SubscriptionError};
use crate::types::{DatabaseId, Etag};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One `TAG:ETAG-DBID` element of a change vector.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChangeVectorEntry {
    pub node_tag: String,
    pub etag: u64,
    pub db_id: DatabaseId,
}

impl fmt::Display for ChangeVectorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.node_tag, self.etag, self.db_id)
    }
}

impl FromStr for ChangeVectorEntry {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self> {
        let text = s.trim();
        let invalid = || SubscriptionError::InvalidChangeVector(text.to_string());

        let (tag, rest) = text.split_once(':').ok_or_else(invalid)?;
        let (etag, db_id) = rest.split_once('-').ok_or_else(invalid)?;
        if tag.is_empty() || db_id.is_empty() {
            return Err(invalid());
        }
        let etag = etag.parse::<u64>().map_err(|_| invalid())?;

        Ok(Self {
            node_tag: tag.to_string(),
            etag,
            db_id: DatabaseId(db_id.to_string()),
        })
    }
}

/// Pointwise-max map. Zero etags are never stored, so equal vectors compare equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
struct Vector(BTreeMap<DatabaseId, (u64, String)>);

impl Vector {
    fn etag(&self, db_id: &DatabaseId) -> u64 {
        self.0.get(db_id).map(|(etag, _)| *etag).unwrap_or(0)
    }

    fn insert(&mut self, db_id: DatabaseId, etag: u64, node_tag: String) {
        if etag == 0 {
            return;
        }
        match self.0.get_mut(&db_id) {
            Some(existing) => {
                // (etag, tag) ordering keeps the merge commutative when tags differ.
                if (etag, &node_tag) > (existing.0, &existing.1) {
                    *existing = (etag, node_tag);
                }
            }
            None => {
                self.0.insert(db_id, (etag, node_tag));
            }
        }
    }

    fn merge(&self, other: &Vector) -> Vector {
        let mut merged = self.clone();
        for (db_id, (etag, tag)) in &other.0 {
            merged.insert(db_id.clone(), *etag, tag.clone());
        }
        merged
    }

    /// Returns (remote ahead somewhere, local ahead somewhere).
    fn compare(remote: &Vector, local: &Vector) -> (bool, bool) {
        let remote_ahead = remote
            .0
            .iter()
            .any(|(db_id, (etag, _))| *etag > local.etag(db_id));
        let local_ahead = local
            .0
            .iter()
            .any(|(db_id, (etag, _))| *etag > remote.etag(db_id));
        (remote_ahead, local_ahead)
    }

    fn entries(&self) -> impl Iterator<Item = ChangeVectorEntry> + '_ {
        self.0.iter().map(|(db_id, (etag, tag))| ChangeVectorEntry {
            node_tag: tag.clone(),
            etag: *etag,
            db_id: db_id.clone(),
        })
    }

    fn parse(text: &str) -> Result<Vector> {
        let mut vector = Vector::default();
        if text.trim().is_empty() {
            return Ok(vector);
        }
        for part in text.split(',') {
            let entry: ChangeVectorEntry = part.parse()?;
            vector.insert(entry.db_id, entry.etag, entry.node_tag);
        }
        Ok(vector)
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

/// Causal ordering token attached to every stored item.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChangeVector {
    version: Vector,
    /// Present only when it differs from `version`.
    order: Option<Vector>,
}

impl ChangeVector {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single-entry vector for a fresh etag on one database.
    pub fn new(node_tag: &str, etag: Etag, db_id: &DatabaseId) -> Self {
        let mut version = Vector::default();
        version.insert(db_id.clone(), etag.0, node_tag.to_string());
        Self {
            version,
            order: None,
        }
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = ChangeVectorEntry>,
    {
        let mut version = Vector::default();
        for entry in entries {
            version.insert(entry.db_id, entry.etag, entry.node_tag);
        }
        Self {
            version,
            order: None,
        }
    }

    /// Combine the version part of `version` with the order part of `order`.
    pub fn with_order(version: &ChangeVector, order: &ChangeVector) -> Self {
        let version_part = version.version.clone();
        let order_part = order.order_vector().merge(&version_part);
        Self::from_parts(version_part, Some(order_part))
    }

    fn from_parts(version: Vector, order: Option<Vector>) -> Self {
        let order = order.filter(|order| *order != version);
        Self { version, order }
    }

    fn order_vector(&self) -> &Vector {
        self.order.as_ref().unwrap_or(&self.version)
    }

    /// The causal content part only.
    pub fn version(&self) -> ChangeVector {
        Self {
            version: self.version.clone(),
            order: None,
        }
    }

    /// The storage order part as a single-part vector.
    pub fn order(&self) -> ChangeVector {
        Self {
            version: self.order_vector().clone(),
            order: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.version.0.is_empty() && self.order.is_none()
    }

    /// True when version and order agree (the item was written where it lives).
    pub fn is_single(&self) -> bool {
        self.order.is_none()
    }

    /// Highest etag recorded for a database, taken from the order part.
    pub fn etag_for(&self, db_id: &DatabaseId) -> Etag {
        Etag(self.order_vector().etag(db_id))
    }

    /// The order-part entry for one database.
    pub fn entry_for(&self, db_id: &DatabaseId) -> Option<ChangeVectorEntry> {
        self.order_vector()
            .0
            .get(db_id)
            .map(|(etag, tag)| ChangeVectorEntry {
                node_tag: tag.clone(),
                etag: *etag,
                db_id: db_id.clone(),
            })
    }

    /// Entries of the version part.
    pub fn entries(&self) -> Vec<ChangeVectorEntry> {
        self.version.entries().collect()
    }

    /// Pointwise max of both parts. The empty vector is the identity.
    pub fn merge(&self, other: &ChangeVector) -> ChangeVector {
        let version = self.version.merge(&other.version);
        let order = if self.order.is_none() && other.order.is_none() {
            None
        } else {
            Some(self.order_vector().merge(other.order_vector()))
        };
        Self::from_parts(version, order)
    }

    pub fn merge_all<'a, I>(vectors: I) -> ChangeVector
    where
        I: IntoIterator<Item = &'a ChangeVector>,
    {
        vectors
            .into_iter()
            .fold(ChangeVector::empty(), |acc, cv| acc.merge(cv))
    }
}

impl fmt::Display for ChangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.version)?;
        if let Some(order) = &self.order {
            write!(f, "|{}", order)?;
        }
        Ok(())
    }
}

impl FromStr for ChangeVector {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('|') {
            Some((version, order)) => {
                let version = Vector::parse(version)?;
                let order = Vector::parse(order)?.merge(&version);
                Ok(Self::from_parts(version, Some(order)))
            }
            None => Ok(Self {
                version: Vector::parse(s)?,
                order: None,
            }),
        }
    }
}

impl Serialize for ChangeVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChangeVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Merge two vectors.
pub fn merge(a: &ChangeVector, b: &ChangeVector) -> ChangeVector {
    a.merge(b)
}

/// Outcome of comparing a remote vector against a local one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    /// The remote is ahead and the local side has nothing the remote lacks.
    Update,
    /// The local side already covers the remote.
    AlreadyMerged,
    /// Both sides advanced independently.
    Conflict,
}

/// Which question a comparison answers. See the module docs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeVectorMode {
    Version,
    Order,
}

/// Compare `remote` against `local`.
pub fn conflict_status(
    remote: &ChangeVector,
    local: &ChangeVector,
    mode: ChangeVectorMode,
) -> ConflictStatus {
    match mode {
        ChangeVectorMode::Version => {
            match Vector::compare(&remote.version, &local.version) {
                (true, false) => ConflictStatus::Update,
                (true, true) => ConflictStatus::Conflict,
                (false, _) => ConflictStatus::AlreadyMerged,
            }
        }
        ChangeVectorMode::Order => {
            let (remote_ahead, _) = Vector::compare(remote.order_vector(), local.order_vector());
            if remote_ahead {
                ConflictStatus::Update
            } else {
                ConflictStatus::AlreadyMerged
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cv(text: &str) -> ChangeVector {
        text.parse().unwrap()
    }

    #[test]
    fn test_parse_and_format() {
        let vector = cv("A:5-db1, B:3-db2");
        assert_eq!(vector.to_string(), "A:5-db1, B:3-db2");
        assert_eq!(vector.etag_for(&DatabaseId("db1".into())), Etag(5));
        assert_eq!(vector.etag_for(&DatabaseId("db3".into())), Etag(0));
        assert!(vector.is_single());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("A5-db1".parse::<ChangeVector>().is_err());
        assert!("A:x-db1".parse::<ChangeVector>().is_err());
        assert!("A:5-".parse::<ChangeVector>().is_err());
        assert!("".parse::<ChangeVector>().unwrap().is_empty());
    }

    #[test]
    fn test_merge_is_pointwise_max() {
        let merged = cv("A:5-db1, B:3-db2").merge(&cv("A:2-db1, C:9-db3"));
        assert_eq!(merged, cv("A:5-db1, B:3-db2, C:9-db3"));
        assert_eq!(merged.merge(&ChangeVector::empty()), merged);
    }

    #[test]
    fn test_two_part_vectors() {
        let version = cv("A:5-db1");
        let copy = ChangeVector::with_order(&version, &cv("B:7-db2"));
        assert!(!copy.is_single());
        assert_eq!(copy.to_string(), "A:5-db1|A:5-db1, B:7-db2");
        assert_eq!(copy.version(), version);
        assert_eq!(copy.etag_for(&DatabaseId("db2".into())), Etag(7));

        let reparsed: ChangeVector = copy.to_string().parse().unwrap();
        assert_eq!(reparsed, copy);
    }

    #[test]
    fn test_version_mode_statuses() {
        let local = cv("A:5-db1, B:3-db2");
        assert_eq!(
            conflict_status(&cv("A:6-db1, B:3-db2"), &local, ChangeVectorMode::Version),
            ConflictStatus::Update
        );
        assert_eq!(
            conflict_status(&cv("A:4-db1"), &local, ChangeVectorMode::Version),
            ConflictStatus::AlreadyMerged
        );
        assert_eq!(
            conflict_status(&local, &local, ChangeVectorMode::Version),
            ConflictStatus::AlreadyMerged
        );
        assert_eq!(
            conflict_status(&cv("A:6-db1"), &local, ChangeVectorMode::Version),
            ConflictStatus::Conflict
        );
    }

    #[test]
    fn test_order_mode_never_conflicts() {
        let position = cv("A:5-db1, B:3-db2");
        assert_eq!(
            conflict_status(&cv("A:6-db1"), &position, ChangeVectorMode::Order),
            ConflictStatus::Update
        );
        assert_eq!(
            conflict_status(&cv("A:5-db1"), &position, ChangeVectorMode::Order),
            ConflictStatus::AlreadyMerged
        );
        assert_eq!(
            conflict_status(&cv("A:1-db1, C:1-db3"), &position, ChangeVectorMode::Order),
            ConflictStatus::Update
        );
    }

    #[test]
    fn test_serde_as_string() {
        let vector = cv("A:5-db1|A:5-db1, B:1-db2");
        let json = serde_json::to_string(&vector).unwrap();
        assert_eq!(json, "\"A:5-db1|A:5-db1, B:1-db2\"");
        let back: ChangeVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vector);
    }
}
