//! Subscription options and the items that flow through a batch.

use crate::change_vector::ChangeVector;
use crate::cluster::bucket_for;
use crate::types::{Document, DocumentId, NodeTag, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// How a new connection treats connections already open on the subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpeningStrategy {
    /// Fail with `InUse` if another connection is open.
    OpenIfFree,
    /// Close the other connections (they receive `InUse`).
    TakeOver,
    /// Wait until the subscription is free.
    WaitForFree,
    /// Run alongside other concurrent connections.
    Concurrent,
}

/// Options a worker sends when it connects.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionWorkerOptions {
    pub subscription_name: String,

    pub worker_id: Option<String>,

    /// Default: OpenIfFree
    pub strategy: OpeningStrategy,

    /// Default: 4096
    pub max_docs_per_batch: usize,

    /// End the connection once a fetch finds nothing to send.
    pub close_when_no_docs_left: bool,

    /// Delay between reconnection attempts.
    /// Default: 5s
    pub time_to_wait_before_connection_retry: Duration,

    /// Stop reconnecting after failing continuously for this long.
    /// Default: 5m
    pub max_erroneous_period: Duration,
}

impl SubscriptionWorkerOptions {
    pub fn new(subscription_name: impl Into<String>) -> Self {
        Self {
            subscription_name: subscription_name.into(),
            worker_id: None,
            strategy: OpeningStrategy::OpenIfFree,
            max_docs_per_batch: 4096,
            close_when_no_docs_left: false,
            time_to_wait_before_connection_retry: Duration::from_secs(5),
            max_erroneous_period: Duration::from_secs(5 * 60),
        }
    }
}

/// Where a new subscription starts reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartingPoint {
    #[default]
    BeginningOfTime,
    /// Skip everything already stored.
    LastDocument,
}

#[derive(Clone, Debug, Default)]
pub struct SubscriptionCreationOptions {
    /// Generated from the index when not given.
    pub name: Option<String>,
    pub collection: Option<String>,
    /// Name of a filter registered on the database.
    pub filter: Option<String>,
    pub starting_point: StartingPoint,
    pub mentor_node: Option<NodeTag>,
    pub disabled: bool,
}

/// Where a batch candidate came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOrigin {
    Storage,
    Resend,
}

/// A document chosen for a batch.
///
/// Items fetched from the resend queue carry etag 0: they add no local scan progress.
#[derive(Clone, Debug)]
pub struct ProcessedItem {
    pub document: Document,
    /// Filter failure; the document is delivered as an error item.
    pub error: Option<String>,
    pub origin: FetchOrigin,
}

impl ProcessedItem {
    /// The `Data` payload sent to the worker.
    pub fn to_wire(&self) -> Value {
        json!({
            "Id": self.document.id.as_str(),
            "ChangeVector": self.document.change_vector.to_string(),
            "Collection": self.document.collection,
            "Body": self.document.data,
        })
    }
}

/// A document as received by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchItem {
    pub id: DocumentId,
    pub change_vector: ChangeVector,
    pub collection: String,
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl BatchItem {
    /// Rebuild the document this item describes, as an orchestrator forwards it.
    pub fn into_processed(self) -> ProcessedItem {
        let bucket = bucket_for(self.id.as_str());
        ProcessedItem {
            document: Document {
                id: self.id,
                collection: self.collection,
                data: self.body,
                change_vector: self.change_vector,
                etag: Default::default(),
                bucket,
                last_modified: Timestamp::now(),
            },
            error: self.exception,
            origin: FetchOrigin::Storage,
        }
    }
}
