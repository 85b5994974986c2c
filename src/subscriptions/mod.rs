//! Subscription delivery.
//!
//! A subscription streams the documents of a database (or of one collection)
//! to a worker in acknowledged batches. The server side is split into:
//! - [`SubscriptionConnection`]: the protocol loop of one client
//! - [`SubscriptionProcessor`]: decides what each batch contains
//! - [`SubscriptionConnectionsState`]: what all connections of a subscription share
//! - [`OrchestratedProcessor`]: merges shard subscriptions for clients of a sharded database
//!
//! The client side is [`SubscriptionWorker`].
//!
//! # Example
//!
//! ```ignore
//! let db = Database::open("db", cluster, ServerConfig::default())?;
//! db.create_subscription(SubscriptionCreationOptions {
//!     name: Some("orders".into()),
//!     collection: Some("Orders".into()),
//!     ..Default::default()
//! })?;
//!
//! let worker = SubscriptionWorker::new(SubscriptionWorkerOptions::new("orders"), db.clone());
//! let handle = worker.spawn(|batch: &SubscriptionBatch| -> Result<()> {
//!     for item in &batch.items {
//!         println!("{} {}", item.id, item.change_vector);
//!     }
//!     Ok(())
//! })?;
//! ```

mod cancel;
mod connection;
mod fetcher;
mod filter;
mod manager;
mod orchestrator;
mod processor;
mod protocol;
mod server;
mod state;
mod types;
mod worker;

pub use cancel::CancellationToken;
pub use connection::{ConnectionInfo, ConnectionPhase, ConnectionStats, SubscriptionConnection};
pub use fetcher::{DocumentFetcher, FetchedItem};
pub use filter::{DocumentFilter, FilterOutcome, FilterRegistry, ScriptError};
pub use manager::SubscriptionManager;
pub use orchestrator::{OrchestratedProcessor, RedeliveryGuard, ShardBatch, ShardFeed};
pub use processor::{BatchLimits, DocumentsProcessor, SubscriptionProcessor};
pub use protocol::{
    duplex, ClientMessage, ConnectionStatus, MessageType, ServerMessage, Transport, HEARTBEAT,
};
pub use server::{
    accept, assert_subscription_connection_details, invalidated_by, Invalidation, SubscriptionHost,
};
pub use state::{
    BatchRecord, ConnectionCoordination, ConnectionEntry, MoreDocsSignal, SubscriptionConnectionsState,
};
pub use types::{
    BatchItem, FetchOrigin, OpeningStrategy, ProcessedItem, StartingPoint, SubscriptionCreationOptions,
    SubscriptionWorkerOptions,
};
pub use worker::{BatchHandler, Connector, SubscriptionBatch, SubscriptionWorker, WorkerHandle};
