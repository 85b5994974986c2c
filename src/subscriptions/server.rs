//! Accepting subscription connections.
//!
//! A host (a database, one shard of one, or a sharded database's
//! orchestrator) hands every incoming transport to [`accept`], which runs
//! the handshake and then the connection on a dedicated thread.

use super::cancel::CancellationToken;
use super::connection::{ConnectionInfo, SubscriptionConnection};
use super::processor::SubscriptionProcessor;
use super::protocol::{ServerMessage, Transport};
use super::state::{ConnectionCoordination, ConnectionEntry};
use super::types::SubscriptionWorkerOptions;
use crate::cluster::{Cluster, ClusterCommand, CommitIndexModification, SubscriptionState};
use crate::config::ServerConfig;
use crate::error::{Result, SubscriptionError};
use crate::types::{NodeTag, RaftIndex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What a connection needs from the database serving it.
pub trait SubscriptionHost: Send + Sync {
    /// Name of the database as the cluster knows it.
    fn database_name(&self) -> &str;

    fn cluster(&self) -> &Arc<Cluster>;

    fn config(&self) -> &ServerConfig;

    /// Cancelled when the host shuts down; connections run on children of it.
    fn shutdown_token(&self) -> &CancellationToken;

    /// Coordination shared by every connection of `subscription` on this host.
    fn coordination(&self, subscription: &SubscriptionState) -> Result<Arc<ConnectionCoordination>>;

    fn create_processor(
        &self,
        subscription: &SubscriptionState,
        options: &SubscriptionWorkerOptions,
        connection: u64,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionProcessor>;
}

/// Serve `transport` on a new thread.
pub fn accept(host: Arc<dyn SubscriptionHost>, transport: Transport) -> Result<JoinHandle<()>> {
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst);
    let thread = thread::Builder::new()
        .name(format!("subscription-conn-{}", id))
        .spawn(move || serve(host.as_ref(), transport, id))?;
    Ok(thread)
}

fn serve(host: &dyn SubscriptionHost, transport: Transport, id: u64) {
    let cancel = host.shutdown_token().child();
    match handle_connection(host, &transport, id, &cancel) {
        Ok(()) => debug!(connection = id, "subscription connection ended"),
        Err(e) if e.is_transport() => {
            debug!(connection = id, reason = %e, "subscription connection ended")
        }
        Err(e) => {
            info!(connection = id, database = host.database_name(), error = %e, "subscription connection closed");
            let message = ServerMessage::from_error(&e, host.cluster().node_tag());
            if let Err(send_error) = transport.send(&message) {
                debug!(connection = id, error = %send_error, "failed to report closing status");
            }
        }
    }
    cancel.cancel();
    transport.close();
}

/// Unregisters a connection when dropped.
struct Registration<'a> {
    coordination: &'a ConnectionCoordination,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.coordination.unregister(self.id);
    }
}

fn handle_connection(
    host: &dyn SubscriptionHost,
    transport: &Transport,
    id: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let config = host.config();
    let options: SubscriptionWorkerOptions = transport
        .recv_timeout(config.handshake_timeout)?
        .ok_or_else(|| SubscriptionError::ConnectionDown("client sent no subscription options".into()))?;

    let subscription = assert_subscription_connection_details(
        host.cluster(),
        host.database_name(),
        &options.subscription_name,
        cancel,
    )?;

    let coordination = host.coordination(&subscription)?;
    let info = Arc::new(ConnectionInfo::new(id, &options, config.status_history_len));
    coordination.register(
        ConnectionEntry {
            id,
            strategy: options.strategy,
            worker_id: options.worker_id.clone(),
            cancel: cancel.clone(),
            info: info.clone(),
        },
        config.wait_for_free_timeout,
        cancel,
    )?;
    let _registration = Registration {
        coordination: &coordination,
        id,
    };

    let processor = host.create_processor(&subscription, &options, id, cancel)?;
    transport.send(&ServerMessage::accepted())?;
    info.add_info(format!("connection accepted by node {}", host.cluster().node_tag().as_str()));

    let mut connection = SubscriptionConnection::new(
        id,
        options,
        processor,
        coordination.clone(),
        cancel.clone(),
        info,
        config,
    );
    connection.run(transport)
}

/// Check that this node may serve `name` on `database`, after catching up with
/// the command that last changed the subscription.
pub fn assert_subscription_connection_details(
    cluster: &Cluster,
    database: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<SubscriptionState> {
    let lookup = || -> Result<_> {
        let db = cluster
            .database(database)
            .filter(|db| !db.deleted)
            .ok_or_else(|| SubscriptionError::DatabaseDoesNotExist(database.to_string()))?;
        let subscription = db
            .subscription(name)
            .cloned()
            .ok_or_else(|| SubscriptionError::DoesNotExist(name.to_string()))?;
        Ok((db, subscription))
    };

    let (_, subscription) = lookup()?;
    cluster.wait_for_commit_index_change(
        CommitIndexModification::GreaterOrEqual,
        subscription.raft_index,
        cancel,
    )?;
    let (db, subscription) = lookup()?;

    let node = cluster.node_tag();
    let appropriate = db.whose_task_is_it(&subscription);
    if appropriate.as_ref() != Some(node) {
        let mut reasons = BTreeMap::new();
        if !db.members.contains(node) {
            reasons.insert(
                node.as_str().to_string(),
                format!("not a member of database '{}'", database),
            );
        }
        for member in &db.members {
            let reason = if Some(member) == appropriate.as_ref() {
                match &subscription.mentor_node {
                    Some(mentor) if mentor == member => "mentor node of the subscription".to_string(),
                    _ => "chosen by the subscription id".to_string(),
                }
            } else {
                format!("not responsible for subscription '{}'", subscription.name)
            };
            reasons.insert(member.as_str().to_string(), reason);
        }
        warn!(
            subscription = name,
            node = node.as_str(),
            appropriate = ?appropriate.as_ref().map(|tag| tag.as_str()),
            "subscription connection redirected"
        );
        return Err(SubscriptionError::DoesNotBelongToNode {
            message: format!(
                "subscription '{}' is not handled by node {}",
                subscription.name,
                node.as_str()
            ),
            appropriate_node: appropriate,
            reasons,
            index: subscription.raft_index,
        });
    }

    if subscription.disabled {
        return Err(SubscriptionError::closed(format!(
            "subscription '{}' is disabled",
            subscription.name
        )));
    }
    Ok(subscription)
}

/// Why a cluster change ends the open connections of a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Invalidation {
    DatabaseDeleted(String),
    SubscriptionDeleted(String),
    Disabled(String),
    Reassigned {
        subscription: String,
        appropriate_node: Option<NodeTag>,
        index: RaftIndex,
    },
}

impl Invalidation {
    /// The error the affected connections end with.
    pub fn to_error(&self) -> SubscriptionError {
        match self {
            Invalidation::DatabaseDeleted(database) => {
                SubscriptionError::DatabaseDoesNotExist(database.clone())
            }
            Invalidation::SubscriptionDeleted(name) => SubscriptionError::DoesNotExist(name.clone()),
            Invalidation::Disabled(name) => {
                SubscriptionError::closed(format!("subscription '{}' was disabled", name))
            }
            Invalidation::Reassigned {
                subscription,
                appropriate_node,
                index,
            } => SubscriptionError::DoesNotBelongToNode {
                message: format!("subscription '{}' was reassigned", subscription),
                appropriate_node: appropriate_node.clone(),
                reasons: BTreeMap::new(),
                index: *index,
            },
        }
    }
}

/// What `command` (already applied at `index`) means for the connections of `subscription`.
pub fn invalidated_by(
    command: &ClusterCommand,
    index: RaftIndex,
    cluster: &Cluster,
    database: &str,
    subscription: &str,
) -> Option<Invalidation> {
    if !command.database().eq_ignore_ascii_case(database) {
        return None;
    }
    let reassigned = || {
        let appropriate_node = cluster.whose_task_is_it(database, subscription);
        (appropriate_node.as_ref() != Some(cluster.node_tag())).then(|| Invalidation::Reassigned {
            subscription: subscription.to_string(),
            appropriate_node,
            index,
        })
    };

    match command {
        ClusterCommand::DeleteDatabase { .. } => Some(Invalidation::DatabaseDeleted(database.to_string())),
        ClusterCommand::DeleteSubscription { name, .. } if name.eq_ignore_ascii_case(subscription) => {
            Some(Invalidation::SubscriptionDeleted(subscription.to_string()))
        }
        ClusterCommand::ToggleSubscription {
            name,
            disabled: true,
            ..
        } if name.eq_ignore_ascii_case(subscription) => Some(Invalidation::Disabled(subscription.to_string())),
        ClusterCommand::PutSubscription { name, .. } if name.eq_ignore_ascii_case(subscription) => reassigned(),
        ClusterCommand::UpdateTopology { .. } => reassigned(),
        _ => None,
    }
}
