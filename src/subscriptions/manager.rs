//! Registry of subscription connection states on one database or shard.

use super::state::SubscriptionConnectionsState;
use crate::cluster::{Cluster, SubscriptionId, SubscriptionState};
use crate::error::SubscriptionError;
use crate::types::ShardNumber;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Owns one [`SubscriptionConnectionsState`] per subscription served here.
pub struct SubscriptionManager {
    database: String,
    shard: ShardNumber,
    cluster: Arc<Cluster>,
    /// Connection states by subscription id.
    states: RwLock<HashMap<SubscriptionId, Arc<SubscriptionConnectionsState>>>,
}

impl SubscriptionManager {
    pub fn new(database: impl Into<String>, shard: ShardNumber, cluster: Arc<Cluster>) -> Self {
        Self {
            database: database.into(),
            shard,
            cluster,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// The state for `subscription`, created on first use.
    pub fn get_or_create(&self, subscription: &SubscriptionState) -> Arc<SubscriptionConnectionsState> {
        if let Some(state) = self.states.read().get(&subscription.id) {
            return state.clone();
        }

        let mut states = self.states.write();
        states
            .entry(subscription.id)
            .or_insert_with(|| {
                debug!(
                    database = %self.database,
                    shard = self.shard.0,
                    subscription = %subscription.name,
                    "subscription state created"
                );
                Arc::new(SubscriptionConnectionsState::new(
                    self.database.clone(),
                    self.shard,
                    subscription,
                    self.cluster.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<SubscriptionConnectionsState>> {
        self.states.read().get(&id).cloned()
    }

    /// Forget a subscription, closing its connections with `reason`.
    pub fn remove(
        &self,
        id: SubscriptionId,
        reason: impl Fn() -> SubscriptionError,
    ) -> Option<Arc<SubscriptionConnectionsState>> {
        let removed = self.states.write().remove(&id);
        if let Some(state) = &removed {
            state.coordination().drop_connections(reason);
        }
        removed
    }

    /// Cancel every connection of a subscription. Returns false if none is served here.
    pub fn drop_connections(&self, id: SubscriptionId, reason: impl Fn() -> SubscriptionError) -> bool {
        match self.get(id) {
            Some(state) => {
                state.coordination().drop_connections(reason);
                true
            }
            None => false,
        }
    }

    /// Wake every waiting connection; called after each committed write.
    pub fn notify_all(&self) {
        for state in self.states.read().values() {
            state.notify_has_more_docs();
        }
    }

    pub fn states(&self) -> Vec<Arc<SubscriptionConnectionsState>> {
        self.states.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
