//! The replicated cluster record: databases, their layout and subscriptions.

use super::sharding::ShardingConfiguration;
use super::subscription_state::{SubscriptionId, SubscriptionState};
use crate::types::{DatabaseId, NodeTag, ShardNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Keyed by lower-cased database name.
    pub databases: BTreeMap<String, DatabaseRecord>,
}

impl ClusterRecord {
    pub fn database(&self, name: &str) -> Option<&DatabaseRecord> {
        self.databases.get(&name.to_lowercase())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub name: String,
    pub database_id: DatabaseId,
    /// Nodes hosting the database, in topology order.
    pub members: Vec<NodeTag>,
    pub sharding: Option<ShardingConfiguration>,
    /// Keyed by lower-cased subscription name.
    pub subscriptions: BTreeMap<String, SubscriptionState>,
    /// Set while the database is being removed.
    pub deleted: bool,
}

impl DatabaseRecord {
    pub fn new(name: impl Into<String>, members: Vec<NodeTag>, shard_count: Option<u32>) -> Self {
        let name = name.into();
        let sharding = shard_count.map(|count| ShardingConfiguration::new(&name, count));
        Self {
            database_id: DatabaseId::for_name(&name),
            name,
            members,
            sharding,
            subscriptions: BTreeMap::new(),
            deleted: false,
        }
    }

    pub fn is_sharded(&self) -> bool {
        self.sharding.is_some()
    }

    /// Database id of every shard. A non-sharded database is shard 0.
    pub fn database_ids(&self) -> BTreeMap<ShardNumber, DatabaseId> {
        match &self.sharding {
            Some(sharding) => sharding.shards.clone(),
            None => {
                let mut ids = BTreeMap::new();
                ids.insert(ShardNumber(0), self.database_id.clone());
                ids
            }
        }
    }

    pub fn subscription(&self, name: &str) -> Option<&SubscriptionState> {
        self.subscriptions.get(&name.to_lowercase())
    }

    pub fn subscription_by_id(&self, id: SubscriptionId) -> Option<&SubscriptionState> {
        self.subscriptions.values().find(|state| state.id == id)
    }

    pub(crate) fn subscription_by_id_mut(
        &mut self,
        id: SubscriptionId,
    ) -> Option<&mut SubscriptionState> {
        self.subscriptions.values_mut().find(|state| state.id == id)
    }

    /// Node responsible for a subscription: the mentor when it is a member,
    /// otherwise a member picked by the subscription id.
    pub fn whose_task_is_it(&self, state: &SubscriptionState) -> Option<NodeTag> {
        if self.deleted || self.members.is_empty() {
            return None;
        }
        if let Some(mentor) = &state.mentor_node {
            if self.members.contains(mentor) {
                return Some(mentor.clone());
            }
        }
        let index = (state.id.0 % self.members.len() as u64) as usize;
        Some(self.members[index].clone())
    }
}
