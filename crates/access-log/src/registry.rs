// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Set of storage shards known to the process.
//!
//! Readers take a snapshot of the shard list and work on it without holding
//! the lock, so a concurrent [`ShardRegistry::replace`] never shows them a
//! half-updated set.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::storage::ShardStore;

/// Id of the fallback shard used when no shard is configured.
pub const FALLBACK_SHARD_ID: i64 = 0;

#[derive(Debug)]
pub struct Shard {
    pub id: i64,
    pub store: Arc<dyn ShardStore>,
    /// Edge nodes whose logs are written to this shard.
    pub nodes: HashSet<i64>,
}

impl Shard {
    pub fn new(id: i64, store: Arc<dyn ShardStore>) -> Self {
        Self {
            id,
            store,
            nodes: HashSet::new(),
        }
    }

    #[must_use]
    pub fn with_nodes(mut self, nodes: impl IntoIterator<Item = i64>) -> Self {
        self.nodes.extend(nodes);
        self
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    shards: Vec<Arc<Shard>>,
    by_node: HashMap<i64, usize>,
}

#[derive(Debug)]
pub struct ShardRegistry {
    state: RwLock<RegistryState>,
    fallback: Arc<Shard>,
}

impl ShardRegistry {
    pub fn new(fallback: Arc<dyn ShardStore>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            fallback: Arc::new(Shard::new(FALLBACK_SHARD_ID, fallback)),
        }
    }

    /// Swaps the whole shard set at once.
    pub fn replace(&self, shards: Vec<Shard>) {
        let shards: Vec<Arc<Shard>> = shards.into_iter().map(Arc::new).collect();
        let mut by_node = HashMap::new();
        for (index, shard) in shards.iter().enumerate() {
            for node in &shard.nodes {
                by_node.entry(*node).or_insert(index);
            }
        }
        let count = shards.len();

        #[allow(clippy::expect_used)]
        let mut state = self.state.write().expect("lock poisoned");
        *state = RegistryState { shards, by_node };
        drop(state);
        info!("ACCESS_LOG | shard registry updated, {count} shards");
    }

    /// Snapshot of the configured shards, or the fallback shard alone.
    pub fn list_shards(&self) -> Vec<Arc<Shard>> {
        #[allow(clippy::expect_used)]
        let state = self.state.read().expect("lock poisoned");
        if state.shards.is_empty() {
            return vec![self.fallback.clone()];
        }
        state.shards.clone()
    }

    /// Shard owning the node, else a random shard, else the fallback.
    pub fn shard_for_write(&self, node_id: i64) -> Arc<Shard> {
        #[allow(clippy::expect_used)]
        let state = self.state.read().expect("lock poisoned");
        if let Some(index) = state.by_node.get(&node_id) {
            return state.shards[*index].clone();
        }
        if state.shards.is_empty() {
            return self.fallback.clone();
        }
        state.shards[fastrand::usize(..state.shards.len())].clone()
    }

    /// Number of configured shards, the fallback excluded.
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let state = self.state.read().expect("lock poisoned");
        state.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
