// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster and account scoping.
//!
//! A search may be narrowed to the nodes of a cluster or to the servers a
//! user owns. Both lookups live outside this subsystem and are reached
//! through the traits below.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::{LookupError, SearchError};
use crate::query::filter::SearchRequest;

/// Resolves the servers owned by a user account.
#[async_trait]
pub trait ServerOwnership: Send + Sync {
    async fn server_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>, LookupError>;
}

/// Resolves the nodes belonging to a cluster.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn node_ids_in_cluster(&self, cluster_id: i64) -> Result<Vec<i64>, LookupError>;
}

/// Fixed user → servers table.
#[derive(Debug, Clone, Default)]
pub struct StaticOwnership {
    servers: HashMap<i64, Vec<i64>>,
}

impl StaticOwnership {
    #[must_use]
    pub fn new(servers: HashMap<i64, Vec<i64>>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl ServerOwnership for StaticOwnership {
    async fn server_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>, LookupError> {
        Ok(self.servers.get(&user_id).cloned().unwrap_or_default())
    }
}

/// Fixed cluster → nodes table.
#[derive(Debug, Clone, Default)]
pub struct StaticNodeDirectory {
    nodes: HashMap<i64, Vec<i64>>,
}

impl StaticNodeDirectory {
    #[must_use]
    pub fn new(nodes: HashMap<i64, Vec<i64>>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl NodeDirectory for StaticNodeDirectory {
    async fn node_ids_in_cluster(&self, cluster_id: i64) -> Result<Vec<i64>, LookupError> {
        Ok(self.nodes.get(&cluster_id).cloned().unwrap_or_default())
    }
}

/// Node and server restrictions resolved before fan-out.
///
/// `None` means unrestricted, `Some(vec![])` means nothing can match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub node_ids: Option<Vec<i64>>,
    pub server_ids: Option<Vec<i64>>,
}

impl Scope {
    /// True when a restriction resolved to an empty set.
    pub fn is_unsatisfiable(&self) -> bool {
        self.node_ids.as_ref().is_some_and(Vec::is_empty)
            || self.server_ids.as_ref().is_some_and(Vec::is_empty)
    }
}

/// An explicit node wins over its cluster, an explicit server over its owner.
pub async fn resolve_scope(
    request: &SearchRequest,
    ownership: &dyn ServerOwnership,
    nodes: &dyn NodeDirectory,
) -> Result<Scope, SearchError> {
    let node_ids = if request.node_id > 0 {
        Some(vec![request.node_id])
    } else if request.cluster_id > 0 {
        let ids = nodes
            .node_ids_in_cluster(request.cluster_id)
            .await
            .map_err(|source| SearchError::ClusterScope {
                cluster_id: request.cluster_id,
                source,
            })?;
        debug!(
            "ACCESS_LOG_QUERY | cluster {} resolved to {} nodes",
            request.cluster_id,
            ids.len()
        );
        Some(ids)
    } else {
        None
    };

    let server_ids = if request.server_id > 0 {
        Some(vec![request.server_id])
    } else if request.user_id > 0 {
        let ids = ownership
            .server_ids_for_user(request.user_id)
            .await
            .map_err(|source| SearchError::AccountScope {
                user_id: request.user_id,
                source,
            })?;
        debug!(
            "ACCESS_LOG_QUERY | user {} owns {} servers",
            request.user_id,
            ids.len()
        );
        Some(ids)
    } else {
        None
    };

    Ok(Scope {
        node_ids,
        server_ids,
    })
}
