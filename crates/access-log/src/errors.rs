// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Malformed caller input, rejected before any storage I/O.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid day '{0}': expected 8 digits (YYYYMMDD)")]
    InvalidDay(String),

    #[error("invalid request id '{0}'")]
    InvalidRequestId(String),

    #[error("invalid address filter '{0}'")]
    InvalidAddress(String),
}

/// Failures reported by a single shard backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The day table has not been created on this shard yet.
    #[error("partition {0} does not exist")]
    PartitionMissing(String),

    #[error("shard unavailable: {0}")]
    Unavailable(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("failed to encode log payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures of the ownership and cluster directories that scope a search.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("invalid directory response: {0}")]
    InvalidResponse(String),
}

/// Errors surfaced by the query engine to its callers.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to resolve nodes of cluster {cluster_id}: {source}")]
    ClusterScope {
        cluster_id: i64,
        #[source]
        source: LookupError,
    },

    #[error("failed to resolve servers of user {user_id}: {source}")]
    AccountScope {
        user_id: i64,
        #[source]
        source: LookupError,
    },

    #[error("no shard could be reached")]
    NoReachableShard,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read queue settings: {0}")]
    Read(String),

    #[error("failed to decode queue settings: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
