// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shard storage seam.
//!
//! A shard is an independent backend holding one table per calendar day.
//! Query plans are backend neutral ([`crate::query::plan::QueryPlan`]); each
//! backend translates them. [`memory::MemoryShardStore`] evaluates them in
//! process and [`sqlite::SqliteShardStore`] renders them into parameterised SQL.

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::constants::PARTITION_TABLE_PREFIX;
use crate::errors::StoreError;
use crate::query::plan::QueryPlan;
use crate::record::{Day, LogRecord};

/// Physical day table of one shard and the optional columns it carries.
///
/// Column presence is decided when the table is created and never changes,
/// so callers cache this descriptor instead of probing per query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub day: Day,
    pub table: String,
    pub has_remote_addr: bool,
    pub has_domain: bool,
}

impl PartitionInfo {
    pub fn new(day: Day, has_remote_addr: bool, has_domain: bool) -> Self {
        let table = table_name(&day);
        Self {
            day,
            table,
            has_remote_addr,
            has_domain,
        }
    }
}

/// Optional columns given to day tables a backend creates from now on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSchema {
    pub remote_addr: bool,
    pub domain: bool,
}

impl Default for PartitionSchema {
    fn default() -> Self {
        Self {
            remote_addr: true,
            domain: true,
        }
    }
}

pub fn table_name(day: &Day) -> String {
    format!("{PARTITION_TABLE_PREFIX}{day}")
}

/// One persisted access log: structured filter columns plus the JSON payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessLogRow {
    /// Assigned by the backend on insert.
    pub id: u64,
    pub server_id: i64,
    pub node_id: i64,
    pub status: u16,
    pub created_at: i64,
    pub request_id: String,
    pub firewall_policy_id: i64,
    pub firewall_rule_group_id: i64,
    pub firewall_rule_set_id: i64,
    pub firewall_rule_id: i64,
    /// Only set when the partition has the `remoteAddr` column.
    pub remote_addr: Option<String>,
    /// Only set when the partition has the `domain` column.
    pub domain: Option<String>,
    pub request_body: Option<Vec<u8>>,
    /// Serialized [`LogRecord`] without the request body.
    pub content: String,
}

impl AccessLogRow {
    pub fn new(
        partition: &PartitionInfo,
        record: &LogRecord,
        request_body: &[u8],
        content: String,
    ) -> Self {
        Self {
            id: 0,
            server_id: record.server_id,
            node_id: record.node_id,
            status: record.status,
            created_at: record.timestamp,
            request_id: record.request_id.clone(),
            firewall_policy_id: record.firewall_policy_id,
            firewall_rule_group_id: record.firewall_rule_group_id,
            firewall_rule_set_id: record.firewall_rule_set_id,
            firewall_rule_id: record.firewall_rule_id,
            remote_addr: partition
                .has_remote_addr
                .then(|| record.remote_addr.clone()),
            domain: partition.has_domain.then(|| record.host.clone()),
            request_body: (!request_body.is_empty()).then(|| request_body.to_vec()),
            content,
        }
    }

    /// Rebuilds the full record from the payload and the body column.
    pub fn decode(&self) -> Result<LogRecord, serde_json::Error> {
        let mut record: LogRecord = serde_json::from_str(&self.content)?;
        if let Some(body) = &self.request_body {
            record.request_body = body.clone();
        }
        Ok(record)
    }
}

/// A storage backend owning the day tables of one shard.
#[async_trait]
pub trait ShardStore: Send + Sync + fmt::Debug {
    /// Looks the day table up. `Ok(None)` when it does not exist.
    async fn find_partition(&self, day: &Day) -> Result<Option<PartitionInfo>, StoreError>;

    /// Creates the day table if needed and returns its descriptor.
    async fn create_partition(&self, day: &Day) -> Result<PartitionInfo, StoreError>;

    /// Fails with [`StoreError::PartitionMissing`] when the table is gone.
    async fn insert(&self, partition: &PartitionInfo, row: &AccessLogRow)
        -> Result<(), StoreError>;

    async fn query(
        &self,
        partition: &PartitionInfo,
        plan: &QueryPlan,
    ) -> Result<Vec<AccessLogRow>, StoreError>;
}

/// Opens the store of shard `shard_id`: `shard-<id>.db` under `dir`, or an
/// in-memory shard when no directory is configured.
pub fn open_shard_store(
    dir: Option<&Path>,
    shard_id: i64,
) -> Result<Arc<dyn ShardStore>, StoreError> {
    let Some(dir) = dir else {
        return Ok(Arc::new(memory::MemoryShardStore::default()));
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| StoreError::Backend(format!("{}: {e}", dir.display())))?;
    let store = sqlite::SqliteShardStore::open(
        dir.join(format!("shard-{shard_id}.db")),
        PartitionSchema::default(),
    )?;
    Ok(Arc::new(store))
}
