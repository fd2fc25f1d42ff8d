// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Day partitions per shard.
//!
//! Descriptors are cached per `(shard, day)` once the table is known to
//! exist. A missing table is not remembered: it may be created by another
//! writer at any time.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::record::{Day, LogRecord};
use crate::registry::Shard;
use crate::storage::{AccessLogRow, PartitionInfo};

#[derive(Debug, Default)]
pub struct PartitionManager {
    cache: RwLock<HashMap<(i64, Day), PartitionInfo>>,
}

impl PartitionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, shard_id: i64, day: &Day) -> Option<PartitionInfo> {
        #[allow(clippy::expect_used)]
        let cache = self.cache.read().expect("lock poisoned");
        cache.get(&(shard_id, day.clone())).cloned()
    }

    fn remember(&self, shard_id: i64, info: &PartitionInfo) {
        #[allow(clippy::expect_used)]
        let mut cache = self.cache.write().expect("lock poisoned");
        cache.insert((shard_id, info.day.clone()), info.clone());
    }

    /// Drops the cached descriptor, e.g. after the table was found missing.
    pub fn forget(&self, shard_id: i64, day: &Day) {
        #[allow(clippy::expect_used)]
        let mut cache = self.cache.write().expect("lock poisoned");
        cache.remove(&(shard_id, day.clone()));
    }

    /// Descriptor of the day table on `shard`.
    ///
    /// Returns `Ok(None)` when the table does not exist and
    /// `create_if_missing` is false.
    pub async fn resolve(
        &self,
        shard: &Shard,
        day: &Day,
        create_if_missing: bool,
    ) -> Result<Option<PartitionInfo>, StoreError> {
        if let Some(info) = self.cached(shard.id, day) {
            return Ok(Some(info));
        }

        let info = match shard.store.find_partition(day).await? {
            Some(info) => info,
            None if create_if_missing => {
                let info = shard.store.create_partition(day).await?;
                debug!(
                    "ACCESS_LOG | created partition {} on shard {}",
                    info.table, shard.id
                );
                info
            }
            None => return Ok(None),
        };
        self.remember(shard.id, &info);
        Ok(Some(info))
    }

    async fn resolve_for_write(
        &self,
        shard: &Shard,
        day: &Day,
    ) -> Result<PartitionInfo, StoreError> {
        self.resolve(shard, day, true)
            .await?
            .ok_or_else(|| StoreError::PartitionMissing(crate::storage::table_name(day)))
    }

    /// Writes one record to its day table on `shard`, creating the table
    /// when needed. A table dropped behind the cache is recreated and the
    /// write retried once.
    pub async fn insert(&self, shard: &Shard, mut record: LogRecord) -> Result<(), StoreError> {
        let request_body = std::mem::take(&mut record.request_body);
        let content = serde_json::to_string(&record)?;
        let day = record.day();

        let partition = self.resolve_for_write(shard, &day).await?;
        let row = AccessLogRow::new(&partition, &record, &request_body, content);
        match shard.store.insert(&partition, &row).await {
            Err(StoreError::PartitionMissing(table)) => {
                warn!(
                    "ACCESS_LOG | partition {table} vanished on shard {}, recreating",
                    shard.id
                );
                self.forget(shard.id, &day);
                let partition = self.resolve_for_write(shard, &day).await?;
                let row = AccessLogRow::new(&partition, &record, &request_body, row.content);
                shard.store.insert(&partition, &row).await
            }
            result => result,
        }
    }
}
