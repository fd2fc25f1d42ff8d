// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cross-shard search.
//!
//! Each query is fanned out as one task per shard, every task bounded by a
//! deadline. A shard that is slow, unavailable or lacks the day's partition
//! contributes no rows. The merge step is the only place where a global
//! request-id order is established.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, warn};

use crate::constants::MAX_PAGE_SIZE;
use crate::errors::{SearchError, StoreError};
use crate::partition::PartitionManager;
use crate::query::builder::build_plan;
use crate::query::filter::{Direction, SearchFilters, SearchRequest};
use crate::query::plan::QueryPlan;
use crate::query::scope::{resolve_scope, NodeDirectory, Scope, ServerOwnership};
use crate::record::{request_id_days, Day};
use crate::registry::{Shard, ShardRegistry};
use crate::storage::AccessLogRow;

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    /// Newest first, whatever the paging direction.
    pub rows: Vec<AccessLogRow>,
    /// Cursor continuing in the same direction. Equals the request cursor
    /// when the page is empty.
    pub next_cursor: String,
    pub has_more: bool,
}

#[derive(Clone)]
pub struct QueryEngine {
    registry: Arc<ShardRegistry>,
    partitions: Arc<PartitionManager>,
    ownership: Arc<dyn ServerOwnership>,
    nodes: Arc<dyn NodeDirectory>,
    shard_timeout: Duration,
}

/// Per-search inputs shared by every shard task.
struct ScanJob {
    filters: SearchFilters,
    scope: Scope,
    direction: Direction,
}

/// Rows gathered by one fan-out and whether any shard answered.
struct FanOut {
    rows: Vec<AccessLogRow>,
    answered: usize,
    failed: usize,
}

impl FanOut {
    fn into_rows(self) -> Result<Vec<AccessLogRow>, SearchError> {
        if self.answered == 0 && self.failed > 0 {
            return Err(SearchError::NoReachableShard);
        }
        Ok(self.rows)
    }
}

impl QueryEngine {
    pub fn new(
        registry: Arc<ShardRegistry>,
        partitions: Arc<PartitionManager>,
        ownership: Arc<dyn ServerOwnership>,
        nodes: Arc<dyn NodeDirectory>,
        shard_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            partitions,
            ownership,
            nodes,
            shard_timeout,
        }
    }

    /// Returns one page of records for a day, merged across every shard.
    ///
    /// Fails only on invalid input, on a scope lookup failure, or when not a
    /// single shard could be queried.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchPage, SearchError> {
        let filters = SearchFilters::parse(request)?;
        let page_size = request.page_size.min(MAX_PAGE_SIZE);
        let empty = SearchPage {
            rows: Vec::new(),
            next_cursor: request.cursor.clone(),
            has_more: false,
        };
        if page_size == 0 {
            return Ok(empty);
        }

        let scope = resolve_scope(request, self.ownership.as_ref(), self.nodes.as_ref()).await?;
        if scope.is_unsatisfiable() {
            debug!("ACCESS_LOG_QUERY | scope resolved to nothing, skipping shards");
            return Ok(empty);
        }

        let timeout = request.timeout.unwrap_or(self.shard_timeout);
        let job = Arc::new(ScanJob {
            filters,
            scope,
            direction: request.direction,
        });

        let rows = self
            .scan(&job, &request.cursor, page_size, timeout)
            .await
            .into_rows()?;
        let (rows, next_cursor) = merge_page(rows, job.direction, page_size, &request.cursor);

        let mut has_more = false;
        if rows.len() == page_size {
            // Unreachable shards during the look-ahead only mean "don't know".
            has_more = self
                .scan(&job, &next_cursor, 1, timeout)
                .await
                .into_rows()
                .is_ok_and(|next| !next.is_empty());
        }

        Ok(SearchPage {
            rows,
            next_cursor,
            has_more,
        })
    }

    async fn scan(
        &self,
        job: &Arc<ScanJob>,
        cursor: &str,
        limit: usize,
        timeout: Duration,
    ) -> FanOut {
        let mut tasks = JoinSet::new();
        for shard in self.registry.list_shards() {
            let partitions = Arc::clone(&self.partitions);
            let job = Arc::clone(job);
            let cursor = cursor.to_string();
            tasks.spawn(async move {
                let outcome = time::timeout(
                    timeout,
                    scan_shard(&partitions, &shard, &job, &cursor, limit),
                )
                .await;
                (shard.id, outcome)
            });
        }

        let mut fan_out = FanOut {
            rows: Vec::new(),
            answered: 0,
            failed: 0,
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Ok(rows)))) => {
                    fan_out.answered += 1;
                    fan_out.rows.extend(rows);
                }
                Ok((shard_id, Ok(Err(e)))) => {
                    fan_out.failed += 1;
                    warn!("ACCESS_LOG_QUERY | shard {shard_id} query failed: {e}");
                }
                Ok((shard_id, Err(_))) => {
                    fan_out.failed += 1;
                    warn!("ACCESS_LOG_QUERY | shard {shard_id} timed out after {timeout:?}");
                }
                Err(e) => {
                    fan_out.failed += 1;
                    error!("ACCESS_LOG_QUERY | shard task failed: {e}");
                }
            }
        }
        fan_out
    }

    /// Looks a single record up by request id across every shard.
    ///
    /// The first shard returning a row wins and the remaining lookups are
    /// cancelled.
    pub async fn find_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<AccessLogRow>, SearchError> {
        let days = request_id_days(request_id)?;
        let plan = Arc::new(QueryPlan::request_id(request_id));

        let mut tasks = JoinSet::new();
        for shard in self.registry.list_shards() {
            for day in &days {
                let partitions = Arc::clone(&self.partitions);
                let shard = Arc::clone(&shard);
                let plan = Arc::clone(&plan);
                let day = day.clone();
                let timeout = self.shard_timeout;
                tasks.spawn(async move {
                    let outcome =
                        time::timeout(timeout, lookup_shard(&partitions, &shard, &day, &plan))
                            .await;
                    (shard.id, outcome)
                });
            }
        }

        let mut answered = 0;
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Ok(Some(row))))) => {
                    tasks.abort_all();
                    return Ok(Some(row));
                }
                Ok((_, Ok(Ok(None)))) => answered += 1,
                Ok((shard_id, Ok(Err(e)))) => {
                    failed += 1;
                    warn!("ACCESS_LOG_QUERY | shard {shard_id} lookup of {request_id} failed: {e}");
                }
                Ok((shard_id, Err(_))) => {
                    failed += 1;
                    warn!("ACCESS_LOG_QUERY | shard {shard_id} lookup of {request_id} timed out");
                }
                Err(e) => {
                    failed += 1;
                    error!("ACCESS_LOG_QUERY | lookup task failed: {e}");
                }
            }
        }

        if answered == 0 && failed > 0 {
            return Err(SearchError::NoReachableShard);
        }
        Ok(None)
    }
}

async fn scan_shard(
    partitions: &PartitionManager,
    shard: &Shard,
    job: &ScanJob,
    cursor: &str,
    limit: usize,
) -> Result<Vec<AccessLogRow>, StoreError> {
    let Some(partition) = partitions.resolve(shard, &job.filters.day, false).await? else {
        return Ok(Vec::new());
    };
    let plan = build_plan(
        &job.filters,
        &job.scope,
        &partition,
        cursor,
        job.direction,
        limit,
    );
    match shard.store.query(&partition, &plan).await {
        Err(StoreError::PartitionMissing(_)) => {
            partitions.forget(shard.id, &partition.day);
            Ok(Vec::new())
        }
        result => result,
    }
}

async fn lookup_shard(
    partitions: &PartitionManager,
    shard: &Shard,
    day: &Day,
    plan: &QueryPlan,
) -> Result<Option<AccessLogRow>, StoreError> {
    let Some(partition) = partitions.resolve(shard, day, false).await? else {
        return Ok(None);
    };
    match shard.store.query(&partition, plan).await {
        Ok(rows) => Ok(rows.into_iter().next()),
        Err(StoreError::PartitionMissing(_)) => {
            partitions.forget(shard.id, day);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Orders the combined shard rows, drops duplicate ids and cuts the page.
///
/// Returns the page newest first and the cursor continuing in `direction`.
fn merge_page(
    mut rows: Vec<AccessLogRow>,
    direction: Direction,
    page_size: usize,
    cursor: &str,
) -> (Vec<AccessLogRow>, String) {
    match direction {
        Direction::Forward => rows.sort_by(|a, b| b.request_id.cmp(&a.request_id)),
        Direction::Backward => rows.sort_by(|a, b| a.request_id.cmp(&b.request_id)),
    }

    let before = rows.len();
    rows.dedup_by(|a, b| a.request_id == b.request_id);
    if rows.len() < before {
        warn!(
            "ACCESS_LOG_QUERY | {} duplicate request ids across shards",
            before - rows.len()
        );
    }

    rows.truncate(page_size);
    let next_cursor = rows
        .last()
        .map_or_else(|| cursor.to_string(), |row| row.request_id.clone());
    if direction == Direction::Backward {
        rows.reverse();
    }
    (rows, next_cursor)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;
    use tracing_test::traced_test;

    use super::*;
    use crate::query::scope::{StaticNodeDirectory, StaticOwnership};
    use crate::record::LogRecord;
    use crate::storage::memory::MemoryShardStore;
    use crate::storage::ShardStore;

    const DAY: &str = "20240115";
    // 2024-01-15T10:00:00Z
    const TIMESTAMP: i64 = 1_705_312_800;

    struct Cluster {
        engine: QueryEngine,
        stores: Vec<Arc<MemoryShardStore>>,
    }

    async fn cluster(shards: &[&[&str]]) -> Cluster {
        let registry = Arc::new(ShardRegistry::new(Arc::new(MemoryShardStore::default())));
        let partitions = Arc::new(PartitionManager::new());
        let mut stores = Vec::new();
        let mut registered = Vec::new();
        for (index, ids) in shards.iter().enumerate() {
            let store = Arc::new(MemoryShardStore::default());
            let shard = Shard::new(index as i64 + 1, store.clone());
            for id in *ids {
                let record = LogRecord {
                    request_id: id.to_string(),
                    timestamp: TIMESTAMP,
                    node_id: index as i64 + 1,
                    server_id: 100,
                    status: 200,
                    ..Default::default()
                };
                partitions.insert(&shard, record).await.unwrap();
            }
            stores.push(store);
            registered.push(shard);
        }
        registry.replace(registered);

        let ownership = StaticOwnership::new(HashMap::from([(7, vec![100]), (8, vec![])]));
        let engine = QueryEngine::new(
            registry,
            Arc::new(PartitionManager::new()),
            Arc::new(ownership),
            Arc::new(StaticNodeDirectory::default()),
            Duration::from_millis(100),
        );
        Cluster { engine, stores }
    }

    fn request(page_size: usize) -> SearchRequest {
        SearchRequest {
            day: DAY.to_string(),
            page_size,
            ..Default::default()
        }
    }

    fn ids(page: &SearchPage) -> Vec<&str> {
        page.rows.iter().map(|r| r.request_id.as_str()).collect()
    }

    fn row(request_id: String) -> AccessLogRow {
        AccessLogRow {
            request_id,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_merges_two_shards() {
        let cluster = cluster(&[
            &["2024011510000001", "2024011510000003"],
            &["2024011510000002"],
        ])
        .await;

        let page = cluster.engine.search(&request(2)).await.unwrap();
        assert_eq!(ids(&page), ["2024011510000003", "2024011510000002"]);
        assert_eq!(page.next_cursor, "2024011510000002");
        assert!(page.has_more);

        let next = cluster
            .engine
            .search(&SearchRequest {
                cursor: page.next_cursor.clone(),
                ..request(2)
            })
            .await
            .unwrap();
        assert_eq!(ids(&next), ["2024011510000001"]);
        assert!(!next.has_more);
    }

    #[tokio::test]
    async fn test_backward_paging_returns_newest_first() {
        let cluster = cluster(&[&["0001", "0003", "0005"], &["0002", "0004", "0006"]]).await;

        let page = cluster
            .engine
            .search(&SearchRequest {
                cursor: "0002".to_string(),
                direction: Direction::Backward,
                ..request(3)
            })
            .await
            .unwrap();
        assert_eq!(ids(&page), ["0005", "0004", "0003"]);
        assert_eq!(page.next_cursor, "0005");
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn test_empty_page_keeps_cursor() {
        let cluster = cluster(&[&["0001"]]).await;
        let page = cluster
            .engine
            .search(&SearchRequest {
                cursor: "0001".to_string(),
                ..request(10)
            })
            .await
            .unwrap();
        assert!(page.rows.is_empty());
        assert_eq!(page.next_cursor, "0001");
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_invalid_day_is_rejected_before_io() {
        let cluster = cluster(&[&["0001"]]).await;
        let result = cluster
            .engine
            .search(&SearchRequest {
                day: "2024-01-15".to_string(),
                ..request(10)
            })
            .await;
        assert!(matches!(result, Err(SearchError::Validation(_))));
        assert_eq!(cluster.stores[0].query_count(), 0);
    }

    #[tokio::test]
    async fn test_unowned_account_queries_nothing() {
        let cluster = cluster(&[&["0001"]]).await;
        let page = cluster
            .engine
            .search(&SearchRequest {
                user_id: 8,
                ..request(10)
            })
            .await
            .unwrap();
        assert!(page.rows.is_empty());
        assert_eq!(cluster.stores[0].query_count(), 0);

        let page = cluster
            .engine
            .search(&SearchRequest {
                user_id: 7,
                ..request(10)
            })
            .await
            .unwrap();
        assert_eq!(ids(&page), ["0001"]);
    }

    #[tokio::test]
    async fn test_zero_page_size() {
        let cluster = cluster(&[&["0001"]]).await;
        let page = cluster.engine.search(&request(0)).await.unwrap();
        assert_eq!(page, SearchPage::default());
        assert_eq!(cluster.stores[0].query_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_slow_shard_contributes_nothing() {
        let cluster = cluster(&[&["0001"], &["0002"]]).await;
        cluster.stores[1].set_latency(Duration::from_millis(500));

        let page = cluster.engine.search(&request(10)).await.unwrap();
        assert_eq!(ids(&page), ["0001"]);
        assert!(logs_contain("shard 2 timed out"));
    }

    #[tokio::test]
    async fn test_request_deadline_overrides_default() {
        let cluster = cluster(&[&["0001"], &["0002"]]).await;
        cluster.stores[1].set_latency(Duration::from_millis(80));

        // The 100ms engine default would have waited for the slow shard.
        let page = cluster
            .engine
            .search(&SearchRequest {
                timeout: Some(Duration::from_millis(40)),
                ..request(10)
            })
            .await
            .unwrap();
        assert_eq!(ids(&page), ["0001"]);
    }

    #[tokio::test]
    async fn test_all_shards_down() {
        let cluster = cluster(&[&["0001"], &["0002"]]).await;
        for store in &cluster.stores {
            store.set_unavailable(true);
        }
        let result = cluster.engine.search(&request(10)).await;
        assert!(matches!(result, Err(SearchError::NoReachableShard)));

        cluster.stores[0].set_unavailable(false);
        let page = cluster.engine.search(&request(10)).await.unwrap();
        assert_eq!(ids(&page), ["0001"]);
    }

    #[tokio::test]
    async fn test_missing_partition_is_not_an_error() {
        let cluster = cluster(&[&["0001"], &[]]).await;
        let day = Day::parse(DAY).unwrap();
        assert_eq!(cluster.stores[1].find_partition(&day).await.unwrap(), None);

        let page = cluster.engine.search(&request(10)).await.unwrap();
        assert_eq!(ids(&page), ["0001"]);
    }

    #[tokio::test]
    async fn test_find_by_request_id() {
        let cluster = cluster(&[
            &["2024011510000001", "2024011510000003"],
            &["2024011510000002"],
        ])
        .await;

        let row = cluster
            .engine
            .find_by_request_id("2024011510000002")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.node_id, 2);

        let missing = cluster
            .engine
            .find_by_request_id("2024011510000009")
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_find_by_request_id_rejects_short_ids() {
        let cluster = cluster(&[&["2024011510000001"]]).await;
        let result = cluster.engine.find_by_request_id("2024011").await;
        assert!(matches!(result, Err(SearchError::Validation(_))));
        assert_eq!(cluster.stores[0].query_count(), 0);
    }

    #[test]
    fn test_merge_drops_duplicates() {
        let rows = vec![
            row("0002".to_string()),
            row("0001".to_string()),
            row("0002".to_string()),
        ];
        let (page, cursor) = merge_page(rows, Direction::Forward, 10, "");
        assert_eq!(
            page.iter().map(|r| r.request_id.as_str()).collect::<Vec<_>>(),
            ["0002", "0001"]
        );
        assert_eq!(cursor, "0001");
    }

    proptest! {
        #[test]
        fn prop_merge_is_ordered_unique_and_capped(
            ids in proptest::collection::vec(0u32..5_000, 0..3_000),
            page_size in 1usize..=MAX_PAGE_SIZE,
            backward in any::<bool>(),
        ) {
            let direction = if backward { Direction::Backward } else { Direction::Forward };
            let rows = ids.iter().map(|id| row(format!("{id:010}"))).collect();
            let (page, cursor) = merge_page(rows, direction, page_size, "start");

            prop_assert!(page.len() <= page_size);
            for pair in page.windows(2) {
                prop_assert!(pair[0].request_id > pair[1].request_id);
            }
            match (direction, page.first(), page.last()) {
                (Direction::Forward, _, Some(last)) => prop_assert_eq!(&cursor, &last.request_id),
                (Direction::Backward, Some(first), _) => {
                    prop_assert_eq!(&cursor, &first.request_id)
                }
                _ => prop_assert_eq!(cursor.as_str(), "start"),
            }
        }
    }
}
