// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process shard backend.
//!
//! Evaluates [`QueryPlan`]s directly against rows held in memory. It backs the
//! standalone agent and doubles as a controllable shard in tests: the schema of
//! newly created day tables, per-call latency and availability can all be
//! changed at runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::StoreError;
use crate::query::filter::ipv4_to_u32;
use crate::query::plan::{
    ContentField, KeywordMatch, Predicate, QueryPlan, SortOrder, KEYWORD_FIELDS,
};
use crate::record::Day;
use crate::storage::{AccessLogRow, PartitionInfo, PartitionSchema, ShardStore};

#[derive(Debug)]
struct StoredRow {
    row: AccessLogRow,
    content: Value,
}

#[derive(Debug)]
struct MemoryPartition {
    info: PartitionInfo,
    rows: Vec<StoredRow>,
}

#[derive(Debug, Default)]
struct MemoryState {
    schema: PartitionSchema,
    partitions: HashMap<Day, MemoryPartition>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct MemoryShardStore {
    state: Mutex<MemoryState>,
    latency_ms: AtomicU64,
    unavailable: AtomicBool,
    queries: AtomicUsize,
    inserts: AtomicUsize,
}

impl MemoryShardStore {
    #[must_use]
    pub fn new(schema: PartitionSchema) -> Self {
        let store = Self::default();
        store.set_schema(schema);
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }

    /// Schema of tables created after this call. Existing tables keep theirs.
    pub fn set_schema(&self, schema: PartitionSchema) {
        self.lock().schema = schema;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Drops a whole day table, as a retention sweep would.
    pub fn drop_partition(&self, day: &Day) -> bool {
        self.lock().partitions.remove(day).is_some()
    }

    #[must_use]
    pub fn row_count(&self, day: &Day) -> usize {
        self.lock()
            .partitions
            .get(day)
            .map_or(0, |partition| partition.rows.len())
    }

    /// Number of `query` calls served, failed ones included.
    #[must_use]
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    /// Number of `insert` calls served, failed ones included.
    #[must_use]
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::Relaxed)
    }

    async fn simulate_io(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable(
                "memory shard marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ShardStore for MemoryShardStore {
    async fn find_partition(&self, day: &Day) -> Result<Option<PartitionInfo>, StoreError> {
        self.simulate_io().await?;
        Ok(self
            .lock()
            .partitions
            .get(day)
            .map(|partition| partition.info.clone()))
    }

    async fn create_partition(&self, day: &Day) -> Result<PartitionInfo, StoreError> {
        self.simulate_io().await?;
        let mut state = self.lock();
        let schema = state.schema;
        let partition = state
            .partitions
            .entry(day.clone())
            .or_insert_with(|| MemoryPartition {
                info: PartitionInfo::new(day.clone(), schema.remote_addr, schema.domain),
                rows: Vec::new(),
            });
        Ok(partition.info.clone())
    }

    async fn insert(
        &self,
        partition: &PartitionInfo,
        row: &AccessLogRow,
    ) -> Result<(), StoreError> {
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.simulate_io().await?;
        let content: Value = serde_json::from_str(&row.content)?;

        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        let Some(table) = state.partitions.get_mut(&partition.day) else {
            return Err(StoreError::PartitionMissing(partition.table.clone()));
        };

        let mut row = row.clone();
        row.id = id;
        if !table.info.has_remote_addr {
            row.remote_addr = None;
        }
        if !table.info.has_domain {
            row.domain = None;
        }
        table.rows.push(StoredRow { row, content });
        Ok(())
    }

    async fn query(
        &self,
        partition: &PartitionInfo,
        plan: &QueryPlan,
    ) -> Result<Vec<AccessLogRow>, StoreError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.simulate_io().await?;

        let state = self.lock();
        let Some(table) = state.partitions.get(&partition.day) else {
            return Err(StoreError::PartitionMissing(partition.table.clone()));
        };

        let mut matched: Vec<&StoredRow> = table
            .rows
            .iter()
            .filter(|stored| plan.predicates.iter().all(|p| matches(stored, p)))
            .collect();
        match plan.order {
            SortOrder::Ascending => {
                matched.sort_by(|a, b| a.row.request_id.cmp(&b.row.request_id))
            }
            SortOrder::Descending => {
                matched.sort_by(|a, b| b.row.request_id.cmp(&a.row.request_id))
            }
        }
        Ok(matched
            .into_iter()
            .take(plan.limit)
            .map(|stored| stored.row.clone())
            .collect())
    }
}

fn content_str(content: &Value, field: ContentField) -> Option<&str> {
    content.get(field.json_key()).and_then(Value::as_str)
}

fn in_range(addr: Option<&str>, from: u32, to: u32) -> bool {
    addr.and_then(ipv4_to_u32)
        .is_some_and(|value| (from..=to).contains(&value))
}

fn matches(stored: &StoredRow, predicate: &Predicate) -> bool {
    let row = &stored.row;
    match predicate {
        Predicate::NodeIn(ids) => ids.contains(&row.node_id),
        Predicate::ServerIn(ids) => ids.contains(&row.server_id),
        Predicate::StatusAtLeast(status) => row.status >= *status,
        Predicate::FirewallPolicy(id) => row.firewall_policy_id == *id,
        Predicate::FirewallRuleGroup(id) => row.firewall_rule_group_id == *id,
        Predicate::FirewallRuleSet(id) => row.firewall_rule_set_id == *id,
        Predicate::AnyFirewallPolicy => row.firewall_policy_id > 0,
        Predicate::RemoteAddr(addr) => row.remote_addr.as_deref() == Some(addr.as_str()),
        Predicate::RemoteAddrBetween(from, to) => in_range(row.remote_addr.as_deref(), *from, *to),
        Predicate::Domain(domain) => row.domain.as_deref() == Some(domain.as_str()),
        Predicate::DomainLike(pattern) => row.domain.as_deref().is_some_and(|d| like(pattern, d)),
        Predicate::ContentEquals(field, value) => {
            content_str(&stored.content, *field) == Some(value.as_str())
        }
        Predicate::ContentLike(field, pattern) => {
            content_str(&stored.content, *field).is_some_and(|v| like(pattern, v))
        }
        Predicate::ContentAddrBetween(from, to) => in_range(
            content_str(&stored.content, ContentField::RemoteAddr),
            *from,
            *to,
        ),
        Predicate::Keyword(keyword) => keyword_matches(stored, keyword),
        Predicate::RequestId(id) => row.request_id == *id,
        Predicate::RequestIdBefore(cursor) => row.request_id.as_str() < cursor.as_str(),
        Predicate::RequestIdAfter(cursor) => row.request_id.as_str() > cursor.as_str(),
    }
}

fn keyword_matches(stored: &StoredRow, keyword: &KeywordMatch) -> bool {
    let pattern = format!("%{}%", keyword.text);
    if KEYWORD_FIELDS
        .iter()
        .any(|field| content_str(&stored.content, *field).is_some_and(|v| like(&pattern, v)))
    {
        return true;
    }

    let tagged = stored
        .content
        .get("tags")
        .and_then(Value::as_array)
        .is_some_and(|tags| tags.iter().any(|tag| tag.as_str() == Some(keyword.text.as_str())));
    if tagged {
        return true;
    }

    if keyword.method
        && content_str(&stored.content, ContentField::RequestMethod) == Some(keyword.text.as_str())
    {
        return true;
    }

    if let Some((from, to)) = keyword.status {
        let status = stored.content.get("status").and_then(Value::as_u64);
        if status.is_some_and(|s| (u64::from(from)..=u64::from(to)).contains(&s)) {
            return true;
        }
    }

    keyword
        .request_id
        .as_ref()
        .is_some_and(|id| stored.row.request_id == *id)
}

/// SQL `LIKE` with `%` as the only wildcard, ASCII case-insensitive.
pub(crate) fn like(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.to_ascii_lowercase().chars().collect();
    let value: Vec<char> = value.to_ascii_lowercase().chars().collect();

    let (mut p, mut v) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while v < value.len() {
        if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, v));
            p += 1;
        } else if p < pattern.len() && pattern[p] == value[v] {
            p += 1;
            v += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            v = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogRecord;

    fn day() -> Day {
        Day::parse("20240115").unwrap()
    }

    async fn insert(store: &MemoryShardStore, partition: &PartitionInfo, record: LogRecord) {
        let content = serde_json::to_string(&record).unwrap();
        let row = AccessLogRow::new(partition, &record, b"", content);
        store.insert(partition, &row).await.unwrap();
    }

    fn record(request_id: &str) -> LogRecord {
        LogRecord {
            request_id: request_id.to_string(),
            timestamp: 1_705_312_800,
            status: 200,
            remote_addr: "192.168.1.10".to_string(),
            host: "www.example.com".to_string(),
            request_uri: "/index.html".to_string(),
            request_method: "GET".to_string(),
            user_agent: "curl/8.0".to_string(),
            ..Default::default()
        }
    }

    fn ids(rows: &[AccessLogRow]) -> Vec<&str> {
        rows.iter().map(|r| r.request_id.as_str()).collect()
    }

    #[test]
    fn test_like() {
        assert!(like("%.example.com", "www.example.com"));
        assert!(like("www.%.com", "WWW.Example.COM"));
        assert!(like("%", ""));
        assert!(like("%exa%", "www.example.com"));
        assert!(!like("%.example.com", "example.com"));
        assert!(!like("abc", "abcd"));
        assert!(like("a%c%e", "abcde"));
    }

    #[tokio::test]
    async fn test_partition_lifecycle() {
        let store = MemoryShardStore::new(PartitionSchema::default());
        assert_eq!(store.find_partition(&day()).await.unwrap(), None);

        let created = store.create_partition(&day()).await.unwrap();
        assert!(created.has_remote_addr && created.has_domain);

        store.set_schema(PartitionSchema {
            remote_addr: false,
            domain: false,
        });
        // Creating again is a no-op and keeps the original schema.
        assert_eq!(store.create_partition(&day()).await.unwrap(), created);
        assert_eq!(store.find_partition(&day()).await.unwrap(), Some(created));

        assert!(store.drop_partition(&day()));
        assert_eq!(store.find_partition(&day()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_into_missing_partition() {
        let store = MemoryShardStore::default();
        let partition = PartitionInfo::new(day(), true, true);
        let row = AccessLogRow {
            content: "{}".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            store.insert(&partition, &row).await,
            Err(StoreError::PartitionMissing(table)) if table == "edgeHTTPAccessLogs_20240115"
        ));
    }

    #[tokio::test]
    async fn test_query_orders_limits_and_bounds() {
        let store = MemoryShardStore::default();
        let partition = store.create_partition(&day()).await.unwrap();
        for id in ["0003", "0001", "0005", "0002", "0004"] {
            insert(&store, &partition, record(id)).await;
        }

        let mut plan = QueryPlan::new(SortOrder::Descending, 2);
        plan.push(Predicate::RequestIdBefore("0005".to_string()));
        assert_eq!(ids(&store.query(&partition, &plan).await.unwrap()), ["0004", "0003"]);

        let mut plan = QueryPlan::new(SortOrder::Ascending, 10);
        plan.push(Predicate::RequestIdAfter("0003".to_string()));
        assert_eq!(ids(&store.query(&partition, &plan).await.unwrap()), ["0004", "0005"]);
        assert_eq!(store.query_count(), 2);
    }

    #[tokio::test]
    async fn test_address_and_domain_predicates() {
        let store = MemoryShardStore::default();
        let partition = store.create_partition(&day()).await.unwrap();
        insert(&store, &partition, record("0001")).await;
        insert(
            &store,
            &partition,
            LogRecord {
                remote_addr: "10.0.0.5".to_string(),
                host: "api.example.org".to_string(),
                ..record("0002")
            },
        )
        .await;

        let query = |predicate: Predicate| {
            let mut plan = QueryPlan::new(SortOrder::Descending, 10);
            plan.push(predicate);
            plan
        };
        let lo = ipv4_to_u32("10.0.0.0").unwrap();
        let hi = ipv4_to_u32("10.0.0.255").unwrap();

        let rows = store
            .query(&partition, &query(Predicate::RemoteAddrBetween(lo, hi)))
            .await
            .unwrap();
        assert_eq!(ids(&rows), ["0002"]);

        let rows = store
            .query(&partition, &query(Predicate::ContentAddrBetween(lo, hi)))
            .await
            .unwrap();
        assert_eq!(ids(&rows), ["0002"]);

        let rows = store
            .query(&partition, &query(Predicate::DomainLike("%.example.com".to_string())))
            .await
            .unwrap();
        assert_eq!(ids(&rows), ["0001"]);

        let rows = store
            .query(
                &partition,
                &query(Predicate::ContentEquals(
                    ContentField::Host,
                    "api.example.org".to_string(),
                )),
            )
            .await
            .unwrap();
        assert_eq!(ids(&rows), ["0002"]);
    }

    #[tokio::test]
    async fn test_keyword_alternatives() {
        let store = MemoryShardStore::default();
        let partition = store.create_partition(&day()).await.unwrap();
        insert(&store, &partition, record("0001")).await;
        insert(
            &store,
            &partition,
            LogRecord {
                status: 502,
                request_method: "POST".to_string(),
                tags: vec!["waf".to_string()],
                user_agent: "Mozilla".to_string(),
                ..record("0002")
            },
        )
        .await;

        let search = |keyword: KeywordMatch| {
            let mut plan = QueryPlan::new(SortOrder::Descending, 10);
            plan.push(Predicate::Keyword(keyword));
            plan
        };
        let keyword = |text: &str| KeywordMatch {
            text: text.to_string(),
            method: false,
            status: None,
            request_id: None,
        };

        let rows = store.query(&partition, &search(keyword("curl"))).await.unwrap();
        assert_eq!(ids(&rows), ["0001"]);

        let rows = store.query(&partition, &search(keyword("waf"))).await.unwrap();
        assert_eq!(ids(&rows), ["0002"]);

        let rows = store
            .query(
                &partition,
                &search(KeywordMatch {
                    method: true,
                    ..keyword("POST")
                }),
            )
            .await
            .unwrap();
        assert_eq!(ids(&rows), ["0002"]);

        let rows = store
            .query(
                &partition,
                &search(KeywordMatch {
                    status: Some((500, 599)),
                    ..keyword("500-599")
                }),
            )
            .await
            .unwrap();
        assert_eq!(ids(&rows), ["0002"]);
    }

    #[tokio::test]
    async fn test_unavailable_shard_fails_calls() {
        let store = MemoryShardStore::default();
        store.set_unavailable(true);
        assert!(matches!(
            store.find_partition(&day()).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.find_partition(&day()).await.is_ok());
    }
}
