// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SQLite shard backend.
//!
//! One database per shard, one table per day. Every caller-supplied value is
//! bound as a parameter. Only the table name, derived from a validated
//! [`Day`], and fixed JSON paths are spliced into statement text. rusqlite is
//! synchronous, so statements run on the blocking pool.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, Row};
use tracing::debug;

use crate::errors::StoreError;
use crate::query::filter::ipv4_to_u32;
use crate::query::plan::{
    ContentField, KeywordMatch, Predicate, QueryPlan, SortOrder, KEYWORD_FIELDS,
};
use crate::record::Day;
use crate::storage::{table_name, AccessLogRow, PartitionInfo, PartitionSchema, ShardStore};

/// Columns every partition has, in select order.
const BASE_COLUMNS: &str = "id, serverId, nodeId, status, createdAt, requestId, \
    firewallPolicyId, firewallRuleGroupId, firewallRuleSetId, firewallRuleId";

const INDEXES: [(&str, &str); 8] = [
    ("serverId", "serverId"),
    ("nodeId", "nodeId"),
    ("serverId_status", "serverId, status"),
    ("requestId", "requestId"),
    ("firewallPolicyId", "firewallPolicyId"),
    ("firewallRuleGroupId", "firewallRuleGroupId"),
    ("firewallRuleSetId", "firewallRuleSetId"),
    ("firewallRuleId", "firewallRuleId"),
];

/// DDL of a day table and its indexes, with the partition's optional columns.
pub fn create_table_sql(partition: &PartitionInfo) -> String {
    let table = &partition.table;
    let mut sql = format!("CREATE TABLE IF NOT EXISTS \"{table}\" (\n");
    sql.push_str("  id INTEGER PRIMARY KEY AUTOINCREMENT,\n");
    sql.push_str("  serverId INTEGER NOT NULL DEFAULT 0,\n");
    sql.push_str("  nodeId INTEGER NOT NULL DEFAULT 0,\n");
    sql.push_str("  status INTEGER NOT NULL DEFAULT 0,\n");
    sql.push_str("  createdAt INTEGER NOT NULL DEFAULT 0,\n");
    sql.push_str("  content TEXT,\n");
    sql.push_str("  requestId TEXT,\n");
    sql.push_str("  firewallPolicyId INTEGER NOT NULL DEFAULT 0,\n");
    sql.push_str("  firewallRuleGroupId INTEGER NOT NULL DEFAULT 0,\n");
    sql.push_str("  firewallRuleSetId INTEGER NOT NULL DEFAULT 0,\n");
    sql.push_str("  firewallRuleId INTEGER NOT NULL DEFAULT 0,\n");
    if partition.has_remote_addr {
        sql.push_str("  remoteAddr TEXT,\n");
    }
    if partition.has_domain {
        sql.push_str("  domain TEXT,\n");
    }
    sql.push_str("  requestBody BLOB\n);\n");

    let optional = [
        partition.has_remote_addr.then_some(("remoteAddr", "remoteAddr")),
        partition.has_domain.then_some(("domain", "domain")),
    ];
    for (name, columns) in INDEXES.into_iter().chain(optional.into_iter().flatten()) {
        let _ = writeln!(
            sql,
            "CREATE INDEX IF NOT EXISTS \"{table}_{name}\" ON \"{table}\" ({columns});"
        );
    }
    sql
}

fn content_path(field: ContentField) -> String {
    format!("json_extract(content, '$.{}')", field.json_key())
}

/// Escapes `_` and `\` so only `%` acts as a wildcard.
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '_' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn like_clause(expr: &str) -> String {
    format!("{expr} LIKE ? ESCAPE '\\'")
}

#[derive(Default)]
struct Renderer {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Renderer {
    fn clause(&mut self, clause: impl Into<String>, params: impl IntoIterator<Item = Value>) {
        self.clauses.push(clause.into());
        self.params.extend(params);
    }

    fn id_list(&mut self, column: &str, ids: &[i64]) {
        if ids.is_empty() {
            self.clause("0 = 1", []);
            return;
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        self.clause(
            format!("{column} IN ({placeholders})"),
            ids.iter().map(|id| Value::Integer(*id)),
        );
    }

    fn keyword(&mut self, keyword: &KeywordMatch) {
        let like = format!("%{}%", escape_like(&keyword.text));
        let mut alternatives = Vec::new();
        let mut params = Vec::new();
        for field in KEYWORD_FIELDS {
            alternatives.push(like_clause(&content_path(field)));
            params.push(Value::Text(like.clone()));
        }
        alternatives.push(
            "EXISTS (SELECT 1 FROM json_each(content, '$.tags') WHERE json_each.value = ?)"
                .to_string(),
        );
        params.push(Value::Text(keyword.text.clone()));
        if keyword.method {
            alternatives.push(format!("{} = ?", content_path(ContentField::RequestMethod)));
            params.push(Value::Text(keyword.text.clone()));
        }
        if let Some((from, to)) = keyword.status {
            alternatives.push("status BETWEEN ? AND ?".to_string());
            params.push(Value::Integer(i64::from(from)));
            params.push(Value::Integer(i64::from(to)));
        }
        if let Some(request_id) = &keyword.request_id {
            alternatives.push("requestId = ?".to_string());
            params.push(Value::Text(request_id.clone()));
        }
        self.clause(format!("({})", alternatives.join(" OR ")), params);
    }

    fn address_range(&mut self, expr: &str, from: u32, to: u32) {
        self.clause(
            format!("inet_aton({expr}) BETWEEN ? AND ?"),
            [Value::Integer(i64::from(from)), Value::Integer(i64::from(to))],
        );
    }

    fn predicate(&mut self, predicate: &Predicate) {
        match predicate {
            Predicate::NodeIn(ids) => self.id_list("nodeId", ids),
            Predicate::ServerIn(ids) => self.id_list("serverId", ids),
            Predicate::StatusAtLeast(status) => {
                self.clause("status >= ?", [Value::Integer(i64::from(*status))])
            }
            Predicate::FirewallPolicy(id) => {
                self.clause("firewallPolicyId = ?", [Value::Integer(*id)])
            }
            Predicate::FirewallRuleGroup(id) => {
                self.clause("firewallRuleGroupId = ?", [Value::Integer(*id)])
            }
            Predicate::FirewallRuleSet(id) => {
                self.clause("firewallRuleSetId = ?", [Value::Integer(*id)])
            }
            Predicate::AnyFirewallPolicy => self.clause("firewallPolicyId > 0", []),
            Predicate::RemoteAddr(addr) => {
                self.clause("remoteAddr = ?", [Value::Text(addr.clone())])
            }
            Predicate::RemoteAddrBetween(from, to) => self.address_range("remoteAddr", *from, *to),
            Predicate::Domain(domain) => self.clause("domain = ?", [Value::Text(domain.clone())]),
            Predicate::DomainLike(pattern) => {
                self.clause(like_clause("domain"), [Value::Text(escape_like(pattern))])
            }
            Predicate::ContentEquals(field, value) => self.clause(
                format!("{} = ?", content_path(*field)),
                [Value::Text(value.clone())],
            ),
            Predicate::ContentLike(field, pattern) => self.clause(
                like_clause(&content_path(*field)),
                [Value::Text(escape_like(pattern))],
            ),
            Predicate::ContentAddrBetween(from, to) => {
                self.address_range(&content_path(ContentField::RemoteAddr), *from, *to)
            }
            Predicate::Keyword(keyword) => self.keyword(keyword),
            Predicate::RequestId(id) => self.clause("requestId = ?", [Value::Text(id.clone())]),
            Predicate::RequestIdBefore(cursor) => {
                self.clause("requestId < ?", [Value::Text(cursor.clone())])
            }
            Predicate::RequestIdAfter(cursor) => {
                self.clause("requestId > ?", [Value::Text(cursor.clone())])
            }
        }
    }
}

/// Renders `plan` against `partition` into a statement and its bound values.
///
/// Optional columns the partition lacks are selected as `NULL` so every row
/// has the same shape.
pub fn render_query(partition: &PartitionInfo, plan: &QueryPlan) -> (String, Vec<Value>) {
    let remote_addr = if partition.has_remote_addr {
        "remoteAddr"
    } else {
        "NULL"
    };
    let domain = if partition.has_domain { "domain" } else { "NULL" };

    let mut renderer = Renderer::default();
    for predicate in &plan.predicates {
        renderer.predicate(predicate);
    }

    let mut sql = format!(
        "SELECT {BASE_COLUMNS}, {remote_addr}, {domain}, requestBody, content FROM \"{}\"",
        partition.table
    );
    if !renderer.clauses.is_empty() {
        let _ = write!(sql, " WHERE {}", renderer.clauses.join(" AND "));
    }
    let order = match plan.order {
        SortOrder::Ascending => "ASC",
        SortOrder::Descending => "DESC",
    };
    let _ = write!(sql, " ORDER BY requestId {order} LIMIT {}", plan.limit);
    (sql, renderer.params)
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<AccessLogRow> {
    Ok(AccessLogRow {
        id: u64::try_from(row.get::<_, i64>(0)?).unwrap_or_default(),
        server_id: row.get(1)?,
        node_id: row.get(2)?,
        status: u16::try_from(row.get::<_, i64>(3)?).unwrap_or_default(),
        created_at: row.get(4)?,
        request_id: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        firewall_policy_id: row.get(6)?,
        firewall_rule_group_id: row.get(7)?,
        firewall_rule_set_id: row.get(8)?,
        firewall_rule_id: row.get(9)?,
        remote_addr: row.get(10)?,
        domain: row.get(11)?,
        request_body: row.get(12)?,
        content: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
    })
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Maps a statement failure on `table`, telling a missing table apart.
fn store_error(table: &str, err: rusqlite::Error) -> StoreError {
    if err.to_string().contains("no such table") {
        StoreError::PartitionMissing(table.to_string())
    } else {
        backend(err)
    }
}

/// `inet_aton(text)`: dotted IPv4 to its 32-bit value, NULL otherwise.
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "inet_aton",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let value = match ctx.get_raw(0) {
                ValueRef::Text(text) => std::str::from_utf8(text).ok().and_then(ipv4_to_u32),
                _ => None,
            };
            Ok(value.map(i64::from))
        },
    )
}

fn describe_partition(conn: &Connection, day: &Day) -> Result<Option<PartitionInfo>, StoreError> {
    let table = table_name(day);
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1)")
        .map_err(backend)?;
    let columns = stmt
        .query_map([table.as_str()], |row| row.get::<_, String>(0))
        .map_err(backend)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(backend)?;
    if columns.is_empty() {
        return Ok(None);
    }
    let has = |name: &str| columns.iter().any(|column| column == name);
    Ok(Some(PartitionInfo::new(
        day.clone(),
        has("remoteAddr"),
        has("domain"),
    )))
}

fn insert_row(
    conn: &Connection,
    partition: &PartitionInfo,
    row: &AccessLogRow,
) -> Result<(), StoreError> {
    let mut columns = vec![
        "serverId",
        "nodeId",
        "status",
        "createdAt",
        "requestId",
        "firewallPolicyId",
        "firewallRuleGroupId",
        "firewallRuleSetId",
        "firewallRuleId",
    ];
    let mut values = vec![
        Value::Integer(row.server_id),
        Value::Integer(row.node_id),
        Value::Integer(i64::from(row.status)),
        Value::Integer(row.created_at),
        Value::Text(row.request_id.clone()),
        Value::Integer(row.firewall_policy_id),
        Value::Integer(row.firewall_rule_group_id),
        Value::Integer(row.firewall_rule_set_id),
        Value::Integer(row.firewall_rule_id),
    ];
    let text = |value: &Option<String>| value.clone().map_or(Value::Null, Value::Text);
    if partition.has_remote_addr {
        columns.push("remoteAddr");
        values.push(text(&row.remote_addr));
    }
    if partition.has_domain {
        columns.push("domain");
        values.push(text(&row.domain));
    }
    columns.push("requestBody");
    values.push(row.request_body.clone().map_or(Value::Null, Value::Blob));
    columns.push("content");
    values.push(Value::Text(row.content.clone()));

    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES ({placeholders})",
        partition.table,
        columns.join(", ")
    );
    conn.execute(&sql, params_from_iter(values))
        .map_err(|e| store_error(&partition.table, e))?;
    Ok(())
}

/// A shard kept in one SQLite database.
#[derive(Debug)]
pub struct SqliteShardStore {
    conn: Arc<Mutex<Connection>>,
    schema: Mutex<PartitionSchema>,
}

impl SqliteShardStore {
    /// Opens (or creates) the database file of a shard.
    pub fn open(path: impl AsRef<Path>, schema: PartitionSchema) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(backend)?;
        Self::with_connection(conn, schema)
    }

    pub fn open_in_memory(schema: PartitionSchema) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::with_connection(conn, schema)
    }

    fn with_connection(conn: Connection, schema: PartitionSchema) -> Result<Self, StoreError> {
        register_functions(&conn).map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            schema: Mutex::new(schema),
        })
    }

    /// Schema of tables created after this call. Existing tables keep theirs.
    pub fn set_schema(&self, schema: PartitionSchema) {
        #[allow(clippy::expect_used)]
        let mut current = self.schema.lock().expect("lock poisoned");
        *current = schema;
    }

    fn schema(&self) -> PartitionSchema {
        #[allow(clippy::expect_used)]
        let schema = self.schema.lock().expect("lock poisoned");
        *schema
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            #[allow(clippy::expect_used)]
            let conn = conn.lock().expect("lock poisoned");
            op(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join: {e}")))?
    }
}

#[async_trait]
impl ShardStore for SqliteShardStore {
    async fn find_partition(&self, day: &Day) -> Result<Option<PartitionInfo>, StoreError> {
        let day = day.clone();
        self.run(move |conn| describe_partition(conn, &day)).await
    }

    async fn create_partition(&self, day: &Day) -> Result<PartitionInfo, StoreError> {
        let schema = self.schema();
        let day = day.clone();
        self.run(move |conn| {
            if let Some(existing) = describe_partition(conn, &day)? {
                return Ok(existing);
            }
            let partition = PartitionInfo::new(day, schema.remote_addr, schema.domain);
            conn.execute_batch(&create_table_sql(&partition))
                .map_err(backend)?;
            debug!("ACCESS_LOG | created partition {}", partition.table);
            Ok(partition)
        })
        .await
    }

    async fn insert(
        &self,
        partition: &PartitionInfo,
        row: &AccessLogRow,
    ) -> Result<(), StoreError> {
        let partition = partition.clone();
        let row = row.clone();
        self.run(move |conn| insert_row(conn, &partition, &row))
            .await
    }

    async fn query(
        &self,
        partition: &PartitionInfo,
        plan: &QueryPlan,
    ) -> Result<Vec<AccessLogRow>, StoreError> {
        let (sql, params) = render_query(partition, plan);
        let table = partition.table.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(|e| store_error(&table, e))?;
            let rows = stmt
                .query_map(params_from_iter(params), read_row)
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)?;
            Ok(rows)
        })
        .await
    }
}
