//! Shared fakes for wharf-etl integration tests
//!
//! - [`SqliteSource`]: a real SQL engine standing in for MySQL. The source
//!   database is attached as `default_db`, so descriptor table references
//!   like `` `default_db`.`table1` `` resolve unchanged.
//! - [`PacedSource`]: a slow or failing view over a [`SqliteSource`].
//! - [`MemoryWarehouse`]: records DDL, appends and count queries, and
//!   evaluates the count queries the pipeline issues.
//! - [`MemoryStore`] / [`FailingStore`]: object stores for staging.
//!
//! All fakes can share an [`EventLog`] so tests can assert the order in which
//! the pipeline touched each system.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::StreamExt;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, TypeInfo, ValueRef};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use wharf_etl::chunk::{Cell, Chunk, Row, TIMESTAMP_FORMAT};
use wharf_etl::descriptor::SinkNamespace;
use wharf_etl::error::{EtlError, QueryKind, Result, System};
use wharf_etl::sink::{SinkAdmin, SinkLoader, SinkQuery};
use wharf_etl::source::{count_from_i64, RowStream, SourceConnection};
use wharf_etl::storage::{ObjectStore, PutResult};

// ============================================================================
// Event log
// ============================================================================

#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

// ============================================================================
// SQLite source
// ============================================================================

pub struct SqliteSource {
    pool: SqlitePool,
    events: EventLog,
    _dir: TempDir,
}

impl SqliteSource {
    pub async fn new(events: EventLog) -> Self {
        let dir = TempDir::new().unwrap();
        let attach = format!(
            "ATTACH DATABASE '{}' AS default_db",
            dir.path().join("default_db.sqlite").display()
        );

        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("main.sqlite"))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .after_connect(move |conn, _meta| {
                let attach = attach.clone();
                Box::pin(async move {
                    sqlx::query(&attach).execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .unwrap();

        Self {
            pool,
            events,
            _dir: dir,
        }
    }

    pub async fn execute(&self, sql: &str) {
        sqlx::query(sql).execute(&self.pool).await.unwrap();
    }

    pub async fn create_table1(&self) {
        self.execute(
            "CREATE TABLE default_db.table1 (
                id TEXT PRIMARY KEY,
                Status TEXT,
                created TEXT,
                updated TEXT,
                deleted TEXT,
                name TEXT,
                `default` INTEGER
            )",
        )
        .await;
    }

    pub async fn insert_table1(&self, id: &str, updated: &str) {
        sqlx::query(
            "INSERT INTO default_db.table1 (id, Status, created, updated, deleted, name, `default`)
             VALUES (?, 'active', ?, ?, NULL, ?, 1)",
        )
        .bind(id)
        .bind(updated)
        .bind(updated)
        .bind(format!("name-{}", id))
        .execute(&self.pool)
        .await
        .unwrap();
    }

    pub async fn create_table2(&self) {
        self.execute(
            "CREATE TABLE default_db.table2 (
                id TEXT PRIMARY KEY,
                Status TEXT,
                created TEXT,
                updated TEXT,
                `index` TEXT,
                content TEXT
            )",
        )
        .await;
    }

    pub async fn insert_table2(&self, id: &str, updated: &str) {
        sqlx::query(
            "INSERT INTO default_db.table2 (id, Status, created, updated, `index`, content)
             VALUES (?, 'open', ?, ?, ?, 'body')",
        )
        .bind(id)
        .bind(updated)
        .bind(updated)
        .bind(format!("idx-{}", id))
        .execute(&self.pool)
        .await
        .unwrap();
    }
}

fn decode_sqlite_row(row: &SqliteRow) -> Result<Row> {
    let err = |e: sqlx::Error| EtlError::query(System::Source, QueryKind::Extract, e);
    (0..row.len())
        .map(|i| {
            let raw = row.try_get_raw(i).map_err(err)?;
            if raw.is_null() {
                return Ok(Cell::Null);
            }
            let type_name = raw.type_info().name().to_string();
            let cell = match type_name.as_str() {
                "INTEGER" => Cell::Int(row.try_get_unchecked(i).map_err(err)?),
                "REAL" => Cell::Float(row.try_get_unchecked(i).map_err(err)?),
                _ => {
                    let text: String = row.try_get_unchecked(i).map_err(err)?;
                    match NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT) {
                        Ok(ts) => Cell::Timestamp(ts),
                        Err(_) => Cell::Text(text),
                    }
                },
            };
            Ok(cell)
        })
        .collect()
}

#[async_trait]
impl SourceConnection for SqliteSource {
    fn fetch<'a>(&'a self, sql: &'a str) -> RowStream<'a> {
        self.events.push("source_fetch");
        sqlx::query(sql)
            .fetch(&self.pool)
            .map(|row| {
                row.map_err(|e| EtlError::query(System::Source, QueryKind::Extract, e))
                    .and_then(|row| decode_sqlite_row(&row))
            })
            .boxed()
    }

    async fn fetch_scalar(&self, sql: &str) -> Result<u64> {
        self.events.push("source_count");
        let value: i64 = sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EtlError::query(System::Source, QueryKind::Count, e))?;
        count_from_i64(System::Source, value)
    }
}

// ============================================================================
// Paced source
// ============================================================================

/// Wraps a [`SqliteSource`], sleeping before each row and logging
/// `source_row:<i>` once the row is handed over. With [`Self::fail_at`],
/// row `i` is replaced by an extraction error.
pub struct PacedSource {
    inner: Arc<SqliteSource>,
    events: EventLog,
    row_delay: Duration,
    fail_at: Option<usize>,
}

impl PacedSource {
    pub fn new(inner: Arc<SqliteSource>, events: EventLog, row_delay: Duration) -> Self {
        Self {
            inner,
            events,
            row_delay,
            fail_at: None,
        }
    }

    pub fn fail_at(mut self, row: usize) -> Self {
        self.fail_at = Some(row);
        self
    }
}

#[async_trait]
impl SourceConnection for PacedSource {
    fn fetch<'a>(&'a self, sql: &'a str) -> RowStream<'a> {
        let events = self.events.clone();
        let delay = self.row_delay;
        let fail_at = self.fail_at;
        self.inner
            .fetch(sql)
            .enumerate()
            .then(move |(i, row)| {
                let events = events.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    events.push(format!("source_row:{}", i));
                    if Some(i) == fail_at {
                        return Err(EtlError::query(
                            System::Source,
                            QueryKind::Extract,
                            "Lost connection to MySQL server during query",
                        ));
                    }
                    row
                }
            })
            .boxed()
    }

    async fn fetch_scalar(&self, sql: &str) -> Result<u64> {
        self.inner.fetch_scalar(sql).await
    }
}

// ============================================================================
// In-memory warehouse
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sink_type: String,
    pub not_null: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemTable {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Default)]
struct WarehouseState {
    tables: BTreeMap<String, MemTable>,
    ddl: Vec<String>,
    queries: Vec<String>,
    /// Remaining forced append failures per chunk index
    append_failures: HashMap<u64, usize>,
}

pub struct MemoryWarehouse {
    state: Mutex<WarehouseState>,
    events: EventLog,
    fail_ddl: bool,
    append_delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryWarehouse {
    pub fn new(events: EventLog) -> Self {
        Self {
            state: Mutex::new(WarehouseState::default()),
            events,
            fail_ddl: false,
            append_delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn failing_ddl(mut self) -> Self {
        self.fail_ddl = true;
        self
    }

    pub fn with_append_delay(mut self, delay: Duration) -> Self {
        self.append_delay = Some(delay);
        self
    }

    /// Fail the next `times` appends of chunk `index`
    pub fn fail_append(self, index: u64, times: usize) -> Self {
        self.state.lock().unwrap().append_failures.insert(index, times);
        self
    }

    pub fn table(&self, fq_name: &str) -> Option<MemTable> {
        self.state.lock().unwrap().tables.get(fq_name).cloned()
    }

    pub fn ddl(&self) -> Vec<String> {
        self.state.lock().unwrap().ddl.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Insert rows directly, bypassing the loader
    pub fn seed(&self, fq_name: &str, rows: Vec<Map<String, Value>>) {
        let mut state = self.state.lock().unwrap();
        state.tables.entry(fq_name.to_string()).or_default().rows.extend(rows);
    }
}

/// Text between the first pair of backticks after `marker`
fn quoted_after<'a>(sql: &'a str, marker: &str) -> Option<&'a str> {
    let rest = &sql[sql.find(marker)? + marker.len()..];
    let start = rest.find('`')? + 1;
    let end = start + rest[start..].find('`')?;
    Some(&rest[start..end])
}

fn parse_create_table(sql: &str) -> Option<(String, Vec<ColumnDef>)> {
    let table = quoted_after(sql, "CREATE OR REPLACE TABLE")?.to_string();
    let body = &sql[sql.find('(')? + 1..sql.rfind(')')?];
    let columns = body
        .split(",\n")
        .map(|line| {
            let line = line.trim();
            let name_end = line[1..].find('`')? + 1;
            let name = line[1..name_end].to_string();
            let mut rest = line[name_end + 1..].split_whitespace();
            let sink_type = rest.next()?.to_string();
            let not_null = line.ends_with("NOT NULL");
            Some(ColumnDef {
                name,
                sink_type,
                not_null,
            })
        })
        .collect::<Option<Vec<_>>>()?;
    Some((table, columns))
}

/// `(column, start, end)` of a half-open range predicate, if present
fn parse_range(sql: &str) -> Option<(String, String, String)> {
    let column = quoted_after(sql, "WHERE")?.to_string();
    let literals: Vec<&str> = sql.split('\'').collect();
    // "... >= '<start>' AND ... < '<end>'" splits into 5 parts
    if literals.len() < 5 {
        return None;
    }
    Some((column, literals[1].to_string(), literals[3].to_string()))
}

#[async_trait]
impl SinkAdmin for MemoryWarehouse {
    async fn execute_ddl(&self, sql: &str) -> Result<()> {
        self.events.push("sink_ddl");
        if self.fail_ddl {
            return Err(EtlError::query(System::Sink, QueryKind::Ddl, "permission denied"));
        }
        let (table, columns) = parse_create_table(sql)
            .ok_or_else(|| EtlError::query(System::Sink, QueryKind::Ddl, "unparsable DDL"))?;

        let mut state = self.state.lock().unwrap();
        state.ddl.push(sql.to_string());
        state.tables.insert(
            table,
            MemTable {
                columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl SinkLoader for MemoryWarehouse {
    async fn append(&self, namespace: &SinkNamespace, table: &str, chunk: &Chunk) -> Result<u64> {
        self.events.push(format!("sink_append:{}", chunk.index));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.append_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fq_name = format!("{}.{}", namespace, table);
        let mut state = self.state.lock().unwrap();

        if let Some(remaining) = state.append_failures.get_mut(&chunk.index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EtlError::Load {
                    chunk: chunk.index,
                    table: fq_name,
                    staged: None,
                    message: "backend error".to_string(),
                });
            }
        }

        let target = state.tables.get_mut(&fq_name).ok_or_else(|| EtlError::Load {
            chunk: chunk.index,
            table: fq_name.clone(),
            staged: None,
            message: "Not found: Table".to_string(),
        })?;
        target.rows.extend(chunk.rows.iter().map(|row| {
            chunk
                .columns
                .iter()
                .zip(row)
                .map(|(name, cell)| {
                    let value = cell.to_text().map(Value::String).unwrap_or(Value::Null);
                    (name.clone(), value)
                })
                .collect::<Map<String, Value>>()
        }));
        Ok(chunk.len() as u64)
    }
}

#[async_trait]
impl SinkQuery for MemoryWarehouse {
    async fn query_scalar(&self, sql: &str) -> Result<u64> {
        self.events.push("sink_count");

        let mut state = self.state.lock().unwrap();
        state.queries.push(sql.to_string());

        let table = quoted_after(sql, "FROM")
            .ok_or_else(|| EtlError::query(System::Sink, QueryKind::Count, "no table"))?;
        let Some(target) = state.tables.get(table) else {
            return Err(EtlError::query(
                System::Sink,
                QueryKind::Count,
                format!("Not found: Table {}", table),
            ));
        };

        let range = parse_range(sql);
        let in_range = |row: &&Map<String, Value>| match &range {
            Some((column, start, end)) => row
                .get(column)
                .and_then(Value::as_str)
                .is_some_and(|v| v >= start.as_str() && v < end.as_str()),
            None => true,
        };

        let count = match quoted_after(sql, "DISTINCT") {
            Some(key) => target
                .rows
                .iter()
                .filter(in_range)
                .filter_map(|row| row.get(key).map(Value::to_string))
                .collect::<HashSet<_>>()
                .len(),
            None => target.rows.iter().filter(in_range).count(),
        };
        Ok(count as u64)
    }
}

// ============================================================================
// Object stores
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        "etl-raw-data"
    }

    async fn put(&self, key: &str, data: Vec<u8>, _content_type: &str) -> anyhow::Result<PutResult> {
        let size = data.len() as u64;
        let checksum = wharf_common::checksum::sha256_hex(&data);
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(PutResult {
            key: key.to_string(),
            checksum,
            size,
        })
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self.object(key)
            .ok_or_else(|| anyhow::anyhow!("NoSuchKey: {}", key))
    }
}

/// Store whose writes always fail
pub struct FailingStore;

#[async_trait]
impl ObjectStore for FailingStore {
    fn bucket(&self) -> &str {
        "etl-raw-data"
    }

    async fn put(&self, _key: &str, _data: Vec<u8>, _content_type: &str) -> anyhow::Result<PutResult> {
        anyhow::bail!("503 Slow Down")
    }

    async fn exists(&self, _key: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("NoSuchKey: {}", key)
    }
}
