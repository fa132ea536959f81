//! Durable staging of chunks as CSV objects
//!
//! Object keys follow
//! `<env>/<table>/year=<Y>/month=<M>/day=<D>/<table>_<token>.csv`, with the
//! date taken from the end of the run window. Every staging attempt draws a
//! fresh token, and an existing object is never overwritten.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::chunk::{Cell, Chunk, Row, DATE_FORMAT, TIMESTAMP_FORMAT};
use crate::descriptor::{SinkType, TableDescriptor};
use crate::error::{EtlError, Result};
use crate::request::{Environment, RunRequest};
use crate::storage::ObjectStore;

pub const STAGING_EXTENSION: &str = "csv";
pub const STAGING_CONTENT_TYPE: &str = "text/csv";
pub const DEFAULT_MAX_TOKEN_DRAWS: usize = 5;
/// Field text standing for SQL NULL; an empty field is an empty string
pub const NULL_MARKER: &str = "\\N";

/// Source of unique filename tokens
pub trait TokenSource: Send + Sync {
    fn next_token(&self) -> String;
}

/// Random v4 UUID per draw
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidTokenSource;

impl TokenSource for UuidTokenSource {
    fn next_token(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Address of one staged chunk
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StagingLocator {
    pub bucket: String,
    pub environment: Environment,
    pub table: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub token: String,
    pub extension: String,
}

impl StagingLocator {
    pub fn new(bucket: impl Into<String>, request: &RunRequest, token: impl Into<String>) -> Self {
        let (year, month, day) = request.window().partition();
        Self {
            bucket: bucket.into(),
            environment: request.environment(),
            table: request.table().sink_table.clone(),
            year,
            month,
            day,
            token: token.into(),
            extension: STAGING_EXTENSION.to_string(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}.{}", self.table, self.token, self.extension)
    }

    /// Object key within the bucket
    pub fn key(&self) -> String {
        format!(
            "{}/{}/year={}/month={}/day={}/{}",
            self.environment,
            self.table,
            self.year,
            self.month,
            self.day,
            self.file_name()
        )
    }

    /// Parse an object key produced by [`StagingLocator::key`]
    pub fn parse_key(bucket: impl Into<String>, key: &str) -> Result<Self> {
        let invalid = || EtlError::Config(format!("'{}' is not a staging object key", key));

        let parts: Vec<&str> = key.split('/').collect();
        let [env, table, year, month, day, file] = parts.as_slice() else {
            return Err(invalid());
        };

        let field = |part: &str, name: &str| -> Result<u32> {
            part.strip_prefix(name)
                .and_then(|v| v.strip_prefix('='))
                .and_then(|v| v.parse().ok())
                .ok_or_else(invalid)
        };

        let year = field(year, "year")?;
        let month = field(month, "month")?;
        let day = field(day, "day")?;
        NaiveDate::from_ymd_opt(year as i32, month, day).ok_or_else(invalid)?;

        let (stem, extension) = file.rsplit_once('.').ok_or_else(invalid)?;
        let token = stem
            .strip_prefix(*table)
            .and_then(|rest| rest.strip_prefix('_'))
            .filter(|t| !t.is_empty())
            .ok_or_else(invalid)?;

        Ok(Self {
            bucket: bucket.into(),
            environment: env.parse()?,
            table: table.to_string(),
            year: year as i32,
            month,
            day,
            token: token.to_string(),
            extension: extension.to_string(),
        })
    }
}

impl fmt::Display for StagingLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key())
    }
}

/// Encode a chunk as CSV: header row, then one line per row
pub fn encode_csv(chunk: &Chunk) -> std::result::Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&chunk.columns)?;
    for row in &chunk.rows {
        writer.write_record(
            row.iter()
                .map(|cell| cell.to_text().unwrap_or_else(|| NULL_MARKER.to_string())),
        )?;
    }
    writer.into_inner().map_err(|e| e.into_error().into())
}

/// Decode a staged CSV object back into a chunk typed by the sink schema.
///
/// Only [`NULL_MARKER`] fields become null.
pub fn decode_csv(data: &[u8], table: &TableDescriptor, index: u64) -> Result<Chunk> {
    let bad = |message: String| EtlError::Config(format!("malformed staged file: {}", message));

    let mut reader = csv::Reader::from_reader(data);
    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| bad(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();
    if columns != table.source_columns {
        return Err(bad(format!(
            "header {:?} does not match columns of '{}'",
            columns, table.id
        )));
    }

    let types: Vec<SinkType> = columns
        .iter()
        .map(|c| {
            table
                .sink_column(c)
                .map(|col| col.sink_type)
                .unwrap_or(SinkType::String)
        })
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| bad(e.to_string()))?;
        let row = record
            .iter()
            .zip(&types)
            .map(|(field, sink_type)| parse_field(field, *sink_type).map_err(&bad))
            .collect::<Result<Row>>()?;
        rows.push(row);
    }

    Ok(Chunk::new(index, columns, rows))
}

fn parse_field(field: &str, sink_type: SinkType) -> std::result::Result<Cell, String> {
    if field == NULL_MARKER {
        return Ok(Cell::Null);
    }
    let cell = match sink_type {
        SinkType::Integer => Cell::Int(field.parse().map_err(|e| format!("'{}': {}", field, e))?),
        SinkType::Float => Cell::Float(field.parse().map_err(|e| format!("'{}': {}", field, e))?),
        SinkType::Boolean => Cell::Bool(field.parse().map_err(|e| format!("'{}': {}", field, e))?),
        SinkType::Timestamp | SinkType::Datetime => Cell::Timestamp(
            NaiveDateTime::parse_from_str(field, TIMESTAMP_FORMAT)
                .map_err(|e| format!("'{}': {}", field, e))?,
        ),
        SinkType::Date => Cell::Date(
            NaiveDate::parse_from_str(field, DATE_FORMAT).map_err(|e| format!("'{}': {}", field, e))?,
        ),
        SinkType::String | SinkType::Numeric | SinkType::Bytes => Cell::Text(field.to_string()),
    };
    Ok(cell)
}

/// Writes chunks to staging
#[async_trait]
pub trait ChunkStager: Send + Sync {
    async fn stage(&self, chunk: &Chunk, request: &RunRequest) -> Result<StagingLocator>;
}

/// Stager over an [`ObjectStore`]
pub struct Stager {
    store: Arc<dyn ObjectStore>,
    tokens: Arc<dyn TokenSource>,
    max_token_draws: usize,
}

impl Stager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_tokens(store, Arc::new(UuidTokenSource))
    }

    pub fn with_tokens(store: Arc<dyn ObjectStore>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            store,
            tokens,
            max_token_draws: DEFAULT_MAX_TOKEN_DRAWS,
        }
    }

    pub fn max_token_draws(mut self, draws: usize) -> Self {
        self.max_token_draws = draws.max(1);
        self
    }
}

#[async_trait]
impl ChunkStager for Stager {
    #[instrument(skip(self, chunk, request), fields(chunk = chunk.index, rows = chunk.len()))]
    async fn stage(&self, chunk: &Chunk, request: &RunRequest) -> Result<StagingLocator> {
        let body = encode_csv(chunk).map_err(|e| EtlError::StagingWrite {
            locator: format!("{}/{}", self.store.bucket(), request.table().sink_table),
            message: format!("CSV encoding failed: {}", e),
        })?;

        let mut last = None;
        for _ in 0..self.max_token_draws {
            let locator = StagingLocator::new(self.store.bucket(), request, self.tokens.next_token());
            let key = locator.key();
            let write_err = |e: anyhow::Error| EtlError::StagingWrite {
                locator: locator.to_string(),
                message: format!("{:#}", e),
            };

            if self.store.exists(&key).await.map_err(write_err)? {
                warn!(locator = %locator, "Staging token collision, drawing a new token");
                last = Some(locator);
                continue;
            }

            let put = self
                .store
                .put(&key, body, STAGING_CONTENT_TYPE)
                .await
                .map_err(write_err)?;

            debug!(checksum = %put.checksum, size = put.size, "Staged object written");
            info!(locator = %locator, "Staged chunk {}", chunk.index);
            return Ok(locator);
        }

        Err(EtlError::StagingWrite {
            locator: last.map(|l| l.to_string()).unwrap_or_default(),
            message: format!("no unused token after {} draws", self.max_token_draws),
        })
    }
}
