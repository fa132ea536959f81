//! Source database connection
//!
//! [`SourceConnection`] is the seam the pipeline talks to. [`MySqlSource`]
//! is the production implementation over a single-connection sqlx pool.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Row as _, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::chunk::{Cell, Row};
use crate::error::{EtlError, QueryKind, Result, System};
use crate::secrets::SourceCredentials;

/// Forward-only stream of decoded rows
pub type RowStream<'a> = BoxStream<'a, Result<Row>>;

/// Opaque connection to the source system
#[async_trait]
pub trait SourceConnection: Send + Sync {
    /// Execute a data query and stream its rows in source order
    fn fetch<'a>(&'a self, sql: &'a str) -> RowStream<'a>;

    /// Execute a query returning a single non-negative integer
    async fn fetch_scalar(&self, sql: &str) -> Result<u64>;
}

/// Convert a signed count into `u64`, rejecting negatives
pub fn count_from_i64(system: System, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| EtlError::query(system, QueryKind::Count, format!("negative count {}", value)))
}

/// MySQL source backed by a one-connection pool
#[derive(Clone)]
pub struct MySqlSource {
    pool: MySqlPool,
}

impl MySqlSource {
    pub async fn connect(credentials: &SourceCredentials, connect_timeout: Duration) -> Result<Self> {
        debug!(
            "Connecting to MySQL at {}:{} as {}",
            credentials.host, credentials.port, credentials.user
        );

        let options = MySqlConnectOptions::new()
            .host(&credentials.host)
            .port(credentials.port)
            .username(&credentials.user)
            .password(&credentials.password)
            .database(&credentials.database);

        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| EtlError::Connection {
                system: System::Source,
                message: e.to_string(),
            })?;

        info!("Connected to MySQL database {}", credentials.database);

        Ok(Self { pool })
    }
}

#[async_trait]
impl SourceConnection for MySqlSource {
    fn fetch<'a>(&'a self, sql: &'a str) -> RowStream<'a> {
        sqlx::query(sql)
            .fetch(&self.pool)
            .map(|row| {
                row.map_err(|e| EtlError::from_sqlx(System::Source, QueryKind::Extract, e))
                    .and_then(|row| decode_row(&row))
            })
            .boxed()
    }

    #[instrument(skip(self))]
    async fn fetch_scalar(&self, sql: &str) -> Result<u64> {
        let value: i64 = sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EtlError::from_sqlx(System::Source, QueryKind::Count, e))?;
        count_from_i64(System::Source, value)
    }
}

fn decode_row(row: &MySqlRow) -> Result<Row> {
    (0..row.len()).map(|i| decode_cell(row, i)).collect()
}

fn decode_cell(row: &MySqlRow, index: usize) -> Result<Cell> {
    let extract_err = |e: sqlx::Error| EtlError::from_sqlx(System::Source, QueryKind::Extract, e);

    let raw = row.try_get_raw(index).map_err(extract_err)?;
    if raw.is_null() {
        return Ok(Cell::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let cell = match type_name.as_str() {
        "BOOLEAN" => Cell::Bool(row.try_get(index).map_err(extract_err)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            Cell::Int(row.try_get(index).map_err(extract_err)?)
        },
        name if name.ends_with("UNSIGNED") => {
            let value: u64 = row.try_get(index).map_err(extract_err)?;
            i64::try_from(value)
                .map(Cell::Int)
                .unwrap_or_else(|_| Cell::Text(value.to_string()))
        },
        "FLOAT" => Cell::Float(f64::from(row.try_get::<f32, _>(index).map_err(extract_err)?)),
        "DOUBLE" => Cell::Float(row.try_get(index).map_err(extract_err)?),
        "DECIMAL" => Cell::Text(
            row.try_get::<sqlx::types::BigDecimal, _>(index)
                .map_err(extract_err)?
                .to_string(),
        ),
        "DATE" => Cell::Date(row.try_get(index).map_err(extract_err)?),
        "DATETIME" | "TIMESTAMP" => Cell::Timestamp(row.try_get(index).map_err(extract_err)?),
        "TIME" => Cell::Text(
            row.try_get::<chrono::NaiveTime, _>(index)
                .map_err(extract_err)?
                .to_string(),
        ),
        "YEAR" => Cell::Int(i64::from(
            row.try_get_unchecked::<u16, _>(index).map_err(extract_err)?,
        )),
        _ => match row.try_get::<String, _>(index) {
            Ok(text) => Cell::Text(text),
            Err(_) => {
                let bytes: Vec<u8> = row.try_get_unchecked(index).map_err(extract_err)?;
                Cell::Text(String::from_utf8_lossy(&bytes).into_owned())
            },
        },
    };

    Ok(cell)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_count_is_a_query_error() {
        assert_eq!(count_from_i64(System::Sink, 42).unwrap(), 42);
        let err = count_from_i64(System::Source, -1).unwrap_err();
        assert!(matches!(
            err,
            EtlError::QueryExecution {
                system: System::Source,
                kind: QueryKind::Count,
                ..
            }
        ));
    }
}
