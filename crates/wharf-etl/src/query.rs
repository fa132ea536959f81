//! SQL text for extraction, counting and table creation
//!
//! Every statement is rendered from a per-dialect template. Identifiers come
//! from static descriptors and are quoted by the dialect; the only values
//! ever spliced in are window timestamps and the row limit.

use chrono::NaiveDateTime;

use crate::descriptor::{SinkNamespace, TableDescriptor};
use crate::error::{EtlError, Result};
use crate::request::{RunMode, TimeWindow};

const SELECT_TEMPLATE: &str = "SELECT {columns}\nFROM {table}";
const COUNT_TEMPLATE: &str = "SELECT COUNT({counted})\nFROM {table}";
const RANGE_TEMPLATE: &str = "WHERE {watermark} >= {start}\nAND {watermark} < {end}";
const LIMIT_TEMPLATE: &str = "LIMIT {limit}";
const CREATE_TABLE_TEMPLATE: &str = "CREATE OR REPLACE TABLE {table} (\n{columns}\n)";

const TIMESTAMP_LITERAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SQL dialect of the system a statement targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    BigQuery,
}

impl Dialect {
    fn quote(&self, table: &TableDescriptor, ident: &str) -> Result<String> {
        if ident.is_empty() || ident.contains('`') {
            return Err(EtlError::invalid_descriptor(
                &table.id,
                format!("identifier '{}' cannot be quoted", ident),
            ));
        }
        Ok(format!("`{}`", ident))
    }
}

/// Where a statement runs
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Source,
    Sink(&'a SinkNamespace),
}

impl Target<'_> {
    pub fn dialect(&self) -> Dialect {
        match self {
            Target::Source => Dialect::MySql,
            Target::Sink(_) => Dialect::BigQuery,
        }
    }

    fn table_ref(&self, table: &TableDescriptor) -> Result<String> {
        let dialect = self.dialect();
        match self {
            Target::Source => Ok(format!(
                "{}.{}",
                dialect.quote(table, &table.source_database)?,
                dialect.quote(table, &table.source_table)?
            )),
            Target::Sink(ns) => dialect.quote(
                table,
                &format!("{}.{}.{}", ns.project, ns.dataset, table.sink_table),
            ),
        }
    }
}

/// What the statement returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryShape {
    /// The declared source columns, in order
    Select,
    /// `COUNT(*)`
    Count,
    /// `COUNT(DISTINCT <primary key>)`
    CountDistinct,
}

impl QueryShape {
    pub fn count(distinct: bool) -> Self {
        if distinct {
            QueryShape::CountDistinct
        } else {
            QueryShape::Count
        }
    }
}

fn literal(ts: NaiveDateTime) -> String {
    format!("'{}'", ts.format(TIMESTAMP_LITERAL_FORMAT))
}

/// Render an extraction or count statement.
///
/// Incremental mode filters `watermark >= start AND watermark < end`;
/// snapshot mode has no predicate. The row limit only applies to `Select`.
pub fn build_query(
    table: &TableDescriptor,
    target: Target<'_>,
    mode: RunMode,
    window: &TimeWindow,
    row_limit: Option<u64>,
    shape: QueryShape,
) -> Result<String> {
    let dialect = target.dialect();
    let table_ref = target.table_ref(table)?;

    let mut sql = match shape {
        QueryShape::Select => {
            let columns = table
                .source_columns
                .iter()
                .map(|c| dialect.quote(table, c))
                .collect::<Result<Vec<_>>>()?;
            SELECT_TEMPLATE
                .replace("{columns}", &columns.join(", "))
                .replace("{table}", &table_ref)
        },
        QueryShape::Count => COUNT_TEMPLATE
            .replace("{counted}", "*")
            .replace("{table}", &table_ref),
        QueryShape::CountDistinct => {
            let key = dialect.quote(table, table.require_primary_key()?)?;
            COUNT_TEMPLATE
                .replace("{counted}", &format!("DISTINCT {}", key))
                .replace("{table}", &table_ref)
        },
    };

    if mode.is_incremental() {
        let watermark = dialect.quote(table, table.require_watermark()?)?;
        sql.push('\n');
        sql.push_str(
            &RANGE_TEMPLATE
                .replace("{watermark}", &watermark)
                .replace("{start}", &literal(window.start()))
                .replace("{end}", &literal(window.end())),
        );
    }

    if let (QueryShape::Select, Some(limit)) = (shape, row_limit) {
        sql.push('\n');
        sql.push_str(&LIMIT_TEMPLATE.replace("{limit}", &limit.to_string()));
    }

    Ok(sql)
}

/// Render the replace-table DDL for the sink.
///
/// Exactly the primary key column is `NOT NULL`.
pub fn create_table_sql(table: &TableDescriptor, namespace: &SinkNamespace) -> Result<String> {
    let target = Target::Sink(namespace);
    let dialect = target.dialect();
    let primary_key = table.primary_key.as_deref();

    let columns = table
        .sink_schema
        .iter()
        .map(|column| {
            let mut line = format!("  {} {}", dialect.quote(table, &column.name)?, column.sink_type);
            if primary_key == Some(column.name.as_str()) {
                line.push_str(" NOT NULL");
            }
            Ok(line)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CREATE_TABLE_TEMPLATE
        .replace("{table}", &target.table_ref(table)?)
        .replace("{columns}", &columns.join(",\n")))
}
