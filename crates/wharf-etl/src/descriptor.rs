//! Table descriptors and the built-in registry
//!
//! A [`TableDescriptor`] is static metadata: where a table lives in the
//! source, what it is called in the warehouse, and how its columns map.
//! Descriptors never come from user input, which is what allows the query
//! builder to splice their identifiers into SQL.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::error::{EtlError, Result};
use crate::request::Environment;

/// Logical column type in the warehouse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SinkType {
    String,
    Integer,
    Float,
    Numeric,
    Boolean,
    Timestamp,
    Datetime,
    Date,
    Bytes,
}

impl SinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkType::String => "STRING",
            SinkType::Integer => "INTEGER",
            SinkType::Float => "FLOAT",
            SinkType::Numeric => "NUMERIC",
            SinkType::Boolean => "BOOLEAN",
            SinkType::Timestamp => "TIMESTAMP",
            SinkType::Datetime => "DATETIME",
            SinkType::Date => "DATE",
            SinkType::Bytes => "BYTES",
        }
    }
}

impl fmt::Display for SinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One column of the warehouse table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkColumn {
    pub name: String,
    pub sink_type: SinkType,
}

impl SinkColumn {
    pub fn new(name: impl Into<String>, sink_type: SinkType) -> Self {
        Self {
            name: name.into(),
            sink_type,
        }
    }
}

/// Fully-qualified warehouse location: project and dataset
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SinkNamespace {
    pub project: String,
    pub dataset: String,
}

impl fmt::Display for SinkNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project, self.dataset)
    }
}

/// Static schema mapping for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Registry key, e.g. "table1"
    pub id: String,
    pub source_table: String,
    pub sink_table: String,
    /// Columns selected from the source, in order
    pub source_columns: Vec<String>,
    /// Warehouse schema, in order
    pub sink_schema: Vec<SinkColumn>,
    /// Timestamp column bounding incremental runs
    pub watermark_column: Option<String>,
    pub primary_key: Option<String>,
    pub source_database: String,
    pub sink_project: String,
    /// Dataset name is `<prefix>_<environment>`
    pub sink_dataset_prefix: String,
}

impl TableDescriptor {
    /// Warehouse namespace for a given environment
    pub fn namespace(&self, environment: Environment) -> SinkNamespace {
        SinkNamespace {
            project: self.sink_project.clone(),
            dataset: format!("{}_{}", self.sink_dataset_prefix, environment),
        }
    }

    pub fn sink_column(&self, name: &str) -> Option<&SinkColumn> {
        self.sink_schema.iter().find(|c| c.name == name)
    }

    /// Watermark column, or `InvalidDescriptor` when the table has none
    pub fn require_watermark(&self) -> Result<&str> {
        match self.watermark_column.as_deref() {
            Some(col) if !col.trim().is_empty() => Ok(col),
            _ => Err(EtlError::invalid_descriptor(
                &self.id,
                "incremental mode requires a watermark column",
            )),
        }
    }

    /// Primary key column, or `InvalidDescriptor` when the table has none
    pub fn require_primary_key(&self) -> Result<&str> {
        match self.primary_key.as_deref() {
            Some(col) if !col.trim().is_empty() => Ok(col),
            _ => Err(EtlError::invalid_descriptor(
                &self.id,
                "distinct counts require a primary key column",
            )),
        }
    }

    /// Structural checks that hold for every descriptor regardless of mode
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(EtlError::invalid_descriptor(&self.id, reason));

        for (what, value) in [
            ("source table", &self.source_table),
            ("sink table", &self.sink_table),
            ("source database", &self.source_database),
            ("sink project", &self.sink_project),
            ("sink dataset prefix", &self.sink_dataset_prefix),
        ] {
            if value.trim().is_empty() {
                return fail(format!("{} must not be empty", what));
            }
        }

        if self.source_columns.is_empty() {
            return fail("at least one source column is required".to_string());
        }

        let mut seen = HashSet::new();
        for column in &self.sink_schema {
            if !seen.insert(column.name.as_str()) {
                return fail(format!("duplicate sink column '{}'", column.name));
            }
        }

        for column in &self.source_columns {
            if !seen.contains(column.as_str()) {
                return fail(format!("source column '{}' is missing from the sink schema", column));
            }
        }

        for (what, column) in [
            ("watermark", &self.watermark_column),
            ("primary key", &self.primary_key),
        ] {
            if let Some(column) = column {
                if !seen.contains(column.as_str()) {
                    return fail(format!("{} column '{}' is not in the sink schema", what, column));
                }
            }
        }

        Ok(())
    }
}

/// Lookup of descriptors by table id
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: BTreeMap<String, TableDescriptor>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables shipped with the binary
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.insert(table1());
        registry.insert(table2());
        registry
    }

    pub fn insert(&mut self, descriptor: TableDescriptor) {
        self.tables.insert(descriptor.id.clone(), descriptor);
    }

    pub fn get(&self, id: &str) -> Result<&TableDescriptor> {
        self.tables.get(id).ok_or_else(|| {
            EtlError::Config(format!(
                "unknown table '{}', expected one of: {}",
                id,
                self.ids().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }
}

const DEFAULT_SOURCE_DATABASE: &str = "default_db";
const DEFAULT_SINK_PROJECT: &str = "default_gcp_project";
const DEFAULT_DATASET_PREFIX: &str = "schema";

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

pub fn table1() -> TableDescriptor {
    TableDescriptor {
        id: "table1".to_string(),
        source_table: "table1".to_string(),
        sink_table: "table_one".to_string(),
        source_columns: columns(&["id", "Status", "created", "updated", "deleted", "name", "default"]),
        sink_schema: vec![
            SinkColumn::new("id", SinkType::String),
            SinkColumn::new("Status", SinkType::String),
            SinkColumn::new("created", SinkType::Timestamp),
            SinkColumn::new("updated", SinkType::Timestamp),
            SinkColumn::new("deleted", SinkType::Timestamp),
            SinkColumn::new("name", SinkType::String),
            SinkColumn::new("default", SinkType::Integer),
        ],
        watermark_column: Some("updated".to_string()),
        primary_key: Some("id".to_string()),
        source_database: DEFAULT_SOURCE_DATABASE.to_string(),
        sink_project: DEFAULT_SINK_PROJECT.to_string(),
        sink_dataset_prefix: DEFAULT_DATASET_PREFIX.to_string(),
    }
}

pub fn table2() -> TableDescriptor {
    TableDescriptor {
        id: "table2".to_string(),
        source_table: "table2".to_string(),
        sink_table: "table_two".to_string(),
        source_columns: columns(&["id", "Status", "created", "updated", "index", "content"]),
        sink_schema: vec![
            SinkColumn::new("id", SinkType::String),
            SinkColumn::new("Status", SinkType::String),
            SinkColumn::new("created", SinkType::Timestamp),
            SinkColumn::new("updated", SinkType::Timestamp),
            SinkColumn::new("index", SinkType::String),
            SinkColumn::new("content", SinkType::String),
        ],
        watermark_column: Some("updated".to_string()),
        primary_key: Some("id".to_string()),
        source_database: DEFAULT_SOURCE_DATABASE.to_string(),
        sink_project: DEFAULT_SINK_PROJECT.to_string(),
        sink_dataset_prefix: DEFAULT_DATASET_PREFIX.to_string(),
    }
}
