//! Run requests: what a single invocation of the pipeline should do

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::descriptor::{SinkNamespace, TableDescriptor};
use crate::error::{EtlError, Result};

/// Deployment environment, a closed set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            other => Err(EtlError::Config(format!(
                "invalid environment '{}': expected 'dev' or 'prod'",
                other
            ))),
        }
    }
}

/// Extraction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Full reload into a freshly replaced table
    Snapshot,
    /// Rows whose watermark falls inside the window
    Incremental,
}

impl RunMode {
    pub fn is_incremental(&self) -> bool {
        matches!(self, RunMode::Incremental)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Snapshot => f.write_str("snapshot"),
            RunMode::Incremental => f.write_str("incremental"),
        }
    }
}

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl TimeWindow {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self> {
        if start >= end {
            return Err(EtlError::Config(format!(
                "window start {} must be before end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Window between two calendar dates, both at midnight
    pub fn from_dates(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        Self::new(midnight(start), midnight(end))
    }

    /// Resolve optional CLI dates (`YYYY-MM-DD`) against `today`.
    ///
    /// Missing start defaults to yesterday, missing end to today.
    pub fn resolve(start: Option<&str>, end: Option<&str>, today: NaiveDate) -> Result<Self> {
        let start = match start {
            Some(s) => parse_date(s)?,
            None => today - Duration::days(1),
        };
        let end = match end {
            Some(s) => parse_date(s)?,
            None => today,
        };
        Self::from_dates(start, end)
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    /// Staging partition `(year, month, day)` derived from `end`
    pub fn partition(&self) -> (i32, u32, u32) {
        (self.end.year(), self.end.month(), self.end.day())
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| EtlError::Config(format!("invalid date '{}' (expected YYYY-MM-DD): {}", s, e)))
}

/// One validated pipeline invocation
#[derive(Debug, Clone)]
pub struct RunRequest {
    environment: Environment,
    table: TableDescriptor,
    window: TimeWindow,
    mode: RunMode,
    row_limit: Option<u64>,
}

impl RunRequest {
    /// Build a request, checking the descriptor/mode combination up front
    pub fn new(
        environment: Environment,
        table: TableDescriptor,
        window: TimeWindow,
        mode: RunMode,
        row_limit: Option<u64>,
    ) -> Result<Self> {
        table.validate()?;
        if mode.is_incremental() {
            table.require_watermark()?;
        }
        if row_limit == Some(0) {
            return Err(EtlError::Config("row limit must be greater than 0".to_string()));
        }

        Ok(Self {
            environment,
            table,
            window,
            mode,
            row_limit,
        })
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn table(&self) -> &TableDescriptor {
        &self.table
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn row_limit(&self) -> Option<u64> {
        self.row_limit
    }

    pub fn namespace(&self) -> SinkNamespace {
        self.table.namespace(self.environment)
    }
}
