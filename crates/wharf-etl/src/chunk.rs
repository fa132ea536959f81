//! Rows and chunks as they travel from the source to the sink

use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;

/// Timestamp text format used in staged files and sink rows
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single decoded source value
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Cell {
    /// Text form written to staging; `None` for null
    pub fn to_text(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Bool(b) => Some(b.to_string()),
            Cell::Int(i) => Some(i.to_string()),
            Cell::Float(f) => Some(f.to_string()),
            Cell::Text(s) => Some(s.clone()),
            Cell::Date(d) => Some(d.format(DATE_FORMAT).to_string()),
            Cell::Timestamp(ts) => Some(ts.format(TIMESTAMP_FORMAT).to_string()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Int(value)
    }
}

impl From<NaiveDateTime> for Cell {
    fn from(value: NaiveDateTime) -> Self {
        Cell::Timestamp(value)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Cell::Null)
    }
}

pub type Row = Vec<Cell>;

/// Bounded, ordered batch of rows. Indexes start at 0 and increase by one.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: u64,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Chunk {
    pub fn new(index: u64, columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            index,
            columns,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_text_forms() {
        let ts = NaiveDate::from_ymd_opt(2023, 8, 27)
            .unwrap()
            .and_hms_opt(9, 5, 0)
            .unwrap();
        assert_eq!(Cell::Timestamp(ts).to_text().unwrap(), "2023-08-27 09:05:00");
        assert_eq!(Cell::Int(-3).to_text().unwrap(), "-3");
        assert_eq!(Cell::Null.to_text(), None);
        assert_eq!(Cell::from(None::<String>), Cell::Null);
    }

    #[test]
    fn test_display_spells_out_null() {
        assert_eq!(Cell::Null.to_string(), "NULL");
        assert_eq!(Cell::from("a1").to_string(), "a1");
        assert_eq!(Cell::Bool(true).to_string(), "true");
    }
}
