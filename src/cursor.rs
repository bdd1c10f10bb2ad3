//! Result cursor: rows from an executed statement, re-keyed by column alias.
//!
//! Execution itself is behind the [`Executor`] trait so the compiler and the
//! facade never depend on a particular driver.

use indexmap::IndexMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;

use crate::error::{DjaqError, DjaqResult};
use crate::value::DjaqValue;

/// Runs SQL with positional parameters.
pub trait Executor: Send + Sync {
    fn execute(&self, sql: &str, parameters: &[DjaqValue]) -> DjaqResult<Box<dyn RowSource>>;
}

/// Pull-based row stream. `Ok(None)` marks the end.
pub trait RowSource: Send {
    fn fetch(&mut self) -> DjaqResult<Option<Vec<DjaqValue>>>;
}

/// Rows already in memory.
#[derive(Debug, Clone, Default)]
pub struct BufferedRows {
    rows: VecDeque<Vec<DjaqValue>>,
}

impl BufferedRows {
    pub fn new(rows: Vec<Vec<DjaqValue>>) -> Self {
        Self { rows: rows.into() }
    }
}

impl RowSource for BufferedRows {
    fn fetch(&mut self) -> DjaqResult<Option<Vec<DjaqValue>>> {
        Ok(self.rows.pop_front())
    }
}

/// One row keyed by column alias, in SELECT order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record(IndexMap<String, DjaqValue>);

impl Record {
    /// Pair `columns` with `row`. Both must be the same width.
    pub fn new(columns: &[String], row: Vec<DjaqValue>) -> DjaqResult<Self> {
        if columns.len() != row.len() {
            return Err(DjaqError::Decode(format!(
                "row has {} values for {} columns",
                row.len(),
                columns.len()
            )));
        }
        Ok(Self(columns.iter().cloned().zip(row).collect()))
    }

    pub fn get(&self, column: &str) -> Option<&DjaqValue> {
        self.0.get(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DjaqValue)> {
        self.0.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &DjaqValue> {
        self.0.values()
    }

    pub fn into_inner(self) -> IndexMap<String, DjaqValue> {
        self.0
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

/// Single-pass cursor over an executed statement.
pub struct Cursor {
    source: Box<dyn RowSource>,
    columns: Vec<String>,
    fetched: usize,
    done: bool,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("columns", &self.columns)
            .field("fetched", &self.fetched)
            .field("done", &self.done)
            .finish()
    }
}

impl Cursor {
    pub fn new(source: Box<dyn RowSource>, columns: Vec<String>) -> Self {
        Self {
            source,
            columns,
            fetched: 0,
            done: false,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows handed out so far.
    pub fn fetched(&self) -> usize {
        self.fetched
    }

    /// Next row as a tuple, `None` once the source is drained.
    pub fn next_row(&mut self) -> DjaqResult<Option<Vec<DjaqValue>>> {
        if self.done {
            return Ok(None);
        }
        match self.source.fetch()? {
            Some(row) => {
                self.fetched += 1;
                Ok(Some(row))
            }
            None => {
                debug!(rows = self.fetched, "cursor exhausted");
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Next row keyed by column alias.
    pub fn next_record(&mut self) -> DjaqResult<Option<Record>> {
        match self.next_row()? {
            Some(row) => Record::new(&self.columns, row).map(Some),
            None => Ok(None),
        }
    }

    /// Drain the remaining rows.
    pub fn collect_rows(&mut self) -> DjaqResult<Vec<Vec<DjaqValue>>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }
}

impl Iterator for Cursor {
    type Item = DjaqResult<Vec<DjaqValue>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

/// Materialized rows that can be iterated any number of times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Vec<DjaqValue>>,
    position: usize,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<DjaqValue>>) -> Self {
        Self {
            columns,
            rows,
            position: 0,
        }
    }

    /// Drain `cursor` into memory.
    pub fn from_cursor(cursor: &mut Cursor) -> DjaqResult<Self> {
        let rows = cursor.collect_rows()?;
        Ok(Self::new(cursor.columns().to_vec(), rows))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<DjaqValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn records(&self) -> DjaqResult<Vec<Record>> {
        self.rows
            .iter()
            .map(|row| Record::new(&self.columns, row.clone()))
            .collect()
    }

    /// Next record from the read position.
    pub fn next_record(&mut self) -> DjaqResult<Option<Record>> {
        let Some(row) = self.rows.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        Record::new(&self.columns, row.clone()).map(Some)
    }

    /// Move the read position back to the first row.
    pub fn rewind(&mut self) {
        self.position = 0;
    }
}

/// One CSV line, without terminator. Text is quoted, numbers are not.
pub fn csv_line(row: &[DjaqValue]) -> DjaqResult<String> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .quote_style(csv::QuoteStyle::NonNumeric)
        .from_writer(Vec::new());
    writer
        .write_record(row.iter().map(|v| v.to_string()))
        .map_err(|e| DjaqError::Decode(e.to_string()))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| DjaqError::Decode(e.to_string()))?;
    let line = String::from_utf8(bytes).map_err(|e| DjaqError::Decode(e.to_string()))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// One JSON object line.
pub fn json_line(record: &Record) -> DjaqResult<String> {
    serde_json::to_string(record).map_err(|e| DjaqError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn columns() -> Vec<String> {
        vec!["id".to_string(), "name".to_string()]
    }

    fn rows() -> Vec<Vec<DjaqValue>> {
        vec![
            vec![DjaqValue::Int(1), DjaqValue::from("Dune")],
            vec![DjaqValue::Int(2), DjaqValue::from("Emma, \"abridged\"")],
        ]
    }

    #[test]
    fn test_cursor_single_pass() {
        let mut cursor = Cursor::new(Box::new(BufferedRows::new(rows())), columns());
        let first = cursor.next_record().unwrap().unwrap();
        assert_eq!(first.get("name"), Some(&DjaqValue::from("Dune")));
        assert_eq!(cursor.fetched(), 1);

        let rest: Vec<_> = cursor.by_ref().collect::<DjaqResult<_>>().unwrap();
        assert_eq!(rest.len(), 1);
        assert!(cursor.next_row().unwrap().is_none());
        assert!(cursor.next_row().unwrap().is_none());
    }

    #[test]
    fn test_record_width_mismatch() {
        let err = Record::new(&columns(), vec![DjaqValue::Int(1)]).unwrap_err();
        assert!(matches!(err, DjaqError::Decode(_)));
    }

    #[test]
    fn test_result_set_rewinds() {
        let mut cursor = Cursor::new(Box::new(BufferedRows::new(rows())), columns());
        let mut set = ResultSet::from_cursor(&mut cursor).unwrap();
        assert_eq!(set.len(), 2);
        while set.next_record().unwrap().is_some() {}
        set.rewind();
        let again = set.next_record().unwrap().unwrap();
        assert_eq!(again.get("id"), Some(&DjaqValue::Int(1)));
        assert_eq!(set.records().unwrap().len(), 2);
    }

    #[test]
    fn test_csv_and_json_lines() {
        let row = &rows()[1];
        assert_eq!(csv_line(row).unwrap(), r#"2,"Emma, ""abridged""""#);
        assert_eq!(
            csv_line(&[DjaqValue::Float(1.5), DjaqValue::Null]).unwrap(),
            r#"1.5,"""#
        );

        let record = Record::new(&columns(), rows()[0].clone()).unwrap();
        assert_eq!(json_line(&record).unwrap(), r#"{"id":1,"name":"Dune"}"#);
    }
}
