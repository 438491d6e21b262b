//! StructuredResult: the table recovered from one inference response.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::record::RecordKey;

/// One table row, cells in schema order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Vec<String>);

impl Row {
    pub fn new(cells: Vec<String>) -> Self {
        Self(cells)
    }

    pub fn cells(&self) -> &[String] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn into_cells(self) -> Vec<String> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("row for '{key}' has {found} cells, header has {expected}")]
pub struct ArityMismatch {
    pub key: RecordKey,
    pub expected: usize,
    pub found: usize,
}

/// Header plus identifier -> row lookup.
///
/// Every stored row has exactly `header.len()` cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredResult {
    header: Vec<String>,
    rows: HashMap<RecordKey, Row>,
}

impl StructuredResult {
    pub fn new(header: Vec<String>) -> Self {
        Self {
            header,
            rows: HashMap::new(),
        }
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Insert or replace the row for `key`. Returns the previous row.
    pub fn insert(&mut self, key: RecordKey, row: Row) -> Result<Option<Row>, ArityMismatch> {
        if row.arity() != self.header.len() {
            return Err(ArityMismatch {
                key,
                expected: self.header.len(),
                found: row.arity(),
            });
        }
        Ok(self.rows.insert(key, row))
    }

    pub fn get(&self, key: &str) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.rows.keys()
    }

    pub fn into_rows(self) -> impl Iterator<Item = (RecordKey, Row)> {
        self.rows.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Row {
        Row::new(cells.iter().map(|c| c.to_string()).collect())
    }

    #[test]
    fn insert_enforces_header_arity() {
        let mut result = StructuredResult::new(vec!["id".into(), "label".into()]);

        assert!(result.insert("A".into(), row(&["A", "quality"])).unwrap().is_none());
        let err = result.insert("B".into(), row(&["B"])).unwrap_err();
        assert_eq!(err.expected, 2);
        assert_eq!(err.found, 1);
        assert_eq!(result.len(), 1);
        assert!(result.contains("A"));
        assert!(!result.contains("B"));
    }

    #[test]
    fn insert_replaces_existing_row() {
        let mut result = StructuredResult::new(vec!["id".into(), "label".into()]);
        result.insert("A".into(), row(&["A", "x"])).unwrap();
        let previous = result.insert("A".into(), row(&["A", "y"])).unwrap();

        assert_eq!(previous, Some(row(&["A", "x"])));
        assert_eq!(result.get("A").and_then(|r| r.get(1)), Some("y"));
        assert_eq!(result.len(), 1);
    }
}
