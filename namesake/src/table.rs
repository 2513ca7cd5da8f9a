//! The in-memory row table the resolver annotates.
//!
//! Upstream readers produce an iterable of `{column -> value}` rows with
//! strings already trimmed; the resolver only ever reads identity columns and
//! writes the output column, so the table is a plain column-keyed value type.
//! An absent key is NULL.

use std::collections::{BTreeSet, HashMap};

/// A single input row: column name to value. Absent columns are NULL.
pub type Row = HashMap<String, String>;

/// A batch of rows plus the set of known column names.
#[derive(Debug, Clone, Default)]
pub struct RowTable {
    rows: Vec<Row>,
    columns: BTreeSet<String>,
}

impl RowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from reader output; the column set is the union of all
    /// row keys.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut columns = BTreeSet::new();
        for row in &rows {
            for key in row.keys() {
                columns.insert(key.clone());
            }
        }
        Self { rows, columns }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    /// Raw cell value, NULL as `None`.
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        self.rows.get(row)?.get(column).map(String::as_str)
    }

    /// Cell value trimmed, with empty and whitespace-only collapsed to NULL.
    /// This is the accessor the resolution layers use: identity keys are
    /// meaningful only when non-blank.
    pub fn text(&self, row: usize, column: &str) -> Option<&str> {
        let value = self.value(row, column)?.trim();
        if value.is_empty() { None } else { Some(value) }
    }

    pub fn set_value(&mut self, row: usize, column: &str, value: String) {
        if let Some(r) = self.rows.get_mut(row) {
            r.insert(column.to_string(), value);
            self.columns.insert(column.to_string());
        }
    }

    /// Register `column` and clear it in every row (initialise to NULL).
    pub fn clear_column(&mut self, column: &str) {
        for row in &mut self.rows {
            row.remove(column);
        }
        self.columns.insert(column.to_string());
    }

    /// Indices of rows where `column` is NULL or blank.
    pub fn rows_missing(&self, column: &str) -> Vec<usize> {
        (0..self.rows.len())
            .filter(|&i| self.text(i, column).is_none())
            .collect()
    }

    /// Count of rows where `column` is NULL or blank.
    pub fn count_missing(&self, column: &str) -> usize {
        (0..self.rows.len())
            .filter(|&i| self.text(i, column).is_none())
            .count()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

/// Convenience constructor used heavily in tests: rows as `(column, value)`
/// pair slices.
impl<const N: usize> From<Vec<[(&str, &str); N]>> for RowTable {
    fn from(rows: Vec<[(&str, &str); N]>) -> Self {
        Self::from_rows(
            rows.into_iter()
                .map(|pairs| {
                    pairs
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect()
                })
                .collect(),
        )
    }
}
