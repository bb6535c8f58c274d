//! In-memory table and its mutation contract.
//!
//! A [`Table`] is an ordered list of named, typed [`Column`]s and an ordered
//! list of rows. Every row holds exactly one [`CellValue`] per column; the
//! row vectors are kept positionally aligned with `columns`.
//!
//! [`TableStore`] owns the live table plus an immutable copy of the table as
//! it was when the session started, so that edits can be thrown away.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

use crate::dtype::{coerce_value, DtypeGuard};
use crate::value::{infer_dtype, CellValue, DType};

/// Hard ceiling on rows accepted by a bulk replace.
pub const MAX_ROWS: usize = 1_000_000;

/// One row on the wire: column name → JSON value, in column order.
pub type Record = Map<String, Value>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TableError {
    #[error("unknown column `{0}`")]
    UnknownColumn(String),
    #[error("row index {index} out of range (table has {len} rows)")]
    RowIndexOutOfRange { index: usize, len: usize },
    #[error("cannot store `{value}` in column `{column}` of type {expected}")]
    TypeMismatch {
        column: String,
        value: String,
        expected: DType,
    },
    #[error("payload of {rows} rows exceeds the {limit} row limit")]
    PayloadTooLarge { rows: usize, limit: usize },
    #[error("column `{0}` already exists")]
    DuplicateColumn(String),
    #[error("column order must name every column exactly once")]
    InvalidColumnOrder,
}

impl TableError {
    /// Stable machine-readable code used in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            TableError::UnknownColumn(_) => "unknown_column",
            TableError::RowIndexOutOfRange { .. } => "row_index_out_of_range",
            TableError::TypeMismatch { .. } => "type_mismatch",
            TableError::PayloadTooLarge { .. } => "payload_too_large",
            TableError::DuplicateColumn(_) => "duplicate_column",
            TableError::InvalidColumnOrder => "invalid_column_order",
        }
    }
}

/// Column descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub dtype: DType,
    /// Value used to fill this column in newly added rows.
    #[serde(default)]
    pub default: CellValue,
}

impl Column {
    /// A column whose default is its type's missing sentinel.
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            default: dtype.missing(),
        }
    }

    pub fn with_default(name: impl Into<String>, dtype: DType, default: CellValue) -> Self {
        Self {
            name: name.into(),
            dtype,
            default,
        }
    }
}

/// Rows × typed columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<CellValue>>,
}

impl Table {
    /// An empty table with the given columns.
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from row records, inferring each column's type.
    ///
    /// The column set is the union of all record keys in first-seen order.
    /// Keys absent from a record become the column's missing sentinel.
    pub fn from_records(records: &[Record]) -> Self {
        Self::from_records_with(records, |_| None)
    }

    /// Like [`Table::from_records`], but `declared` may pin a column's type.
    ///
    /// Values that do not fit a declared type are stored as missing.
    pub fn from_records_with(records: &[Record], declared: impl Fn(&str) -> Option<DType>) -> Self {
        let names = union_keys(records);
        let columns: Vec<Column> = names
            .iter()
            .map(|name| {
                let dtype = declared(name).unwrap_or_else(|| {
                    infer_dtype(records.iter().filter_map(|r| r.get(name.as_str())))
                });
                Column::new(name.clone(), dtype)
            })
            .collect();

        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|col| match record.get(&col.name) {
                        None | Some(Value::Null) => col.dtype.missing(),
                        Some(raw) => coerce_value(raw, col.dtype).unwrap_or_else(|| col.dtype.missing()),
                    })
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    /// Build a table from a column-keyed object of equal-length arrays.
    pub fn from_columnar(data: &Map<String, Value>) -> Self {
        Self::from_columnar_with(data, |_| None)
    }

    /// Like [`Table::from_columnar`], with declared column types.
    pub fn from_columnar_with(data: &Map<String, Value>, declared: impl Fn(&str) -> Option<DType>) -> Self {
        let len = data
            .values()
            .filter_map(Value::as_array)
            .map(Vec::len)
            .max()
            .unwrap_or(0);
        let records: Vec<Record> = (0..len)
            .map(|i| {
                data.iter()
                    .map(|(name, values)| {
                        let v = values
                            .as_array()
                            .and_then(|a| a.get(i))
                            .cloned()
                            .unwrap_or(Value::Null);
                        (name.clone(), v)
                    })
                    .collect()
            })
            .collect();
        if records.is_empty() {
            let columns = data
                .keys()
                .map(|n| Column::new(n.clone(), declared(n).unwrap_or(DType::Text)))
                .collect();
            return Self::new(columns);
        }
        Self::from_records_with(&records, declared)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&CellValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Append a row given in column order. Short rows are padded with defaults.
    pub fn push_row(&mut self, mut values: Vec<CellValue>) {
        values.truncate(self.columns.len());
        for col in &self.columns[values.len()..] {
            values.push(col.default.clone());
        }
        self.rows.push(values);
    }

    /// Rows as column-keyed records, in row order.
    pub fn to_records(&self) -> Vec<Record> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(col, v)| (col.name.clone(), v.to_json()))
                    .collect()
            })
            .collect()
    }

    /// Column name → array of values, in column order.
    pub fn to_columnar(&self) -> Map<String, Value> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let values = self.rows.iter().map(|r| r[i].to_json()).collect();
                (col.name.clone(), Value::Array(values))
            })
            .collect()
    }
}

fn union_keys(records: &[Record]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for record in records {
        for key in record.keys() {
            if seen.insert(key.as_str()) {
                names.push(key.clone());
            }
        }
    }
    names
}

/// Canonical table for one editing session.
#[derive(Debug, Clone)]
pub struct TableStore {
    current: Table,
    original: Table,
}

impl TableStore {
    pub fn new(table: Table) -> Self {
        Self {
            original: table.clone(),
            current: table,
        }
    }

    pub fn table(&self) -> &Table {
        &self.current
    }

    /// The table as captured at session start.
    pub fn original(&self) -> &Table {
        &self.original
    }

    pub fn into_table(self) -> Table {
        self.current
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.current.column(name)
    }

    pub fn row_count(&self) -> usize {
        self.current.row_count()
    }

    /// Current rows as wire records.
    pub fn snapshot(&self) -> Vec<Record> {
        self.current.to_records()
    }

    /// Replace the whole table with `rows`.
    ///
    /// Existing columns keep their type when every incoming value fits it,
    /// otherwise they fall back to text. New columns are inferred. Rejects
    /// payloads above [`MAX_ROWS`] without touching the table.
    pub fn replace_all(&mut self, rows: Vec<Record>) -> Result<(), TableError> {
        if rows.len() > MAX_ROWS {
            return Err(TableError::PayloadTooLarge {
                rows: rows.len(),
                limit: MAX_ROWS,
            });
        }
        let previous = &self.current;
        let table = Table::from_records_with(&rows, |name| {
            let col = previous.column(name)?;
            let fits = rows
                .iter()
                .filter_map(|r| r.get(name))
                .all(|raw| coerce_value(raw, col.dtype).is_some());
            Some(if fits { col.dtype } else { DType::Text })
        });
        log::debug!(
            "Replaced table: {} rows x {} columns",
            table.row_count(),
            table.column_count()
        );
        self.current = table;
        Ok(())
    }

    /// Store an already-coerced value.
    pub fn set_cell(&mut self, row: usize, column: &str, value: CellValue) -> Result<(), TableError> {
        let idx = self
            .current
            .column_index(column)
            .ok_or_else(|| TableError::UnknownColumn(column.to_string()))?;
        let len = self.current.rows.len();
        let cells = self
            .current
            .rows
            .get_mut(row)
            .ok_or(TableError::RowIndexOutOfRange { index: row, len })?;
        cells[idx] = value;
        Ok(())
    }

    /// Validate, coerce and store a raw edit. Returns the value actually stored.
    ///
    /// Nothing is mutated unless the column exists, the row is in range and
    /// the value passes `guard`.
    pub fn edit_cell(
        &mut self,
        row: usize,
        column: &str,
        raw: &Value,
        guard: &DtypeGuard,
    ) -> Result<CellValue, TableError> {
        let dtype = self
            .current
            .column(column)
            .map(|c| c.dtype)
            .ok_or_else(|| TableError::UnknownColumn(column.to_string()))?;
        if row >= self.current.row_count() {
            return Err(TableError::RowIndexOutOfRange {
                index: row,
                len: self.current.row_count(),
            });
        }
        let value = guard.coerce(column, raw, dtype)?;
        self.set_cell(row, column, value.clone())?;
        Ok(value)
    }

    /// Append a text column filled with `default`. Returns `false` (and does
    /// nothing) when the name is already taken.
    pub fn add_column(&mut self, name: &str, default: CellValue) -> bool {
        if self.current.column(name).is_some() {
            return false;
        }
        for row in &mut self.current.rows {
            row.push(default.clone());
        }
        self.current
            .columns
            .push(Column::with_default(name, DType::Text, default));
        true
    }

    /// Append a row of column defaults. Returns the new row's index.
    pub fn add_row(&mut self) -> usize {
        self.current.push_row(Vec::new());
        self.current.row_count() - 1
    }

    pub fn rename_column(&mut self, old: &str, new: &str) -> Result<(), TableError> {
        if old == new {
            return self
                .current
                .column(old)
                .map(|_| ())
                .ok_or_else(|| TableError::UnknownColumn(old.to_string()));
        }
        if self.current.column(new).is_some() {
            return Err(TableError::DuplicateColumn(new.to_string()));
        }
        let col = self
            .current
            .columns
            .iter_mut()
            .find(|c| c.name == old)
            .ok_or_else(|| TableError::UnknownColumn(old.to_string()))?;
        col.name = new.to_string();
        Ok(())
    }

    /// Reorder columns; `order` must be a permutation of the current names.
    pub fn reorder_columns(&mut self, order: &[String]) -> Result<(), TableError> {
        if order.len() != self.current.columns.len() {
            return Err(TableError::InvalidColumnOrder);
        }
        let mut positions = Vec::with_capacity(order.len());
        let mut seen = HashSet::new();
        for name in order {
            if !seen.insert(name.as_str()) {
                return Err(TableError::InvalidColumnOrder);
            }
            let idx = self
                .current
                .column_index(name)
                .ok_or(TableError::InvalidColumnOrder)?;
            positions.push(idx);
        }

        let table = &mut self.current;
        table.columns = positions.iter().map(|&i| table.columns[i].clone()).collect();
        for row in &mut table.rows {
            *row = positions.iter().map(|&i| row[i].clone()).collect();
        }
        Ok(())
    }

    /// Throw away every edit since session start.
    pub fn revert_to_original(&mut self) {
        self.current = self.original.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(value: Value) -> Vec<Record> {
        serde_json::from_value(value).unwrap()
    }

    /// `{col1: [1,2,3], col2: ['a','b','c']}`
    fn sample_store() -> TableStore {
        TableStore::new(Table::from_records(&records(json!([
            {"col1": 1, "col2": "a"},
            {"col1": 2, "col2": "b"},
            {"col1": 3, "col2": "c"},
        ]))))
    }

    #[test]
    fn test_from_records_infers_types() {
        let store = sample_store();
        assert_eq!(store.column("col1").unwrap().dtype, DType::Integer);
        assert_eq!(store.column("col2").unwrap().dtype, DType::Text);
        assert_eq!(store.row_count(), 3);
    }

    #[test]
    fn test_from_records_ragged_keys() {
        let table = Table::from_records(&records(json!([
            {"a": 1},
            {"b": "x", "a": 2},
        ])));
        assert_eq!(table.column_names(), vec!["a", "b"]);
        assert_eq!(table.get(0, "b"), Some(&CellValue::Missing));
        assert_eq!(table.get(1, "a"), Some(&CellValue::Int(2)));
    }

    #[test]
    fn test_declared_types_override_inference() {
        let table = Table::from_records_with(
            &records(json!([{"when": "2024-01-02"}, {"when": "bogus"}])),
            |name| (name == "when").then_some(DType::DateTime),
        );
        assert_eq!(table.column("when").unwrap().dtype, DType::DateTime);
        assert_eq!(table.get(0, "when").unwrap().to_json(), json!("2024-01-02T00:00:00"));
        assert_eq!(table.get(1, "when"), Some(&CellValue::Missing));
    }

    #[test]
    fn test_snapshot_keeps_column_order() {
        let store = sample_store();
        let snap = store.snapshot();
        assert_eq!(snap.len(), 3);
        let keys: Vec<&String> = snap[0].keys().collect();
        assert_eq!(keys, vec!["col1", "col2"]);
        assert_eq!(snap[2]["col2"], json!("c"));
    }

    #[test]
    fn test_set_cell_errors() {
        let mut store = sample_store();
        assert_eq!(
            store.set_cell(0, "nope", CellValue::Int(1)),
            Err(TableError::UnknownColumn("nope".into()))
        );
        assert_eq!(
            store.set_cell(3, "col1", CellValue::Int(1)),
            Err(TableError::RowIndexOutOfRange { index: 3, len: 3 })
        );
        store.set_cell(2, "col1", CellValue::Int(9)).unwrap();
        assert_eq!(store.table().get(2, "col1"), Some(&CellValue::Int(9)));
    }

    #[test]
    fn test_edit_cell_coerces() {
        let mut store = sample_store();
        let guard = DtypeGuard::strict();
        let stored = store.edit_cell(0, "col1", &json!("7"), &guard).unwrap();
        assert_eq!(stored, CellValue::Int(7));
        assert_eq!(store.snapshot()[0]["col1"], json!(7));
    }

    #[test]
    fn test_edit_cell_empty_integer_is_missing() {
        let mut store = sample_store();
        let stored = store.edit_cell(1, "col1", &json!(""), &DtypeGuard::strict()).unwrap();
        assert_eq!(stored, CellValue::Missing);
        assert_eq!(store.table().get(1, "col1"), Some(&CellValue::Missing));
    }

    #[test]
    fn test_edit_cell_mismatch_leaves_table() {
        let mut store = sample_store();
        let err = store.edit_cell(0, "col1", &json!("abc"), &DtypeGuard::strict()).unwrap_err();
        assert!(matches!(err, TableError::TypeMismatch { .. }));
        assert_eq!(store.snapshot()[0]["col1"], json!(1));
    }

    #[test]
    fn test_add_column_fills_every_row() {
        let mut store = sample_store();
        assert!(store.add_column("notes", CellValue::Text(String::new())));
        for record in store.snapshot() {
            assert_eq!(record["notes"], json!(""));
        }
        let idx = store.add_row();
        assert_eq!(store.snapshot()[idx]["notes"], json!(""));
    }

    #[test]
    fn test_add_column_idempotent() {
        let mut store = sample_store();
        assert!(store.add_column("notes", CellValue::Text(String::new())));
        assert!(!store.add_column("notes", CellValue::Text("other".into())));
        let count = store.table().columns().iter().filter(|c| c.name == "notes").count();
        assert_eq!(count, 1);
        assert_eq!(store.table().column_count(), 3);
    }

    #[test]
    fn test_add_row_uses_column_defaults() {
        let mut store = sample_store();
        let idx = store.add_row();
        assert_eq!(idx, 3);
        assert_eq!(store.row_count(), 4);
        let table = store.table();
        assert_eq!(table.get(3, "col1"), Some(&table.column("col1").unwrap().default));
        assert_eq!(table.get(3, "col2"), Some(&table.column("col2").unwrap().default));
    }

    #[test]
    fn test_revert_to_original() {
        let mut store = sample_store();
        let before = store.table().clone();
        store.edit_cell(0, "col1", &json!("42"), &DtypeGuard::strict()).unwrap();
        store.add_column("extra", CellValue::Text("x".into()));
        store.add_row();
        store.rename_column("col2", "letters").unwrap();
        assert_ne!(store.table(), &before);

        store.revert_to_original();
        assert_eq!(store.table(), &before);
        assert_eq!(store.original(), &before);
    }

    #[test]
    fn test_replace_all_keeps_fitting_types() {
        let mut store = sample_store();
        store
            .replace_all(records(json!([
                {"col1": "10", "col2": "z"},
                {"col1": 11, "new": true},
            ])))
            .unwrap();
        let table = store.table();
        assert_eq!(table.column("col1").unwrap().dtype, DType::Integer);
        assert_eq!(table.get(0, "col1"), Some(&CellValue::Int(10)));
        assert_eq!(table.column("new").unwrap().dtype, DType::Boolean);
        assert_eq!(table.get(1, "col2"), Some(&CellValue::Missing));
    }

    #[test]
    fn test_replace_all_degrades_to_text() {
        let mut store = sample_store();
        store.replace_all(records(json!([{"col1": "one"}]))).unwrap();
        assert_eq!(store.column("col1").unwrap().dtype, DType::Text);
        assert_eq!(store.snapshot()[0]["col1"], json!("one"));
    }

    #[test]
    fn test_replace_all_rejects_oversized_payload() {
        let mut store = sample_store();
        let before = store.table().clone();
        let rows = vec![Record::new(); MAX_ROWS + 1];
        let err = store.replace_all(rows).unwrap_err();
        assert_eq!(
            err,
            TableError::PayloadTooLarge {
                rows: MAX_ROWS + 1,
                limit: MAX_ROWS
            }
        );
        assert_eq!(store.table(), &before);
    }

    #[test]
    fn test_rename_column() {
        let mut store = sample_store();
        store.rename_column("col2", "letters").unwrap();
        assert_eq!(store.snapshot()[0]["letters"], json!("a"));
        assert_eq!(
            store.rename_column("missing", "x"),
            Err(TableError::UnknownColumn("missing".into()))
        );
        assert_eq!(
            store.rename_column("col1", "letters"),
            Err(TableError::DuplicateColumn("letters".into()))
        );
    }

    #[test]
    fn test_reorder_columns() {
        let mut store = sample_store();
        store
            .reorder_columns(&["col2".to_string(), "col1".to_string()])
            .unwrap();
        let snap = store.snapshot();
        let keys: Vec<&String> = snap[0].keys().collect();
        assert_eq!(keys, vec!["col2", "col1"]);
        assert_eq!(snap[1]["col1"], json!(2));

        assert_eq!(
            store.reorder_columns(&["col1".to_string()]),
            Err(TableError::InvalidColumnOrder)
        );
        assert_eq!(
            store.reorder_columns(&["col1".to_string(), "col1".to_string()]),
            Err(TableError::InvalidColumnOrder)
        );
    }

    #[test]
    fn test_columnar_round_trip_shape() {
        let data: Map<String, Value> =
            serde_json::from_value(json!({"x": [1, 2], "y": ["a", null]})).unwrap();
        let table = Table::from_columnar(&data);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.to_columnar(), data);
    }
}
