//! Loading and storing datasets as JSON files.
//!
//! Two shapes are accepted:
//!
//! ```text
//! records:  [{"name": "Ada", "age": 36}, {"name": "Alan", "age": 41}]
//! columns:  {"name": ["Ada", "Alan"], "age": [36, 41]}
//! ```
//!
//! The final table is written back in the shape it was read in.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sheetshare_core::{DType, Record, Table};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Shape of the input document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// Array of row objects
    Records,
    /// Object of column arrays
    Columns,
}

/// Column types pinned on the command line.
pub type DtypeOverrides = HashMap<String, DType>;

/// Parse a `COLUMN=TYPE` argument.
pub fn parse_dtype_override(arg: &str) -> Result<(String, DType), String> {
    let (column, dtype) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected COLUMN=TYPE, got `{arg}`"))?;
    let column = column.trim();
    if column.is_empty() {
        return Err(format!("missing column name in `{arg}`"));
    }
    let dtype = dtype.parse::<DType>()?;
    Ok((column.to_string(), dtype))
}

/// Build a table from a parsed JSON document.
pub fn parse_dataset(doc: Value, overrides: &DtypeOverrides) -> Result<(Table, TableFormat)> {
    let declared = |name: &str| overrides.get(name).copied();
    match doc {
        Value::Array(items) => {
            let mut records: Vec<Record> = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                match item {
                    Value::Object(map) => records.push(map),
                    other => bail!("row {i} is not an object: {other}"),
                }
            }
            Ok((Table::from_records_with(&records, declared), TableFormat::Records))
        }
        Value::Object(map) => {
            if let Some((name, _)) = map.iter().find(|(_, v)| !v.is_array()) {
                bail!("column `{name}` is not an array");
            }
            Ok((Table::from_columnar_with(&map, declared), TableFormat::Columns))
        }
        other => bail!("expected an array of rows or an object of columns, got {other}"),
    }
}

pub fn load(path: &Path, overrides: &DtypeOverrides) -> Result<(Table, TableFormat)> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let doc: Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let (table, format) = parse_dataset(doc, overrides)
        .with_context(|| format!("loading table from {}", path.display()))?;
    for name in overrides.keys() {
        if table.column(name).is_none() {
            log::warn!("--dtype names unknown column `{name}`");
        }
    }
    log::info!(
        "Loaded {} rows x {} columns from {} ({format:?})",
        table.row_count(),
        table.column_count(),
        path.display()
    );
    Ok((table, format))
}

/// The table as a JSON document of the given shape.
pub fn render(table: &Table, format: TableFormat) -> Value {
    match format {
        TableFormat::Records => Value::Array(table.to_records().into_iter().map(Value::Object).collect()),
        TableFormat::Columns => Value::Object(table.to_columnar()),
    }
}

pub fn save(path: &Path, table: &Table, format: TableFormat) -> Result<()> {
    let text = serde_json::to_string_pretty(&render(table, format))?;
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    log::info!("Wrote {} rows to {}", table.row_count(), path.display());
    Ok(())
}
