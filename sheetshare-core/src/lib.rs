//! # sheetshare-core — typed table model for SheetShare
//!
//! The canonical in-memory table behind a live editing session:
//!
//! - [`value`] — column types ([`DType`]) and cell values ([`CellValue`])
//! - [`dtype`] — [`DtypeGuard`], coercion of raw edits to a column's type
//! - [`table`] — [`Table`] and [`TableStore`], the mutation contract
//!
//! Nothing here does I/O or knows about editors; the collaboration layer
//! drives a [`TableStore`] and decides who hears about each change.

pub mod dtype;
pub mod table;
pub mod value;

pub use dtype::{parse_datetime, DtypeGuard};
pub use table::{Column, Record, Table, TableError, TableStore, MAX_ROWS};
pub use value::{infer_dtype, CellValue, DType};
