//! Materialized result rows.

use crate::db::types::{FromSql, SqlValue};
use crate::error::{DbError, DbResult};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Name and driver type of a result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub index: usize,
    pub name: String,
    /// Type name reported by the driver, e.g. "INTEGER" or "TEXT".
    pub type_name: String,
}

/// A column position or name usable with [`Row::get`].
pub trait RowIndex {
    fn position(&self, row: &Row) -> DbResult<usize>;
}

impl RowIndex for usize {
    fn position(&self, row: &Row) -> DbResult<usize> {
        if *self < row.values.len() {
            Ok(*self)
        } else {
            Err(DbError::row_mapping(format!(
                "column index {} out of bounds (len: {})",
                self,
                row.values.len()
            )))
        }
    }
}

impl RowIndex for &str {
    fn position(&self, row: &Row) -> DbResult<usize> {
        row.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(self))
            .ok_or_else(|| DbError::row_mapping(format!("column not found: {}", self)))
    }
}

/// One decoded result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[ColumnInfo]>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Arc<[ColumnInfo]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at a column index or name.
    pub fn value(&self, index: impl RowIndex) -> DbResult<&SqlValue> {
        let pos = index.position(self)?;
        Ok(&self.values[pos])
    }

    /// Typed value at a column index or name.
    pub fn get<T: FromSql>(&self, index: impl RowIndex) -> DbResult<T> {
        let pos = index.position(self)?;
        T::from_sql(&self.values[pos]).map_err(|e| match e {
            DbError::RowMapping { message } => DbError::row_mapping(format!(
                "column '{}': {}",
                self.columns.get(pos).map_or("?", |c| c.name.as_str()),
                message
            )),
            other => other,
        })
    }

    /// Convert the row to a JSON object keyed by column name.
    pub fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| (c.name.clone(), v.to_json()))
            .collect()
    }
}

/// Construction of a record from a [`Row`].
///
/// Implemented for [`Row`] itself and for tuples of [`FromSql`] types (read by position).
/// Records implement it by hand, naming their columns:
///
/// ```ignore
/// impl FromRow for User {
///     fn from_row(row: &Row) -> DbResult<Self> {
///         Ok(User { id: row.get("id")?, name: row.get("name")? })
///     }
/// }
/// ```
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> DbResult<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> DbResult<Self> {
        Ok(row.clone())
    }
}

macro_rules! impl_from_row_for_tuple {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: FromSql),+> FromRow for ($($name,)+) {
            fn from_row(row: &Row) -> DbResult<Self> {
                Ok(($(row.get::<$name>($idx as usize)?,)+))
            }
        }
    };
}

impl_from_row_for_tuple!(A: 0);
impl_from_row_for_tuple!(A: 0, B: 1);
impl_from_row_for_tuple!(A: 0, B: 1, C: 2);
impl_from_row_for_tuple!(A: 0, B: 1, C: 2, D: 3);
impl_from_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_from_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

/// All rows of a query, in result order.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSet {
    columns: Arc<[ColumnInfo]>,
    rows: Vec<Row>,
}

impl RowSet {
    pub fn new(columns: Arc<[ColumnInfo]>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Map every row into a record.
    pub fn map<T: FromRow>(&self) -> DbResult<Vec<T>> {
        self.rows.iter().map(T::from_row).collect()
    }
}

impl Default for RowSet {
    fn default() -> Self {
        Self {
            columns: Arc::from(Vec::new()),
            rows: Vec::new(),
        }
    }
}

impl IntoIterator for RowSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a RowSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}
