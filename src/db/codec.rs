//! Row decoding and parameter encoding at the driver boundary.
//!
//! # Architecture
//!
//! The Any driver reports a type for every value it returns, so decoding works in two phases:
//! 1. Registered [`TypeConverter`]s are asked first, in registration order
//! 2. Otherwise the value's type name is classified with [`categorize_type`] and decoded by
//!    category, narrowing through the integer and float widths the driver may report
//!
//! Encoding mirrors this: converters may rewrite a parameter before it is bound.

use crate::db::row::{ColumnInfo, Row};
use crate::db::types::{SqlValue, TypeCategory, categorize_type};
use crate::error::{DbError, DbResult};
use sqlx::any::AnyRow;
use sqlx::{Any, Column, Row as _, TypeInfo, ValueRef};
use std::sync::Arc;

type AnyColumn = <Any as sqlx::Database>::Column;

/// A custom conversion consulted before the built-in table.
///
/// Both methods return `None` to decline, letting the next converter (or the built-in table)
/// handle the value.
pub trait TypeConverter: Send + Sync {
    /// Decode the value of `column` from `row`.
    fn decode(&self, column: &ColumnInfo, row: &AnyRow) -> Option<DbResult<SqlValue>> {
        let _ = (column, row);
        None
    }

    /// Rewrite a parameter before it is bound.
    fn encode(&self, value: &SqlValue) -> Option<DbResult<SqlValue>> {
        let _ = value;
        None
    }
}

/// Ordered registry of converters plus the built-in conversions.
#[derive(Clone, Default)]
pub struct RowCodec {
    converters: Vec<Arc<dyn TypeConverter>>,
}

impl RowCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a converter. Earlier registrations win.
    pub fn register(&mut self, converter: Arc<dyn TypeConverter>) {
        self.converters.push(converter);
    }

    pub fn with_converter(mut self, converter: impl TypeConverter + 'static) -> Self {
        self.register(Arc::new(converter));
        self
    }

    pub fn converter_count(&self) -> usize {
        self.converters.len()
    }

    /// Decode every column of a driver row.
    pub fn decode_row(&self, row: &AnyRow, columns: &Arc<[ColumnInfo]>) -> DbResult<Row> {
        let mut values = Vec::with_capacity(columns.len());
        for column in columns.iter() {
            values.push(self.decode_value(column, row)?);
        }
        Ok(Row::new(Arc::clone(columns), values))
    }

    fn decode_value(&self, column: &ColumnInfo, row: &AnyRow) -> DbResult<SqlValue> {
        for converter in &self.converters {
            if let Some(result) = converter.decode(column, row) {
                return result;
            }
        }
        decode_builtin(row, column.index)
    }

    /// Run parameters through the registered converters.
    pub fn encode_params(&self, params: &[SqlValue]) -> DbResult<Vec<SqlValue>> {
        params.iter().map(|p| self.encode_value(p)).collect()
    }

    fn encode_value(&self, value: &SqlValue) -> DbResult<SqlValue> {
        for converter in &self.converters {
            if let Some(result) = converter.encode(value) {
                return result;
            }
        }
        Ok(value.clone())
    }
}

impl std::fmt::Debug for RowCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCodec")
            .field("converters", &self.converters.len())
            .finish()
    }
}

/// Column metadata for a result or prepared statement.
pub fn column_info(columns: &[AnyColumn]) -> Arc<[ColumnInfo]> {
    columns
        .iter()
        .map(|c| ColumnInfo {
            index: c.ordinal(),
            name: c.name().to_string(),
            type_name: c.type_info().name().to_string(),
        })
        .collect()
}

/// Decode a value by the type the driver reports for it.
pub fn decode_builtin(row: &AnyRow, index: usize) -> DbResult<SqlValue> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let type_name = raw.type_info().name().to_string();

    match categorize_type(&type_name) {
        TypeCategory::Boolean => Ok(SqlValue::Bool(row.try_get::<bool, _>(index)?)),
        TypeCategory::Integer => decode_integer(row, index),
        TypeCategory::Float => decode_float(row, index),
        TypeCategory::Binary => Ok(SqlValue::Bytes(row.try_get::<Vec<u8>, _>(index)?)),
        TypeCategory::Null
        | TypeCategory::Text
        | TypeCategory::Temporal
        | TypeCategory::Json => row
            .try_get::<String, _>(index)
            .map(SqlValue::Text)
            .map_err(|e| {
                DbError::row_mapping(format!(
                    "unsupported column type {} at index {}: {}",
                    type_name, index, e
                ))
            }),
    }
}

fn decode_integer(row: &AnyRow, index: usize) -> DbResult<SqlValue> {
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Ok(SqlValue::Int(v));
    }
    if let Ok(v) = row.try_get::<i32, _>(index) {
        return Ok(SqlValue::Int(i64::from(v)));
    }
    Ok(SqlValue::Int(i64::from(row.try_get::<i16, _>(index)?)))
}

fn decode_float(row: &AnyRow, index: usize) -> DbResult<SqlValue> {
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return Ok(SqlValue::Float(v));
    }
    Ok(SqlValue::Float(f64::from(row.try_get::<f32, _>(index)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UpperText;

    impl TypeConverter for UpperText {
        fn encode(&self, value: &SqlValue) -> Option<DbResult<SqlValue>> {
            value
                .as_str()
                .map(|s| Ok(SqlValue::Text(s.to_uppercase())))
        }
    }

    struct RejectBytes;

    impl TypeConverter for RejectBytes {
        fn encode(&self, value: &SqlValue) -> Option<DbResult<SqlValue>> {
            match value {
                SqlValue::Bytes(_) => Some(Err(DbError::row_mapping("bytes not allowed"))),
                _ => None,
            }
        }
    }

    #[test]
    fn test_encode_without_converters_is_identity() {
        let codec = RowCodec::new();
        let params = vec![SqlValue::Int(1), SqlValue::Text("a".into()), SqlValue::Null];
        assert_eq!(codec.encode_params(&params).unwrap(), params);
    }

    #[test]
    fn test_converters_consulted_in_order() {
        let codec = RowCodec::new()
            .with_converter(RejectBytes)
            .with_converter(UpperText);
        assert_eq!(codec.converter_count(), 2);

        let encoded = codec
            .encode_params(&[SqlValue::Text("abc".into()), SqlValue::Int(3)])
            .unwrap();
        assert_eq!(encoded, vec![SqlValue::Text("ABC".into()), SqlValue::Int(3)]);

        let err = codec
            .encode_params(&[SqlValue::Bytes(vec![1])])
            .unwrap_err();
        assert!(matches!(err, DbError::RowMapping { .. }));
    }

    #[test]
    fn test_debug_hides_converters() {
        let codec = RowCodec::new().with_converter(UpperText);
        assert_eq!(format!("{:?}", codec), "RowCodec { converters: 1 }");
    }
}
