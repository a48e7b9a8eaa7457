//! Database-agnostic value model.
//!
//! Values cross the driver boundary as [`SqlValue`], a closed set of semantic types. Columns are
//! classified by [`TypeCategory`] and Rust types are read back through [`FromSql`].
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies the driver's type name into a logical category
//! 2. A category-specific decoder extracts the value (see [`crate::db::codec`])
//!
//! Temporal, JSON and enumerated values travel as text on the wire. They are parsed on the
//! way out by the corresponding `FromSql` implementation.

use crate::error::{DbError, DbResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeCategory {
    Null,
    Boolean,
    Integer,
    Float,
    Text,
    Binary,
    Temporal,
    Json,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.is_empty() || lower == "null" || lower == "void" {
        return TypeCategory::Null;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    // Checked before integers: "interval" and "point" contain "int"
    if lower.contains("timestamp")
        || lower.contains("date")
        || lower == "time"
        || lower == "timetz"
        || lower == "interval"
    {
        return TypeCategory::Temporal;
    }

    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "numeric"
        || lower.contains("decimal")
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    TypeCategory::Text
}

// =============================================================================
// Values
// =============================================================================

/// A single database value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Json(JsonValue),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The category this value belongs to.
    pub fn category(&self) -> TypeCategory {
        match self {
            Self::Null => TypeCategory::Null,
            Self::Bool(_) => TypeCategory::Boolean,
            Self::Int(_) => TypeCategory::Integer,
            Self::Float(_) => TypeCategory::Float,
            Self::Text(_) => TypeCategory::Text,
            Self::Bytes(_) => TypeCategory::Binary,
            Self::Timestamp(_) => TypeCategory::Temporal,
            Self::Json(_) => TypeCategory::Json,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to a JSON value. Binary data is base64 encoded.
    pub fn to_json(&self) -> JsonValue {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int(v) => JsonValue::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::Text(v) => JsonValue::String(v.clone()),
            Self::Bytes(v) => JsonValue::String(STANDARD.encode(v)),
            Self::Timestamp(v) => JsonValue::String(v.to_rfc3339()),
            Self::Json(v) => v.clone(),
        }
    }
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "'{v}'"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! impl_from_for_sql_value {
    ($($ty:ty => $variant:ident($conv:expr)),+ $(,)?) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(value: $ty) -> Self {
                    SqlValue::$variant($conv(value))
                }
            }
        )+
    };
}

impl_from_for_sql_value! {
    bool => Bool(|v| v),
    i8 => Int(i64::from),
    i16 => Int(i64::from),
    i32 => Int(i64::from),
    i64 => Int(|v| v),
    u8 => Int(i64::from),
    u16 => Int(i64::from),
    u32 => Int(i64::from),
    f32 => Float(f64::from),
    f64 => Float(|v| v),
    String => Text(|v| v),
    &str => Text(String::from),
    &String => Text(String::clone),
    Vec<u8> => Bytes(|v| v),
    &[u8] => Bytes(<[u8]>::to_vec),
    DateTime<Utc> => Timestamp(|v| v),
    NaiveDateTime => Timestamp(|v: NaiveDateTime| v.and_utc()),
    JsonValue => Json(|v| v),
    uuid::Uuid => Text(|v: uuid::Uuid| v.to_string()),
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}

// =============================================================================
// Reading values back
// =============================================================================

/// Conversion from a [`SqlValue`] into a Rust type.
pub trait FromSql: Sized {
    fn from_sql(value: &SqlValue) -> DbResult<Self>;
}

fn mismatch<T>(value: &SqlValue, target: &str) -> DbResult<T> {
    Err(DbError::row_mapping(format!(
        "cannot convert {:?} value {} to {}",
        value.category(),
        value,
        target
    )))
}

impl FromSql for SqlValue {
    fn from_sql(value: &SqlValue) -> DbResult<Self> {
        Ok(value.clone())
    }
}

impl FromSql for i64 {
    fn from_sql(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Int(v) => Ok(*v),
            SqlValue::Bool(v) => Ok(i64::from(*v)),
            SqlValue::Text(s) => s.trim().parse().or_else(|_| mismatch(value, "i64")),
            _ => mismatch(value, "i64"),
        }
    }
}

macro_rules! impl_from_sql_narrow_int {
    ($($ty:ty),+) => {
        $(
            impl FromSql for $ty {
                fn from_sql(value: &SqlValue) -> DbResult<Self> {
                    let wide = i64::from_sql(value)?;
                    <$ty>::try_from(wide).or_else(|_| mismatch(value, stringify!($ty)))
                }
            }
        )+
    };
}

impl_from_sql_narrow_int!(i32, i16, u32, u64, usize);

impl FromSql for f64 {
    fn from_sql(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Float(v) => Ok(*v),
            SqlValue::Int(v) => Ok(*v as f64),
            SqlValue::Text(s) => s.trim().parse().or_else(|_| mismatch(value, "f64")),
            _ => mismatch(value, "f64"),
        }
    }
}

impl FromSql for f32 {
    fn from_sql(value: &SqlValue) -> DbResult<Self> {
        f64::from_sql(value).map(|v| v as f32)
    }
}

impl FromSql for bool {
    fn from_sql(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Bool(v) => Ok(*v),
            // SQLite and MySQL store booleans as integers
            SqlValue::Int(0) => Ok(false),
            SqlValue::Int(1) => Ok(true),
            SqlValue::Text(s) => match s.to_ascii_lowercase().as_str() {
                "t" | "true" | "1" => Ok(true),
                "f" | "false" | "0" => Ok(false),
                _ => mismatch(value, "bool"),
            },
            _ => mismatch(value, "bool"),
        }
    }
}

impl FromSql for String {
    fn from_sql(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Text(s) => Ok(s.clone()),
            SqlValue::Json(v) => Ok(v.to_string()),
            SqlValue::Timestamp(v) => Ok(v.to_rfc3339()),
            SqlValue::Bytes(b) => String::from_utf8(b.clone()).or_else(|_| mismatch(value, "String")),
            _ => mismatch(value, "String"),
        }
    }
}

impl FromSql for Vec<u8> {
    fn from_sql(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Bytes(b) => Ok(b.clone()),
            SqlValue::Text(s) => Ok(s.as_bytes().to_vec()),
            _ => mismatch(value, "Vec<u8>"),
        }
    }
}

/// Parse the text forms databases use for timestamps.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f][+zz[:zz]]` (PostgreSQL `::text`), and the same
/// without an offset, which is taken as UTC (SQLite `CURRENT_TIMESTAMP`, MySQL `CAST AS CHAR`).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(v) = DateTime::parse_from_rfc3339(text) {
        return Some(v.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(v) = DateTime::parse_from_str(text, format) {
            return Some(v.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(v) = NaiveDateTime::parse_from_str(text, format) {
            return Some(v.and_utc());
        }
    }
    None
}

impl FromSql for DateTime<Utc> {
    fn from_sql(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Timestamp(v) => Ok(*v),
            SqlValue::Text(s) => parse_timestamp(s).map_or_else(|| mismatch(value, "timestamp"), Ok),
            // Unix seconds
            SqlValue::Int(secs) => {
                DateTime::from_timestamp(*secs, 0).map_or_else(|| mismatch(value, "timestamp"), Ok)
            }
            _ => mismatch(value, "timestamp"),
        }
    }
}

impl FromSql for NaiveDateTime {
    fn from_sql(value: &SqlValue) -> DbResult<Self> {
        DateTime::<Utc>::from_sql(value).map(|v| v.naive_utc())
    }
}

impl FromSql for JsonValue {
    fn from_sql(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Json(v) => Ok(v.clone()),
            SqlValue::Text(s) => serde_json::from_str(s)
                .map_err(|e| DbError::row_mapping(format!("invalid JSON text: {e}"))),
            other => Ok(other.to_json()),
        }
    }
}

impl FromSql for uuid::Uuid {
    fn from_sql(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Text(s) => uuid::Uuid::parse_str(s.trim())
                .map_err(|e| DbError::row_mapping(format!("invalid UUID text: {e}"))),
            SqlValue::Bytes(b) => uuid::Uuid::from_slice(b)
                .map_err(|e| DbError::row_mapping(format!("invalid UUID bytes: {e}"))),
            _ => mismatch(value, "Uuid"),
        }
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Null => Ok(None),
            other => T::from_sql(other).map(Some),
        }
    }
}
