//! Parameter binding for Any-driver queries.

use crate::db::types::SqlValue;
use sqlx::Any;
use sqlx::any::AnyArguments;
use sqlx::query::Query;

/// Bind a parameter to a query.
///
/// Timestamps bind as RFC 3339 text and JSON as its serialized text; the Any driver has no
/// native encoding for either.
pub(crate) fn bind_value<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    value: SqlValue,
) -> Query<'q, Any, AnyArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(v),
        SqlValue::Int(v) => query.bind(v),
        SqlValue::Float(v) => query.bind(v),
        SqlValue::Text(v) => query.bind(v),
        SqlValue::Bytes(v) => query.bind(v),
        SqlValue::Timestamp(v) => query.bind(v.to_rfc3339()),
        SqlValue::Json(v) => query.bind(v.to_string()),
    }
}

/// Bind every parameter in order.
pub(crate) fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: Vec<SqlValue>,
) -> Query<'q, Any, AnyArguments<'q>> {
    for value in params {
        query = bind_value(query, value);
    }
    query
}
