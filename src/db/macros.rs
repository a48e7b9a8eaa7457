//! Declarative helpers for building statement parameters.

/// Build a positional parameter list from heterogeneous values.
///
/// Every argument is converted with `Into<SqlValue>`, so primitives, strings, `Option<T>`,
/// chrono timestamps and JSON values can be mixed freely.
///
/// # Example
///
/// ```ignore
/// let params = sql_params![42, "alice", None::<i64>];
/// ctx.execute_update("INSERT INTO users(id, name, age) VALUES (?, ?, ?)", &params).await?;
/// ```
#[macro_export]
macro_rules! sql_params {
    () => {
        ::std::vec::Vec::<$crate::db::types::SqlValue>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::db::types::SqlValue::from($value)),+]
    };
}
