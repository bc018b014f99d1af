//! Shared Postgres plumbing for the sqlx-backed stores.

use sqlx::PgPool;
use tracing::info;

const INIT_SCHEMA: &str = include_str!("../migrations/0001_init.sql");

/// Create the jobs, quota and queue tables if they do not exist.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(INIT_SCHEMA).execute(pool).await?;
    info!("database schema up to date");
    Ok(())
}

/// Render a sqlx error with the operation that produced it.
///
/// | sqlx error | rendered as |
/// |---|---|
/// | `Database` with a code | `database error in {op} ({code}): {message}` |
/// | `PoolClosed` | `connection pool closed in {op}` |
/// | anything else | `sqlx error in {op}: {err}` |
pub(crate) fn describe_sqlx_error(operation: &str, err: sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ),
            None => format!("database error in {operation}: {}", db_err.message()),
        },
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
