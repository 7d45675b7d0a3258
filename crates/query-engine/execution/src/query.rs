//! Bind rendered statements onto the database driver and run them.

use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};

use query_engine_sql::sql::string::{Param, DDL, SQL};

use crate::error::Error;

/// Attach a statement's parameters to a driver query, by position.
pub fn bind(sql: &SQL) -> Query<'_, Postgres, PgArguments> {
    let mut query = sqlx::query(sql.sql.as_str());
    for param in &sql.params {
        query = match param {
            Param::String(s) => query.bind(s),
            Param::Int(i) => query.bind(i),
            Param::Float(f) => query.bind(f),
            Param::Json(v) => query.bind(v),
            Param::StringArray(items) => query.bind(items),
        };
    }
    query
}

pub async fn fetch_all(pool: &PgPool, sql: &SQL) -> Result<Vec<PgRow>, Error> {
    tracing::debug!(sql = %sql.sql, "running query");
    let rows = bind(sql).fetch_all(pool).await?;
    Ok(rows)
}

pub async fn fetch_optional(pool: &PgPool, sql: &SQL) -> Result<Option<PgRow>, Error> {
    tracing::debug!(sql = %sql.sql, "running query");
    let row = bind(sql).fetch_optional(pool).await?;
    Ok(row)
}

/// Run a statement and report how many rows it touched.
pub async fn execute(pool: &PgPool, sql: &SQL) -> Result<u64, Error> {
    tracing::debug!(sql = %sql.sql, "running statement");
    let result = bind(sql).execute(pool).await?;
    Ok(result.rows_affected())
}

/// Run a DDL statement, absorbing lost races against concurrent
/// creation of the same table, column, or constraint.
pub async fn run_ddl(pool: &PgPool, ddl: &DDL) -> Result<(), Error> {
    let DDL(sql) = ddl;
    tracing::debug!(sql = %sql.sql, "running ddl");
    match bind(sql).execute(pool).await {
        Ok(_) => Ok(()),
        Err(sqlx_error) => {
            let error = Error::from(sqlx_error);
            if error.is_duplicate_definition() {
                tracing::debug!("definition already exists; continuing");
                Ok(())
            } else {
                Err(error)
            }
        }
    }
}
