//! SQL execution against the pooled database.
//!
//! Reads consult the query cache first (single-flight on a miss); writes
//! bypass the cache entirely and report `rows_affected`. The request
//! deadline bounds connection acquisition here; the dispatcher bounds the
//! whole branch.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::cache::{fingerprint, QueryCache};
use crate::dbpool::DbPool;
use crate::errors::Error;
use crate::protocol::Response;

use super::classify::{classify, StatementClass};
use super::params::{as_dyn_refs, bind_params};
use super::rows::{column_names, decode_rows};

pub struct SqlExecutor {
    pool: DbPool,
    cache: Arc<QueryCache>,
}

fn sql_error(err: tokio_postgres::Error) -> Error {
    Error::Sql(err.to_string())
}

/// Re-materializes an error shared between single-flight waiters.
fn unshare(err: &Error) -> Error {
    match err {
        Error::Sql(s) => Error::Sql(s.clone()),
        Error::Scan(s) => Error::Scan(s.clone()),
        Error::DbUnavailable(s) => Error::DbUnavailable(s.clone()),
        Error::DeadlineExceeded(ms) => Error::DeadlineExceeded(*ms),
        other => Error::Internal(other.to_string()),
    }
}

impl SqlExecutor {
    pub fn new(pool: DbPool, cache: Arc<QueryCache>) -> SqlExecutor {
        SqlExecutor { pool, cache }
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[Value],
        deadline: Duration,
    ) -> Result<Response, Error> {
        match classify(sql) {
            StatementClass::CachableRead if self.cache.enabled() => {
                let key = fingerprint(sql, params);
                let loaded = self
                    .cache
                    .get_or_load(key, || async {
                        let (columns, rows) = self.run_read(sql, params, deadline).await?;
                        Ok(self.cache.make_entry(key, columns, rows))
                    })
                    .await;
                match loaded {
                    Ok(entry) => Ok(Response::ok(entry.columns.clone(), entry.rows.clone())),
                    Err(shared) => Err(unshare(&shared)),
                }
            }
            StatementClass::CachableRead | StatementClass::UncachedRead => {
                let (columns, rows) = self.run_read(sql, params, deadline).await?;
                Ok(Response::ok(columns, rows))
            }
            StatementClass::Write => {
                let affected = self.run_write(sql, params, deadline).await?;
                Ok(Response::rows_affected(affected))
            }
        }
    }

    async fn run_read(
        &self,
        sql: &str,
        params: &[Value],
        deadline: Duration,
    ) -> Result<(Vec<String>, Vec<Vec<Value>>), Error> {
        let conn = self.pool.acquire(deadline).await?;
        let statement = conn.prepare(sql).await.map_err(sql_error)?;
        let bound = bind_params(params);
        let rows = conn
            .query(&statement, &as_dyn_refs(&bound))
            .await
            .map_err(sql_error)?;

        let columns = column_names(&statement);
        let decoded = decode_rows(&rows)?;
        Ok((columns, decoded))
    }

    async fn run_write(
        &self,
        sql: &str,
        params: &[Value],
        deadline: Duration,
    ) -> Result<u64, Error> {
        let conn = self.pool.acquire(deadline).await?;
        let statement = conn.prepare(sql).await.map_err(sql_error)?;
        let bound = bind_params(params);
        conn.execute(&statement, &as_dyn_refs(&bound))
            .await
            .map_err(sql_error)
    }
}
