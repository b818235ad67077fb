use tracing::debug;

use crate::error::{AcquireError, QueryError};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::query::context::{Interrupted, QueryContext};
use crate::query::frame::RawRow;

/// Run `text` on one pooled connection.
///
/// Exactly one connection is acquired, and it is released before returning on
/// every path, including interruption by `ctx`. Acquisition failures surface
/// as [`QueryError::Acquisition`], everything after as
/// [`QueryError::Execution`].
pub async fn execute<P: ConnectionPool>(
    ctx: &QueryContext,
    pool: &P,
    text: &str,
) -> Result<Vec<RawRow>, QueryError> {
    let mut conn = match ctx.run(pool.acquire()).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => return Err(QueryError::Acquisition(e)),
        Err(Interrupted::Cancelled) => return Err(AcquireError::Cancelled.into()),
        Err(Interrupted::DeadlineExceeded) => return Err(AcquireError::Timeout.into()),
    };

    debug!("Executing query: {}", text);
    let result = match ctx.run(conn.query(text)).await {
        Ok(result) => result,
        Err(interrupted) => Err(QueryError::Execution(interrupted.to_string())),
    };
    drop(conn);

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::duckdb::DuckDbPool;
    use crate::query::frame::ScalarValue;
    use std::time::Duration;

    #[tokio::test]
    async fn test_execute_releases_connection() {
        let pool = DuckDbPool::open_in_memory(1).unwrap();
        let ctx = QueryContext::background();

        let rows = execute(&ctx, &pool, "SELECT 42 AS answer").await.unwrap();
        assert_eq!(rows[0].get("answer"), Some(&ScalarValue::Int64(42)));
        assert_eq!(pool.available_permits(), 1);

        let err = execute(&ctx, &pool, "SELECT * FROM missing_table")
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Execution(_)));
        assert_eq!(pool.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_saturated_pool_times_out() {
        let pool = DuckDbPool::open_in_memory(1).unwrap();
        let _held = pool.acquire().await.unwrap();

        let ctx = QueryContext::background().with_timeout(Duration::from_millis(20));
        let err = execute(&ctx, &pool, "SELECT 1").await.unwrap_err();
        assert!(matches!(
            err,
            QueryError::Acquisition(AcquireError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_acquisition() {
        let pool = DuckDbPool::open_in_memory(1).unwrap();
        let ctx = QueryContext::background();
        ctx.cancel();

        let err = execute(&ctx, &pool, "SELECT 1").await.unwrap_err();
        assert!(matches!(
            err,
            QueryError::Acquisition(AcquireError::Cancelled)
        ));
        assert_eq!(pool.available_permits(), 1);
    }
}
