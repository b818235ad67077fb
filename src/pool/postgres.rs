//! KWDB pool over the PostgreSQL wire protocol, backed by `deadpool-postgres`.
//!
//! The pool is capped at [`MAX_CONNECTIONS`]. A background task evicts
//! connections past their lifetime or idle limit and keeps
//! [`MIN_IDLE_CONNECTIONS`] warm without ever waiting on a busy pool.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{
    Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime, Timeouts,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio_postgres::types::Type;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info, warn};

use crate::error::{AcquireError, QueryError};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::query::frame::{RawRow, ScalarValue};
use crate::settings::{
    DataSourceSettings, CONNECT_TIMEOUT, HEALTH_CHECK_INTERVAL, MAX_CONNECTIONS,
    MAX_CONNECTION_IDLE_TIME, MAX_CONNECTION_LIFETIME, MIN_IDLE_CONNECTIONS,
};
use crate::Result;

pub struct PgPool {
    pool: Pool,
    maintenance: JoinHandle<()>,
}

impl PgPool {
    /// Build the pool and start its maintenance task. Connections are opened
    /// lazily, so an unreachable server is only reported on acquisition.
    pub async fn connect(settings: &DataSourceSettings) -> Result<Self> {
        let manager = Manager::from_config(
            settings.pg_config()?,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(MAX_CONNECTIONS)
            .create_timeout(Some(CONNECT_TIMEOUT))
            .runtime(Runtime::Tokio1)
            .build()?;

        info!("Created connection pool for {}", settings.redacted_url());
        let maintenance = tokio::spawn(run_maintenance(pool.clone()));

        Ok(Self { pool, maintenance })
    }

    pub fn idle_count(&self) -> usize {
        self.pool.status().available
    }

    pub fn in_use(&self) -> usize {
        let status = self.pool.status();
        status.size.saturating_sub(status.available)
    }

    pub fn max_size(&self) -> usize {
        self.pool.status().max_size
    }
}

impl Drop for PgPool {
    fn drop(&mut self) {
        self.maintenance.abort();
    }
}

#[async_trait]
impl ConnectionPool for PgPool {
    type Connection = PgConnection;

    async fn acquire(&self) -> std::result::Result<PgConnection, AcquireError> {
        self.pool.get().await.map(PgConnection).map_err(acquire_error)
    }

    fn close(&self) {
        self.maintenance.abort();
        self.pool.close();
    }
}

/// A checked-out client; dropping it hands it back to the pool.
pub struct PgConnection(Object);

#[async_trait]
impl PooledConnection for PgConnection {
    async fn query(&mut self, sql: &str) -> std::result::Result<Vec<RawRow>, QueryError> {
        let rows = self.0.query(sql, &[]).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn ping(&mut self) -> std::result::Result<(), QueryError> {
        self.0.simple_query("SELECT 1").await?;
        Ok(())
    }
}

async fn run_maintenance(pool: Pool) {
    let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        if pool.is_closed() {
            break;
        }
        maintain(&pool).await;
    }
}

async fn maintain(pool: &Pool) {
    let evicted = pool.retain(|_, metrics| {
        metrics.age() < MAX_CONNECTION_LIFETIME && metrics.last_used() < MAX_CONNECTION_IDLE_TIME
    });
    if !evicted.removed.is_empty() {
        debug!("Evicted {} stale KWDB connections", evicted.removed.len());
    }

    let status = pool.status();
    let headroom = status.max_size.saturating_sub(status.size);
    let missing = MIN_IDLE_CONNECTIONS
        .saturating_sub(status.available)
        .min(headroom);
    if missing == 0 {
        return;
    }

    // Zero wait: warming never queues behind real queries.
    let timeouts = Timeouts {
        wait: Some(Duration::ZERO),
        create: Some(CONNECT_TIMEOUT),
        recycle: None,
    };
    let warmed =
        futures::future::join_all((0..missing).map(|_| pool.timeout_get(&timeouts))).await;
    for result in warmed {
        if let Err(e) = result {
            warn!("Failed to warm pool connection: {}", e);
        }
    }
}

fn acquire_error(err: PoolError) -> AcquireError {
    match err {
        PoolError::Timeout(_) => AcquireError::Timeout,
        PoolError::Closed => AcquireError::Closed,
        PoolError::Backend(e) if is_timeout(&e) => AcquireError::Timeout,
        PoolError::Backend(e) => AcquireError::Backend(e.to_string()),
        other => AcquireError::Backend(other.to_string()),
    }
}

fn is_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        current = e.source();
    }
    false
}

fn decode_row(row: &Row) -> std::result::Result<RawRow, QueryError> {
    let mut raw = RawRow::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        raw.push(column.name(), decode_value(row, idx, column.type_())?);
    }
    Ok(raw)
}

fn decode_value(row: &Row, idx: usize, ty: &Type) -> std::result::Result<ScalarValue, QueryError> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.into(),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(i64::from).into(),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(i64::from).into(),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.into(),
        Type::OID => row.try_get::<_, Option<u32>>(idx)?.map(i64::from).into(),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(f64::from).into(),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.into(),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(idx)?
            .and_then(|d| d.to_f64())
            .into(),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            row.try_get::<_, Option<String>>(idx)?.into()
        }
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|ts| ts.and_utc())
            .into(),
        Type::TIMESTAMPTZ => row.try_get::<_, Option<DateTime<Utc>>>(idx)?.into(),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|ts| ts.and_utc())
            .into(),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|json| json.to_string())
            .into(),
        _ => {
            return Err(QueryError::Execution(format!(
                "cannot decode column \"{}\" of type {}",
                row.columns()[idx].name(),
                ty
            )))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadpool_postgres::TimeoutType;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pool_errors_map_to_acquire_errors() {
        assert_eq!(
            acquire_error(PoolError::Timeout(TimeoutType::Wait)),
            AcquireError::Timeout
        );
        assert_eq!(
            acquire_error(PoolError::Timeout(TimeoutType::Create)),
            AcquireError::Timeout
        );
        assert_eq!(acquire_error(PoolError::Closed), AcquireError::Closed);
    }

    #[test]
    fn test_io_timeout_is_detected_in_source_chain() {
        #[derive(Debug)]
        struct Wrapper(std::io::Error);

        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "error connecting to server")
            }
        }

        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let timed_out = Wrapper(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"));
        assert!(is_timeout(&timed_out));

        let refused = Wrapper(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(!is_timeout(&refused));
    }

    fn unreachable_settings() -> DataSourceSettings {
        DataSourceSettings {
            host: "127.0.0.1".into(),
            port: 1,
            database: "defaultdb".into(),
            username: "root".into(),
            password: String::new(),
        }
    }

    #[tokio::test]
    async fn test_pool_is_capped() {
        let pool = PgPool::connect(&unreachable_settings()).await.unwrap();
        assert_eq!(pool.max_size(), MAX_CONNECTIONS);
        assert_eq!(pool.idle_count(), 0);
        pool.close();
    }

    #[tokio::test]
    async fn test_warming_an_unreachable_server_opens_nothing() {
        let pool = PgPool::connect(&unreachable_settings()).await.unwrap();
        maintain(&pool.pool).await;
        assert_eq!(pool.pool.status().size, 0);
        assert_eq!(pool.in_use(), 0);
        pool.close();
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_on_acquire() {
        let pool = PgPool::connect(&unreachable_settings()).await.unwrap();
        let err = pool.acquire().await.err().expect("acquisition should fail");
        assert!(matches!(err, AcquireError::Backend(_) | AcquireError::Timeout));
        assert_eq!(pool.in_use(), 0);
        pool.close();
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_acquisition() {
        let pool = PgPool::connect(&unreachable_settings()).await.unwrap();
        pool.close();
        assert_eq!(pool.acquire().await.err(), Some(AcquireError::Closed));
    }

    #[tokio::test]
    async fn test_out_of_range_port_fails_to_build() {
        let settings = DataSourceSettings {
            port: 70_000,
            ..unreachable_settings()
        };
        let err = PgPool::connect(&settings).await.err().expect("build should fail");
        assert!(matches!(err, crate::DataSourceError::Settings(_)));
    }
}
