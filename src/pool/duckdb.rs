//! Embedded in-process pool over DuckDB.
//!
//! All connections share one in-memory database; statements run on the
//! blocking thread pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use duckdb::types::{TimeUnit, ValueRef};
use duckdb::Connection;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{AcquireError, QueryError};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::query::frame::{RawRow, ScalarValue};
use crate::Result;

struct Shared {
    root: Mutex<Connection>,
    idle: Mutex<Vec<Connection>>,
}

pub struct DuckDbPool {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
}

impl DuckDbPool {
    pub fn open_in_memory(max_connections: usize) -> Result<Self> {
        let root = Connection::open_in_memory()?;
        Ok(Self {
            shared: Arc::new(Shared {
                root: Mutex::new(root),
                idle: Mutex::new(Vec::new()),
            }),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
        })
    }

    /// Run setup statements (DDL, fixtures) on the shared database.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.shared.root.lock().execute_batch(sql)?;
        Ok(())
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().len()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl ConnectionPool for DuckDbPool {
    type Connection = DuckDbConnection;

    async fn acquire(&self) -> std::result::Result<DuckDbConnection, AcquireError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AcquireError::Closed)?;

        let idle = self.shared.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self
                .shared
                .root
                .lock()
                .try_clone()
                .map_err(|e| AcquireError::Backend(e.to_string()))?,
        };

        Ok(DuckDbConnection {
            conn: Some(conn),
            shared: self.shared.clone(),
            _permit: permit,
        })
    }

    fn close(&self) {
        self.permits.close();
        self.shared.idle.lock().clear();
    }
}

pub struct DuckDbConnection {
    conn: Option<Connection>,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for DuckDbConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.idle.lock().push(conn);
        }
    }
}

#[async_trait]
impl PooledConnection for DuckDbConnection {
    async fn query(&mut self, sql: &str) -> std::result::Result<Vec<RawRow>, QueryError> {
        // A statement interrupted mid-flight keeps its connection; the slot is
        // still freed when this handle drops.
        let conn = self
            .conn
            .take()
            .ok_or_else(|| QueryError::Execution("connection is no longer usable".into()))?;
        let sql = sql.to_string();

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = run_query(&conn, &sql);
            (conn, result)
        })
        .await
        .map_err(|e| QueryError::Execution(e.to_string()))?;

        self.conn = Some(conn);
        result
    }
}

fn run_query(conn: &Connection, sql: &str) -> std::result::Result<Vec<RawRow>, QueryError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;

    let mut names: Option<Vec<String>> = None;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let names = names.get_or_insert_with(|| row.as_ref().column_names());
        let mut raw = RawRow::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            raw.push(name.as_str(), scalar_from(name, row.get_ref(idx)?)?);
        }
        out.push(raw);
    }
    Ok(out)
}

fn scalar_from(column: &str, value: ValueRef<'_>) -> std::result::Result<ScalarValue, QueryError> {
    let scalar = match value {
        ValueRef::Null => ScalarValue::Null,
        ValueRef::Boolean(v) => ScalarValue::Bool(v),
        ValueRef::TinyInt(v) => ScalarValue::Int64(v.into()),
        ValueRef::SmallInt(v) => ScalarValue::Int64(v.into()),
        ValueRef::Int(v) => ScalarValue::Int64(v.into()),
        ValueRef::BigInt(v) => ScalarValue::Int64(v),
        ValueRef::HugeInt(v) => {
            i64::try_from(v).map_or(ScalarValue::Float64(v as f64), ScalarValue::Int64)
        }
        ValueRef::UTinyInt(v) => ScalarValue::Int64(v.into()),
        ValueRef::USmallInt(v) => ScalarValue::Int64(v.into()),
        ValueRef::UInt(v) => ScalarValue::Int64(v.into()),
        ValueRef::UBigInt(v) => {
            i64::try_from(v).map_or(ScalarValue::Float64(v as f64), ScalarValue::Int64)
        }
        ValueRef::Float(v) => ScalarValue::Float64(v.into()),
        ValueRef::Double(v) => ScalarValue::Float64(v),
        ValueRef::Decimal(d) => decimal(column, d)?,
        ValueRef::Text(bytes) => ScalarValue::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Timestamp(unit, v) => timestamp(unit, v).into(),
        ValueRef::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days.into())))
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|ts| ts.and_utc())
            .into(),
        ValueRef::Blob(_) => return Err(unsupported(column, "BLOB")),
        ValueRef::Time64(..) => return Err(unsupported(column, "TIME")),
        _ => return Err(unsupported(column, "nested or enum")),
    };
    Ok(scalar)
}

/// Integral decimals stay integers when they fit; the rest become floats.
fn decimal(column: &str, d: Decimal) -> std::result::Result<ScalarValue, QueryError> {
    if d.scale() == 0 {
        if let Some(v) = d.to_i64() {
            return Ok(ScalarValue::Int64(v));
        }
    }
    d.to_f64()
        .map(ScalarValue::Float64)
        .ok_or_else(|| unsupported(column, "DECIMAL out of range"))
}

fn unsupported(column: &str, kind: &str) -> QueryError {
    QueryError::Execution(format!("cannot decode column \"{}\" of type {}", column, kind))
}

fn timestamp(unit: TimeUnit, value: i64) -> Option<DateTime<Utc>> {
    match unit {
        TimeUnit::Second => DateTime::from_timestamp(value, 0),
        TimeUnit::Millisecond => DateTime::from_timestamp_millis(value),
        TimeUnit::Microsecond => DateTime::from_timestamp_micros(value),
        TimeUnit::Nanosecond => Some(DateTime::from_timestamp_nanos(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::frame::FieldType;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn seeded_pool() -> DuckDbPool {
        let pool = DuckDbPool::open_in_memory(2).unwrap();
        pool.execute_batch(
            "CREATE TABLE meters (ts TIMESTAMP, meter_id VARCHAR, power BIGINT, voltage DOUBLE, ok BOOLEAN);
             INSERT INTO meters VALUES
                ('2025-04-16 07:40:22', 'M1', 1050, 221.0, true),
                ('2025-04-16 07:41:22', 'M2', NULL, 219.5, false);",
        )
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_query_decodes_rows() {
        let pool = seeded_pool();
        let mut conn = pool.acquire().await.unwrap();
        let rows = conn
            .query("SELECT ts, meter_id, power, voltage, ok FROM meters ORDER BY ts")
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].get("ts"),
            Some(&ScalarValue::Time(
                Utc.with_ymd_and_hms(2025, 4, 16, 7, 40, 22).unwrap()
            ))
        );
        assert_eq!(rows[0].get("meter_id"), Some(&ScalarValue::from("M1")));
        assert_eq!(rows[0].get("power"), Some(&ScalarValue::Int64(1050)));
        assert_eq!(rows[1].get("power"), Some(&ScalarValue::Null));
        assert_eq!(rows[1].get("voltage"), Some(&ScalarValue::Float64(219.5)));
        assert_eq!(rows[1].get("ok"), Some(&ScalarValue::Bool(false)));
        assert_eq!(
            rows[0].get("ts").and_then(ScalarValue::field_type),
            Some(FieldType::Time)
        );
    }

    #[tokio::test]
    async fn test_aggregates_and_decimals_keep_numeric_types() {
        let pool = seeded_pool();
        let mut conn = pool.acquire().await.unwrap();
        let rows = conn
            .query("SELECT SUM(power) AS total, 1.5 AS ratio, 2::UBIGINT AS small FROM meters")
            .await
            .unwrap();

        assert_eq!(rows[0].get("total"), Some(&ScalarValue::Int64(1050)));
        assert_eq!(rows[0].get("ratio"), Some(&ScalarValue::Float64(1.5)));
        assert_eq!(rows[0].get("small"), Some(&ScalarValue::Int64(2)));
    }

    #[test]
    fn test_wide_integers_fall_back_to_float() {
        assert_eq!(
            scalar_from("big", ValueRef::HugeInt(i128::from(i64::MAX) + 1)).unwrap(),
            ScalarValue::Float64(9_223_372_036_854_775_808.0)
        );
        assert_eq!(
            scalar_from("big", ValueRef::UBigInt(u64::MAX)).unwrap(),
            ScalarValue::Float64(u64::MAX as f64)
        );
        assert_eq!(
            scalar_from("d", ValueRef::Decimal(Decimal::new(-25, 1))).unwrap(),
            ScalarValue::Float64(-2.5)
        );
    }

    #[tokio::test]
    async fn test_unsupported_value_is_execution_error() {
        let pool = seeded_pool();
        let mut conn = pool.acquire().await.unwrap();
        let err = conn.query("SELECT 'abc'::BLOB AS payload").await.unwrap_err();

        match err {
            QueryError::Execution(message) => assert!(message.contains("payload"), "{}", message),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_sql_is_execution_error() {
        let pool = seeded_pool();
        let mut conn = pool.acquire().await.unwrap();
        let err = conn.query("SELEC nonsense").await.unwrap_err();
        assert!(matches!(err, QueryError::Execution(_)));

        // The connection stays usable after a failed statement.
        conn.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_connections_are_released_on_drop() {
        let pool = seeded_pool();
        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.available_permits(), 1);

        drop(conn);
        assert_eq!(pool.available_permits(), 2);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_acquisition() {
        let pool = seeded_pool();
        pool.close();
        assert_eq!(pool.acquire().await.err(), Some(AcquireError::Closed));
    }
}
