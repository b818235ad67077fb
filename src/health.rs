use tracing::error;

use crate::error::{AcquireError, QueryError};
use crate::metrics;
use crate::models::HealthResult;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::query::context::QueryContext;
use crate::settings::{valid_port, InstanceSettings, HEALTH_CHECK_TIMEOUT};

pub const INVALID_CONFIGURATION: &str = "Invalid datasource configuration";
pub const NOT_INITIALIZED: &str = "Connection not initialized";
pub const WORKING: &str = "Data source is working";

/// Validate the settings, then acquire a connection and run a round trip
/// query. Stops at the first failing step; failures are reported, never
/// raised.
pub async fn check<P: ConnectionPool>(
    instance: &InstanceSettings,
    pool: Option<&P>,
) -> HealthResult {
    let result = run_checks(instance, pool).await;
    metrics::record_health_check(result.status);
    result
}

async fn run_checks<P: ConnectionPool>(
    instance: &InstanceSettings,
    pool: Option<&P>,
) -> HealthResult {
    let settings = match instance.parse() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load plugin settings: {}", e);
            return HealthResult::error(INVALID_CONFIGURATION);
        }
    };

    let pool = match pool {
        Some(pool) => pool,
        None => return HealthResult::error(NOT_INITIALIZED),
    };

    let ctx = QueryContext::background().with_timeout(HEALTH_CHECK_TIMEOUT);
    let mut conn = match ctx.run(pool.acquire()).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => return HealthResult::error(connection_error_message(&e, settings.port)),
        Err(_) => {
            return HealthResult::error(connection_error_message(
                &AcquireError::Timeout,
                settings.port,
            ))
        }
    };

    let failure = match ctx.run(conn.ping()).await {
        Ok(Ok(())) => return HealthResult::ok(WORKING),
        Ok(Err(QueryError::Execution(detail))) => detail,
        Ok(Err(other)) => other.to_string(),
        Err(interrupted) => interrupted.to_string(),
    };

    error!(
        host = %settings.host,
        port = settings.port,
        error = %failure,
        "Database health check failed"
    );
    HealthResult::error(format!("Database query failed: {}", failure))
}

/// Turn an acquisition failure into an actionable message.
pub fn connection_error_message(err: &AcquireError, port: i64) -> String {
    let text = err.to_string();
    let lower = text.to_lowercase();

    if lower.contains("password authentication failed") {
        return "Password authentication failed: please check your username/password".to_string();
    }
    if matches!(err, AcquireError::Timeout) {
        return "Connection timed out: Please check the host address and port".to_string();
    }
    if lower.contains("connection refused") {
        if !valid_port(port) {
            return "Invalid port: port range should be 1-65535".to_string();
        }
        return "Connection refused: please check the host port and firewall settings".to_string();
    }

    format!("KWDB connection failed: {}", text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HealthStatus;
    use crate::pool::duckdb::DuckDbPool;
    use crate::query::frame::RawRow;
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn instance(json: &str) -> InstanceSettings {
        InstanceSettings {
            json_data: json.as_bytes().to_vec(),
            decrypted_secure_json_data: HashMap::from([(
                "password".to_string(),
                "pass".to_string(),
            )]),
        }
    }

    fn valid_instance() -> InstanceSettings {
        instance(r#"{"host":"localhost","port":5432,"database":"test","username":"user"}"#)
    }

    struct RefusingPool(AcquireError);

    struct BrokenConnection;

    #[async_trait]
    impl ConnectionPool for RefusingPool {
        type Connection = BrokenConnection;

        async fn acquire(&self) -> Result<BrokenConnection, AcquireError> {
            Err(self.0.clone())
        }
    }

    struct BrokenPool;

    #[async_trait]
    impl ConnectionPool for BrokenPool {
        type Connection = BrokenConnection;

        async fn acquire(&self) -> Result<BrokenConnection, AcquireError> {
            Ok(BrokenConnection)
        }
    }

    #[async_trait]
    impl PooledConnection for BrokenConnection {
        async fn query(&mut self, _sql: &str) -> Result<Vec<RawRow>, QueryError> {
            Err(QueryError::Execution("server closed the connection".into()))
        }
    }

    #[test]
    fn test_connection_error_message() {
        let cases = [
            (
                AcquireError::Backend("password authentication failed for user".into()),
                5432,
                "Password authentication failed: please check your username/password",
            ),
            (
                AcquireError::Timeout,
                5432,
                "Connection timed out: Please check the host address and port",
            ),
            (
                AcquireError::Backend("connection refused".into()),
                0,
                "Invalid port: port range should be 1-65535",
            ),
            (
                AcquireError::Backend("connection refused".into()),
                5432,
                "Connection refused: please check the host port and firewall settings",
            ),
            (
                AcquireError::Backend(
                    "error connecting to server: Connection refused (os error 111)".into(),
                ),
                5432,
                "Connection refused: please check the host port and firewall settings",
            ),
            (
                AcquireError::Backend("unknown error".into()),
                5432,
                "KWDB connection failed: unknown error",
            ),
        ];

        for (err, port, expected) in cases {
            assert_eq!(connection_error_message(&err, port), expected, "{:?}", err);
        }
    }

    #[tokio::test]
    async fn test_invalid_settings() {
        let result = check::<DuckDbPool>(&instance("invalid json"), None).await;
        assert_eq!(result.status, HealthStatus::Error);
        assert_eq!(result.message, INVALID_CONFIGURATION);
    }

    #[tokio::test]
    async fn test_pool_not_initialized() {
        let result = check::<DuckDbPool>(&valid_instance(), None).await;
        assert_eq!(result.status, HealthStatus::Error);
        assert_eq!(result.message, NOT_INITIALIZED);
    }

    #[tokio::test]
    async fn test_acquire_error_is_classified() {
        let pool = RefusingPool(AcquireError::Backend("connection refused".into()));
        let zero_port = instance(r#"{"host":"localhost","port":0}"#);

        let result = check(&zero_port, Some(&pool)).await;
        assert_eq!(result.status, HealthStatus::Error);
        assert_eq!(result.message, "Invalid port: port range should be 1-65535");
    }

    #[tokio::test]
    async fn test_round_trip_failure() {
        let result = check(&valid_instance(), Some(&BrokenPool)).await;
        assert_eq!(result.status, HealthStatus::Error);
        assert_eq!(
            result.message,
            "Database query failed: server closed the connection"
        );
    }

    #[tokio::test]
    async fn test_working_data_source() {
        let pool = DuckDbPool::open_in_memory(1).unwrap();
        let result = check(&valid_instance(), Some(&pool)).await;
        assert_eq!(result, HealthResult::ok(WORKING));
        assert_eq!(pool.available_permits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_pool_times_out() {
        let pool = DuckDbPool::open_in_memory(1).unwrap();
        let _held = pool.acquire().await.unwrap();

        let result = check(&valid_instance(), Some(&pool)).await;
        assert_eq!(
            result.message,
            "Connection timed out: Please check the host address and port"
        );
    }
}
