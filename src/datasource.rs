//! One configured data source instance: its settings plus the pool serving
//! its queries.

use std::sync::Arc;

use tracing::{error, info};

use crate::health;
use crate::models::{BatchResult, HealthResult, QueryRequest};
use crate::pool::postgres::PgPool;
use crate::pool::ConnectionPool;
use crate::query::dispatcher::QueryDispatcher;
use crate::settings::InstanceSettings;
use crate::{DataSourceError, Result};

pub struct DataSource<P> {
    instance: InstanceSettings,
    dispatcher: Option<QueryDispatcher<P>>,
}

impl DataSource<PgPool> {
    /// Build an instance against KWDB. A bad configuration or a pool that
    /// cannot be built leaves the instance without a pool; queries then fail
    /// and health checks report why.
    pub async fn start(instance: InstanceSettings) -> Self {
        let pool = match instance.parse() {
            Ok(settings) => match PgPool::connect(&settings).await {
                Ok(pool) => Some(Arc::new(pool)),
                Err(e) => {
                    error!("Failed to create connection pool: {}", e);
                    None
                }
            },
            Err(e) => {
                error!("Failed to load plugin settings: {}", e);
                None
            }
        };

        Self::new(instance, pool)
    }
}

impl<P: ConnectionPool> DataSource<P> {
    pub fn new(instance: InstanceSettings, pool: Option<Arc<P>>) -> Self {
        Self {
            instance,
            dispatcher: pool.map(QueryDispatcher::new),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.is_some()
    }

    pub async fn query_data(&self, queries: Vec<QueryRequest>) -> Result<BatchResult> {
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| DataSourceError::Unavailable(health::NOT_INITIALIZED.to_string()))?;
        dispatcher.dispatch(queries).await
    }

    pub async fn check_health(&self) -> HealthResult {
        let pool = self.dispatcher.as_ref().map(|d| d.pool().as_ref());
        health::check(&self.instance, pool).await
    }

    /// Close the pool. Safe to call more than once.
    pub fn dispose(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            info!("Disposing data source");
            dispatcher.pool().close();
        }
    }
}
