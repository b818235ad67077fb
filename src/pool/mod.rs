//! Connection pool boundary.
//!
//! A pool hands out exclusive connection handles; dropping a handle gives the
//! connection back. Queries run through [`PooledConnection::query`] and come
//! back as [`RawRow`]s.

use async_trait::async_trait;

use crate::error::{AcquireError, QueryError};
use crate::query::frame::RawRow;

pub mod duckdb;
pub mod postgres;

#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    type Connection: PooledConnection;

    /// Wait for a free connection. Callers bound the wait by dropping the
    /// returned future.
    async fn acquire(&self) -> Result<Self::Connection, AcquireError>;

    /// Stop handing out connections. Handles already out stay usable.
    fn close(&self) {}
}

#[async_trait]
pub trait PooledConnection: Send {
    async fn query(&mut self, sql: &str) -> Result<Vec<RawRow>, QueryError>;

    async fn ping(&mut self) -> Result<(), QueryError> {
        self.query("SELECT 1").await.map(|_| ())
    }
}
