pub mod api;
pub mod config;
pub mod datasource;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod query;
pub mod settings;

pub use error::{DataSourceError, Result};
