use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DataSourceError, Result};

pub const MAX_CONNECTIONS: usize = 20;
pub const MIN_IDLE_CONNECTIONS: usize = 2;
pub const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(10 * 60);
pub const MAX_CONNECTION_IDLE_TIME: Duration = Duration::from_secs(5 * 60);
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the health check's connection acquisition.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

const PASSWORD_KEY: &str = "password";

/// Settings exactly as the host hands them over: the plain JSON block and
/// the decrypted secure values.
#[derive(Clone, Default)]
pub struct InstanceSettings {
    pub json_data: Vec<u8>,
    pub decrypted_secure_json_data: HashMap<String, String>,
}

impl InstanceSettings {
    pub fn parse(&self) -> Result<DataSourceSettings> {
        DataSourceSettings::load(&self.json_data, &self.decrypted_secure_json_data)
    }
}

impl std::fmt::Debug for InstanceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceSettings")
            .field("json_data", &String::from_utf8_lossy(&self.json_data))
            .field(
                "decrypted_secure_json_data",
                &self.decrypted_secure_json_data.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonData {
    host: String,
    port: i64,
    database: String,
    username: String,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceSettings {
    pub host: String,
    pub port: i64,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl std::fmt::Debug for DataSourceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl DataSourceSettings {
    /// Load settings from the host's plain JSON block and its decrypted
    /// secure map. Missing fields default; only unparsable JSON fails.
    pub fn load(json_data: &[u8], secure_json_data: &HashMap<String, String>) -> Result<Self> {
        let data: JsonData = serde_json::from_slice(json_data)
            .map_err(|e| DataSourceError::Settings(e.to_string()))?;

        Ok(Self {
            host: data.host,
            port: data.port,
            database: data.database,
            username: data.username,
            password: secure_json_data
                .get(PASSWORD_KEY)
                .cloned()
                .unwrap_or_default(),
        })
    }

    pub fn port_in_range(&self) -> bool {
        valid_port(self.port)
    }

    /// Connection parameters for the wire-protocol driver. Credentials are
    /// passed as discrete fields so they need no escaping.
    pub fn pg_config(&self) -> Result<tokio_postgres::Config> {
        let port = u16::try_from(self.port)
            .map_err(|_| DataSourceError::Settings(format!("invalid port {}", self.port)))?;

        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(port)
            .user(&self.username)
            .password(&self.password)
            .dbname(&self.database)
            .connect_timeout(CONNECT_TIMEOUT);
        Ok(config)
    }

    /// Display form for logs; never carries the password.
    pub fn redacted_url(&self) -> String {
        format!(
            "postgresql://{}:***@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

pub fn valid_port(port: i64) -> bool {
    (1..=65535).contains(&port)
}
