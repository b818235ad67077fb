use std::collections::HashMap;
use std::env;

use serde_json::json;

use crate::settings::InstanceSettings;
use crate::{DataSourceError, Result};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_KWDB_PORT: i64 = 26257;

/// Process-level configuration of the service binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub instance: InstanceSettings,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any variable source; unset variables take their
    /// defaults, set ones must parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let port = match lookup("PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|e| DataSourceError::Settings(format!("PORT {:?}: {}", raw, e)))?,
            None => DEFAULT_PORT,
        };
        let kwdb_port: i64 = match lookup("KWDB_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|e| DataSourceError::Settings(format!("KWDB_PORT {:?}: {}", raw, e)))?,
            None => DEFAULT_KWDB_PORT,
        };

        let json_data = json!({
            "host": var("KWDB_HOST", "localhost"),
            "port": kwdb_port,
            "database": var("KWDB_DATABASE", "defaultdb"),
            "username": var("KWDB_USER", "root"),
        });

        let mut secure = HashMap::new();
        secure.insert("password".to_string(), var("KWDB_PASSWORD", ""));

        Ok(Self {
            port,
            instance: InstanceSettings {
                json_data: serde_json::to_vec(&json_data)?,
                decrypted_secure_json_data: secure,
            },
        })
    }
}
