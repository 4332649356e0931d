//! Connection and client configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Connection parameters for the database being streamed.
///
/// Empty strings (and a zero port) mean "use the default": the
/// corresponding flag is not passed to the backend and the key is left out
/// of the connection string, mirroring how `pg_recvlogical` and libpq
/// treat absent options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub database: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl DatabaseConfig {
    /// Creates a config for the given database with user `postgres` and
    /// everything else defaulted.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            user: default_user(),
            password: String::new(),
            host: String::new(),
            port: 0,
        }
    }

    /// Renders a key/value connection string usable with `tokio_postgres`.
    pub fn to_connect_string(&self) -> String {
        let mut options = Vec::new();
        if !self.database.is_empty() {
            options.push(format!("dbname={}", self.database));
        }
        if !self.user.is_empty() {
            options.push(format!("user={}", self.user));
        }
        if !self.password.is_empty() {
            options.push(format!("password={}", self.password));
        }
        if !self.host.is_empty() {
            options.push(format!("host={}", self.host));
        }
        if self.port > 0 {
            options.push(format!("port={}", self.port));
        }
        options.push("sslmode=disable".to_string());
        options.join(" ")
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub database: DatabaseConfig,
    /// Name of the replication slot to attach to.
    pub slot: String,
    /// Path of the `pg_recvlogical` binary driving the slot.
    #[serde(default = "default_program")]
    pub program: PathBuf,
    /// Whether to backfill column values the decoding plugin omitted as
    /// unchanged, via point lookups against the source table.
    #[serde(default)]
    pub backfill: bool,
    /// Numeric primary-key column used by backfill lookups.
    #[serde(default = "default_key_column")]
    pub key_column: String,
}

impl ClientConfig {
    pub fn new(database: DatabaseConfig, slot: impl Into<String>) -> Self {
        Self {
            database,
            slot: slot.into(),
            program: default_program(),
            backfill: false,
            key_column: default_key_column(),
        }
    }
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_program() -> PathBuf {
    PathBuf::from("pg_recvlogical")
}

fn default_key_column() -> String {
    "id".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_string_includes_only_set_options() {
        let config = DatabaseConfig::new("app");
        assert_eq!(config.to_connect_string(), "dbname=app user=postgres sslmode=disable");
    }

    #[test]
    fn connect_string_full() {
        let config = DatabaseConfig {
            database: "app".to_string(),
            user: "streamer".to_string(),
            password: "secret".to_string(),
            host: "db.internal".to_string(),
            port: 5433,
        };
        assert_eq!(
            config.to_connect_string(),
            "dbname=app user=streamer password=secret host=db.internal port=5433 sslmode=disable"
        );
    }
}
