//! Catalog access: the one-shot enum-type scan and backfill point lookups.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Database queries the client consumes from outside the streaming core.
///
/// One implementation talks to the real server ([`PgCatalog`]); tests
/// substitute fixed data.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Returns the OIDs of every enum type defined in the database.
    /// Queried once per client lifetime, at startup.
    async fn enum_oids(&self) -> Result<HashSet<i64>>;

    /// Fetches the named columns of the single row of `table` whose
    /// `key_column` equals `key`, each rendered as text. `Ok(None)` when
    /// no such row exists.
    async fn select_row_text(
        &self,
        table: &str,
        key_column: &str,
        key: i64,
        columns: &[String],
    ) -> Result<Option<Vec<Option<String>>>>;
}

/// [`Catalog`] implementation over a dedicated `tokio_postgres` connection.
///
/// Usage is strictly sequential (one scan at startup, then at most one
/// point lookup at a time from the data loop), so a single connection is
/// enough.
pub struct PgCatalog {
    client: tokio_postgres::Client,
    connection: tokio::task::JoinHandle<()>,
}

impl PgCatalog {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let (client, connection) =
            tokio_postgres::connect(&config.to_connect_string(), NoTls).await?;
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("catalog connection error: {e}");
            }
        });
        info!(database = %config.database, "catalog connection established");
        Ok(Self { client, connection })
    }
}

impl Drop for PgCatalog {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn enum_oids(&self) -> Result<HashSet<i64>> {
        let rows = self
            .client
            .query("SELECT enumtypid FROM pg_enum", &[])
            .await?;
        let oids: HashSet<i64> = rows
            .iter()
            .map(|row| {
                let oid: u32 = row.get(0);
                i64::from(oid)
            })
            .collect();
        debug!(count = oids.len(), "scanned enum types");
        Ok(oids)
    }

    async fn select_row_text(
        &self,
        table: &str,
        key_column: &str,
        key: i64,
        columns: &[String],
    ) -> Result<Option<Vec<Option<String>>>> {
        // Table and column names come from the server's own decoded
        // stream; the key is a decoded integer.
        let query = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            columns.join(", "),
            table,
            key_column,
            key
        );
        debug!(%query, "backfill lookup");
        for message in self.client.simple_query(&query).await? {
            if let SimpleQueryMessage::Row(row) = message {
                let values = (0..columns.len())
                    .map(|i| row.get(i).map(str::to_string))
                    .collect();
                return Ok(Some(values));
            }
        }
        Ok(None)
    }
}
