//! Client for PostgreSQL Logical Log Streaming Replication, driving a
//! `pg_recvlogical` subprocess attached to a replication slot.
//!
//! The crate re-frames the backend's binary stdout into decoded row-change
//! records, runs them through an application-supplied [`Converter`], and
//! publishes the results on an update feed, reconnecting automatically
//! from the last accepted position when the backend dies. Delivery is
//! at-least-once across reconnects and strictly ordered within one stream
//! lifetime.
//!
//! ```rust,no_run
//! use pg_logstream::{
//!     ChangeRecord, Client, ClientConfig, DatabaseConfig, ExtractContext, LogPos, PgCatalog,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> pg_logstream::Result<()> {
//!     let config = ClientConfig::new(DatabaseConfig::new("app"), "my_slot");
//!     let catalog = Arc::new(PgCatalog::connect(&config.database).await?);
//!
//!     let converter =
//!         |record: &ChangeRecord, _ctx: &ExtractContext| (record.table.clone(), record.op);
//!
//!     let (client, mut updates, mut events) =
//!         Client::connect(config, catalog, converter, LogPos::ZERO).await?;
//!
//!     tokio::select! {
//!         Some((table, op)) = updates.recv() => println!("{op:?} on {table}"),
//!         Some(event) = events.recv() => println!("event: {event:?}"),
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod fifo;
pub mod position;
pub mod proto;
pub mod record;
pub mod stream;
pub mod values;

pub use catalog::{Catalog, PgCatalog};
pub use client::{Client, Converter, Events, NoRetry, ReconnectPolicy, RetryImmediately, Updates};
pub use config::{ClientConfig, DatabaseConfig};
pub use error::{Error, Result};
pub use position::LogPos;
pub use record::{ChangeOperation, ChangeRecord, Datum, Event, Value};
pub use stream::{Stream, StreamOutput};
pub use values::{EnumSet, ExtractContext, PgType, UnknownOid};
