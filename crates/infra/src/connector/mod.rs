//! Connection boundary between the writer and the relational store.
//!
//! ## Components
//!
//! - `Connector`: hands out pooled connections and creates the schema
//! - `Connection`: one checked-out connection (transaction control, statements, row streams)
//! - `ConnectionSlot`: a connection shared by the jobs of one batch
//! - `PgConnector`: Postgres via sqlx
//! - `InMemoryConnector`: in-process store for tests, with fault injection

pub mod in_memory;
pub mod postgres;
pub mod slot;

use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio_stream::{Stream, StreamExt};

use crate::config::{ConfigError, StoreConfig};
use crate::sql::{Query, ValueRow, ValueTable};

pub use in_memory::{Fault, InMemoryConnection, InMemoryConnector, StatementKind, StatementRecord};
pub use postgres::{PgConnector, PgPooledConnection};
pub use slot::ConnectionSlot;

/// Errors raised by a connector or connection.
///
/// Carries messages only so it can be cloned into job errors and queue events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    #[error("failed to acquire connection: {0}")]
    Acquire(String),

    #[error("database error in {operation}: {message}")]
    Statement {
        operation: &'static str,
        message: String,
    },

    #[error("failed to decode row: {0}")]
    Decode(String),

    #[error("schema setup failed: {0}")]
    Schema(String),

    #[error("connection already released")]
    Released,
}

impl ConnectorError {
    pub fn statement(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Statement {
            operation,
            message: message.into(),
        }
    }
}

/// Rows produced by [`Connection::fetch`]. Errors arrive as stream items.
pub type RowStream<'a> = Pin<Box<dyn Stream<Item = Result<ValueRow, ConnectorError>> + Send + 'a>>;

/// One checked-out connection.
///
/// Transaction control is explicit: nothing is committed unless `commit`
/// succeeds, and a connection must not go back to the pool with a
/// transaction still open. Use `destroy` when a rollback could not be
/// confirmed.
///
/// A failed statement inside a transaction leaves it aborted: every later
/// statement fails until `rollback`, or `rollback_to` a savepoint taken
/// before the failure.
#[async_trait]
pub trait Connection: Send + Sized + 'static {
    async fn begin(&mut self) -> Result<(), ConnectorError>;

    async fn commit(&mut self) -> Result<(), ConnectorError>;

    /// Roll back the open transaction. A no-op when none is open.
    async fn rollback(&mut self) -> Result<(), ConnectorError>;

    /// Open a savepoint inside the current transaction.
    ///
    /// `name` is written into the statement as-is and must be a plain
    /// identifier.
    async fn savepoint(&mut self, name: &'static str) -> Result<(), ConnectorError>;

    /// Undo everything since `name` and clear a failed transaction state.
    /// The savepoint stays open.
    async fn rollback_to(&mut self, name: &'static str) -> Result<(), ConnectorError>;

    async fn release_savepoint(&mut self, name: &'static str) -> Result<(), ConnectorError>;

    /// Run a statement, returning the number of affected rows.
    async fn execute(&mut self, query: &Query) -> Result<u64, ConnectorError>;

    fn fetch<'a>(&'a mut self, query: &'a Query) -> RowStream<'a>;

    /// Return the connection to its pool.
    fn release(self);

    /// Close the connection instead of returning it to the pool.
    async fn destroy(self);
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn acquire(&self) -> Result<Self::Connection, ConnectorError>;

    /// Create the value table and its index if missing.
    async fn ensure_schema(&self, table: &ValueTable) -> Result<(), ConnectorError>;
}

/// Connectors that can be built from a [`StoreConfig`].
pub trait FromConfig: Sized {
    fn from_config(config: &StoreConfig) -> Result<Self, ConfigError>;
}

/// Drive a row stream to its end, handing each row to `on_row`.
///
/// An error item does not stop the stream; the first one is returned once the
/// stream ends. Returns the number of rows delivered.
pub async fn stream_rows<C: Connection>(
    conn: &mut C,
    query: &Query,
    mut on_row: impl FnMut(ValueRow) + Send,
) -> Result<usize, ConnectorError> {
    let mut rows = conn.fetch(query);
    let mut delivered = 0;
    let mut failure = None;

    while let Some(item) = rows.next().await {
        match item {
            Ok(row) => {
                delivered += 1;
                on_row(row);
            }
            Err(err) => {
                failure.get_or_insert(err);
            }
        }
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(delivered),
    }
}
