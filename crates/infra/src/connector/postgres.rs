//! Postgres connector.
//!
//! Transactions are driven with raw `BEGIN` / `COMMIT` / `ROLLBACK` on a
//! pooled connection so that one connection can be shared by all jobs of a
//! batch. Postgres aborts the whole transaction on any failed statement, so
//! each job attempt runs inside its own `SAVEPOINT`. A connection whose
//! rollback failed is closed rather than returned to the pool.
//!
//! ## Error Mapping
//!
//! | SQLx Error | ConnectorError |
//! |------------|----------------|
//! | PoolTimedOut / PoolClosed | `Acquire` |
//! | Database | `Statement` (with SQLSTATE code) |
//! | ColumnDecode / ColumnNotFound | `Decode` |
//! | Other | `Statement` |

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::query::Query as SqlxQuery;
use sqlx::{PgPool, Postgres, Row};
use tokio_stream::StreamExt;
use tracing::{debug, instrument, warn};

use super::{Connection, Connector, ConnectorError, FromConfig, RowStream};
use crate::config::{ConfigError, ConnectionSettings, StoreConfig};
use crate::sql::{Query, SqlParam, ValueRow, ValueTable};

/// Pooled Postgres connector.
#[derive(Debug, Clone)]
pub struct PgConnector {
    pool: PgPool,
}

impl PgConnector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a lazily-connecting pool; nothing is dialed until first use.
    pub fn connect_lazy(config: &StoreConfig) -> Result<Self, ConfigError> {
        let options = PgPoolOptions::new()
            .max_connections(config.pool.max_connections)
            .acquire_timeout(config.pool.acquire_timeout());

        let pool = match &config.connection.url {
            Some(url) => options
                .connect_lazy(url)
                .map_err(|e| ConfigError::Connection(e.to_string()))?,
            None => options.connect_lazy_with(connect_options(&config.connection)),
        };

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn connect_options(settings: &ConnectionSettings) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&settings.host)
        .port(settings.port)
        .username(&settings.user)
        .password(&settings.password)
        .database(&settings.database)
}

impl FromConfig for PgConnector {
    fn from_config(config: &StoreConfig) -> Result<Self, ConfigError> {
        Self::connect_lazy(config)
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgPooledConnection;

    #[instrument(skip(self), err)]
    async fn acquire(&self) -> Result<PgPooledConnection, ConnectorError> {
        let conn = self.pool.acquire().await.map_err(|e| map_sqlx_error("acquire", e))?;
        Ok(PgPooledConnection { conn })
    }

    #[instrument(skip(self, table), fields(table = table.name()), err)]
    async fn ensure_schema(&self, table: &ValueTable) -> Result<(), ConnectorError> {
        for query in [table.create_table(), table.create_index()] {
            bind_all(&query)
                .execute(&self.pool)
                .await
                .map_err(|e| ConnectorError::Schema(map_sqlx_error(query.name(), e).to_string()))?;
        }
        debug!("value table ready");
        Ok(())
    }
}

/// A connection checked out of a [`PgConnector`] pool.
#[derive(Debug)]
pub struct PgPooledConnection {
    conn: PoolConnection<Postgres>,
}

impl PgPooledConnection {
    async fn control(&mut self, statement: &str, operation: &'static str) -> Result<(), ConnectorError> {
        sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(statement))
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }
}

#[async_trait]
impl Connection for PgPooledConnection {
    async fn begin(&mut self) -> Result<(), ConnectorError> {
        self.control("BEGIN", "begin").await
    }

    async fn commit(&mut self) -> Result<(), ConnectorError> {
        self.control("COMMIT", "commit").await
    }

    async fn rollback(&mut self) -> Result<(), ConnectorError> {
        self.control("ROLLBACK", "rollback").await
    }

    async fn savepoint(&mut self, name: &'static str) -> Result<(), ConnectorError> {
        self.control(&format!("SAVEPOINT {name}"), "savepoint").await
    }

    async fn rollback_to(&mut self, name: &'static str) -> Result<(), ConnectorError> {
        self.control(&format!("ROLLBACK TO SAVEPOINT {name}"), "rollback_to_savepoint")
            .await
    }

    async fn release_savepoint(&mut self, name: &'static str) -> Result<(), ConnectorError> {
        self.control(&format!("RELEASE SAVEPOINT {name}"), "release_savepoint")
            .await
    }

    async fn execute(&mut self, query: &Query) -> Result<u64, ConnectorError> {
        let result = bind_all(query)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error(query.name(), e))?;
        Ok(result.rows_affected())
    }

    fn fetch<'a>(&'a mut self, query: &'a Query) -> RowStream<'a> {
        let operation = query.name();
        let rows = bind_all(query).fetch(&mut *self.conn).map(move |row| {
            row.map_err(|e| map_sqlx_error(operation, e))
                .and_then(|row| decode_row(&row))
        });
        Box::pin(rows)
    }

    fn release(self) {
        drop(self.conn);
    }

    async fn destroy(self) {
        if let Err(e) = self.conn.close().await {
            warn!(error = %e, "failed to close connection");
        }
    }
}

fn bind_all(query: &Query) -> SqlxQuery<'_, Postgres, PgArguments> {
    query
        .params()
        .iter()
        .fold(sqlx::query(query.sql()), |q, param| match param {
            SqlParam::Text(value) => q.bind(value.as_str()),
            SqlParam::BigInt(value) => q.bind(*value),
            SqlParam::SmallInt(value) => q.bind(*value),
            SqlParam::Bool(value) => q.bind(*value),
        })
}

fn decode_row(row: &PgRow) -> Result<ValueRow, ConnectorError> {
    let decode = |e: sqlx::Error| ConnectorError::Decode(e.to_string());
    Ok(ValueRow {
        id: row.try_get("id").map_err(decode)?,
        key: row.try_get("key").map_err(decode)?,
        field: row.try_get("field").map_err(decode)?,
        value: row.try_get("value").map_err(decode)?,
        value_type: row.try_get("value_type").map_err(decode)?,
        is_relationship: row.try_get("is_relationship").map_err(decode)?,
        state: row.try_get("state").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> ConnectorError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = match db_err.code() {
                Some(code) => format!("{} (SQLSTATE {})", db_err.message(), code),
                None => db_err.message().to_string(),
            };
            ConnectorError::statement(operation, message)
        }
        sqlx::Error::PoolTimedOut => {
            ConnectorError::Acquire(format!("timed out waiting for a connection in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            ConnectorError::Acquire(format!("connection pool closed in {operation}"))
        }
        e @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_)) => {
            ConnectorError::Decode(e.to_string())
        }
        other => ConnectorError::statement(operation, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_map_to_acquire() {
        assert!(matches!(
            map_sqlx_error("acquire", sqlx::Error::PoolTimedOut),
            ConnectorError::Acquire(_)
        ));
        assert!(matches!(
            map_sqlx_error("lookup", sqlx::Error::PoolClosed),
            ConnectorError::Acquire(_)
        ));
    }

    #[test]
    fn other_errors_keep_the_operation() {
        match map_sqlx_error("update", sqlx::Error::RowNotFound) {
            ConnectorError::Statement { operation, .. } => assert_eq!(operation, "update"),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn discrete_settings_build_connect_options() {
        let settings = ConnectionSettings {
            host: "db.internal".into(),
            port: 6543,
            ..ConnectionSettings::default()
        };
        let options = connect_options(&settings);
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_database(), Some("graph_store"));
    }
}
