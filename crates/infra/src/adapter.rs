//! Host-facing storage adapter.
//!
//! Wraps a [`Connector`] with the lifecycle the host expects:
//!
//! - `Uninitialized`: no store options seen yet; calls are rejected
//! - `Initialized`: configured, schema creation in progress; calls wait
//! - `Ready`: calls proceed
//! - `Unavailable`: schema creation failed; calls are rejected for good
//!
//! Every failure reaching the host collapses to [`AdapterError::Internal`],
//! except a read that matched nothing, which is [`AdapterError::Lost`].

use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use graphstore_core::{NodeMutation, StoredNode, TablePrefix};

use crate::config::{AdapterOptions, ConfigError};
use crate::connector::{Connection, Connector, FromConfig, stream_rows};
use crate::jobs::RetryPolicy;
use crate::put_transaction::{PutReport, PutTransaction};
use crate::sql::ValueTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    Ready,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("internal storage error")]
    Internal,
    #[error("no matching node")]
    Lost,
}

struct Configured<C> {
    connector: Arc<C>,
    table: Arc<ValueTable>,
    retry_policy: RetryPolicy,
}

pub struct GraphAdapter<C: Connector> {
    lifecycle: watch::Sender<Lifecycle>,
    configured: OnceLock<Configured<C>>,
}

impl<C: Connector> Default for GraphAdapter<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> GraphAdapter<C> {
    pub fn new() -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Uninitialized);
        Self {
            lifecycle,
            configured: OnceLock::new(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Host option hook.
    ///
    /// Configures the adapter from the first options carrying a `store`
    /// section; later options are ignored. Options without a `store` section
    /// leave the adapter uninitialized.
    #[instrument(skip(self, options), fields(has_store = options.store.is_some()), err)]
    pub async fn opt(&self, options: AdapterOptions, is_initial: bool) -> Result<(), ConfigError>
    where
        C: FromConfig,
    {
        let Some(config) = options.store else {
            debug!(is_initial, "no store options, adapter stays uninitialized");
            return Ok(());
        };
        if self.configured.get().is_some() {
            debug!(is_initial, "adapter already configured, ignoring options");
            return Ok(());
        }

        let prefix = config.table_prefix()?;
        let connector = C::from_config(&config)?;
        match self.configure(connector, prefix, config.jobs.retry_policy()).await {
            // Lost a race with a concurrent call.
            Err(ConfigError::AlreadyConfigured) => Ok(()),
            other => other,
        }
    }

    /// Install a connector and create the schema.
    ///
    /// On schema failure the adapter becomes `Unavailable` and stays so.
    #[instrument(skip(self, connector, retry_policy), fields(table = %prefix), err)]
    pub async fn configure(
        &self,
        connector: C,
        prefix: TablePrefix,
        retry_policy: RetryPolicy,
    ) -> Result<(), ConfigError> {
        let configured = Configured {
            connector: Arc::new(connector),
            table: Arc::new(ValueTable::new(prefix)),
            retry_policy,
        };
        if self.configured.set(configured).is_err() {
            return Err(ConfigError::AlreadyConfigured);
        }
        let Some(configured) = self.configured.get() else {
            return Err(ConfigError::AlreadyConfigured);
        };
        self.lifecycle.send_replace(Lifecycle::Initialized);

        match configured.connector.ensure_schema(&configured.table).await {
            Ok(()) => {
                info!(table = configured.table.name(), "adapter ready");
                self.lifecycle.send_replace(Lifecycle::Ready);
                Ok(())
            }
            Err(err) => {
                error!(table = configured.table.name(), error = %err, "schema setup failed");
                self.lifecycle.send_replace(Lifecycle::Unavailable);
                Err(ConfigError::Schema(err.to_string()))
            }
        }
    }

    /// Wait out schema creation and return the configured store.
    async fn ready(&self) -> Result<&Configured<C>, AdapterError> {
        let mut lifecycle = self.lifecycle.subscribe();
        let state = lifecycle
            .wait_for(|state| *state != Lifecycle::Initialized)
            .await
            .map(|state| *state)
            .map_err(|_| AdapterError::Internal)?;

        match state {
            Lifecycle::Ready => self.configured.get().ok_or(AdapterError::Internal),
            Lifecycle::Uninitialized => {
                warn!("adapter used before it was configured");
                Err(AdapterError::Internal)
            }
            Lifecycle::Unavailable | Lifecycle::Initialized => {
                warn!("adapter unavailable, schema setup failed");
                Err(AdapterError::Internal)
            }
        }
    }

    /// Stream every stored field of `key` (or just `field`) to `on_row`.
    ///
    /// Returns `Lost` when nothing matched.
    #[instrument(skip(self, on_row), err)]
    pub async fn get<F>(&self, key: &str, field: Option<&str>, mut on_row: F) -> Result<(), AdapterError>
    where
        F: FnMut(StoredNode) + Send,
    {
        let configured = self.ready().await?;
        let mut conn = configured.connector.acquire().await.map_err(|err| {
            error!(error = %err, "failed to acquire connection for read");
            AdapterError::Internal
        })?;

        let query = configured.table.lookup(key, field);
        let result = stream_rows(&mut conn, &query, |row| on_row(row.into_node())).await;
        conn.release();

        match result {
            Ok(0) => Err(AdapterError::Lost),
            Ok(rows) => {
                debug!(rows, "read complete");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "read failed");
                Err(AdapterError::Internal)
            }
        }
    }

    /// Collect the rows [`GraphAdapter::get`] would stream.
    pub async fn fetch(&self, key: &str, field: Option<&str>) -> Result<Vec<StoredNode>, AdapterError> {
        let mut nodes = Vec::new();
        self.get(key, field, |node| nodes.push(node)).await?;
        Ok(nodes)
    }

    /// Write a batch in one transaction.
    #[instrument(skip(self, batch), fields(nodes = batch.len()), err)]
    pub async fn put(&self, batch: Vec<NodeMutation>) -> Result<PutReport, AdapterError> {
        let configured = self.ready().await?;
        PutTransaction::new(
            configured.connector.clone(),
            configured.table.clone(),
            configured.retry_policy.clone(),
        )
        .execute(batch)
        .await
        .map_err(|err| {
            error!(error = %err, setup = err.is_setup_failure(), "put failed");
            AdapterError::Internal
        })
    }
}
