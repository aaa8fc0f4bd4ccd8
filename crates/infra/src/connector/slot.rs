use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use super::{Connection, ConnectorError, stream_rows};
use crate::sql::{Query, ValueRow};

/// A connection shared by every job of one batch.
///
/// Jobs run one at a time, so the lock is uncontended; it exists so the
/// connection can be borrowed from `'static` job actions. Once taken out
/// (released or destroyed) every further use fails with
/// [`ConnectorError::Released`].
pub struct ConnectionSlot<C> {
    inner: Arc<Mutex<Option<C>>>,
}

impl<C> Clone for ConnectionSlot<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connection> ConnectionSlot<C> {
    pub fn new(conn: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(conn))),
        }
    }

    pub async fn begin(&self) -> Result<(), ConnectorError> {
        let mut guard = self.inner.lock().await;
        guard.as_mut().ok_or(ConnectorError::Released)?.begin().await
    }

    pub async fn commit(&self) -> Result<(), ConnectorError> {
        let mut guard = self.inner.lock().await;
        guard.as_mut().ok_or(ConnectorError::Released)?.commit().await
    }

    pub async fn rollback(&self) -> Result<(), ConnectorError> {
        let mut guard = self.inner.lock().await;
        guard.as_mut().ok_or(ConnectorError::Released)?.rollback().await
    }

    pub async fn savepoint(&self, name: &'static str) -> Result<(), ConnectorError> {
        let mut guard = self.inner.lock().await;
        guard.as_mut().ok_or(ConnectorError::Released)?.savepoint(name).await
    }

    pub async fn rollback_to(&self, name: &'static str) -> Result<(), ConnectorError> {
        let mut guard = self.inner.lock().await;
        guard.as_mut().ok_or(ConnectorError::Released)?.rollback_to(name).await
    }

    pub async fn release_savepoint(&self, name: &'static str) -> Result<(), ConnectorError> {
        let mut guard = self.inner.lock().await;
        guard
            .as_mut()
            .ok_or(ConnectorError::Released)?
            .release_savepoint(name)
            .await
    }

    /// Run `work` inside the savepoint `name`.
    ///
    /// When `work` fails its statements are rolled back to the savepoint, so
    /// the enclosing transaction stays usable for a retry. The error from
    /// `work` is returned either way.
    pub async fn in_savepoint<T, E, F>(&self, name: &'static str, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<ConnectorError>,
    {
        self.savepoint(name).await?;
        match work.await {
            Ok(value) => {
                self.release_savepoint(name).await?;
                Ok(value)
            }
            Err(err) => {
                match self.rollback_to(name).await {
                    Ok(()) => {
                        if let Err(release_err) = self.release_savepoint(name).await {
                            warn!(savepoint = name, error = %release_err, "failed to release savepoint");
                        }
                    }
                    Err(rollback_err) => {
                        warn!(savepoint = name, error = %rollback_err, "rollback to savepoint failed");
                    }
                }
                Err(err)
            }
        }
    }

    pub async fn execute(&self, query: &Query) -> Result<u64, ConnectorError> {
        let mut guard = self.inner.lock().await;
        guard.as_mut().ok_or(ConnectorError::Released)?.execute(query).await
    }

    /// First row of `query`, reported only after the stream has ended.
    pub async fn find_first(&self, query: &Query) -> Result<Option<ValueRow>, ConnectorError> {
        let mut guard = self.inner.lock().await;
        let conn = guard.as_mut().ok_or(ConnectorError::Released)?;

        let mut first = None;
        stream_rows(conn, query, |row| {
            if first.is_none() {
                first = Some(row);
            }
        })
        .await?;
        Ok(first)
    }

    pub async fn take(&self) -> Option<C> {
        self.inner.lock().await.take()
    }

    /// Return the connection to its pool. Later calls are no-ops.
    pub async fn release(&self) {
        if let Some(conn) = self.take().await {
            conn.release();
        }
    }

    pub async fn destroy(&self) {
        match self.take().await {
            Some(conn) => conn.destroy().await,
            None => warn!("destroy requested for a connection that was already released"),
        }
    }
}
