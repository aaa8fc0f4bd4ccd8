//! Transactional batch writer.
//!
//! One batch of node mutations is written inside a single transaction on a
//! single connection:
//!
//! 1. validate every mutation (no IO on failure)
//! 2. acquire a connection and `BEGIN`
//! 3. queue one node write per mutation; each looks its row up and either
//!    updates it in place or defers a new row to the batched insert. Every
//!    attempt runs in a savepoint so a failed one can be retried without
//!    losing the transaction
//! 4. once every node write has accounted for itself, the batched insert is
//!    appended as the last job of the queue
//! 5. `COMMIT` when the queue drains cleanly, `ROLLBACK` otherwise
//!
//! The connection is released on every path, or closed when a rollback
//! could not be confirmed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use graphstore_core::{DomainError, NodeMutation};

use crate::batch_insert::{BatchInsertJob, InsertBuffer};
use crate::connector::{Connection, ConnectionSlot, Connector, ConnectorError};
use crate::jobs::{
    Job, JobAction, JobError, JoinBarrier, QueueEvent, QueueHandle, QueueObserver, Reaction,
    RetryPolicy, SequentialQueue,
};
use crate::sql::{NewRow, ValueTable};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid mutation at index {index}: {source}")]
    Invalid {
        index: usize,
        #[source]
        source: DomainError,
    },

    #[error("failed to acquire connection: {0}")]
    Acquire(#[source] ConnectorError),

    #[error("failed to begin transaction: {0}")]
    Begin(#[source] ConnectorError),

    #[error("batch aborted: {0}")]
    Job(#[source] JobError),

    #[error("failed to commit transaction: {0}")]
    Commit(#[source] ConnectorError),

    #[error("queue drained before every node was written")]
    Incomplete,

    #[error("batch queue stopped unexpectedly")]
    QueueClosed,
}

impl BatchError {
    /// Failures raised before any node write was queued.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            BatchError::Invalid { .. } | BatchError::Acquire(_) | BatchError::Begin(_)
        )
    }
}

/// Outcome of a committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PutReport {
    pub batch_id: Uuid,
    /// Mutations received.
    pub nodes: usize,
    /// Existing rows updated in place.
    pub updated: usize,
    /// New rows written by the batched insert, after coalescing.
    pub inserted: usize,
}

impl PutReport {
    fn empty(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            nodes: 0,
            updated: 0,
            inserted: 0,
        }
    }
}

/// Writes one batch. Single use.
pub struct PutTransaction<C: Connector> {
    connector: Arc<C>,
    table: Arc<ValueTable>,
    retry_policy: RetryPolicy,
    batch_id: Uuid,
}

impl<C: Connector> PutTransaction<C> {
    pub fn new(connector: Arc<C>, table: Arc<ValueTable>, retry_policy: RetryPolicy) -> Self {
        Self {
            connector,
            table,
            retry_policy,
            batch_id: Uuid::now_v7(),
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    #[instrument(
        skip(self, batch),
        fields(batch_id = %self.batch_id, table = self.table.name(), nodes = batch.len()),
        err
    )]
    pub async fn execute(self, batch: Vec<NodeMutation>) -> Result<PutReport, BatchError> {
        for (index, mutation) in batch.iter().enumerate() {
            mutation
                .validate()
                .map_err(|source| BatchError::Invalid { index, source })?;
        }
        if batch.is_empty() {
            debug!("empty batch, nothing to write");
            return Ok(PutReport::empty(self.batch_id));
        }

        let conn = self.connector.acquire().await.map_err(BatchError::Acquire)?;
        let slot = ConnectionSlot::new(conn);

        if let Err(err) = slot.begin().await {
            abort(&slot).await;
            return Err(BatchError::Begin(err));
        }

        match self.run_queue(&slot, batch).await {
            Ok(report) => match slot.commit().await {
                Ok(()) => {
                    slot.release().await;
                    info!(
                        updated = report.updated,
                        inserted = report.inserted,
                        "batch committed"
                    );
                    Ok(report)
                }
                Err(err) => {
                    abort(&slot).await;
                    Err(BatchError::Commit(err))
                }
            },
            Err(err) => {
                abort(&slot).await;
                Err(err)
            }
        }
    }

    /// Dispatch the node writes and wait for the queue to drain.
    async fn run_queue(
        &self,
        slot: &ConnectionSlot<C::Connection>,
        batch: Vec<NodeMutation>,
    ) -> Result<PutReport, BatchError> {
        let nodes = batch.len();
        let (drained_tx, drained_rx) = oneshot::channel();
        let queue = SequentialQueue::spawn(
            format!("put-{}", self.batch_id),
            BatchObserver {
                drained: Some(drained_tx),
            },
        );

        let inserts = InsertBuffer::new();
        let insert_job = BatchInsertJob::new(inserts.clone(), self.table.clone(), slot.clone());
        let receipt = insert_job.receipt();
        let insert_job = Job::new(insert_job)
            .with_retry_policy(self.retry_policy.clone())
            .prepared();
        let barrier = Arc::new(JoinBarrier::new(nodes, insert_job));
        let updated = Arc::new(AtomicUsize::new(0));

        for mutation in batch {
            let write = NodeWrite {
                row: NewRow::from_mutation(&mutation),
                table: self.table.clone(),
                slot: slot.clone(),
                inserts: inserts.clone(),
                barrier: barrier.clone(),
                queue: queue.clone(),
                updated: updated.clone(),
                accounted: false,
            };
            let job = Job::new(write)
                .with_retry_policy(self.retry_policy.clone())
                .prepared();
            queue.push(job).map_err(|_| BatchError::QueueClosed)?;
        }
        // Node writes keep their own handles; the driver stops once they are done.
        drop(queue);

        let reason = drained_rx.await.map_err(|_| BatchError::QueueClosed)?;
        if let Some(err) = reason {
            return Err(BatchError::Job(err));
        }
        if !barrier.is_complete() || !receipt.ran() {
            return Err(BatchError::Incomplete);
        }

        Ok(PutReport {
            batch_id: self.batch_id,
            nodes,
            updated: updated.load(Ordering::Acquire),
            inserted: inserts.len(),
        })
    }
}

/// Roll back and release, or close the connection if the rollback failed.
async fn abort<C: Connection>(slot: &ConnectionSlot<C>) {
    match slot.rollback().await {
        Ok(()) => slot.release().await,
        Err(err) => {
            error!(error = %err, "rollback failed, closing connection");
            slot.destroy().await;
        }
    }
}

/// Flushes the batch queue on the first unrecoverable failure and forwards
/// the drained signal.
struct BatchObserver {
    drained: Option<oneshot::Sender<Option<JobError>>>,
}

impl QueueObserver for BatchObserver {
    fn on_event(&mut self, event: &QueueEvent) -> Reaction {
        match event {
            QueueEvent::ItemFailed {
                job_id,
                attempt,
                error,
                will_retry: false,
            } => {
                error!(%job_id, attempt, error = %error, "node write failed, aborting batch");
                Reaction::Flush(error.clone())
            }
            QueueEvent::ItemFailed {
                job_id,
                attempt,
                error,
                will_retry: true,
            } => {
                warn!(%job_id, attempt, error = %error, "node write failed, retrying");
                Reaction::Continue
            }
            QueueEvent::Drained { reason } => {
                if let Some(tx) = self.drained.take() {
                    let _ = tx.send(reason.clone());
                }
                Reaction::Continue
            }
            _ => Reaction::Continue,
        }
    }
}

const NODE_SAVEPOINT: &str = "node_write";

/// Writes one mutation: update in place when the row exists, otherwise defer
/// it to the batched insert.
struct NodeWrite<C> {
    row: NewRow,
    table: Arc<ValueTable>,
    slot: ConnectionSlot<C>,
    inserts: InsertBuffer,
    barrier: Arc<JoinBarrier<Job>>,
    queue: QueueHandle,
    updated: Arc<AtomicUsize>,
    accounted: bool,
}

impl<C: Connection> NodeWrite<C> {
    /// Count this node toward the barrier, once across all attempts. The last
    /// node to do so appends the batched insert.
    fn account(&mut self) -> Result<(), JobError> {
        if self.accounted {
            return Ok(());
        }
        self.accounted = true;

        if let Some(insert_job) = self.barrier.arrive() {
            debug!(
                deferred = self.inserts.len(),
                "every node accounted for, queueing batched insert"
            );
            self.queue
                .push(insert_job)
                .map_err(|e| JobError::failed(e.to_string()))?;
        }
        Ok(())
    }

    /// One attempt: look the row up, then update it or defer it.
    async fn write(&mut self) -> Result<(), JobError> {
        let lookup = self.table.find_one(&self.row.key, &self.row.field);
        let existing = self.slot.find_first(&lookup).await?;

        match existing {
            Some(found) => {
                self.account()?;
                let update = self.table.update(found.id, &self.row);
                self.slot.execute(&update).await?;
                self.updated.fetch_add(1, Ordering::AcqRel);
            }
            None => {
                self.inserts.insert_row(self.row.clone());
                self.account()?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<C: Connection> JobAction for NodeWrite<C> {
    fn kind(&self) -> &'static str {
        "node_write"
    }

    async fn run(&mut self) -> Result<(), JobError> {
        let slot = self.slot.clone();
        slot.in_savepoint(NODE_SAVEPOINT, self.write()).await
    }
}
