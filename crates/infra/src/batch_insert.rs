//! Deferred inserts for one batch.
//!
//! Node writes that find no existing row append to an [`InsertBuffer`]
//! instead of inserting immediately; a single [`BatchInsertJob`] then writes
//! every buffered row, after all node writes have accounted for themselves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::connector::{Connection, ConnectionSlot};
use crate::jobs::{JobAction, JobError};
use crate::sql::{MAX_ROWS_PER_INSERT, NewRow, SqlParam, ValueTable};

/// Rows waiting for the batched insert, shared between jobs.
///
/// At most one row is kept per `(key, field)`; a later row replaces the
/// earlier one in place.
#[derive(Debug, Clone, Default)]
pub struct InsertBuffer {
    rows: Arc<Mutex<Vec<NewRow>>>,
}

impl InsertBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<NewRow>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_row(&self, row: NewRow) {
        let mut rows = self.lock();
        match rows
            .iter_mut()
            .find(|existing| existing.key == row.key && existing.field == row.field)
        {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }

    /// Append a row given as raw column values.
    ///
    /// Rows with the wrong arity or column types are dropped with a warning;
    /// returns whether the row was kept.
    pub fn insert_columns(&self, columns: &[SqlParam]) -> bool {
        match NewRow::from_columns(columns) {
            Some(row) => {
                self.insert_row(row);
                true
            }
            None => {
                warn!(columns = columns.len(), "dropping malformed row from batched insert");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<NewRow> {
        self.lock().clone()
    }
}

/// Set once the batched insert has run to completion.
#[derive(Debug, Clone, Default)]
pub struct InsertReceipt(Arc<AtomicBool>);

impl InsertReceipt {
    pub fn ran(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }
}

const INSERT_SAVEPOINT: &str = "batch_insert";

/// Writes every buffered row through the batch's connection.
///
/// All chunks of one attempt share a savepoint, so a failed attempt leaves no
/// partial insert behind.
pub struct BatchInsertJob<C> {
    buffer: InsertBuffer,
    table: Arc<ValueTable>,
    slot: ConnectionSlot<C>,
    receipt: InsertReceipt,
}

impl<C: Connection> BatchInsertJob<C> {
    pub fn new(buffer: InsertBuffer, table: Arc<ValueTable>, slot: ConnectionSlot<C>) -> Self {
        Self {
            buffer,
            table,
            slot,
            receipt: InsertReceipt::default(),
        }
    }

    pub fn receipt(&self) -> InsertReceipt {
        self.receipt.clone()
    }

    async fn insert_all(&self, rows: &[NewRow]) -> Result<(), JobError> {
        for chunk in rows.chunks(MAX_ROWS_PER_INSERT) {
            let query = self.table.insert_many(chunk);
            self.slot.execute(&query).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<C: Connection> JobAction for BatchInsertJob<C> {
    fn kind(&self) -> &'static str {
        "batch_insert"
    }

    async fn run(&mut self) -> Result<(), JobError> {
        let rows = self.buffer.snapshot();
        if rows.is_empty() {
            debug!(table = self.table.name(), "no deferred rows, skipping insert");
            self.receipt.mark();
            return Ok(());
        }

        self.slot
            .in_savepoint(INSERT_SAVEPOINT, self.insert_all(&rows))
            .await?;

        debug!(table = self.table.name(), rows = rows.len(), "batched insert written");
        self.receipt.mark();
        Ok(())
    }
}
