//! In-process connector.
//!
//! Intended for tests/dev. Executes the structured [`Operation`] of each
//! query instead of its SQL text and keeps writes of an open transaction
//! private to its connection until commit. Every statement is recorded, and
//! specific statements can be made to fail.
//!
//! Transactions follow Postgres: once a statement fails inside one, every
//! later statement is rejected until `ROLLBACK` or `ROLLBACK TO SAVEPOINT`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::{Connection, Connector, ConnectorError, FromConfig, RowStream};
use crate::config::{ConfigError, StoreConfig};
use crate::sql::{NewRow, Operation, Query, ValueRow, ValueTable};

const DEFAULT_CAPACITY: usize = 10;

const TX_ABORTED: &str = "current transaction is aborted, commands ignored until end of transaction block";

/// A statement class that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Acquire,
    Begin,
    Commit,
    Rollback,
    /// `SAVEPOINT`, `ROLLBACK TO SAVEPOINT` and `RELEASE SAVEPOINT`.
    Savepoint,
    Lookup,
    Update,
    Insert,
    Schema,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Begin,
    Commit,
    Rollback,
    Savepoint,
    RollbackToSavepoint,
    ReleaseSavepoint,
    Lookup,
    Update,
    Insert { rows: usize },
    Schema,
}

/// One statement seen by the store, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementRecord {
    pub connection: u64,
    pub kind: StatementKind,
    pub failed: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<i64, ValueRow>,
    last_id: i64,
    schema_ready: bool,
    log: Vec<StatementRecord>,
    faults: HashMap<Fault, usize>,
    last_connection: u64,
    destroyed: usize,
}

impl MemoryState {
    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.get_mut(&fault) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Log a statement, failing it if a matching fault is armed.
    fn record(
        &mut self,
        connection: u64,
        kind: StatementKind,
        fault: Fault,
        operation: &'static str,
    ) -> Result<(), ConnectorError> {
        let failed = self.take_fault(fault);
        self.log.push(StatementRecord {
            connection,
            kind,
            failed,
        });
        if failed {
            return Err(ConnectorError::statement(operation, "injected fault"));
        }
        Ok(())
    }

    fn require_schema(&self, operation: &'static str) -> Result<(), ConnectorError> {
        if self.schema_ready {
            Ok(())
        } else {
            Err(ConnectorError::statement(operation, "value table does not exist"))
        }
    }

    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    /// Committed rows plus the given uncommitted writes.
    fn visible(&self, pending: Option<&[PendingWrite]>) -> BTreeMap<i64, ValueRow> {
        let mut rows = self.rows.clone();
        for write in pending.unwrap_or_default() {
            write.apply(&mut rows);
        }
        rows
    }
}

/// Uncommitted state of one connection.
#[derive(Debug, Default)]
struct OpenTransaction {
    writes: Vec<PendingWrite>,
    /// Savepoint names with the number of writes made before each.
    savepoints: Vec<(&'static str, usize)>,
    aborted: bool,
}

impl OpenTransaction {
    fn find_savepoint(&self, name: &str) -> Option<usize> {
        self.savepoints.iter().rposition(|(saved, _)| *saved == name)
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Update { id: i64, row: NewRow },
    Insert(ValueRow),
}

impl PendingWrite {
    fn apply(&self, rows: &mut BTreeMap<i64, ValueRow>) {
        match self {
            PendingWrite::Update { id, row } => {
                if let Some(existing) = rows.get_mut(id) {
                    existing.value = Some(row.value.clone());
                    existing.value_type = Some(row.value_type);
                    existing.is_relationship = row.is_relationship;
                    existing.state = Some(row.state);
                }
            }
            PendingWrite::Insert(row) => {
                rows.insert(row.id, row.clone());
            }
        }
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn stored(id: i64, row: &NewRow) -> ValueRow {
    ValueRow {
        id,
        key: row.key.clone(),
        field: row.field.clone(),
        value: Some(row.value.clone()),
        value_type: Some(row.value_type),
        is_relationship: row.is_relationship,
        state: Some(row.state),
    }
}

/// In-memory store with a bounded connection pool.
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    state: Arc<Mutex<MemoryState>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    schema_delay: Option<Duration>,
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Arc::default(),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            schema_delay: None,
        }
    }

    /// Make schema creation take at least `delay`.
    pub fn with_schema_delay(mut self, delay: Duration) -> Self {
        self.schema_delay = Some(delay);
        self
    }

    /// Fail the next `times` statements of the given class.
    pub fn fail(&self, fault: Fault, times: usize) {
        *lock(&self.state).faults.entry(fault).or_default() += times;
    }

    pub fn statements(&self) -> Vec<StatementRecord> {
        lock(&self.state).log.clone()
    }

    pub fn clear_statements(&self) {
        lock(&self.state).log.clear();
    }

    /// Committed rows in id order.
    pub fn rows(&self) -> Vec<ValueRow> {
        lock(&self.state).rows.values().cloned().collect()
    }

    /// Write a committed row directly, bypassing the statement log.
    pub fn seed(&self, row: NewRow) -> i64 {
        let mut state = lock(&self.state);
        state.schema_ready = true;
        let id = state.next_id();
        state.rows.insert(id, stored(id, &row));
        id
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Connections closed instead of released.
    pub fn destroyed(&self) -> usize {
        lock(&self.state).destroyed
    }
}

impl FromConfig for InMemoryConnector {
    fn from_config(config: &StoreConfig) -> Result<Self, ConfigError> {
        Ok(Self::with_capacity(config.pool.max_connections as usize))
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    type Connection = InMemoryConnection;

    async fn acquire(&self) -> Result<InMemoryConnection, ConnectorError> {
        let injected = lock(&self.state).take_fault(Fault::Acquire);
        if injected {
            return Err(ConnectorError::Acquire("injected fault".to_string()));
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ConnectorError::Acquire(e.to_string()))?;

        let id = {
            let mut state = lock(&self.state);
            state.last_connection += 1;
            state.last_connection
        };

        Ok(InMemoryConnection {
            id,
            state: self.state.clone(),
            tx: None,
            _permit: permit,
        })
    }

    async fn ensure_schema(&self, table: &ValueTable) -> Result<(), ConnectorError> {
        if let Some(delay) = self.schema_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        for query in [table.create_table(), table.create_index()] {
            state
                .record(0, StatementKind::Schema, Fault::Schema, query.name())
                .map_err(|e| ConnectorError::Schema(e.to_string()))?;
        }
        state.schema_ready = true;
        debug!(table = table.name(), "in-memory value table ready");
        Ok(())
    }
}

/// A connection checked out of an [`InMemoryConnector`].
///
/// Holds one pool permit until released or destroyed.
#[derive(Debug)]
pub struct InMemoryConnection {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
    tx: Option<OpenTransaction>,
    _permit: OwnedSemaphorePermit,
}

impl InMemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Whether the open transaction has seen a failed statement.
    pub fn is_aborted(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.aborted)
    }

    fn pending(&self) -> Option<&[PendingWrite]> {
        self.tx.as_ref().map(|tx| tx.writes.as_slice())
    }

    /// Log a statement and decide whether it runs.
    ///
    /// Fails when the open transaction is already aborted or a matching fault
    /// is armed; a failure inside a transaction aborts it.
    fn start(
        &mut self,
        state: &mut MemoryState,
        kind: StatementKind,
        fault: Fault,
        operation: &'static str,
    ) -> Result<(), ConnectorError> {
        if self.is_aborted() {
            state.log.push(StatementRecord {
                connection: self.id,
                kind,
                failed: true,
            });
            return Err(ConnectorError::statement(operation, TX_ABORTED));
        }
        let result = state.record(self.id, kind, fault, operation);
        self.check(result)
    }

    /// Abort the open transaction if `result` is a failure.
    fn check<T>(&mut self, result: Result<T, ConnectorError>) -> Result<T, ConnectorError> {
        if result.is_err() {
            if let Some(tx) = self.tx.as_mut() {
                tx.aborted = true;
            }
        }
        result
    }

    fn lookup(&mut self, query: &Query) -> Result<Vec<ValueRow>, ConnectorError> {
        let Operation::Lookup { key, field, limit } = query.operation() else {
            return Err(ConnectorError::statement(query.name(), "statement returns no rows"));
        };

        let state = self.state.clone();
        let mut state = lock(&state);
        self.start(&mut state, StatementKind::Lookup, Fault::Lookup, query.name())?;
        let schema = state.require_schema(query.name());
        self.check(schema)?;

        let limit = limit.map_or(usize::MAX, |l| l as usize);
        Ok(state
            .visible(self.pending())
            .into_values()
            .filter(|row| row.key == *key && field.as_ref().is_none_or(|f| row.field == *f))
            .take(limit)
            .collect())
    }

    fn write(&mut self, state: &mut MemoryState, write: PendingWrite) {
        match &mut self.tx {
            Some(tx) => tx.writes.push(write),
            None => write.apply(&mut state.rows),
        }
    }

    /// Position of savepoint `name` in the open transaction.
    fn savepoint_index(&mut self, name: &str, operation: &'static str) -> Result<usize, ConnectorError> {
        let found = match &self.tx {
            Some(tx) => tx.find_savepoint(name).ok_or_else(|| {
                ConnectorError::statement(operation, format!("savepoint \"{name}\" does not exist"))
            }),
            None => Err(ConnectorError::statement(
                operation,
                "savepoints can only be used in transaction blocks",
            )),
        };
        self.check(found)
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn begin(&mut self) -> Result<(), ConnectorError> {
        let state = self.state.clone();
        self.start(&mut lock(&state), StatementKind::Begin, Fault::Begin, "begin")?;
        self.tx = Some(OpenTransaction::default());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ConnectorError> {
        let state = self.state.clone();
        let mut state = lock(&state);
        if self.is_aborted() {
            // An aborted transaction can only end in a rollback.
            self.tx = None;
            state.log.push(StatementRecord {
                connection: self.id,
                kind: StatementKind::Commit,
                failed: true,
            });
            return Err(ConnectorError::statement("commit", TX_ABORTED));
        }
        state.record(self.id, StatementKind::Commit, Fault::Commit, "commit")?;
        for write in self.tx.take().map(|tx| tx.writes).unwrap_or_default() {
            write.apply(&mut state.rows);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ConnectorError> {
        lock(&self.state).record(self.id, StatementKind::Rollback, Fault::Rollback, "rollback")?;
        self.tx = None;
        Ok(())
    }

    async fn savepoint(&mut self, name: &'static str) -> Result<(), ConnectorError> {
        let state = self.state.clone();
        self.start(&mut lock(&state), StatementKind::Savepoint, Fault::Savepoint, "savepoint")?;
        match self.tx.as_mut() {
            Some(tx) => {
                tx.savepoints.push((name, tx.writes.len()));
                Ok(())
            }
            None => Err(ConnectorError::statement(
                "savepoint",
                "savepoints can only be used in transaction blocks",
            )),
        }
    }

    async fn rollback_to(&mut self, name: &'static str) -> Result<(), ConnectorError> {
        let operation = "rollback_to_savepoint";
        lock(&self.state).record(
            self.id,
            StatementKind::RollbackToSavepoint,
            Fault::Savepoint,
            operation,
        )?;
        let index = self.savepoint_index(name, operation)?;
        if let Some(tx) = self.tx.as_mut() {
            let (_, writes) = tx.savepoints[index];
            tx.writes.truncate(writes);
            tx.savepoints.truncate(index + 1);
            tx.aborted = false;
        }
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &'static str) -> Result<(), ConnectorError> {
        let operation = "release_savepoint";
        let state = self.state.clone();
        self.start(
            &mut lock(&state),
            StatementKind::ReleaseSavepoint,
            Fault::Savepoint,
            operation,
        )?;
        let index = self.savepoint_index(name, operation)?;
        if let Some(tx) = self.tx.as_mut() {
            tx.savepoints.truncate(index);
        }
        Ok(())
    }

    async fn execute(&mut self, query: &Query) -> Result<u64, ConnectorError> {
        let operation = query.name();
        match query.operation() {
            Operation::Lookup { .. } => Ok(self.lookup(query)?.len() as u64),
            Operation::CreateTable | Operation::CreateIndex => {
                let state = self.state.clone();
                let mut state = lock(&state);
                self.start(&mut state, StatementKind::Schema, Fault::Schema, operation)?;
                state.schema_ready = true;
                Ok(0)
            }
            Operation::Update { id, row } => {
                let state = self.state.clone();
                let mut state = lock(&state);
                self.start(&mut state, StatementKind::Update, Fault::Update, operation)?;
                let schema = state.require_schema(operation);
                self.check(schema)?;

                if !state.visible(self.pending()).contains_key(id) {
                    return Ok(0);
                }
                self.write(
                    &mut state,
                    PendingWrite::Update {
                        id: *id,
                        row: row.clone(),
                    },
                );
                Ok(1)
            }
            Operation::InsertMany { rows } => {
                let state = self.state.clone();
                let mut state = lock(&state);
                let kind = StatementKind::Insert { rows: rows.len() };
                self.start(&mut state, kind, Fault::Insert, operation)?;
                let schema = state.require_schema(operation);
                self.check(schema)?;

                for row in rows {
                    let id = state.next_id();
                    self.write(&mut state, PendingWrite::Insert(stored(id, row)));
                }
                Ok(rows.len() as u64)
            }
        }
    }

    fn fetch<'a>(&'a mut self, query: &'a Query) -> RowStream<'a> {
        let items: Vec<Result<ValueRow, ConnectorError>> = match self.lookup(query) {
            Ok(rows) => rows.into_iter().map(Ok).collect(),
            Err(err) => vec![Err(err)],
        };
        Box::pin(tokio_stream::iter(items))
    }

    fn release(self) {
        // Uncommitted writes and the pool permit go with `self`.
    }

    async fn destroy(self) {
        lock(&self.state).destroyed += 1;
    }
}
