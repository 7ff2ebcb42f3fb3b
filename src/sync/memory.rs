//! In-process source and sink.
//!
//! `MemorySource` lets callers push transactions by hand and serves backfill
//! queries from a preset row list; `MemorySink` records what it receives.
//! Both are used to exercise the controller without a database.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::queue::AsyncQueue;
use crate::sync::traits::{Sink, Source, Subscription};
use crate::sync::watermark::Watermark;
use crate::types::{Ack, Row, RowChange, TableOperation, TableRef, Transaction, TransformedOperation};
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemorySource {
    queue: Arc<AsyncQueue<Result<Transaction>>>,
    watermark_table: TableRef,
    backfill_rows: Mutex<Vec<Row>>,
    watermarks: Mutex<Vec<Watermark>>,
    untransformed_tables: Mutex<HashSet<TableRef>>,
    hold_queries: AtomicBool,
    query_started: Notify,
    query_release: Notify,
    fail_on_stop: AtomicBool,
    next_id: AtomicU64,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::with_watermark_table(TableRef::new("schema_sync", "watermarks"))
    }

    pub fn with_watermark_table(watermark_table: TableRef) -> Self {
        Self {
            queue: Arc::new(AsyncQueue::new(CancellationToken::new())),
            watermark_table,
            backfill_rows: Mutex::new(Vec::new()),
            watermarks: Mutex::new(Vec::new()),
            untransformed_tables: Mutex::new(HashSet::new()),
            hold_queries: AtomicBool::new(false),
            query_started: Notify::new(),
            query_release: Notify::new(),
            fail_on_stop: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Rows returned by the next backfill queries.
    pub fn set_backfill_rows(&self, rows: Vec<Row>) {
        *lock(&self.backfill_rows) = rows;
    }

    /// Makes backfill queries wait for [`release_backfill`](Self::release_backfill).
    pub fn hold_backfill(&self) {
        self.hold_queries.store(true, Ordering::SeqCst);
    }

    pub fn release_backfill(&self) {
        self.hold_queries.store(false, Ordering::SeqCst);
        self.query_release.notify_one();
    }

    /// Resolves once a backfill query has begun.
    pub async fn backfill_started(&self) {
        self.query_started.notified().await;
    }

    /// Changes to `table` have no public counterpart.
    pub fn skip_table(&self, table: TableRef) {
        lock(&self.untransformed_tables).insert(table);
    }

    pub fn fail_on_stop(&self, fail: bool) {
        self.fail_on_stop.store(fail, Ordering::SeqCst);
    }

    /// Watermarks written so far.
    pub fn watermarks(&self) -> Vec<Watermark> {
        lock(&self.watermarks).clone()
    }

    fn push(&self, operations: Vec<TableOperation>, ack: Ack) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.queue
            .enqueue(Ok(Transaction::new(id.to_string(), operations, ack)));
    }

    /// Delivers a transaction and waits for the consumer's answer.
    pub async fn emit(&self, operations: Vec<TableOperation>) -> bool {
        let (ack, rx) = Ack::channel();
        self.push(operations, ack);
        rx.await.unwrap_or(false)
    }

    /// Ends the stream with an error.
    pub fn fail(&self, error: Error) {
        self.queue.enqueue(Err(error));
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.queue.abort();
        if self.fail_on_stop.load(Ordering::SeqCst) {
            return Err(Error::Connection("memory source failed to stop".to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription> {
        Ok(Subscription::new(self.queue.clone()))
    }

    async fn apply_transformations(
        &self,
        operation: &TableOperation,
    ) -> Option<TransformedOperation> {
        if lock(&self.untransformed_tables).contains(&operation.table_ref()) {
            return None;
        }
        let key_columns = operation.key_columns.clone();
        Some(match &operation.change {
            RowChange::Insert { new } => TransformedOperation::Insert {
                key_columns,
                object: new.clone(),
            },
            RowChange::Update { new, .. } => TransformedOperation::Update {
                key_columns,
                object: new.clone(),
            },
            RowChange::Delete { old_keys } => TransformedOperation::Delete {
                key_columns,
                object_keys: old_keys.clone(),
            },
        })
    }

    async fn get_backfill_records(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        debug!(sql = %sql, "Serving in-memory backfill");
        self.query_started.notify_one();
        if self.hold_queries.load(Ordering::SeqCst) {
            self.query_release.notified().await;
        }
        Ok(lock(&self.backfill_rows).clone())
    }

    async fn write_watermark(&self, watermark: &Watermark) -> Result<()> {
        lock(&self.watermarks).push(watermark.clone());
        self.push(vec![watermark.to_row(&self.watermark_table)], Ack::detached());
        Ok(())
    }

    fn watermark_table(&self) -> TableRef {
        self.watermark_table.clone()
    }
}

#[derive(Default)]
pub struct MemorySink {
    operations: Mutex<Vec<TransformedOperation>>,
    fail_writes: AtomicBool,
    fail_on_stop: AtomicBool,
    stopped: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operations(&self) -> Vec<TransformedOperation> {
        lock(&self.operations).clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_on_stop(&self, fail: bool) {
        self.fail_on_stop.store(fail, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        if self.fail_on_stop.load(Ordering::SeqCst) {
            return Err(Error::Connection("memory sink failed to stop".to_string()));
        }
        Ok(())
    }

    async fn write_data(&self, operation: &TransformedOperation) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Connection("memory sink rejected write".to_string()));
        }
        lock(&self.operations).push(operation.clone());
        Ok(())
    }
}
