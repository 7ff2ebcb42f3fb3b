//! Applies the change stream to a sink and runs watermark-delimited backfills.
//!
//! Transactions are processed one at a time, in commit order. A backfill
//! writes a low watermark, runs its query on a separate connection, loads the
//! rows into a [`ResultSetStore`] and writes a high watermark. Every live
//! operation on a backfilled table processed in the meantime registers a drop
//! key. When the high watermark comes through the stream, the rows whose keys
//! were never dropped are emitted as inserts.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::sync::result_set::{validate_sources, BackfillSource, ResultSetStore};
use crate::sync::traits::{Sink, Source, Subscription};
use crate::sync::watermark::{Watermark, WatermarkKind};
use crate::types::{TableOperation, TableRef, Transaction, TransformedOperation};
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Abandon a backfill whose window is still open after this long.
    /// Checked whenever a transaction arrives.
    pub backfill_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillOutcome {
    Completed {
        backfill_id: String,
        emitted: usize,
        dropped: usize,
    },
    TimedOut {
        backfill_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackfillPhase {
    /// Low watermark written, not yet seen in the stream.
    Registered,
    /// Low watermark seen.
    Open,
    /// Rows are in the store; waiting for the high watermark.
    Loaded,
}

struct ActiveBackfill {
    id: String,
    sources: Vec<BackfillSource>,
    tables: HashSet<TableRef>,
    started_at: Instant,
    phase: BackfillPhase,
    completion: Option<oneshot::Sender<Result<BackfillOutcome>>>,
}

impl ActiveBackfill {
    fn resolve(mut self, result: Result<BackfillOutcome>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

#[derive(Default)]
struct ControllerState {
    backfill: Option<ActiveBackfill>,
    store: ResultSetStore,
}

struct Inner {
    source: Arc<dyn Source>,
    sink: Arc<dyn Sink>,
    config: ControllerConfig,
    watermark_table: TableRef,
    state: Mutex<ControllerState>,
    closed: CancellationToken,
}

#[derive(Clone)]
pub struct SyncController {
    inner: Arc<Inner>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncController {
    pub fn new(source: Arc<dyn Source>, sink: Arc<dyn Sink>, config: ControllerConfig) -> Self {
        let watermark_table = source.watermark_table();
        Self {
            inner: Arc::new(Inner {
                source,
                sink,
                config,
                watermark_table,
                state: Mutex::new(ControllerState::default()),
                closed: CancellationToken::new(),
            }),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Prepares source and sink, then starts consuming the change stream.
    pub async fn start(&self) -> Result<()> {
        info!(watermark_table = %self.inner.watermark_table, "Starting sync controller");
        self.inner.source.prepare().await?;
        self.inner.sink.prepare().await?;
        let subscription = self.inner.source.subscribe().await?;

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run(subscription).await });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Resolves once the controller stopped consuming the stream.
    pub async fn wait(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Backfills the rows returned by `sql` without overwriting newer live
    /// changes.
    ///
    /// Resolves after the surviving rows were written to the sink, or with
    /// [`BackfillOutcome::TimedOut`] when the window was abandoned.
    pub async fn start_backfill(
        &self,
        sources: Vec<BackfillSource>,
        sql: &str,
        params: &[Value],
    ) -> Result<BackfillOutcome> {
        validate_sources(&sources)?;
        if self.inner.closed.is_cancelled() {
            return Err(Error::Shutdown);
        }

        let backfill_id = Uuid::new_v4().to_string();
        {
            let mut state = self.inner.state.lock().await;
            if let Some(active) = &state.backfill {
                return Err(Error::BackfillInProgress {
                    backfill_id: active.id.clone(),
                });
            }
            state.store.clear();
            state.backfill = Some(ActiveBackfill {
                id: backfill_id.clone(),
                tables: sources.iter().map(BackfillSource::table).collect(),
                sources,
                started_at: Instant::now(),
                phase: BackfillPhase::Registered,
                completion: None,
            });
        }
        info!(backfill_id = %backfill_id, "Starting backfill");

        if let Err(e) = self
            .inner
            .source
            .write_watermark(&Watermark::low(&backfill_id))
            .await
        {
            self.inner.abandon(&backfill_id).await;
            return Err(e);
        }

        let rows = match self.inner.source.get_backfill_records(sql, params).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(backfill_id = %backfill_id, error = %e, "Backfill query failed");
                self.inner.abandon(&backfill_id).await;
                return Err(e);
            }
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if self.inner.closed.is_cancelled() {
                return Err(Error::Shutdown);
            }
            match state.backfill.as_mut() {
                Some(active) if active.id == backfill_id => {
                    let count = rows.len();
                    if let Err(e) = state.store.add_records(&active.sources, rows) {
                        state.backfill = None;
                        state.store.clear();
                        return Err(e);
                    }
                    active.phase = BackfillPhase::Loaded;
                    active.completion = Some(tx);
                    debug!(backfill_id = %backfill_id, rows = count, "Backfill rows loaded");
                }
                _ => {
                    warn!(backfill_id = %backfill_id, "Backfill was abandoned before its rows were loaded");
                    return Ok(BackfillOutcome::TimedOut { backfill_id });
                }
            }
        }

        if let Err(e) = self
            .inner
            .source
            .write_watermark(&Watermark::high(&backfill_id))
            .await
        {
            self.inner.abandon(&backfill_id).await;
            return Err(e);
        }

        rx.await.unwrap_or(Err(Error::Shutdown))
    }

    /// Stops source, processing and sink. Errors are logged, not returned.
    pub async fn stop(&self) {
        info!("Stopping sync controller");
        if let Err(e) = self.inner.source.stop().await {
            warn!(error = %e, "Failed to stop source");
        }
        self.inner.closed.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Processing task ended abnormally");
            }
        }
        if let Err(e) = self.inner.sink.stop().await {
            warn!(error = %e, "Failed to stop sink");
        }
        self.inner.shutdown_backfill().await;
    }
}

impl Inner {
    async fn run(&self, subscription: Subscription) {
        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => break,
                next = subscription.next() => next,
            };

            match next {
                None => {
                    info!("Change stream closed");
                    break;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Change stream failed");
                    break;
                }
                Some(Ok(transaction)) => {
                    let Transaction {
                        id,
                        operations,
                        ack,
                    } = transaction;
                    match self.process_transaction(&id, &operations).await {
                        Ok(()) => ack.send(true),
                        Err(e) => {
                            error!(transaction = %id, error = %e, "Failed to process transaction");
                            ack.send(false);
                        }
                    }
                }
            }
        }

        self.closed.cancel();
        self.shutdown_backfill().await;
        debug!("Processing task finished");
    }

    async fn process_transaction(&self, id: &str, operations: &[TableOperation]) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.expire_backfill(state);

        trace!(transaction = %id, operations = operations.len(), "Processing transaction");
        for operation in operations {
            if Watermark::is_watermark_table(operation, &self.watermark_table) {
                match Watermark::from_operation(operation, &self.watermark_table) {
                    Some(watermark) => self.handle_watermark(state, watermark).await,
                    None => debug!(kind = operation.kind(), "Ignoring watermark table change"),
                }
                continue;
            }

            if let Some(backfill) = &state.backfill {
                if backfill.tables.contains(&operation.table_ref()) {
                    let key = state.store.add_drop_key(operation);
                    trace!(backfill_id = %backfill.id, key = %key, "Registered drop key");
                }
            }

            match self.source.apply_transformations(operation).await {
                Some(transformed) => self.sink.write_data(&transformed).await?,
                None => debug!(
                    table = %operation.table_ref(),
                    kind = operation.kind(),
                    "No public counterpart for operation"
                ),
            }
        }
        Ok(())
    }

    fn expire_backfill(&self, state: &mut ControllerState) {
        let Some(timeout) = self.config.backfill_timeout else {
            return;
        };
        let expired = state
            .backfill
            .as_ref()
            .is_some_and(|b| b.started_at.elapsed() >= timeout);
        if !expired {
            return;
        }
        if let Some(backfill) = state.backfill.take() {
            warn!(
                backfill_id = %backfill.id,
                timeout_ms = timeout.as_millis() as u64,
                "Backfill timed out, discarding its rows"
            );
            state.store.clear();
            let backfill_id = backfill.id.clone();
            backfill.resolve(Ok(BackfillOutcome::TimedOut { backfill_id }));
        }
    }

    async fn handle_watermark(&self, state: &mut ControllerState, watermark: Watermark) {
        let Some(backfill) = state.backfill.as_mut() else {
            debug!(backfill_id = %watermark.backfill_id, kind = %watermark.kind, "Ignoring watermark without active backfill");
            return;
        };
        if backfill.id != watermark.backfill_id {
            debug!(backfill_id = %watermark.backfill_id, kind = %watermark.kind, "Ignoring watermark of another backfill");
            return;
        }

        match watermark.kind {
            WatermarkKind::Low => {
                if backfill.phase == BackfillPhase::Registered {
                    backfill.phase = BackfillPhase::Open;
                }
                debug!(backfill_id = %backfill.id, "Backfill window opened");
            }
            WatermarkKind::High if backfill.phase == BackfillPhase::Loaded => {
                self.complete_backfill(state).await;
            }
            WatermarkKind::High => {
                warn!(backfill_id = %backfill.id, "High watermark seen before backfill rows were loaded");
            }
        }
    }

    async fn complete_backfill(&self, state: &mut ControllerState) {
        let Some(backfill) = state.backfill.take() else {
            return;
        };
        let survivors = state.store.records_without_drop_keys();
        let dropped = state.store.len() - survivors.len();
        state.store.clear();

        let mut emitted = 0;
        for (key_columns, object) in survivors {
            let operation = TransformedOperation::Insert {
                key_columns,
                object,
            };
            if let Err(e) = self.sink.write_data(&operation).await {
                error!(backfill_id = %backfill.id, error = %e, "Failed to write backfilled row");
                backfill.resolve(Err(e));
                return;
            }
            emitted += 1;
        }

        info!(backfill_id = %backfill.id, emitted, dropped, "Backfill completed");
        let backfill_id = backfill.id.clone();
        backfill.resolve(Ok(BackfillOutcome::Completed {
            backfill_id,
            emitted,
            dropped,
        }));
    }

    async fn abandon(&self, backfill_id: &str) {
        let mut state = self.state.lock().await;
        if state.backfill.as_ref().is_some_and(|b| b.id == backfill_id) {
            state.backfill = None;
            state.store.clear();
        }
    }

    async fn shutdown_backfill(&self) {
        let mut state = self.state.lock().await;
        if let Some(backfill) = state.backfill.take() {
            debug!(backfill_id = %backfill.id, "Cancelling outstanding backfill");
            backfill.resolve(Err(Error::Shutdown));
        }
        state.store.clear();
    }
}
