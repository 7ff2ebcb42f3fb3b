//! Replication listener for MySQL: follows the row-based binary log as a
//! replica and groups row events into transactions.

use futures::StreamExt;
use mysql_async::binlog::events::{Event, EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Pool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{current_binlog_position, opts, value_to_json};
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::MysqlConfig;
use crate::queue::AsyncQueue;
use crate::sync::Subscription;
use crate::types::{split_key_changes, Ack, Row, TableOperation, TableRef, Transaction};
use crate::{Error, Result};

/// Column names of a table in ordinal order, with primary key flags.
#[derive(Debug, Clone, PartialEq)]
pub struct TableColumns {
    pub columns: Vec<(String, bool)>,
}

impl TableColumns {
    pub fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|(_, key)| *key)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Zips row values with column names, optionally keeping only keys.
    pub fn to_row(&self, values: Vec<serde_json::Value>, keys_only: bool) -> Row {
        self.columns
            .iter()
            .zip(values)
            .filter(|((_, key), _)| !keys_only || *key)
            .map(|((name, _), value)| (name.clone(), value))
            .collect()
    }

    /// Builds the operation for one row event image pair.
    pub fn operation(
        &self,
        table: &TableRef,
        before: Option<Vec<serde_json::Value>>,
        after: Option<Vec<serde_json::Value>>,
    ) -> Option<TableOperation> {
        let key_columns = self.key_columns();
        match (before, after) {
            (None, Some(after)) => Some(TableOperation::insert(
                table,
                key_columns,
                self.to_row(after, false),
            )),
            (Some(before), Some(after)) => Some(TableOperation::update(
                table,
                key_columns,
                self.to_row(after, false),
                self.to_row(before, true),
            )),
            (Some(before), None) => Some(TableOperation::delete(
                table,
                key_columns,
                self.to_row(before, true),
            )),
            (None, None) => None,
        }
    }
}

pub struct MysqlBinlogListener {
    config: MysqlConfig,
    pool: Pool,
    queue_capacity: usize,
    checkpoints: Arc<CheckpointManager>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MysqlBinlogListener {
    pub fn new(
        config: MysqlConfig,
        pool: Pool,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let checkpoints = Arc::new(CheckpointManager::new(&config.checkpoint_file));
        Self {
            config,
            pool,
            queue_capacity,
            checkpoints,
            cancel,
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<Subscription> {
        let (file, position) = match self.checkpoints.load().await? {
            Some(checkpoint) => checkpoint.binlog_position()?,
            None => current_binlog_position(&self.pool).await?,
        };

        let conn = Conn::new(opts(&self.config)).await?;
        let request = BinlogStreamRequest::new(self.config.server_id)
            .with_filename(file.as_bytes())
            .with_pos(position);
        let stream = conn.get_binlog_stream(request).await?;
        info!(
            file = %file,
            position,
            server_id = self.config.server_id,
            "Binlog streaming started"
        );

        let queue = Arc::new(AsyncQueue::bounded(self.queue_capacity, self.cancel.child_token()));
        let reader = BinlogReader {
            stream,
            pool: self.pool.clone(),
            delivery: Delivery {
                queue: queue.clone(),
                cancel: self.cancel.clone(),
                checkpoints: self.checkpoints.clone(),
                acknowledged: 0,
            },
            tables: HashMap::new(),
            file,
            current: None,
        };
        let handle = tokio::spawn(reader.run());
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(Subscription::new(queue))
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
            debug!("Binlog reader stopped");
        }
    }
}

impl Drop for MysqlBinlogListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A decoded rows event, detached from the binlog buffer.
struct RowImages {
    table: TableRef,
    rows: Vec<(Option<Vec<serde_json::Value>>, Option<Vec<serde_json::Value>>)>,
}

/// Hands transactions to the consumer and checkpoints each acknowledged one.
struct Delivery {
    queue: Arc<AsyncQueue<Result<Transaction>>>,
    cancel: CancellationToken,
    checkpoints: Arc<CheckpointManager>,
    acknowledged: u64,
}

impl Delivery {
    /// Returns `false` when the transaction was not consumed.
    async fn deliver(&mut self, id: String, operations: Vec<TableOperation>) -> Result<bool> {
        if self.queue.ready().await.is_err() {
            return Ok(false);
        }
        debug!(position = %id, operations = operations.len(), "Delivering transaction");
        let (ack, rx) = Ack::channel();
        self.queue
            .enqueue(Ok(Transaction::new(id.clone(), split_key_changes(operations), ack)));

        let consumed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            consumed = rx => consumed.unwrap_or(false),
        };
        if !consumed {
            warn!(position = %id, "Transaction was not consumed, stopping binlog reader");
            return Ok(false);
        }

        self.acknowledged += 1;
        self.checkpoints
            .save(&Checkpoint::new(id, self.acknowledged))
            .await?;
        Ok(true)
    }
}

struct BinlogReader {
    stream: BinlogStream,
    pool: Pool,
    delivery: Delivery,
    tables: HashMap<TableRef, TableColumns>,
    file: String,
    current: Option<Vec<TableOperation>>,
}

impl BinlogReader {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.delivery.cancel.cancelled() => break,
                event = self.stream.next() => event,
            };

            let result = match event {
                Some(Ok(event)) => self.handle(event).await,
                Some(Err(e)) => Err(e.into()),
                None => Err(Error::Connection("binlog stream ended".to_string())),
            };

            match result {
                Ok(true) => {}
                Ok(false) => {
                    self.delivery.queue.abort();
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Binlog stream failed");
                    self.delivery.queue.enqueue(Err(e));
                    break;
                }
            }
        }
        if let Err(e) = self.stream.close().await {
            warn!(error = %e, "Failed to close binlog stream");
        }
    }

    /// Returns `false` once the reader should stop.
    async fn handle(&mut self, event: Event) -> Result<bool> {
        let position = u64::from(event.header().log_pos());

        let images = match event.read_data()? {
            Some(EventData::RotateEvent(rotate)) => {
                self.file = rotate.name().into_owned();
                debug!(file = %self.file, "Binlog rotated");
                None
            }
            Some(EventData::QueryEvent(query)) => {
                let sql = query.query();
                let sql = sql.trim();
                if sql.eq_ignore_ascii_case("BEGIN") {
                    self.begin()?;
                } else if sql.eq_ignore_ascii_case("COMMIT") {
                    return self.commit(position).await;
                } else {
                    trace!(query = %sql, "Schema change, clearing column cache");
                    self.tables.clear();
                }
                None
            }
            Some(EventData::RowsEvent(rows)) => Some(self.images(&rows)?),
            Some(EventData::XidEvent(_)) => return self.commit(position).await,
            _ => None,
        };

        if let Some(images) = images {
            let columns = self.columns(&images.table).await?;
            let operations: Vec<TableOperation> = images
                .rows
                .into_iter()
                .filter_map(|(before, after)| columns.operation(&images.table, before, after))
                .collect();
            match &mut self.current {
                Some(current) => current.extend(operations),
                None => {
                    return Err(Error::Protocol(format!(
                        "rows event on {} outside of a transaction",
                        images.table
                    )));
                }
            }
        }
        Ok(true)
    }

    fn images(&self, rows: &RowsEventData<'_>) -> Result<RowImages> {
        let tme = self.stream.get_tme(rows.table_id()).ok_or_else(|| Error::InvalidMessage {
            message: format!("rows event for unknown table id {}", rows.table_id()),
        })?;
        let table = TableRef::new(tme.database_name().into_owned(), tme.table_name().into_owned());

        let mut images = Vec::new();
        for row in rows.rows(tme) {
            let (before, after) = row?;
            images.push((before.map(binlog_row_values), after.map(binlog_row_values)));
        }
        Ok(RowImages { table, rows: images })
    }

    fn begin(&mut self) -> Result<()> {
        if self.current.is_some() {
            return Err(Error::Protocol(
                "BEGIN while a transaction is still open".to_string(),
            ));
        }
        self.current = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self, position: u64) -> Result<bool> {
        let operations = self.current.take().ok_or_else(|| {
            Error::Protocol("transaction end without a matching BEGIN".to_string())
        })?;
        let id = format!("{}:{}", self.file, position);
        if operations.is_empty() {
            return Ok(true);
        }
        self.delivery.deliver(id, operations).await
    }

    async fn columns(&mut self, table: &TableRef) -> Result<TableColumns> {
        if let Some(columns) = self.tables.get(table) {
            return Ok(columns.clone());
        }

        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<(String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_KEY FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
                (table.schema.as_str(), table.table.as_str()),
            )
            .await?;
        let columns = TableColumns {
            columns: rows
                .into_iter()
                .map(|(name, key)| (name, key == "PRI"))
                .collect(),
        };
        debug!(table = %table, columns = columns.columns.len(), "Loaded table columns");
        self.tables.insert(table.clone(), columns.clone());
        Ok(columns)
    }
}

fn binlog_row_values(row: BinlogRow) -> Vec<serde_json::Value> {
    row.unwrap()
        .into_iter()
        .map(|value| match value {
            BinlogValue::Value(value) => value_to_json(value),
            // JSON columns arrive in MySQL's binary document format.
            other => serde_json::Value::String(format!("{:?}", other)),
        })
        .collect()
}
