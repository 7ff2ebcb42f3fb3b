use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::queue::AsyncQueue;
use crate::sync::watermark::Watermark;
use crate::types::{Row, TableOperation, TableRef, Transaction, TransformedOperation};
use crate::Result;

/// Committed transactions delivered by a source, in commit order.
///
/// A stream error is delivered once as `Err` and ends the subscription.
pub struct Subscription {
    queue: Arc<AsyncQueue<Result<Transaction>>>,
}

impl Subscription {
    pub fn new(queue: Arc<AsyncQueue<Result<Transaction>>>) -> Self {
        Self { queue }
    }

    /// Next transaction, or `None` once the source was stopped.
    pub async fn next(&self) -> Option<Result<Transaction>> {
        self.queue.dequeue().await.ok()
    }

    pub fn close(&self) {
        self.queue.abort();
    }
}

/// A database the controller reads changes and backfills from.
#[async_trait]
pub trait Source: Send + Sync {
    /// Verifies prerequisites and creates the objects replication needs.
    async fn prepare(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Starts streaming committed transactions.
    async fn subscribe(&self) -> Result<Subscription>;

    /// Projects a change into the public schema. `None` means the change
    /// has no public counterpart or could not be transformed.
    async fn apply_transformations(&self, operation: &TableOperation)
        -> Option<TransformedOperation>;

    /// Runs a historical query, off the replication connection.
    async fn get_backfill_records(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Commits a watermark row so it appears in the change stream.
    async fn write_watermark(&self, watermark: &Watermark) -> Result<()>;

    /// Table the source writes watermarks into.
    fn watermark_table(&self) -> TableRef;
}

/// Destination for transformed operations.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn prepare(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn write_data(&self, operation: &TransformedOperation) -> Result<()>;
}
