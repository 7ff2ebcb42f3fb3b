use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::sync::result_set::key_text;
use crate::sync::Sink;
use crate::types::{Row, TransformedOperation};
use crate::{Error, Result};

/// Publishes every operation to a single topic, keyed by its key values so
/// all changes to one object land in the same partition.
pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("linger.ms", config.linger_ms.to_string())
            .set("batch.size", config.batch_size.to_string())
            .set(
                "queue.buffering.max.kbytes",
                (config.buffer_memory / 1024).max(1).to_string(),
            )
            .set("message.timeout.ms", (config.send_timeout_secs * 1000).to_string())
            .create()?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            send_timeout: Duration::from_secs(config.send_timeout_secs),
        })
    }
}

/// Joins the key column values with `:`; `None` when a key column is missing.
pub fn message_key(key_columns: &[String], payload: &Row) -> Option<String> {
    let mut parts = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        match payload.get(column) {
            Some(value) => parts.push(key_text(Some(value))),
            None => {
                debug!(column = %column, "Key column not found in payload");
                return None;
            }
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(":"))
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn prepare(&self) -> Result<()> {
        let producer = self.producer.clone();
        let topic = self.topic.clone();
        let timeout = self.send_timeout;
        // Metadata lookups block; keep them off the runtime threads.
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(&topic), Timeout::After(timeout))
                .map(|_| ())
        })
        .await
        .map_err(|e| Error::Connection(format!("kafka metadata task failed: {}", e)))??;
        info!(topic = %self.topic, "Kafka sink ready");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.send_timeout;
        let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| Error::Connection(format!("kafka flush task failed: {}", e)))?;
        if let Err(e) = flushed {
            warn!(error = %e, "Failed to flush Kafka producer");
            return Err(e.into());
        }
        Ok(())
    }

    async fn write_data(&self, operation: &TransformedOperation) -> Result<()> {
        let payload = serde_json::to_string(operation)?;
        let key = message_key(operation.key_columns(), operation.payload());

        let mut record = FutureRecord::to(&self.topic).payload(&payload);
        if let Some(key) = key.as_deref() {
            record = record.key(key);
        }

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(e, _)| Error::Kafka(e))?;
        debug!(topic = %self.topic, partition, offset, key = ?key, "Delivered operation");
        Ok(())
    }
}
