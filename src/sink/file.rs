use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::sync::Sink;
use crate::types::TransformedOperation;
use crate::Result;

/// Writes one JSON document per line, to a file opened in append mode or to
/// stdout when the path is `-`.
pub struct FileSink {
    path: String,
    writer: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl FileSink {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        if self.path == "-" {
            return Ok(Box::new(tokio::io::stdout()));
        }
        let file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        Ok(Box::new(file))
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn prepare(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            *writer = Some(self.open().await?);
            info!(path = %self.path, "File sink opened");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.flush().await?;
            writer.shutdown().await?;
        }
        Ok(())
    }

    async fn write_data(&self, operation: &TransformedOperation) -> Result<()> {
        let mut line = serde_json::to_vec(operation)?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        let writer = match &mut *guard {
            Some(writer) => writer,
            slot @ None => slot.insert(self.open().await?),
        };
        writer.write_all(&line).await?;
        writer.flush().await?;
        debug!(path = %self.path, "Wrote operation");
        Ok(())
    }
}
