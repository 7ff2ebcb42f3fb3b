//! Durable record of the last acknowledged source position.
//!
//! Postgres keeps its position in the replication slot; the MySQL binlog
//! listener has no such server-side state and resumes from this file.
//!
//! ```rust,no_run
//! use schema_sync::checkpoint::{Checkpoint, CheckpointManager};
//!
//! # async fn example() -> schema_sync::Result<()> {
//! let manager = CheckpointManager::new("schema-sync.checkpoint");
//! if let Some(checkpoint) = manager.load().await? {
//!     println!("Resuming from {}", checkpoint.position);
//! }
//! manager.save(&Checkpoint::new("binlog.000003:4711", 12)).await?;
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Source-specific position, `file:offset` for binlogs
    pub position: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Transactions acknowledged since the process started
    pub transaction_count: u64,
}

impl Checkpoint {
    pub fn new(position: impl Into<String>, transaction_count: u64) -> Self {
        Self {
            position: position.into(),
            timestamp: chrono::Utc::now(),
            transaction_count,
        }
    }

    /// Splits a `file:offset` position.
    pub fn binlog_position(&self) -> Result<(String, u64)> {
        let (file, offset) = self
            .position
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("invalid binlog position: {}", self.position)))?;
        let offset = offset
            .parse()
            .map_err(|_| Error::Config(format!("invalid binlog offset: {}", self.position)))?;
        Ok((file.to_string(), offset))
    }
}

pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Returns `None` when no checkpoint has been written yet.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let content = match fs::read_to_string(&self.file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.file_path, "No checkpoint file found");
                return Ok(None);
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| {
            warn!(path = ?self.file_path, error = %e, "Unreadable checkpoint file");
            Error::Config(format!("invalid checkpoint file {:?}: {}", self.file_path, e))
        })?;
        info!(
            position = %checkpoint.position,
            timestamp = %checkpoint.timestamp,
            "Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Writes to a temporary file, syncs it and renames it into place, so a
    /// crash never leaves a partially written checkpoint.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let temp_path = self.file_path.with_extension("tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.file_path).await?;

        debug!(position = %checkpoint.position, "Checkpoint saved");
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.file_path).await {
            Ok(()) => {
                info!(path = ?self.file_path, "Deleted checkpoint file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
