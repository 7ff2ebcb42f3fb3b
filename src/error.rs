//! Error types and result handling for schema-sync.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use schema_sync::{Error, Result};
//!
//! fn start() -> Result<()> {
//!     Err(Error::BackfillInProgress {
//!         backfill_id: "0b0f".to_string(),
//!     })
//! }
//!
//! match start() {
//!     Ok(()) => println!("Started"),
//!     Err(Error::BackfillInProgress { backfill_id }) => {
//!         eprintln!("Backfill {} is still running", backfill_id)
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for schema-sync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration values.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configuration file or environment could not be loaded.
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// PostgreSQL client error on a regular (non-replication) connection.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL client or binlog error.
    #[error("MySQL error: {0}")]
    Mysql(#[from] mysql_async::Error),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from sockets, sink files or checkpoints.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with the source database.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Unexpected message sequence on the replication stream.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error reported by the server on the replication connection.
    #[error("Database error {code}: {message}")]
    Database {
        /// SQLSTATE code
        code: String,
        /// Primary human-readable message
        message: String,
    },

    /// The source database is not set up for change capture.
    ///
    /// Raised while preparing a source, e.g. when `wal_level` is not
    /// `logical` or a required publication is missing.
    #[error("Prerequisite not met: {0}")]
    Prerequisite(String),

    /// Invalid or malformed replication message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// A transformation query could not be executed.
    #[error("Transformation error: {0}")]
    Transformation(String),

    /// A backfill was requested while another one is still outstanding.
    #[error("Backfill {backfill_id} is already in progress")]
    BackfillInProgress {
        /// Identifier of the outstanding backfill
        backfill_id: String,
    },

    /// The backfill request itself is unusable.
    #[error("Invalid backfill: {0}")]
    InvalidBackfill(String),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// The component was stopped while the operation was pending.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// SQLSTATE code of a server-reported error, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Database { code, .. } => Some(code.as_str()),
            Error::Postgres(e) => e.code().map(|c| c.code()),
            _ => None,
        }
    }
}

/// A convenient Result type alias for schema-sync operations.
pub type Result<T> = std::result::Result<T, Error>;
