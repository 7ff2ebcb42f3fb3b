pub mod checkpoint;
pub mod config;
pub mod error;
pub mod queue;
pub mod replicator;
pub mod types;

pub mod mysql;
pub mod postgres;
pub mod sink;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};
pub use replicator::Replicator;
pub use sync::SyncController;
