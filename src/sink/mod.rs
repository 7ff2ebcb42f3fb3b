//! Destinations for transformed operations.

pub mod file;
pub mod kafka;
pub mod postgres;

pub use file::FileSink;
pub use kafka::KafkaSink;
pub use postgres::PostgresSink;
