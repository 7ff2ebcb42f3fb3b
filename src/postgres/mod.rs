pub mod connection;
pub mod decoder;
pub mod listener;
pub mod source;
pub mod sql;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use connection::{ReplicationConnection, ReplicationMessage, ReplicationStream, SystemInfo};
pub use decoder::{ColumnInfo, DecodedMessage, PgOutputDecoder, RelationInfo};
pub use listener::{PgReplicationListener, TransactionAssembler};
pub use source::PostgresSource;
pub use types::{format_lsn, parse_lsn};
