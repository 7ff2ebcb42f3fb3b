//! Change records exchanged between listeners, the sync controller and sinks.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;
use tracing::debug;

/// A row as a JSON object keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parses `schema.table`; a bare name gets an empty schema.
    pub fn parse(name: &str) -> Self {
        match name.split_once('.') {
            Some((schema, table)) => Self::new(schema, table),
            None => Self::new("", name),
        }
    }

    pub fn matches(&self, schema: &str, table: &str) -> bool {
        self.schema == schema && self.table == table
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.schema.is_empty() {
            write!(f, "{}", self.table)
        } else {
            write!(f, "{}.{}", self.schema, self.table)
        }
    }
}

/// What happened to a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum RowChange {
    Insert { new: Row },
    Update { new: Row, old_keys: Row },
    Delete { old_keys: Row },
}

/// A single row change captured from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOperation {
    pub table: String,
    pub table_schema: String,
    pub key_columns: Vec<String>,
    #[serde(flatten)]
    pub change: RowChange,
}

impl TableOperation {
    pub fn insert(table_ref: &TableRef, key_columns: Vec<String>, new: Row) -> Self {
        Self::with_change(table_ref, key_columns, RowChange::Insert { new })
    }

    pub fn update(table_ref: &TableRef, key_columns: Vec<String>, new: Row, old_keys: Row) -> Self {
        Self::with_change(table_ref, key_columns, RowChange::Update { new, old_keys })
    }

    pub fn delete(table_ref: &TableRef, key_columns: Vec<String>, old_keys: Row) -> Self {
        Self::with_change(table_ref, key_columns, RowChange::Delete { old_keys })
    }

    fn with_change(table_ref: &TableRef, key_columns: Vec<String>, change: RowChange) -> Self {
        Self {
            table: table_ref.table.clone(),
            table_schema: table_ref.schema.clone(),
            key_columns,
            change,
        }
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.table_schema.clone(), self.table.clone())
    }

    pub fn kind(&self) -> &'static str {
        match self.change {
            RowChange::Insert { .. } => "insert",
            RowChange::Update { .. } => "update",
            RowChange::Delete { .. } => "delete",
        }
    }

    /// The new row image, absent for deletes.
    pub fn new_row(&self) -> Option<&Row> {
        match &self.change {
            RowChange::Insert { new } | RowChange::Update { new, .. } => Some(new),
            RowChange::Delete { .. } => None,
        }
    }

    /// The row that identifies the affected record: the new image for
    /// inserts and updates, the old key image for deletes.
    pub fn identity_row(&self) -> &Row {
        match &self.change {
            RowChange::Insert { new } | RowChange::Update { new, .. } => new,
            RowChange::Delete { old_keys } => old_keys,
        }
    }

    /// Values of the key columns, in key column order.
    pub fn key_values(&self) -> Vec<serde_json::Value> {
        let row = self.identity_row();
        self.key_columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(serde_json::Value::Null))
            .collect()
    }
}

/// Replaces every update that changes a key column with an insert of the
/// new row followed by a delete of the old key.
pub fn split_key_changes(operations: Vec<TableOperation>) -> Vec<TableOperation> {
    let mut out = Vec::with_capacity(operations.len());
    for op in operations {
        let TableOperation {
            table,
            table_schema,
            key_columns,
            change,
        } = op;
        match change {
            RowChange::Update { new, old_keys }
                if !old_keys.is_empty()
                    && key_columns.iter().any(|c| old_keys.get(c) != new.get(c)) =>
            {
                debug!(table = %table, "Splitting key-changing update");
                out.push(TableOperation {
                    table: table.clone(),
                    table_schema: table_schema.clone(),
                    key_columns: key_columns.clone(),
                    change: RowChange::Insert { new },
                });
                out.push(TableOperation {
                    table,
                    table_schema,
                    key_columns,
                    change: RowChange::Delete { old_keys },
                });
            }
            change => out.push(TableOperation {
                table,
                table_schema,
                key_columns,
                change,
            }),
        }
    }
    out
}

/// Consumer acknowledgement for one transaction.
///
/// Dropping an `Ack` without answering counts as "not consumed".
#[derive(Debug, Default)]
pub struct Ack(Option<oneshot::Sender<bool>>);

impl Ack {
    pub fn channel() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// An acknowledgement nobody waits for.
    pub fn detached() -> Self {
        Self(None)
    }

    pub fn send(mut self, consumed: bool) {
        if let Some(tx) = self.0.take() {
            // The listener may already be gone.
            let _ = tx.send(consumed);
        }
    }
}

/// Operations committed together on the source.
#[derive(Debug)]
pub struct Transaction {
    /// Source position of the commit (LSN or binlog `file:pos`).
    pub id: String,
    pub operations: Vec<TableOperation>,
    pub ack: Ack,
}

impl Transaction {
    pub fn new(id: impl Into<String>, operations: Vec<TableOperation>, ack: Ack) -> Self {
        Self {
            id: id.into(),
            operations,
            ack,
        }
    }
}

/// A change projected into the public schema, ready for a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum TransformedOperation {
    Insert { key_columns: Vec<String>, object: Row },
    Update { key_columns: Vec<String>, object: Row },
    Delete { key_columns: Vec<String>, object_keys: Row },
}

impl TransformedOperation {
    pub fn key_columns(&self) -> &[String] {
        match self {
            TransformedOperation::Insert { key_columns, .. }
            | TransformedOperation::Update { key_columns, .. }
            | TransformedOperation::Delete { key_columns, .. } => key_columns,
        }
    }

    /// The object for inserts and updates, the key object for deletes.
    pub fn payload(&self) -> &Row {
        match self {
            TransformedOperation::Insert { object, .. }
            | TransformedOperation::Update { object, .. } => object,
            TransformedOperation::Delete { object_keys, .. } => object_keys,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, TransformedOperation::Delete { .. })
    }
}
