//! Backfilled rows held back until the backfill window closes.
//!
//! Every row is indexed under one key per backfill source table. Live
//! operations seen during the window register drop keys; rows matching any
//! drop key are excluded when the window closes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::types::{Row, TableOperation, TableRef};
use crate::{Error, Result};

/// A table read by a backfill query, with the output aliases of its key
/// columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillSource {
    /// `schema.table` of the source table
    pub table_ref: String,
    /// Source key column name to the column name in the query output
    pub primary_key_aliases: BTreeMap<String, String>,
}

impl BackfillSource {
    pub fn new<I, K, V>(table_ref: impl Into<String>, aliases: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            table_ref: table_ref.into(),
            primary_key_aliases: aliases
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn table(&self) -> TableRef {
        TableRef::parse(&self.table_ref)
    }
}

/// Rejects an empty source list, sources whose table is not
/// schema-qualified and sources without key columns.
///
/// Live operations always carry a schema, so a bare table name would never
/// match one and its rows could not be dropped.
pub fn validate_sources(sources: &[BackfillSource]) -> Result<()> {
    if sources.is_empty() {
        return Err(Error::InvalidBackfill(
            "at least one backfill source is required".to_string(),
        ));
    }
    for source in sources {
        let table = source.table();
        if table.schema.is_empty() || table.table.is_empty() {
            return Err(Error::InvalidBackfill(format!(
                "backfill source '{}' must be written as schema.table",
                source.table_ref
            )));
        }
        if source.primary_key_aliases.is_empty() {
            return Err(Error::InvalidBackfill(format!(
                "backfill source '{}' has no key columns",
                source.table_ref
            )));
        }
    }
    Ok(())
}

/// Canonical identity of a source row: sorted `table.column=value` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultSetKey(String);

impl ResultSetKey {
    fn from_pairs(mut pairs: Vec<String>) -> Self {
        pairs.sort();
        Self(pairs.join(","))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Text form of a key value; strings are written without quotes.
pub(crate) fn key_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    }
}

#[derive(Debug)]
struct StoredRecord {
    key_columns: Vec<String>,
    row: Row,
    keys: Vec<ResultSetKey>,
}

#[derive(Debug, Default)]
pub struct ResultSetStore {
    records: Vec<StoredRecord>,
    index: HashMap<ResultSetKey, Vec<usize>>,
    drop_keys: HashSet<ResultSetKey>,
}

impl ResultSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores backfilled rows, keyed once per source.
    pub fn add_records(&mut self, sources: &[BackfillSource], rows: Vec<Row>) -> Result<()> {
        validate_sources(sources)?;

        let key_columns: Vec<String> = sources
            .iter()
            .flat_map(|s| s.primary_key_aliases.values().cloned())
            .collect();

        for row in rows {
            let keys: Vec<ResultSetKey> = sources
                .iter()
                .map(|source| {
                    let pairs = source
                        .primary_key_aliases
                        .iter()
                        .map(|(column, alias)| {
                            format!("{}.{}={}", source.table_ref, column, key_text(row.get(alias)))
                        })
                        .collect();
                    ResultSetKey::from_pairs(pairs)
                })
                .collect();

            let position = self.records.len();
            for key in &keys {
                self.index.entry(key.clone()).or_default().push(position);
            }
            self.records.push(StoredRecord {
                key_columns: key_columns.clone(),
                row,
                keys,
            });
        }
        Ok(())
    }

    /// Key identifying the row a live operation touched.
    pub fn operation_key(operation: &TableOperation) -> ResultSetKey {
        let table_ref = operation.table_ref().to_string();
        let row = operation.identity_row();
        let pairs = operation
            .key_columns
            .iter()
            .map(|column| format!("{}.{}={}", table_ref, column, key_text(row.get(column))))
            .collect();
        ResultSetKey::from_pairs(pairs)
    }

    pub fn add_drop_key(&mut self, operation: &TableOperation) -> ResultSetKey {
        let key = Self::operation_key(operation);
        self.drop_keys.insert(key.clone());
        key
    }

    /// Rows none of whose keys were dropped, in insertion order, paired with
    /// the output names of their key columns.
    pub fn records_without_drop_keys(&self) -> Vec<(Vec<String>, Row)> {
        self.records
            .iter()
            .filter(|record| !record.keys.iter().any(|k| self.drop_keys.contains(k)))
            .map(|record| (record.key_columns.clone(), record.row.clone()))
            .collect()
    }

    /// Number of stored rows excluded by drop keys.
    pub fn dropped_count(&self) -> usize {
        self.drop_keys
            .iter()
            .filter_map(|k| self.index.get(k))
            .flatten()
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
        self.drop_keys.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
