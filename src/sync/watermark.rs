//! Low/high markers written into the change stream around a backfill query.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{RowChange, TableOperation, TableRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkKind {
    /// Written before the backfill query runs.
    Low,
    /// Written after the backfill query returned.
    High,
}

impl WatermarkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatermarkKind::Low => "low",
            WatermarkKind::High => "high",
        }
    }
}

impl fmt::Display for WatermarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatermarkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(WatermarkKind::Low),
            "high" => Ok(WatermarkKind::High),
            other => Err(format!("unknown watermark type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub kind: WatermarkKind,
    pub backfill_id: String,
}

impl Watermark {
    pub fn low(backfill_id: impl Into<String>) -> Self {
        Self {
            kind: WatermarkKind::Low,
            backfill_id: backfill_id.into(),
        }
    }

    pub fn high(backfill_id: impl Into<String>) -> Self {
        Self {
            kind: WatermarkKind::High,
            backfill_id: backfill_id.into(),
        }
    }

    /// Whether the operation touched the watermark table at all.
    pub fn is_watermark_table(operation: &TableOperation, table: &TableRef) -> bool {
        table.matches(&operation.table_schema, &operation.table)
    }

    /// Reads a watermark out of an insert into the watermark table.
    ///
    /// Returns `None` for any other operation, including updates and
    /// deletes on the watermark table itself.
    pub fn from_operation(operation: &TableOperation, table: &TableRef) -> Option<Self> {
        if !Self::is_watermark_table(operation, table) {
            return None;
        }
        let RowChange::Insert { new } = &operation.change else {
            return None;
        };
        let kind = new.get("type")?.as_str()?.parse().ok()?;
        let backfill_id = new.get("backfill")?.as_str()?.to_string();
        Some(Self { kind, backfill_id })
    }

    /// The row a source inserts for this watermark.
    pub fn to_row(&self, table: &TableRef) -> TableOperation {
        let mut row = crate::types::Row::new();
        row.insert("type".to_string(), self.kind.as_str().into());
        row.insert("backfill".to_string(), self.backfill_id.clone().into());
        TableOperation::insert(table, vec!["id".to_string()], row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn control_table() -> TableRef {
        TableRef::new("schema_sync", "watermarks")
    }

    #[test]
    fn test_recognizes_watermark_insert() {
        let op = TableOperation::insert(
            &control_table(),
            vec!["id".to_string()],
            json!({"id": 4, "type": "high", "backfill": "b-1"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(
            Watermark::from_operation(&op, &control_table()),
            Some(Watermark::high("b-1"))
        );
    }

    #[test]
    fn test_ignores_other_tables_and_malformed_rows() {
        let other = TableOperation::insert(
            &TableRef::new("public", "watermarks"),
            vec!["id".to_string()],
            json!({"type": "low", "backfill": "b-1"}).as_object().cloned().unwrap(),
        );
        assert_eq!(Watermark::from_operation(&other, &control_table()), None);

        let malformed = TableOperation::insert(
            &control_table(),
            vec!["id".to_string()],
            json!({"type": "middle", "backfill": "b-1"}).as_object().cloned().unwrap(),
        );
        assert_eq!(Watermark::from_operation(&malformed, &control_table()), None);
        assert!(Watermark::is_watermark_table(&malformed, &control_table()));
    }

    #[test]
    fn test_round_trips_through_row() {
        let mark = Watermark::low("abc");
        let op = mark.to_row(&control_table());
        assert_eq!(Watermark::from_operation(&op, &control_table()), Some(mark));
    }
}
