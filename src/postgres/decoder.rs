//! Decoder for the `pgoutput` logical replication protocol.
//!
//! Takes the payload of an XLogData message (the part after the `w` header)
//! and turns it into transaction boundaries and row operations. Relation
//! messages are cached so that later row messages can be resolved to a table
//! and its column names.

use bytes::Buf;
use std::collections::HashMap;
use tracing::{debug, trace};

use super::types::{format_lsn, parse_binary_value, parse_text_value};
use crate::types::{Row, TableOperation, TableRef};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RelationInfo {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

impl RelationInfo {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.schema.clone(), self.table.clone())
    }

    pub fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_key)
            .map(|c| c.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Begin {
        final_lsn: u64,
        commit_time: i64,
        xid: u32,
    },
    Commit {
        commit_lsn: u64,
        end_lsn: u64,
        commit_time: i64,
    },
    Relation(RelationInfo),
    Change(TableOperation),
    Truncate {
        tables: Vec<TableRef>,
    },
}

/// One column of a TupleData block.
#[derive(Debug)]
enum TupleValue<'a> {
    Null,
    /// Unchanged TOASTed value; the server does not resend it.
    Unchanged,
    Text(&'a [u8]),
    Binary(&'a [u8]),
}

#[derive(Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationInfo>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(&self, id: u32) -> Option<&RelationInfo> {
        self.relations.get(&id)
    }

    pub fn decode(&mut self, payload: &[u8]) -> Result<Option<DecodedMessage>> {
        let mut cursor = payload;
        if cursor.is_empty() {
            return Ok(None);
        }

        let msg_type = cursor.get_u8();
        match msg_type {
            b'B' => decode_begin(&mut cursor).map(Some),
            b'C' => decode_commit(&mut cursor).map(Some),
            b'R' => self.decode_relation(&mut cursor).map(Some),
            b'I' => self.decode_insert(&mut cursor).map(Some),
            b'U' => self.decode_update(&mut cursor).map(Some),
            b'D' => self.decode_delete(&mut cursor).map(Some),
            b'T' => self.decode_truncate(&mut cursor).map(Some),
            b'Y' | b'O' | b'M' => {
                trace!(msg_type = %(msg_type as char), "Skipping pgoutput message");
                Ok(None)
            }
            _ => {
                debug!(msg_type = %(msg_type as char), "Unknown pgoutput message type");
                Ok(None)
            }
        }
    }

    fn decode_relation(&mut self, cursor: &mut &[u8]) -> Result<DecodedMessage> {
        need(cursor, 4, "RELATION")?;
        let id = cursor.get_u32();
        let schema = read_cstr(cursor)?;
        let table = read_cstr(cursor)?;
        need(cursor, 3, "RELATION")?;
        let _replica_identity = cursor.get_u8();
        let num_columns = cursor.get_u16();

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            need(cursor, 1, "RELATION column")?;
            let flags = cursor.get_u8();
            let name = read_cstr(cursor)?;
            need(cursor, 8, "RELATION column")?;
            let type_id = cursor.get_u32();
            let _type_modifier = cursor.get_i32();
            columns.push(ColumnInfo {
                name,
                type_id,
                is_key: flags & 1 != 0,
            });
        }

        let relation = RelationInfo {
            id,
            schema,
            table,
            columns,
        };
        debug!(
            relation_id = id,
            table = %relation.table_ref(),
            columns = relation.columns.len(),
            "Cached relation"
        );
        self.relations.insert(id, relation.clone());
        Ok(DecodedMessage::Relation(relation))
    }

    fn lookup(&self, cursor: &mut &[u8], what: &str) -> Result<&RelationInfo> {
        need(cursor, 5, what)?;
        let id = cursor.get_u32();
        self.relations.get(&id).ok_or_else(|| Error::InvalidMessage {
            message: format!("Unknown relation ID: {}", id),
        })
    }

    fn decode_insert(&self, cursor: &mut &[u8]) -> Result<DecodedMessage> {
        let relation = self.lookup(cursor, "INSERT")?;
        let tuple_type = cursor.get_u8();
        if tuple_type != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("Unexpected tuple type in INSERT: {}", tuple_type as char),
            });
        }
        let tuple = read_tuple(cursor, relation)?;
        let new = build_row(relation, &tuple, None, |_| true);
        Ok(DecodedMessage::Change(TableOperation::insert(
            &relation.table_ref(),
            relation.key_columns(),
            new,
        )))
    }

    fn decode_update(&self, cursor: &mut &[u8]) -> Result<DecodedMessage> {
        let relation = self.lookup(cursor, "UPDATE")?;
        let mut tuple_type = cursor.get_u8();

        let old = match tuple_type {
            b'K' | b'O' => {
                let old = read_tuple(cursor, relation)?;
                need(cursor, 1, "UPDATE")?;
                tuple_type = cursor.get_u8();
                Some(old)
            }
            _ => None,
        };
        if tuple_type != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("Unexpected tuple type in UPDATE: {}", tuple_type as char),
            });
        }
        let new_tuple = read_tuple(cursor, relation)?;

        let new = build_row(relation, &new_tuple, old.as_deref(), |_| true);
        let old_keys = match &old {
            Some(old) => build_row(relation, old, None, |c| c.is_key),
            None => build_row(relation, &new_tuple, None, |c| c.is_key),
        };
        Ok(DecodedMessage::Change(TableOperation::update(
            &relation.table_ref(),
            relation.key_columns(),
            new,
            old_keys,
        )))
    }

    fn decode_delete(&self, cursor: &mut &[u8]) -> Result<DecodedMessage> {
        let relation = self.lookup(cursor, "DELETE")?;
        let tuple_type = cursor.get_u8();
        if tuple_type != b'K' && tuple_type != b'O' {
            return Err(Error::InvalidMessage {
                message: format!("Unexpected tuple type in DELETE: {}", tuple_type as char),
            });
        }
        let old = read_tuple(cursor, relation)?;
        let old_keys = build_row(relation, &old, None, |c| c.is_key);
        Ok(DecodedMessage::Change(TableOperation::delete(
            &relation.table_ref(),
            relation.key_columns(),
            old_keys,
        )))
    }

    fn decode_truncate(&self, cursor: &mut &[u8]) -> Result<DecodedMessage> {
        need(cursor, 5, "TRUNCATE")?;
        let count = cursor.get_u32() as usize;
        let _options = cursor.get_u8();
        need(cursor, count * 4, "TRUNCATE")?;
        let tables = (0..count)
            .filter_map(|_| self.relations.get(&cursor.get_u32()))
            .map(RelationInfo::table_ref)
            .collect();
        Ok(DecodedMessage::Truncate { tables })
    }
}

fn decode_begin(cursor: &mut &[u8]) -> Result<DecodedMessage> {
    need(cursor, 20, "BEGIN")?;
    let final_lsn = cursor.get_u64();
    let commit_time = cursor.get_i64();
    let xid = cursor.get_u32();
    trace!(lsn = %format_lsn(final_lsn), xid, "BEGIN");
    Ok(DecodedMessage::Begin {
        final_lsn,
        commit_time,
        xid,
    })
}

fn decode_commit(cursor: &mut &[u8]) -> Result<DecodedMessage> {
    need(cursor, 25, "COMMIT")?;
    let _flags = cursor.get_u8();
    let commit_lsn = cursor.get_u64();
    let end_lsn = cursor.get_u64();
    let commit_time = cursor.get_i64();
    trace!(lsn = %format_lsn(end_lsn), "COMMIT");
    Ok(DecodedMessage::Commit {
        commit_lsn,
        end_lsn,
        commit_time,
    })
}

fn need(cursor: &[u8], len: usize, what: &str) -> Result<()> {
    if cursor.remaining() < len {
        return Err(Error::InvalidMessage {
            message: format!("Truncated {} message", what),
        });
    }
    Ok(())
}

fn read_cstr(cursor: &mut &[u8]) -> Result<String> {
    let end = cursor
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::InvalidMessage {
            message: "Unterminated string".to_string(),
        })?;
    let value = String::from_utf8_lossy(&cursor[..end]).into_owned();
    cursor.advance(end + 1);
    Ok(value)
}

fn read_tuple<'a>(cursor: &mut &'a [u8], relation: &RelationInfo) -> Result<Vec<TupleValue<'a>>> {
    need(cursor, 2, "TupleData")?;
    let num_columns = cursor.get_u16() as usize;
    if num_columns != relation.columns.len() {
        return Err(Error::InvalidMessage {
            message: format!(
                "Column count mismatch for {}: {} vs {}",
                relation.table_ref(),
                num_columns,
                relation.columns.len()
            ),
        });
    }

    let mut values = Vec::with_capacity(num_columns);
    for _ in 0..num_columns {
        need(cursor, 1, "TupleData")?;
        let value = match cursor.get_u8() {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::Unchanged,
            kind @ (b't' | b'b') => {
                need(cursor, 4, "TupleData")?;
                let len = cursor.get_u32() as usize;
                need(cursor, len, "TupleData")?;
                let data: &'a [u8] = &cursor[..len];
                cursor.advance(len);
                if kind == b't' {
                    TupleValue::Text(data)
                } else {
                    TupleValue::Binary(data)
                }
            }
            other => {
                return Err(Error::InvalidMessage {
                    message: format!("Unknown column type: {}", other as char),
                });
            }
        };
        values.push(value);
    }
    Ok(values)
}

/// Converts the selected columns of a tuple into a row.
///
/// Unchanged TOAST values are taken from `old` when it carries them and are
/// left out of the row otherwise.
fn build_row<'a>(
    relation: &RelationInfo,
    tuple: &[TupleValue<'a>],
    old: Option<&[TupleValue<'a>]>,
    include: impl Fn(&ColumnInfo) -> bool,
) -> Row {
    let mut row = Row::new();
    for (i, (column, value)) in relation.columns.iter().zip(tuple).enumerate() {
        if !include(column) {
            continue;
        }
        let value = match value {
            TupleValue::Unchanged => match old.and_then(|o| o.get(i)) {
                Some(previous @ (TupleValue::Text(_) | TupleValue::Binary(_) | TupleValue::Null)) => {
                    previous
                }
                _ => continue,
            },
            value => value,
        };
        let json = match value {
            TupleValue::Null | TupleValue::Unchanged => serde_json::Value::Null,
            TupleValue::Text(data) => {
                parse_text_value(&String::from_utf8_lossy(data), column.type_id)
            }
            TupleValue::Binary(data) => parse_binary_value(data, column.type_id),
        };
        row.insert(column.name.clone(), json);
    }
    row
}
