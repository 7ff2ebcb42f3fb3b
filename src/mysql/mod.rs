//! MySQL change capture through the row-based binary log.

pub mod listener;
pub mod source;

pub use listener::MysqlBinlogListener;
pub use source::MysqlSource;

use base64::Engine;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Pool, Row, Value as MyValue};
use serde_json::Value;
use tracing::info;

use crate::config::MysqlConfig;
use crate::{Error, Result};

pub(crate) fn opts(config: &MysqlConfig) -> OptsBuilder {
    OptsBuilder::default()
        .ip_or_hostname(config.host.clone())
        .tcp_port(config.port)
        .user(Some(config.username.clone()))
        .pass(Some(config.password.clone()))
        .db_name(Some(config.database.clone()))
}

pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Converts a MySQL value into JSON.
///
/// Byte strings that are not UTF-8 become `base64:`-prefixed text; dates
/// and times become ISO-8601 style strings.
pub fn value_to_json(value: MyValue) -> Value {
    match value {
        MyValue::NULL => Value::Null,
        MyValue::Int(n) => Value::from(n),
        MyValue::UInt(n) => Value::from(n),
        MyValue::Float(n) => serde_json::Number::from_f64(f64::from(n))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        MyValue::Double(n) => serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        MyValue::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => Value::String(s),
            Err(e) => Value::String(format!(
                "base64:{}",
                base64::engine::general_purpose::STANDARD.encode(e.as_bytes())
            )),
        },
        MyValue::Date(year, month, day, hour, min, sec, micro) => Value::String(format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}",
            year, month, day, hour, min, sec, micro
        )),
        MyValue::Time(negative, days, hours, mins, secs, micro) => {
            let sign = if negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(hours);
            Value::String(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                sign, total_hours, mins, secs, micro
            ))
        }
    }
}

/// Converts a JSON query parameter into a MySQL value.
pub fn json_to_value(value: &Value) -> MyValue {
    match value {
        Value::Null => MyValue::NULL,
        Value::Bool(b) => MyValue::Int(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                MyValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                MyValue::UInt(u)
            } else {
                MyValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => MyValue::Bytes(s.clone().into_bytes()),
        other => MyValue::Bytes(other.to_string().into_bytes()),
    }
}

/// Turns a result row into a JSON object keyed by column name.
pub fn row_to_json(row: &Row) -> crate::types::Row {
    row.columns_ref()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let value = row.as_ref(i).cloned().unwrap_or(MyValue::NULL);
            (column.name_str().into_owned(), value_to_json(value))
        })
        .collect()
}

/// Current `(file, position)` of the server's binary log.
///
/// `SHOW BINARY LOG STATUS` replaced `SHOW MASTER STATUS` in 8.4; the old
/// form is tried when the new one is rejected.
pub async fn current_binlog_position(pool: &Pool) -> Result<(String, u64)> {
    let mut conn: Conn = pool.get_conn().await?;
    let row: Option<Row> = match conn.query_first("SHOW BINARY LOG STATUS").await {
        Ok(row) => row,
        Err(_) => conn.query_first("SHOW MASTER STATUS").await?,
    };

    let row = row.ok_or_else(|| {
        Error::Prerequisite("binary log status returned no rows; is log_bin enabled?".to_string())
    })?;
    let file: String = row
        .get_opt(0)
        .and_then(|v| v.ok())
        .unwrap_or_default();
    let position: u64 = row.get_opt(1).and_then(|v| v.ok()).unwrap_or(4);
    if file.is_empty() {
        return Err(Error::Prerequisite(
            "binary log status returned an empty file name".to_string(),
        ));
    }
    info!(file = %file, position, "Current binlog position");
    Ok((file, position))
}
