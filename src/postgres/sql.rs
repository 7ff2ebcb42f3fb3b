//! Running user-supplied SQL with JSON parameters and JSON results.

use bytes::BytesMut;
use serde_json::Value;
use std::error::Error as StdError;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Client;

use crate::types::Row;
use crate::{Error, Result};

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

type BoxError = Box<dyn StdError + Sync + Send>;

/// A JSON value bound as a query parameter.
///
/// The value is encoded for whatever type the server inferred for the
/// parameter, so `$1` compared against an `int4` column receives an `int4`.
#[derive(Debug)]
pub struct JsonParam<'a>(pub &'a Value);

impl JsonParam<'_> {
    fn integer<T: TryFrom<i64>>(&self) -> std::result::Result<T, BoxError> {
        let value = match self.0 {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
        .ok_or_else(|| format!("cannot bind {} as an integer", self.0))?;
        T::try_from(value).map_err(|_| format!("{} is out of range", value).into())
    }

    fn float(&self) -> std::result::Result<f64, BoxError> {
        match self.0 {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| format!("cannot bind {} as a float", self.0).into())
    }

    fn text(&self) -> String {
        match self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl ToSql for JsonParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        if self.0.is_null() {
            return Ok(IsNull::Yes);
        }
        match *ty {
            Type::BOOL => match self.0 {
                Value::Bool(b) => b.to_sql(ty, out),
                Value::String(s) if s == "t" || s == "true" => true.to_sql(ty, out),
                Value::String(s) if s == "f" || s == "false" => false.to_sql(ty, out),
                other => Err(format!("cannot bind {} as a boolean", other).into()),
            },
            Type::INT2 => self.integer::<i16>()?.to_sql(ty, out),
            Type::INT4 => self.integer::<i32>()?.to_sql(ty, out),
            Type::INT8 => self.integer::<i64>()?.to_sql(ty, out),
            Type::OID => self.integer::<u32>()?.to_sql(ty, out),
            Type::FLOAT4 => (self.float()? as f32).to_sql(ty, out),
            Type::FLOAT8 => self.float()?.to_sql(ty, out),
            Type::JSON | Type::JSONB => self.0.to_sql(ty, out),
            Type::UUID => uuid::Uuid::parse_str(&self.text())?.to_sql(ty, out),
            Type::TIMESTAMPTZ => chrono::DateTime::parse_from_rfc3339(&self.text())?
                .with_timezone(&chrono::Utc)
                .to_sql(ty, out),
            Type::TIMESTAMP => {
                chrono::NaiveDateTime::parse_from_str(&self.text(), "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| {
                        chrono::NaiveDateTime::parse_from_str(&self.text(), "%Y-%m-%d %H:%M:%S%.f")
                    })?
                    .to_sql(ty, out)
            }
            _ => self.text().as_str().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Runs `sql` and returns every result row as a JSON object.
///
/// The statement is wrapped in `row_to_json`, so column types the client
/// cannot decode natively still come back intact.
pub async fn query_json_rows(client: &Client, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let statement = format!(
        "SELECT row_to_json(q)::text FROM ({}) AS q",
        sql.trim().trim_end_matches(';')
    );
    let params: Vec<JsonParam<'_>> = params.iter().map(JsonParam).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

    let rows = client.query(statement.as_str(), &refs).await?;
    rows.iter()
        .map(|row| -> Result<Row> {
            let text: String = row.try_get(0)?;
            match serde_json::from_str::<Value>(&text)? {
                Value::Object(map) => Ok(map),
                other => Err(Error::Protocol(format!("expected a JSON object row, got {}", other))),
            }
        })
        .collect()
}
