//! Conversion of replicated column values into JSON, keyed by type OID.

use base64::Engine;
use serde_json::Value;

use crate::{Error, Result};

pub mod oid {
    pub const BOOL: u32 = 16;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const OID: u32 = 26;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;

    pub const BOOL_ARRAY: u32 = 1000;
    pub const INT2_ARRAY: u32 = 1005;
    pub const INT4_ARRAY: u32 = 1007;
    pub const TEXT_ARRAY: u32 = 1009;
    pub const VARCHAR_ARRAY: u32 = 1015;
    pub const INT8_ARRAY: u32 = 1016;
    pub const FLOAT4_ARRAY: u32 = 1021;
    pub const FLOAT8_ARRAY: u32 = 1022;
}

/// Formats an LSN the way the server prints it, e.g. `16/B374D848`.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

pub fn parse_lsn(text: &str) -> Result<u64> {
    let invalid = || Error::Config(format!("invalid LSN: {}", text));
    let (high, low) = text.split_once('/').ok_or_else(invalid)?;
    let high = u64::from_str_radix(high, 16).map_err(|_| invalid())?;
    let low = u64::from_str_radix(low, 16).map_err(|_| invalid())?;
    if high > u64::from(u32::MAX) || low > u64::from(u32::MAX) {
        return Err(invalid());
    }
    Ok((high << 32) | low)
}

/// Element type of the array types we unpack.
fn array_element(type_id: u32) -> Option<u32> {
    match type_id {
        oid::BOOL_ARRAY => Some(oid::BOOL),
        oid::INT2_ARRAY => Some(oid::INT2),
        oid::INT4_ARRAY => Some(oid::INT4),
        oid::INT8_ARRAY => Some(oid::INT8),
        oid::FLOAT4_ARRAY => Some(oid::FLOAT4),
        oid::FLOAT8_ARRAY => Some(oid::FLOAT8),
        oid::TEXT_ARRAY | oid::VARCHAR_ARRAY => Some(25),
        _ => None,
    }
}

/// Parses a value in the server's text output format.
///
/// Numbers, booleans, JSON and one-dimensional arrays of those become typed
/// JSON; everything else (uuid, dates, ...) stays a string. Numeric and
/// timestamp values take the shape `row_to_json` gives them, so a key read
/// from the stream equals the same key read by a query.
pub fn parse_text_value(text: &str, type_id: u32) -> Value {
    let fallback = || Value::String(text.to_string());
    match type_id {
        oid::BOOL => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => fallback(),
        },
        oid::INT2 | oid::INT4 | oid::INT8 | oid::OID => {
            text.parse::<i64>().map(Value::from).unwrap_or_else(|_| fallback())
        }
        oid::FLOAT4 | oid::FLOAT8 => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(fallback),
        oid::NUMERIC => parse_numeric(text).unwrap_or_else(fallback),
        oid::TIMESTAMP | oid::TIMESTAMPTZ => Value::String(iso_timestamp(text)),
        oid::JSON | oid::JSONB => serde_json::from_str(text).unwrap_or_else(|_| fallback()),
        _ => match array_element(type_id) {
            Some(element) => parse_array(text, element).unwrap_or_else(fallback),
            None => fallback(),
        },
    }
}

/// `1.50` becomes the number `1.5`, as when the JSON text `1.50` is read.
/// NaN and infinities stay strings.
fn parse_numeric(text: &str) -> Option<Value> {
    if let Ok(n) = text.parse::<i64>() {
        return Some(Value::from(n));
    }
    if let Ok(n) = text.parse::<u64>() {
        return Some(Value::from(n));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

/// `2024-01-01 10:00:00+05` becomes `2024-01-01T10:00:00+05:00`.
fn iso_timestamp(text: &str) -> String {
    let Some((date, time)) = text.split_once(' ') else {
        return text.to_string();
    };
    let mut out = format!("{}T{}", date, time);
    if let Some(sign) = time.rfind(['+', '-']) {
        let offset = &time[sign + 1..];
        if offset.len() == 2 && offset.bytes().all(|b| b.is_ascii_digit()) {
            out.push_str(":00");
        }
    }
    out
}

/// Parses a one-dimensional array literal such as `{1,2,NULL}` or
/// `{"a b",c}`. Returns `None` for anything it does not understand.
fn parse_array(text: &str, element: u32) -> Option<Value> {
    let inner = text.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() {
        return Some(Value::Array(Vec::new()));
    }

    let mut items = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        let (raw, quoted) = if chars.peek() == Some(&'"') {
            chars.next();
            let mut item = String::new();
            loop {
                match chars.next()? {
                    '\\' => item.push(chars.next()?),
                    '"' => break,
                    c => item.push(c),
                }
            }
            (item, true)
        } else {
            let mut item = String::new();
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                if c == '{' || c == '"' {
                    return None;
                }
                item.push(c);
                chars.next();
            }
            (item, false)
        };

        if !quoted && raw == "NULL" {
            items.push(Value::Null);
        } else {
            items.push(parse_text_value(&raw, element));
        }

        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(_) => return None,
        }
    }
    Some(Value::Array(items))
}

/// Parses a value sent in binary format.
///
/// Types without a decoder are returned as `base64:`-prefixed text.
pub fn parse_binary_value(data: &[u8], type_id: u32) -> Value {
    match (type_id, data.len()) {
        (_, 0) if type_id == oid::BOOL => Value::Null,
        (oid::BOOL, 1) => Value::Bool(data[0] != 0),
        (oid::INT2, 2) => Value::from(i16::from_be_bytes([data[0], data[1]])),
        (oid::INT4, 4) => Value::from(i32::from_be_bytes([data[0], data[1], data[2], data[3]])),
        (oid::INT8, 8) => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(data);
            Value::from(i64::from_be_bytes(bytes))
        }
        (oid::FLOAT4, 4) => {
            let value = f32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            serde_json::Number::from_f64(f64::from(value))
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        (oid::FLOAT8, 8) => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(data);
            serde_json::Number::from_f64(f64::from_be_bytes(bytes))
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        (oid::UUID, 16) => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(data);
            Value::String(uuid::Uuid::from_bytes(bytes).to_string())
        }
        _ => Value::String(format!(
            "base64:{}",
            base64::engine::general_purpose::STANDARD.encode(data)
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lsn_round_trip() {
        assert_eq!(format_lsn(0x16_B374_D848), "16/B374D848");
        assert_eq!(parse_lsn("16/B374D848").unwrap(), 0x16_B374_D848);
        assert_eq!(parse_lsn("0/0").unwrap(), 0);
        assert!(parse_lsn("16").is_err());
        assert!(parse_lsn("zz/1").is_err());
    }

    #[test]
    fn test_bool_parsing() {
        assert_eq!(parse_text_value("t", oid::BOOL), Value::Bool(true));
        assert_eq!(parse_text_value("f", oid::BOOL), Value::Bool(false));
        assert_eq!(parse_text_value("invalid", oid::BOOL), json!("invalid"));
    }

    #[test]
    fn test_integer_parsing() {
        assert_eq!(parse_text_value("123", oid::INT2), json!(123));
        assert_eq!(parse_text_value("456789", oid::INT4), json!(456789));
        assert_eq!(parse_text_value("9876543210", oid::INT8), json!(9876543210i64));
        assert_eq!(parse_text_value("invalid", oid::INT4), json!("invalid"));
    }

    #[test]
    fn test_float_parsing() {
        let result = parse_text_value("3.14", oid::FLOAT4);
        assert!((result.as_f64().unwrap() - 3.14).abs() < 0.001);
        assert_eq!(parse_text_value("NaN", oid::FLOAT8), json!("NaN"));
    }

    #[test]
    fn test_text_like_types_stay_strings() {
        assert_eq!(parse_text_value("Hello", 25), json!("Hello"));
        assert_eq!(parse_text_value("2023-10-15", 1082), json!("2023-10-15"));
        assert_eq!(
            parse_text_value("550e8400-e29b-41d4-a716-446655440000", oid::UUID),
            json!("550e8400-e29b-41d4-a716-446655440000")
        );
    }

    #[test]
    fn test_numeric_reads_like_json_number() {
        assert_eq!(parse_text_value("1.50", oid::NUMERIC), json!(1.5));
        assert_eq!(parse_text_value("42", oid::NUMERIC), json!(42));
        assert_eq!(parse_text_value("-7.000", oid::NUMERIC), json!(-7.0));
        assert_eq!(
            parse_text_value("1.50", oid::NUMERIC),
            serde_json::from_str::<Value>("1.50").unwrap()
        );
        assert_eq!(parse_text_value("NaN", oid::NUMERIC), json!("NaN"));
    }

    #[test]
    fn test_timestamps_use_iso_form() {
        assert_eq!(
            parse_text_value("2024-01-01 10:00:00", oid::TIMESTAMP),
            json!("2024-01-01T10:00:00")
        );
        assert_eq!(
            parse_text_value("2024-01-01 10:00:00.25", oid::TIMESTAMP),
            json!("2024-01-01T10:00:00.25")
        );
        assert_eq!(
            parse_text_value("2023-10-15 10:30:00+00", oid::TIMESTAMPTZ),
            json!("2023-10-15T10:30:00+00:00")
        );
        assert_eq!(
            parse_text_value("2023-10-15 10:30:00.5-08", oid::TIMESTAMPTZ),
            json!("2023-10-15T10:30:00.5-08:00")
        );
        assert_eq!(
            parse_text_value("2023-10-15 10:30:00+05:30", oid::TIMESTAMPTZ),
            json!("2023-10-15T10:30:00+05:30")
        );
        assert_eq!(parse_text_value("infinity", oid::TIMESTAMPTZ), json!("infinity"));
    }

    #[test]
    fn test_json_types() {
        let parsed = parse_text_value(r#"{"key": "value", "number": 42}"#, oid::JSONB);
        assert_eq!(parsed, json!({"key": "value", "number": 42}));

        let invalid = r#"{"invalid": json"#;
        assert_eq!(parse_text_value(invalid, oid::JSON), json!(invalid));
    }

    #[test]
    fn test_array_parsing() {
        assert_eq!(parse_text_value("{1,2,3}", oid::INT4_ARRAY), json!([1, 2, 3]));
        assert_eq!(parse_text_value("{}", oid::INT4_ARRAY), json!([]));
        assert_eq!(
            parse_text_value(r#"{hello,"big world",NULL,"NULL"}"#, oid::TEXT_ARRAY),
            json!(["hello", "big world", null, "NULL"])
        );
        assert_eq!(
            parse_text_value(r#"{"say \"hi\""}"#, oid::TEXT_ARRAY),
            json!([r#"say "hi""#])
        );
        // Nested arrays are left alone.
        assert_eq!(
            parse_text_value("{{1,2},{3,4}}", oid::INT4_ARRAY),
            json!("{{1,2},{3,4}}")
        );
    }

    #[test]
    fn test_binary_parsing() {
        assert_eq!(parse_binary_value(&[1], oid::BOOL), json!(true));
        assert_eq!(parse_binary_value(&[], oid::BOOL), Value::Null);
        assert_eq!(parse_binary_value(&123i16.to_be_bytes(), oid::INT2), json!(123));
        assert_eq!(
            parse_binary_value(&9876543210i64.to_be_bytes(), oid::INT8),
            json!(9876543210i64)
        );
        let float = parse_binary_value(&2.718281828f64.to_be_bytes(), oid::FLOAT8);
        assert!((float.as_f64().unwrap() - 2.718281828).abs() < 0.000001);

        let uuid_bytes = [
            0x55, 0x0e, 0x84, 0x00, 0xe2, 0x9b, 0x41, 0xd4, 0xa7, 0x16, 0x44, 0x66, 0x55, 0x44,
            0x00, 0x00,
        ];
        assert_eq!(
            parse_binary_value(&uuid_bytes, oid::UUID),
            json!("550e8400-e29b-41d4-a716-446655440000")
        );
        assert_eq!(parse_binary_value(&[1, 2, 3, 4], 9999), json!("base64:AQIDBA=="));
    }
}
