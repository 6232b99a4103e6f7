//! Row materialization.
//!
//! Result sets are read eagerly and converted to JSON-representable
//! scalars: null, bool, i64, f64, string, binary as base64, timestamps as
//! RFC 3339. A column type with no mapping aborts the request with a scan
//! error rather than returning a lossy value.

use base64::prelude::*;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use tokio_postgres::types::Type;
use tokio_postgres::{Row, Statement};

use crate::errors::Error;

pub fn column_names(statement: &Statement) -> Vec<String> {
    statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect()
}

fn scan_err(column: &str, err: impl std::fmt::Display) -> Error {
    Error::Scan(format!("column {column:?}: {err}"))
}

fn number(f: f64) -> Value {
    serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn decode_value(row: &Row, idx: usize) -> Result<Value, Error> {
    let column = row.columns().get(idx).expect("column index in range");
    let name = column.name();
    let ty = column.type_();

    macro_rules! take {
        ($rust:ty, $convert:expr) => {
            row.try_get::<_, Option<$rust>>(idx)
                .map(|opt| opt.map($convert).unwrap_or(Value::Null))
                .map_err(|e| scan_err(name, e))
        };
    }

    match ty {
        t if *t == Type::BOOL => take!(bool, Value::from),
        t if *t == Type::CHAR => take!(i8, |v| Value::from(v as i64)),
        t if *t == Type::INT2 => take!(i16, |v| Value::from(v as i64)),
        t if *t == Type::INT4 => take!(i32, |v| Value::from(v as i64)),
        t if *t == Type::INT8 => take!(i64, Value::from),
        t if *t == Type::OID => take!(u32, |v| Value::from(v as u64)),
        t if *t == Type::FLOAT4 => take!(f32, |v| number(v as f64)),
        t if *t == Type::FLOAT8 => take!(f64, number),
        t if *t == Type::BYTEA => take!(Vec<u8>, |v| Value::from(BASE64_STANDARD.encode(v))),
        t if *t == Type::TIMESTAMPTZ => {
            take!(DateTime<Utc>, |v| Value::from(v.to_rfc3339()))
        }
        t if *t == Type::TIMESTAMP => {
            take!(NaiveDateTime, |v| Value::from(
                v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
            ))
        }
        t if *t == Type::DATE => take!(NaiveDate, |v| Value::from(v.format("%Y-%m-%d").to_string())),
        t if *t == Type::TIME => {
            take!(NaiveTime, |v| Value::from(v.format("%H:%M:%S%.f").to_string()))
        }
        t if *t == Type::JSON || *t == Type::JSONB => take!(Value, |v| v),
        t if *t == Type::TEXT
            || *t == Type::VARCHAR
            || *t == Type::BPCHAR
            || *t == Type::NAME
            || *t == Type::UNKNOWN =>
        {
            take!(String, Value::from)
        }
        other => Err(scan_err(
            name,
            format!("unsupported column type {other}; cast it in the query"),
        )),
    }
}

/// Decodes all rows eagerly, in declared column order.
pub fn decode_rows(rows: &[Row]) -> Result<Vec<Vec<Value>>, Error> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut decoded = Vec::with_capacity(row.len());
        for idx in 0..row.len() {
            decoded.push(decode_value(row, idx)?);
        }
        out.push(decoded);
    }
    Ok(out)
}
