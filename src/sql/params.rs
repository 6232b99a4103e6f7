//! Positional parameter binding.
//!
//! Wire parameters arrive as JSON scalars; the statement's prepared
//! parameter types decide how each one is encoded. The bridge never
//! interpolates values into SQL text.

use base64::prelude::*;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// Adapter binding one JSON value against the declared parameter type.
#[derive(Debug)]
pub struct JsonParam<'a>(pub &'a Value);

fn mismatch(value: &Value, ty: &Type) -> BoxError {
    format!("cannot bind {value} as {ty}").into()
}

fn as_i64(value: &Value, ty: &Type) -> Result<i64, BoxError> {
    value
        .as_i64()
        .ok_or_else(|| mismatch(value, ty))
}

fn as_f64(value: &Value, ty: &Type) -> Result<f64, BoxError> {
    value
        .as_f64()
        .ok_or_else(|| mismatch(value, ty))
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ToSql for JsonParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        let value = self.0;
        if value.is_null() {
            return Ok(IsNull::Yes);
        }

        match ty {
            t if *t == Type::BOOL => value
                .as_bool()
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(t, out),
            t if *t == Type::INT2 => {
                i16::try_from(as_i64(value, ty)?)
                    .map_err(|_| mismatch(value, ty))?
                    .to_sql(t, out)
            }
            t if *t == Type::INT4 => {
                i32::try_from(as_i64(value, ty)?)
                    .map_err(|_| mismatch(value, ty))?
                    .to_sql(t, out)
            }
            t if *t == Type::INT8 => as_i64(value, ty)?.to_sql(t, out),
            t if *t == Type::FLOAT4 => (as_f64(value, ty)? as f32).to_sql(t, out),
            t if *t == Type::FLOAT8 => as_f64(value, ty)?.to_sql(t, out),
            t if *t == Type::BYTEA => {
                let encoded = value.as_str().ok_or_else(|| mismatch(value, ty))?;
                let raw = BASE64_STANDARD
                    .decode(encoded)
                    .map_err(|e| -> BoxError { format!("invalid base64 parameter: {e}").into() })?;
                raw.to_sql(t, out)
            }
            t if *t == Type::JSON || *t == Type::JSONB => value.to_sql(t, out),
            t if *t == Type::TIMESTAMPTZ => {
                let raw = value.as_str().ok_or_else(|| mismatch(value, ty))?;
                let parsed = DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| -> BoxError { format!("invalid timestamp {raw:?}: {e}").into() })?
                    .with_timezone(&Utc);
                parsed.to_sql(t, out)
            }
            t if *t == Type::TIMESTAMP => {
                let raw = value.as_str().ok_or_else(|| mismatch(value, ty))?;
                let parsed = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
                    .map_err(|e| -> BoxError { format!("invalid timestamp {raw:?}: {e}").into() })?;
                parsed.to_sql(t, out)
            }
            t if *t == Type::DATE => {
                let raw = value.as_str().ok_or_else(|| mismatch(value, ty))?;
                let parsed = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|e| -> BoxError { format!("invalid date {raw:?}: {e}").into() })?;
                parsed.to_sql(t, out)
            }
            // Text-ish targets and types the server left undeclared get the
            // textual rendering; Postgres casts from there.
            t if *t == Type::TEXT
                || *t == Type::VARCHAR
                || *t == Type::BPCHAR
                || *t == Type::NAME
                || *t == Type::UNKNOWN =>
            {
                as_text(value).to_sql(&Type::TEXT, out)
            }
            _ => Err(format!("unsupported parameter type {ty}").into()),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Borrows a parameter slice in the form `query`/`execute` expect.
pub fn bind_params(params: &[Value]) -> Vec<JsonParam<'_>> {
    params.iter().map(JsonParam).collect()
}

pub fn as_dyn_refs<'a>(bound: &'a [JsonParam<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}
