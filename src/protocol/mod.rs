//! Wire envelopes.
//!
//! Requests and responses are JSON documents on the broker. The request
//! `type` is decoded as a plain string first so that an unknown value can be
//! reported as `unknown_type` instead of being folded into the generic
//! parse failure (`bad_envelope`).

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Error;

/// The three operations a client can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Sql,
    Function,
    Command,
}

impl RequestKind {
    pub fn parse(s: &str) -> Result<RequestKind, Error> {
        match s {
            "sql" => Ok(RequestKind::Sql),
            "function" => Ok(RequestKind::Function),
            "command" => Ok(RequestKind::Command),
            other => Err(Error::UnknownType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Sql => "sql",
            RequestKind::Function => "function",
            RequestKind::Command => "command",
        }
    }
}

/// Request envelope as received from the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// Correlation id, echoed verbatim on the response.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: String,
    /// Positional SQL parameters; unused by the other request kinds.
    #[serde(default)]
    pub params: Vec<Value>,
    pub client_id: String,
    /// 0 means "use the server default".
    #[serde(default)]
    pub deadline_ms: u64,
}

impl Request {
    /// Decodes the envelope and validates required fields.
    pub fn decode(data: &[u8]) -> Result<Request, Error> {
        let request: Request = serde_json::from_slice(data)
            .map_err(|e| Error::BadEnvelope(format!("request is not a valid envelope: {e}")))?;

        if request.id.is_empty() {
            return Err(Error::BadEnvelope("envelope id is empty".into()));
        }
        if request.client_id.is_empty() {
            return Err(Error::BadEnvelope("envelope client_id is empty".into()));
        }
        Ok(request)
    }

    pub fn parsed_kind(&self) -> Result<RequestKind, Error> {
        RequestKind::parse(&self.kind)
    }
}

/// Response envelope published to `reply_to`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub error: String,
}

impl Response {
    pub fn ok(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Response {
        Response {
            columns,
            rows,
            error: String::new(),
        }
    }

    /// Shape of every write statement result.
    pub fn rows_affected(count: u64) -> Response {
        Response {
            columns: vec!["rows_affected".into(), "last_insert_id".into()],
            rows: vec![vec![Value::from(count), Value::Null]],
            error: String::new(),
        }
    }

    /// An error response never carries rows.
    pub fn from_error(err: &Error) -> Response {
        Response {
            columns: Vec::new(),
            rows: Vec::new(),
            error: err.to_wire(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Response contains only JSON-representable values; serialization
        // cannot fail.
        serde_json::to_vec(self).expect("response serialization")
    }
}
