//! Server-side function registry.
//!
//! Functions are registered before the server starts and the map is frozen
//! from then on, so lookups take no lock. Dispatch stays name-based at the
//! wire level; each registration supplies a typed [`Invoker`] adapter that
//! declares its parameter kinds and produces one of four return shapes.
//!
//! Wire payload: `{"name": "...", "params": [{"type": "...", "value": ...}]}`.

use std::collections::HashMap;
use std::sync::Arc;

use base64::prelude::*;
use serde_derive::Deserialize;
use serde_json::Value;

use crate::errors::Error;
use crate::protocol::Response;

/// Parameter kinds a function can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int64,
    Float64,
    String,
    /// Base64-encoded on the wire.
    Bytes,
    /// Arbitrary decoded JSON value.
    Json,
}

impl ParamKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            ParamKind::Bool => "bool",
            ParamKind::Int64 => "int64",
            ParamKind::Float64 => "float64",
            ParamKind::String => "string",
            ParamKind::Bytes => "bytes",
            ParamKind::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Result<ParamKind, Error> {
        match s {
            "bool" => Ok(ParamKind::Bool),
            "int64" => Ok(ParamKind::Int64),
            "float64" => Ok(ParamKind::Float64),
            "string" => Ok(ParamKind::String),
            "bytes" => Ok(ParamKind::Bytes),
            "json" => Ok(ParamKind::Json),
            other => Err(Error::BadArguments(format!(
                "unsupported parameter kind {other:?}"
            ))),
        }
    }
}

/// A decoded, typed argument or result element.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl FunctionValue {
    fn decode(kind: ParamKind, value: &Value) -> Result<FunctionValue, Error> {
        let fail = || {
            Error::BadArguments(format!(
                "value {value} does not decode as {}",
                kind.wire_name()
            ))
        };
        match kind {
            ParamKind::Bool => value.as_bool().map(FunctionValue::Bool).ok_or_else(fail),
            ParamKind::Int64 => value.as_i64().map(FunctionValue::Int).ok_or_else(fail),
            ParamKind::Float64 => value.as_f64().map(FunctionValue::Float).ok_or_else(fail),
            ParamKind::String => value
                .as_str()
                .map(|s| FunctionValue::Text(s.to_string()))
                .ok_or_else(fail),
            ParamKind::Bytes => {
                let encoded = value.as_str().ok_or_else(fail)?;
                BASE64_STANDARD
                    .decode(encoded)
                    .map(FunctionValue::Bytes)
                    .map_err(|_| fail())
            }
            ParamKind::Json => Ok(FunctionValue::Json(value.clone())),
        }
    }

    pub fn into_json(self) -> Value {
        match self {
            FunctionValue::Bool(b) => Value::from(b),
            FunctionValue::Int(i) => Value::from(i),
            FunctionValue::Float(f) => Value::from(f),
            FunctionValue::Text(s) => Value::from(s),
            FunctionValue::Bytes(b) => Value::from(BASE64_STANDARD.encode(b)),
            FunctionValue::Json(v) => v,
        }
    }
}

/// The shapes a function result can take; each maps onto the tabular
/// response differently.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionReturn {
    /// One row, one column named `result`.
    Scalar(FunctionValue),
    /// One `result` row per element.
    Sequence(Vec<FunctionValue>),
    /// Columns named after the fields, one row of values.
    Object(Vec<(String, FunctionValue)>),
    /// One column per element, named `result_0..result_{n-1}`.
    Tuple(Vec<FunctionValue>),
}

/// Typed adapter around one registered function.
pub trait Invoker: Send + Sync {
    fn param_kinds(&self) -> &[ParamKind];

    /// Runs the function. An `Err` becomes a `function_error` response.
    fn invoke(&self, args: Vec<FunctionValue>) -> Result<FunctionReturn, String>;
}

type BoxedFn =
    Box<dyn Fn(Vec<FunctionValue>) -> Result<FunctionReturn, String> + Send + Sync + 'static>;

struct FnInvoker {
    kinds: Vec<ParamKind>,
    body: BoxedFn,
}

impl Invoker for FnInvoker {
    fn param_kinds(&self) -> &[ParamKind] {
        &self.kinds
    }

    fn invoke(&self, args: Vec<FunctionValue>) -> Result<FunctionReturn, String> {
        (self.body)(args)
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    map: HashMap<String, Arc<dyn Invoker>>,
}

impl RegistryBuilder {
    pub fn register(mut self, name: &str, invoker: Arc<dyn Invoker>) -> Self {
        self.map.insert(name.to_string(), invoker);
        self
    }

    /// Convenience registration from a closure.
    pub fn register_fn<F>(self, name: &str, kinds: Vec<ParamKind>, body: F) -> Self
    where
        F: Fn(Vec<FunctionValue>) -> Result<FunctionReturn, String> + Send + Sync + 'static,
    {
        self.register(
            name,
            Arc::new(FnInvoker {
                kinds,
                body: Box::new(body),
            }),
        )
    }

    pub fn build(self) -> Registry {
        Registry { map: self.map }
    }
}

/// Immutable after `build()`; reads are lock-free.
pub struct Registry {
    map: HashMap<String, Arc<dyn Invoker>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Invoker>> {
        self.map.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct WireCall {
    name: String,
    #[serde(default)]
    params: Vec<WireParam>,
}

#[derive(Debug, Deserialize)]
struct WireParam {
    #[serde(rename = "type")]
    kind: String,
    value: Value,
}

fn project(ret: FunctionReturn) -> Response {
    match ret {
        FunctionReturn::Scalar(v) => {
            Response::ok(vec!["result".into()], vec![vec![v.into_json()]])
        }
        FunctionReturn::Sequence(vs) => Response::ok(
            vec!["result".into()],
            vs.into_iter().map(|v| vec![v.into_json()]).collect(),
        ),
        FunctionReturn::Object(fields) => {
            let (columns, values): (Vec<String>, Vec<FunctionValue>) = fields.into_iter().unzip();
            Response::ok(
                columns,
                vec![values.into_iter().map(FunctionValue::into_json).collect()],
            )
        }
        FunctionReturn::Tuple(vs) => {
            let columns = (0..vs.len()).map(|i| format!("result_{i}")).collect();
            Response::ok(
                columns,
                vec![vs.into_iter().map(FunctionValue::into_json).collect()],
            )
        }
    }
}

/// Decodes the wire descriptor, validates it against the registration and
/// runs the function on the blocking pool.
pub async fn invoke_call(registry: &Registry, payload: &str) -> Result<Response, Error> {
    let call: WireCall = serde_json::from_str(payload)
        .map_err(|e| Error::BadArguments(format!("function payload is not valid JSON: {e}")))?;

    let invoker = registry
        .get(&call.name)
        .ok_or_else(|| Error::UnknownFunction(call.name.clone()))?;

    let declared = invoker.param_kinds();
    if declared.len() != call.params.len() {
        return Err(Error::BadArguments(format!(
            "function {:?} takes {} parameter(s), got {}",
            call.name,
            declared.len(),
            call.params.len()
        )));
    }

    let mut args = Vec::with_capacity(call.params.len());
    for (idx, (wire, &kind)) in call.params.iter().zip(declared.iter()).enumerate() {
        if wire.kind != kind.wire_name() {
            return Err(Error::BadArguments(format!(
                "parameter {idx} of {:?} is declared {}, got {:?}",
                call.name,
                kind.wire_name(),
                wire.kind
            )));
        }
        args.push(FunctionValue::decode(kind, &wire.value)?);
    }

    let name = call.name;
    let result = tokio::task::spawn_blocking(move || invoker.invoke(args))
        .await
        .map_err(|e| Error::Internal(format!("function {name:?} panicked: {e}")))?;

    match result {
        Ok(ret) => Ok(project(ret)),
        Err(msg) => Err(Error::Function(msg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Registry {
        Registry::builder()
            .register_fn("add", vec![ParamKind::Int64, ParamKind::Int64], |args| {
                let (a, b) = match (&args[0], &args[1]) {
                    (FunctionValue::Int(a), FunctionValue::Int(b)) => (*a, *b),
                    _ => return Err("expected two integers".into()),
                };
                Ok(FunctionReturn::Scalar(FunctionValue::Int(a + b)))
            })
            .register_fn("split", vec![ParamKind::String], |args| {
                let FunctionValue::Text(s) = &args[0] else {
                    return Err("expected a string".into());
                };
                Ok(FunctionReturn::Sequence(
                    s.split(',').map(|p| FunctionValue::Text(p.into())).collect(),
                ))
            })
            .register_fn("whoami", vec![], |_| {
                Ok(FunctionReturn::Object(vec![
                    ("name".into(), FunctionValue::Text("burrow".into())),
                    ("uid".into(), FunctionValue::Int(42)),
                ]))
            })
            .register_fn("divmod", vec![ParamKind::Int64, ParamKind::Int64], |args| {
                let (a, b) = match (&args[0], &args[1]) {
                    (FunctionValue::Int(a), FunctionValue::Int(b)) => (*a, *b),
                    _ => return Err("expected two integers".into()),
                };
                if b == 0 {
                    return Err("division by zero".into());
                }
                Ok(FunctionReturn::Tuple(vec![
                    FunctionValue::Int(a / b),
                    FunctionValue::Int(a % b),
                ]))
            })
            .build()
    }

    #[tokio::test]
    async fn scalar_result_is_one_cell() {
        let payload = r#"{"name":"add","params":[
            {"type":"int64","value":2},{"type":"int64","value":3}]}"#;
        let response = invoke_call(&registry(), payload).await.unwrap();
        assert_eq!(response.columns, vec!["result"]);
        assert_eq!(response.rows, vec![vec![json!(5)]]);
        assert!(response.error.is_empty());
    }

    #[tokio::test]
    async fn sequence_result_is_one_row_per_element() {
        let payload = r#"{"name":"split","params":[{"type":"string","value":"a,b,c"}]}"#;
        let response = invoke_call(&registry(), payload).await.unwrap();
        assert_eq!(response.columns, vec!["result"]);
        assert_eq!(
            response.rows,
            vec![vec![json!("a")], vec![json!("b")], vec![json!("c")]]
        );
    }

    #[tokio::test]
    async fn object_result_projects_fields_as_columns() {
        let payload = r#"{"name":"whoami","params":[]}"#;
        let response = invoke_call(&registry(), payload).await.unwrap();
        assert_eq!(response.columns, vec!["name", "uid"]);
        assert_eq!(response.rows, vec![vec![json!("burrow"), json!(42)]]);
    }

    #[tokio::test]
    async fn tuple_result_projects_successive_columns() {
        let payload = r#"{"name":"divmod","params":[
            {"type":"int64","value":7},{"type":"int64","value":2}]}"#;
        let response = invoke_call(&registry(), payload).await.unwrap();
        assert_eq!(response.columns, vec!["result_0", "result_1"]);
        assert_eq!(response.rows, vec![vec![json!(3), json!(1)]]);
    }

    #[tokio::test]
    async fn unknown_function() {
        let payload = r#"{"name":"nope","params":[]}"#;
        let err = invoke_call(&registry(), payload).await.unwrap_err();
        assert_eq!(err.kind(), "unknown_function");
    }

    #[tokio::test]
    async fn arity_mismatch_is_bad_arguments() {
        let payload = r#"{"name":"add","params":[{"type":"int64","value":2}]}"#;
        let err = invoke_call(&registry(), payload).await.unwrap_err();
        assert_eq!(err.kind(), "bad_arguments");
    }

    #[tokio::test]
    async fn kind_mismatch_is_bad_arguments() {
        let payload = r#"{"name":"add","params":[
            {"type":"string","value":"2"},{"type":"int64","value":3}]}"#;
        let err = invoke_call(&registry(), payload).await.unwrap_err();
        assert_eq!(err.kind(), "bad_arguments");
    }

    #[tokio::test]
    async fn value_not_decodable_is_bad_arguments() {
        let payload = r#"{"name":"add","params":[
            {"type":"int64","value":"two"},{"type":"int64","value":3}]}"#;
        let err = invoke_call(&registry(), payload).await.unwrap_err();
        assert_eq!(err.kind(), "bad_arguments");
    }

    #[tokio::test]
    async fn function_failure_maps_to_function_error() {
        let payload = r#"{"name":"divmod","params":[
            {"type":"int64","value":1},{"type":"int64","value":0}]}"#;
        let err = invoke_call(&registry(), payload).await.unwrap_err();
        assert_eq!(err.kind(), "function_error");
        assert!(err.to_wire().contains("division by zero"));
    }

    #[tokio::test]
    async fn malformed_payload_is_bad_arguments() {
        let err = invoke_call(&registry(), "not json").await.unwrap_err();
        assert_eq!(err.kind(), "bad_arguments");
    }

    #[test]
    fn bytes_round_trip_base64() {
        let decoded =
            FunctionValue::decode(ParamKind::Bytes, &json!("aGVsbG8=")).unwrap();
        assert_eq!(decoded, FunctionValue::Bytes(b"hello".to_vec()));
        assert_eq!(decoded.into_json(), json!("aGVsbG8="));
    }
}
