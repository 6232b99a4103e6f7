//! Request routing.
//!
//! One entry point turns an admitted request into exactly one response.
//! Deadlines are enforced here for the SQL and function branches; the
//! command branch enforces its own so the process tree gets its SIGTERM
//! grace before SIGKILL. Panics anywhere below are caught and turned into
//! `internal_error` responses; nothing propagates out of a worker.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::error;
use serde_json::Value;
use std::panic::AssertUnwindSafe;

use crate::command;
use crate::errors::Error;
use crate::functions::{invoke_call, Registry};
use crate::protocol::{Request, RequestKind, Response};
use crate::sql::SqlExecutor;
use crate::stats::ServerStats;

/// The time budget of one request: the clamped total and what is left of
/// it after queueing.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineBudget {
    pub total: Duration,
    pub remaining: Duration,
}

impl DeadlineBudget {
    pub fn total_ms(&self) -> u64 {
        self.total.as_millis() as u64
    }
}

pub struct Dispatcher {
    sql: SqlExecutor,
    registry: Arc<Registry>,
    stats: Arc<ServerStats>,
}

fn describe_panic(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic of unknown type".to_string()
    }
}

/// §4.H: stdout becomes one `output` row per line; on failure stderr rows
/// are appended for diagnostics alongside the `command_failed` error.
fn command_response(output: command::CommandOutput) -> Response {
    let mut rows: Vec<Vec<Value>> = output
        .stdout
        .iter()
        .map(|line| vec![Value::from(line.as_str())])
        .collect();

    if output.exit_code == 0 {
        return Response::ok(vec!["output".into()], rows);
    }

    rows.extend(
        output
            .stderr
            .iter()
            .map(|line| vec![Value::from(line.as_str())]),
    );
    Response {
        columns: vec!["output".into()],
        rows,
        error: Error::CommandFailed {
            code: output.exit_code,
        }
        .to_wire(),
    }
}

impl Dispatcher {
    pub fn new(sql: SqlExecutor, registry: Arc<Registry>, stats: Arc<ServerStats>) -> Dispatcher {
        Dispatcher {
            sql,
            registry,
            stats,
        }
    }

    pub async fn dispatch(
        &self,
        kind: RequestKind,
        request: &Request,
        budget: DeadlineBudget,
    ) -> Response {
        if budget.remaining.is_zero() {
            ServerStats::incr(&self.stats.deadline_exceeded);
            return Response::from_error(&Error::DeadlineExceeded(budget.total_ms()));
        }

        let outcome = AssertUnwindSafe(self.route(kind, request, budget))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let what = describe_panic(panic);
                error!("request {} panicked: {what}", request.id);
                Err(Error::Internal(what))
            });

        match outcome {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    Error::DeadlineExceeded(_) => ServerStats::incr(&self.stats.deadline_exceeded),
                    Error::Internal(_) => ServerStats::incr(&self.stats.internal_errors),
                    _ => {}
                }
                Response::from_error(&err)
            }
        }
    }

    async fn route(
        &self,
        kind: RequestKind,
        request: &Request,
        budget: DeadlineBudget,
    ) -> Result<Response, Error> {
        match kind {
            RequestKind::Sql => {
                ServerStats::incr(&self.stats.sql_requests);
                tokio::time::timeout(
                    budget.remaining,
                    self.sql
                        .execute(&request.payload, &request.params, budget.remaining),
                )
                .await
                .map_err(|_| Error::DeadlineExceeded(budget.total_ms()))?
            }
            RequestKind::Function => {
                ServerStats::incr(&self.stats.function_requests);
                tokio::time::timeout(
                    budget.remaining,
                    invoke_call(&self.registry, &request.payload),
                )
                .await
                .map_err(|_| Error::DeadlineExceeded(budget.total_ms()))?
            }
            RequestKind::Command => {
                ServerStats::incr(&self.stats.command_requests);
                let output = command::run(&request.payload, budget.remaining).await?;
                Ok(command_response(output))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryCache;
    use crate::config::{Cache as CacheConfig, Database};
    use crate::dbpool::DbPool;
    use crate::functions::{FunctionReturn, FunctionValue, ParamKind};
    use serde_json::json;

    fn request(kind: RequestKind, payload: &str) -> Request {
        Request {
            id: "t-1".into(),
            kind: kind.as_str().into(),
            payload: payload.into(),
            params: Vec::new(),
            client_id: "tester".into(),
            deadline_ms: 0,
        }
    }

    fn budget(ms: u64) -> DeadlineBudget {
        DeadlineBudget {
            total: Duration::from_millis(ms),
            remaining: Duration::from_millis(ms),
        }
    }

    fn dispatcher(registry: Registry) -> Dispatcher {
        // The pool dials lazily; function and command dispatch never touch
        // the database.
        let database = Database {
            uri: "postgres://u:p@127.0.0.1:5432/db".into(),
            ..Database::default()
        };
        let pool = DbPool::new(&database).unwrap();
        let cache = Arc::new(QueryCache::new(&CacheConfig::default(), 2));
        Dispatcher::new(
            SqlExecutor::new(pool, cache),
            Arc::new(registry),
            Arc::new(ServerStats::default()),
        )
    }

    fn test_registry() -> Registry {
        Registry::builder()
            .register_fn("add", vec![ParamKind::Int64, ParamKind::Int64], |args| {
                let (FunctionValue::Int(a), FunctionValue::Int(b)) = (&args[0], &args[1]) else {
                    return Err("bad args".into());
                };
                Ok(FunctionReturn::Scalar(FunctionValue::Int(a + b)))
            })
            .register_fn("boom", vec![], |_| panic!("kaboom"))
            .build()
    }

    #[tokio::test]
    async fn function_request_round_trips() {
        let dispatcher = dispatcher(test_registry());
        let payload = r#"{"name":"add","params":[
            {"type":"int64","value":2},{"type":"int64","value":3}]}"#;
        let request = request(RequestKind::Function, payload);

        let response = dispatcher
            .dispatch(RequestKind::Function, &request, budget(5000))
            .await;
        assert!(response.error.is_empty(), "error: {}", response.error);
        assert_eq!(response.columns, vec!["result"]);
        assert_eq!(response.rows, vec![vec![json!(5)]]);
    }

    #[tokio::test]
    async fn command_request_round_trips() {
        let dispatcher = dispatcher(test_registry());
        let request = request(RequestKind::Command, "sh -c 'echo hello; echo world'");

        let response = dispatcher
            .dispatch(RequestKind::Command, &request, budget(5000))
            .await;
        assert!(response.error.is_empty());
        assert_eq!(response.columns, vec!["output"]);
        assert_eq!(response.rows, vec![vec![json!("hello")], vec![json!("world")]]);
    }

    #[tokio::test]
    async fn failed_command_reports_exit_code_and_stderr() {
        let dispatcher = dispatcher(test_registry());
        let request = request(
            RequestKind::Command,
            "sh -c 'echo out; echo err >&2; exit 7'",
        );

        let response = dispatcher
            .dispatch(RequestKind::Command, &request, budget(5000))
            .await;
        assert_eq!(response.error, "command_failed: 7");
        assert_eq!(response.rows, vec![vec![json!("out")], vec![json!("err")]]);
    }

    #[tokio::test]
    async fn exhausted_budget_short_circuits() {
        let dispatcher = dispatcher(test_registry());
        let request = request(RequestKind::Command, "echo unreachable");

        let response = dispatcher
            .dispatch(
                RequestKind::Command,
                &request,
                DeadlineBudget {
                    total: Duration::from_millis(500),
                    remaining: Duration::ZERO,
                },
            )
            .await;
        assert!(response.error.starts_with("deadline_exceeded"));
        assert!(response.rows.is_empty());
    }

    #[tokio::test]
    async fn panicking_function_becomes_internal_error() {
        let dispatcher = dispatcher(test_registry());
        let request = request(RequestKind::Function, r#"{"name":"boom","params":[]}"#);

        let response = dispatcher
            .dispatch(RequestKind::Function, &request, budget(5000))
            .await;
        assert!(response.error.starts_with("internal_error"), "{}", response.error);
    }

    #[tokio::test]
    async fn slow_function_hits_the_deadline() {
        let registry = Registry::builder()
            .register_fn("nap", vec![], |_| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(FunctionReturn::Scalar(FunctionValue::Bool(true)))
            })
            .build();
        let dispatcher = dispatcher(registry);
        let request = request(RequestKind::Function, r#"{"name":"nap","params":[]}"#);

        let response = dispatcher
            .dispatch(RequestKind::Function, &request, budget(50))
            .await;
        assert!(response.error.starts_with("deadline_exceeded"));
    }
}
