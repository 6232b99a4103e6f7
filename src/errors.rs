//! Errors.
//!
//! Every failure a request can hit maps to a stable wire kind via
//! [`Error::kind`]; the response carries `"<kind>: <detail>"`. Startup-side
//! errors (config, broker connect) never reach the wire.

/// Various errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    BadEnvelope(String),
    #[error("request type {0:?} is not one of sql, function, command")]
    UnknownType(String),
    #[error("client {0:?} is over quota")]
    RateLimited(String),
    #[error("worker queue is full")]
    ServerBusy,
    #[error("request did not finish within {0}ms")]
    DeadlineExceeded(u64),
    #[error("{0}")]
    DbUnavailable(String),
    #[error("{0}")]
    Sql(String),
    #[error("{0}")]
    Scan(String),
    #[error("function {0:?} is not registered")]
    UnknownFunction(String),
    #[error("{0}")]
    BadArguments(String),
    #[error("{0}")]
    Function(String),
    #[error("command exited with code {code}")]
    CommandFailed { code: i32 },
    #[error("{0}")]
    Internal(String),

    // Startup and lifecycle. Not request errors; kind() degrades to
    // internal_error should one ever be rendered into a response.
    #[error("bad configuration: {0}")]
    BadConfig(String),
    #[error(transparent)]
    Broker(#[from] lapin::Error),
    #[error("shutting down")]
    ShuttingDown,
}

impl Error {
    /// Stable machine-readable kind, used as the response error prefix.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadEnvelope(_) => "bad_envelope",
            Error::UnknownType(_) => "unknown_type",
            Error::RateLimited(_) => "rate_limited",
            Error::ServerBusy => "server_busy",
            Error::DeadlineExceeded(_) => "deadline_exceeded",
            Error::DbUnavailable(_) => "db_unavailable",
            Error::Sql(_) => "sql_error",
            Error::Scan(_) => "scan_error",
            Error::UnknownFunction(_) => "unknown_function",
            Error::BadArguments(_) => "bad_arguments",
            Error::Function(_) => "function_error",
            Error::CommandFailed { .. } => "command_failed",
            Error::Internal(_)
            | Error::BadConfig(_)
            | Error::Broker(_)
            | Error::ShuttingDown => "internal_error",
        }
    }

    /// Renders the error the way it travels in `Response.error`.
    ///
    /// `command_failed` carries the exit code right after the kind so that
    /// clients can parse `command_failed: <exit>` as documented.
    pub fn to_wire(&self) -> String {
        match self {
            Error::CommandFailed { code } => format!("command_failed: {code}"),
            other => format!("{}: {}", other.kind(), other),
        }
    }

}
