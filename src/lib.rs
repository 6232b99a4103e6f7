pub mod app;
pub mod broker;
pub mod cache;
pub mod command;
pub mod config;
pub mod dbpool;
pub mod dispatch;
pub mod errors;
pub mod functions;
pub mod limiter;
pub mod prometheus;
pub mod protocol;
pub mod sql;
pub mod stats;
pub mod utils;
pub mod workers;

pub use errors::Error;
pub use functions::{FunctionReturn, FunctionValue, Invoker, ParamKind, Registry};
