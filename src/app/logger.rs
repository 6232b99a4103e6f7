use log::info;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use super::args::{Args, LogFormat};
use crate::config::VERSION;

/// Initializes the tracing backend; `log` macro records flow through it.
/// A `debug=true` DSN raises the floor to DEBUG.
pub fn init_logging(args: &Args, dsn_debug: bool) {
    let level = if dsn_debug {
        std::cmp::max(args.log_level, Level::DEBUG)
    } else {
        args.log_level
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!args.no_color);

    match args.log_format {
        LogFormat::Structured => subscriber.json().init(),
        LogFormat::Debug => subscriber.pretty().init(),
        LogFormat::Text => subscriber.init(),
    }

    info!("Welcome to BurrowCtl! (Version {VERSION})");
}
