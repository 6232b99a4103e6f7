use clap::{Parser, ValueEnum};
use tracing::Level;

/// BurrowCtl: broker-mediated remote execution server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(default_value_t = String::from("burrowctl.toml"), env = "BURROWCTL_CONFIG")]
    pub config_file: String,

    #[arg(short, long, default_value_t = tracing::Level::INFO, env = "BURROWCTL_LOG_LEVEL")]
    pub log_level: Level,

    #[clap(short = 'F', long, value_enum, default_value_t = LogFormat::Text, env = "BURROWCTL_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[arg(
        short,
        long,
        default_value_t = false,
        env = "BURROWCTL_NO_COLOR",
        help = "disable colors in the log output"
    )]
    pub no_color: bool,

    #[arg(
        long,
        env = "BURROWCTL_DSN",
        help = "connection string: deviceID=<id>&amqp_uri=<url>&timeout=<dur>&debug=<bool>; overrides the [broker] section"
    )]
    pub dsn: Option<String>,

    #[arg(
        short = 't',
        long = "test-config",
        default_value_t = false,
        help = "validate the configuration and exit"
    )]
    pub test_config: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogFormat {
    Text,
    Structured,
    Debug,
}

pub fn parse() -> Args {
    Args::parse()
}
