use std::process;

use burrowctl::app;
use burrowctl::config::{Config, Dsn};
use burrowctl::errors::Error;
use burrowctl::functions::Registry;
use log::{error, info};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    let args = app::parse();

    let dsn = match args.dsn.as_deref().map(Dsn::parse).transpose() {
        Ok(dsn) => dsn,
        Err(e) => {
            eprintln!("Invalid --dsn: {e}");
            process::exit(exitcode::CONFIG);
        }
    };

    app::init_logging(&args, dsn.as_ref().map(|d| d.debug).unwrap_or(false));

    let mut config = match Config::load(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            process::exit(exitcode::CONFIG);
        }
    };
    if let Some(dsn) = &dsn {
        config.apply_dsn(dsn);
    }
    if let Err(e) = config.validate() {
        error!("{e}");
        process::exit(exitcode::CONFIG);
    }
    if args.test_config {
        info!("Configuration OK");
        process::exit(exitcode::OK);
    }

    // The embedding deployment registers its functions here; the bare
    // server ships with an empty registry.
    let registry = Registry::builder().build();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("burrowctl-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Cannot start runtime: {e}");
            process::exit(exitcode::OSERR);
        }
    };

    match runtime.block_on(app::run_server(config, registry)) {
        Ok(()) => process::exit(exitcode::OK),
        Err(Error::BadConfig(e)) => {
            error!("Bad configuration: {e}");
            process::exit(exitcode::CONFIG);
        }
        Err(Error::Broker(e)) => {
            error!("Broker unavailable: {e}");
            process::exit(exitcode::UNAVAILABLE);
        }
        Err(e) => {
            error!("Fatal: {e}");
            process::exit(exitcode::SOFTWARE);
        }
    }
}
