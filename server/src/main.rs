use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use granary_server::config::{self, LogConfig, LogMode};

/// Content-addressed caching proxy for Nix binary caches.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long)]
    config: PathBuf,

    /// Socket address to listen on.
    ///
    /// This overrides `listen` in the config.
    #[clap(short = 'l', long)]
    listen: Option<SocketAddr>,

    /// Mode to run.
    #[clap(long, default_value = "server")]
    mode: ServerMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServerMode {
    /// Run the API server, the copy queue, and the periodic garbage collector.
    Server,

    /// Run garbage collection then exit.
    GarbageCollectorOnce,

    /// Re-hash every stored chunk then exit.
    VerifyOnce,

    /// Check the configuration then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    let config = match config::load_config(&opts.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error reading configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config.log);
    dump_version();

    // an unloadable secret key is fatal
    config::load_keys(&config)?;

    tracing::info!("Using configuration: {:?}", opts.config);

    match opts.mode {
        ServerMode::Server => {
            let (server_ret, gc_ret) = tokio::join!(
                granary_server::run_server(opts.listen, config.clone()),
                granary_server::run_gc_loop(config.clone()),
            );

            server_ret?;
            gc_ret?;
        }
        ServerMode::GarbageCollectorOnce => {
            granary_server::run_gc_once(config).await?;
        }
        ServerMode::VerifyOnce => {
            granary_server::run_verify_once(config).await?;
        }
        ServerMode::CheckConfig => {
            eprintln!("Config looks good!");
        }
    }

    Ok(())
}

fn init_logging(log: &LogConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    match log.mode {
        LogMode::Full => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);
            let error_layer = ErrorLayer::default();

            tracing_subscriber::registry()
                .with(fmt_layer)
                .with(error_layer)
                .init();
        }
        LogMode::Compact => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_filter(env_filter);
            let error_layer = ErrorLayer::default();

            tracing_subscriber::registry()
                .with(fmt_layer)
                .with(error_layer)
                .init();
        }
        LogMode::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_filter(env_filter);
            let error_layer = ErrorLayer::default();

            tracing_subscriber::registry()
                .with(fmt_layer)
                .with(error_layer)
                .init();
        }
    }
}

fn dump_version() {
    #[cfg(debug_assertions)]
    eprintln!("granary {} (debug)", env!("CARGO_PKG_VERSION"));

    #[cfg(not(debug_assertions))]
    eprintln!("granary {} (release)", env!("CARGO_PKG_VERSION"));
}
