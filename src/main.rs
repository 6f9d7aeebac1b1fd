//! bertrpc: a BERT-RPC server
//!
//! Serves `{call, ...}` and `{cast, ...}` requests over length-prefixed
//! BERT frames.
//!
//! Features:
//! - Call/cast dispatch to registered module functions
//! - Functions run on a blocking pool, isolated from socket handling
//! - Built-in `berp` module (ping, echo, sleep) for health checks
//! - Configuration via CLI arguments or TOML file

use bertrpc::{builtin, Config, DispatchTable, Server};
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> Result<(), BoxError> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config)?;

    info!(
        host = %config.host,
        port = config.port,
        workers = ?config.workers,
        blocking_threads = config.blocking_threads,
        max_connections = config.max_connections,
        max_frame_size = config.max_frame_size,
        "Starting bertrpc server"
    );

    let mut table = DispatchTable::new();
    table.add_module(builtin::module());

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder
        .enable_all()
        .thread_name("bertrpc-worker")
        .max_blocking_threads(config.blocking_threads);
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(serve(config, table))
}

async fn serve(config: Config, table: DispatchTable) -> Result<(), BoxError> {
    let server = Server::new(config, table);

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
            Ok(())
        }
    }
}

/// Install the fmt subscriber. `RUST_LOG` overrides the configured level.
fn init_logging(config: &Config) -> std::io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            subscriber
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => subscriber.init(),
    }

    Ok(())
}
