//! filepool: a pooled file-transfer server and its load-testing harness
//!
//! Subcommands:
//! - `serve`: file server backed by a thread or process pool
//! - `batch`: one batch of concurrent client operations
//! - `grid`: grid search over server and client settings, CSV report
//! - `client`: single LIST/GET/UPLOAD/DELETE request
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod config;
mod dispatch;
mod grid;
mod pool;
mod protocol;
mod server;
mod signal;
mod storage;

use client::{BatchRunner, ClientOpTask, DriverConfig, OpDriver, PayloadCatalog};
use config::{ClientRequest, Config, Role};
use dispatch::Dispatcher;
use grid::GridSearch;
use server::{ConnectionTask, Server};
use signal::ShutdownFlag;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();

    match config.role {
        Role::Serve(server_config) => {
            info!(
                host = %server_config.host,
                port = server_config.port,
                mode = %server_config.mode,
                workers = server_config.workers,
                root = %server_config.root.display(),
                "Starting filepool server"
            );
            let shutdown = ShutdownFlag::new();
            signal::watch_signals(shutdown.clone())?;
            Server::bind(server_config)?.run(&shutdown)?;
        }
        Role::Batch { driver, request } => {
            if request.action == client::Action::Upload {
                prepare_payload(&driver, &request.payload_key);
            }
            BatchRunner::new(driver, config.log_level).run(&request)?;
        }
        Role::Grid(grid_config) => {
            let shutdown = ShutdownFlag::new();
            signal::watch_signals(shutdown.clone())?;
            let outcome = GridSearch::new(grid_config, shutdown).run()?;
            info!(
                rows = outcome.rows,
                skipped_configs = outcome.skipped_configs,
                interrupted = outcome.interrupted,
                "Grid search finished"
            );
        }
        Role::Client { driver, request } => run_client(OpDriver::new(driver), request)?,
        Role::ConnectionWorker { root } => {
            pool::run_worker::<ConnectionTask>(Dispatcher::open(&root)?)?;
        }
        Role::ClientOpWorker { driver } => {
            pool::run_worker::<ClientOpTask>(OpDriver::new(driver))?;
        }
    }
    Ok(())
}

/// Create the upload source for `key` if it is missing
fn prepare_payload(driver: &DriverConfig, key: &str) {
    let Some(entry) = driver.payloads.get(key) else {
        return;
    };
    let single = PayloadCatalog::from(vec![entry.clone()]);
    if let Err(e) = single.ensure_files(&driver.payload_dir) {
        warn!(payload = key, error = %e, "Failed to create dummy payload");
    }
}

fn run_client(driver: OpDriver, request: ClientRequest) -> Result<(), client::ClientError> {
    match request {
        ClientRequest::List => {
            let files = driver.list()?;
            if files.is_empty() {
                println!("(no files)");
            }
            for name in files {
                println!("{}", name);
            }
        }
        ClientRequest::Get { name, out } => {
            let contents = driver.get(&name)?;
            let path = config::download_target(&out, &name);
            std::fs::write(&path, &contents)
                .map_err(|e| client::ClientError::LocalFile(path.clone(), e))?;
            println!("Saved {} ({} bytes) to {}", name, contents.len(), path.display());
        }
        ClientRequest::Upload { path } => {
            let bytes = driver.upload(&path)?;
            println!("Uploaded {} ({} bytes)", path.display(), bytes);
        }
        ClientRequest::Delete { name } => {
            println!("{}", driver.delete(&name)?);
        }
    }
    Ok(())
}
