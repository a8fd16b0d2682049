//! Grid-search orchestrator.
//!
//! Iterates `server kind x server workers x operation x payload x client
//! workers`. For every server configuration a `filepool serve` subprocess is
//! started, probed with `LIST` until ready, driven with one batch per client
//! worker count, and stopped before the next configuration starts. Every
//! completed batch becomes one report row.

pub mod process;
pub mod report;

pub use process::{ReadinessError, ServerProcess, StopPolicy};
pub use report::{ReportRow, ReportWriter};

use crate::client::{Action, BatchRequest, BatchRunner, DriverConfig, OpDriver, PayloadCatalog};
use crate::pool::PoolKind;
use crate::signal::ShutdownFlag;
use std::ffi::OsString;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Timeout for a single readiness probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One point of the grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridCell {
    pub server_kind: PoolKind,
    pub server_workers: usize,
    pub operation: Action,
    pub payload_key: String,
    pub client_workers: usize,
    pub client_mode: PoolKind,
}

/// Resolved grid settings
#[derive(Debug, Clone)]
pub struct GridConfig {
    pub host: String,
    pub port: u16,
    pub server_kinds: Vec<PoolKind>,
    pub operations: Vec<Action>,
    pub payloads: Vec<String>,
    pub client_workers: Vec<usize>,
    pub server_workers: Vec<usize>,
    /// Operations per cell; the client worker count when unset
    pub ops_per_cell: Option<usize>,
    pub client_mode: PoolKind,
    pub output: PathBuf,
    pub payload_dir: PathBuf,
    pub catalog: PayloadCatalog,
    pub client_timeout: Duration,
    pub root: PathBuf,
    pub log_dir: PathBuf,
    pub settle_delay: Duration,
    pub startup_wait: Duration,
    pub readiness_interval: Duration,
    pub pause_between_tests: Duration,
    pub pause_between_servers: Duration,
    pub stop_policy: StopPolicy,
    pub server_bin: PathBuf,
    pub log_level: String,
}

/// Grid errors. Everything else is logged and skipped.
#[derive(Debug)]
pub enum GridError {
    /// The target address did not resolve
    Address(String, io::Error),
    Spawn(String, io::Error),
    LogFile(PathBuf, io::Error),
    Report(PathBuf, csv::Error),
    /// A server survived SIGKILL
    Unkillable(u32),
    Io(io::Error),
}

impl std::fmt::Display for GridError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GridError::Address(addr, e) => write!(f, "Invalid server address '{}': {}", addr, e),
            GridError::Spawn(program, e) => write!(f, "Failed to start '{}': {}", program, e),
            GridError::LogFile(path, e) => {
                write!(f, "Failed to open log file '{}': {}", path.display(), e)
            }
            GridError::Report(path, e) => {
                write!(f, "Failed to write report '{}': {}", path.display(), e)
            }
            GridError::Unkillable(pid) => {
                write!(f, "Server process {} did not exit after SIGKILL", pid)
            }
            GridError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GridError {}

/// What a grid run produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GridOutcome {
    pub rows: u64,
    pub skipped_configs: u64,
    pub interrupted: bool,
}

/// Runs the grid, one server at a time.
pub struct GridSearch {
    config: GridConfig,
    shutdown: ShutdownFlag,
}

impl GridSearch {
    pub fn new(config: GridConfig, shutdown: ShutdownFlag) -> Self {
        Self { config, shutdown }
    }

    fn target(&self) -> Result<SocketAddr, GridError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        addr.to_socket_addrs()
            .map_err(|e| GridError::Address(addr.clone(), e))?
            .next()
            .ok_or_else(|| {
                GridError::Address(addr.clone(), io::Error::other("no address resolved"))
            })
    }

    fn server_args(&self, kind: PoolKind, workers: usize) -> Vec<OsString> {
        let cfg = &self.config;
        vec![
            "--log-level".into(),
            cfg.log_level.clone().into(),
            "serve".into(),
            "--host".into(),
            cfg.host.clone().into(),
            "--port".into(),
            cfg.port.to_string().into(),
            "--mode".into(),
            kind.as_str().into(),
            "--workers".into(),
            workers.to_string().into(),
            "--root".into(),
            cfg.root.clone().into_os_string(),
        ]
    }

    /// Run the whole grid and write the report.
    pub fn run(&self) -> Result<GridOutcome, GridError> {
        let cfg = &self.config;
        let target = self.target()?;

        // Only the payloads this grid uses are generated
        let needed = PayloadCatalog::from(
            cfg.catalog
                .iter()
                .filter(|entry| cfg.payloads.contains(&entry.key))
                .cloned()
                .collect::<Vec<_>>(),
        );
        if let Err(e) = needed.ensure_files(&cfg.payload_dir) {
            error!(dir = %cfg.payload_dir.display(), error = %e, "Failed to create dummy payloads");
        }

        let driver = DriverConfig {
            target,
            timeout: cfg.client_timeout,
            payload_dir: cfg.payload_dir.clone(),
            payloads: cfg.catalog.clone(),
        };
        let runner = BatchRunner::new(driver.clone(), cfg.log_level.clone());
        let seeder = OpDriver::new(driver.clone());
        let probe = OpDriver::new(DriverConfig {
            timeout: PROBE_TIMEOUT,
            ..driver
        });

        info!(
            server = %target,
            server_kinds = ?cfg.server_kinds,
            server_workers = ?cfg.server_workers,
            operations = ?cfg.operations,
            payloads = ?cfg.payloads,
            client_workers = ?cfg.client_workers,
            client_mode = %cfg.client_mode,
            "Starting grid search"
        );

        let mut report = ReportWriter::new(&cfg.output);
        let mut outcome = GridOutcome::default();

        'servers: for &kind in &cfg.server_kinds {
            for &workers in &cfg.server_workers {
                if self.shutdown.is_triggered() {
                    break 'servers;
                }
                info!(kind = %kind, workers, "----- Preparing server configuration -----");

                let ready = self.run_server_config(
                    kind,
                    workers,
                    &runner,
                    &seeder,
                    &probe,
                    &mut report,
                )?;
                if !ready {
                    outcome.skipped_configs += 1;
                }

                info!(
                    pause_s = cfg.pause_between_servers.as_secs(),
                    "Waiting before the next server configuration"
                );
                if !self.shutdown.sleep(cfg.pause_between_servers) {
                    break 'servers;
                }
            }
        }

        outcome.rows = report.rows();
        outcome.interrupted = self.shutdown.is_triggered();
        if outcome.interrupted {
            warn!("Grid search interrupted");
        }
        if outcome.rows == 0 {
            info!("No test results were generated, no report written");
        } else {
            info!(path = %report.path().display(), rows = outcome.rows, "Grid results written");
        }
        Ok(outcome)
    }

    /// Start, drive and stop one server. Returns `false` if the server never
    /// became ready.
    fn run_server_config(
        &self,
        kind: PoolKind,
        workers: usize,
        runner: &BatchRunner,
        seeder: &OpDriver,
        probe: &OpDriver,
        report: &mut ReportWriter,
    ) -> Result<bool, GridError> {
        let cfg = &self.config;
        let label = format!("server_{}_w{}_p{}", kind, workers, cfg.port);
        let args = self.server_args(kind, workers);

        let mut server = match ServerProcess::spawn(&cfg.server_bin, &args, &cfg.log_dir, &label) {
            Ok(server) => server,
            Err(e) => {
                error!(kind = %kind, workers, error = %e, "Failed to start server, skipping configuration");
                return Ok(false);
            }
        };
        // A forced exit on a second signal takes the server down with it
        self.shutdown.track_group(server.pid());

        let ready = if self.shutdown.sleep(cfg.settle_delay) {
            server.wait_ready(
                || answers_list(probe),
                cfg.startup_wait,
                cfg.readiness_interval,
                &self.shutdown,
            )
        } else {
            Err(ReadinessError::Interrupted)
        };

        let result = match ready {
            Ok(()) => {
                info!(kind = %kind, workers, "Server is up, running client tests");
                self.run_cells(kind, workers, &mut server, runner, seeder, report)
                    .map(|()| true)
            }
            Err(e) => {
                let (stdout_log, stderr_log) = server.log_paths();
                error!(
                    kind = %kind,
                    workers,
                    reason = %e,
                    stderr = %stderr_log.display(),
                    stdout = %stdout_log.display(),
                    "Server failed to become ready, skipping configuration"
                );
                Ok(false)
            }
        };

        // A server that cannot be killed ends the run
        let stopped = server.stop(&cfg.stop_policy);
        self.shutdown.release_group();
        stopped?;
        info!(kind = %kind, workers, "----- Finished server configuration -----");
        result
    }

    fn run_cells(
        &self,
        kind: PoolKind,
        server_workers: usize,
        server: &mut ServerProcess,
        runner: &BatchRunner,
        seeder: &OpDriver,
        report: &mut ReportWriter,
    ) -> Result<(), GridError> {
        let cfg = &self.config;

        for &operation in &cfg.operations {
            for payload_key in &cfg.payloads {
                let Some(entry) = cfg.catalog.get(payload_key) else {
                    let known: Vec<&str> = cfg.catalog.keys().collect();
                    warn!(payload = %payload_key, ?known, "Skipping unknown payload");
                    continue;
                };

                match operation {
                    Action::Upload => {
                        let source = cfg.payload_dir.join(&entry.file);
                        if !source.exists() {
                            error!(
                                payload = %payload_key,
                                source = %source.display(),
                                "Upload source not found, skipping payload"
                            );
                            continue;
                        }
                    }
                    Action::Download => seed(seeder, &cfg.payload_dir.join(&entry.file), &entry.file),
                    Action::List | Action::Delete => {}
                }

                for &client_workers in &cfg.client_workers {
                    if self.shutdown.is_triggered() {
                        return Ok(());
                    }
                    if !server.is_running() {
                        error!(pid = server.pid(), "Server died, skipping the rest of this configuration");
                        return Ok(());
                    }

                    let cell = GridCell {
                        server_kind: kind,
                        server_workers,
                        operation,
                        payload_key: payload_key.clone(),
                        client_workers,
                        client_mode: cfg.client_mode,
                    };
                    let run = report.rows() + 1;
                    info!(
                        run,
                        server_kind = %kind,
                        server_workers,
                        operation = %operation,
                        payload = %payload_key,
                        client_workers,
                        client_mode = %cfg.client_mode,
                        "--- Grid test ---"
                    );

                    let request = BatchRequest {
                        action: operation,
                        payload_key: payload_key.clone(),
                        workers: client_workers,
                        total_ops: cfg.ops_per_cell.unwrap_or(client_workers),
                        mode: cfg.client_mode,
                    };
                    match runner.run(&request) {
                        Ok(summary) => {
                            let row = ReportRow::new(run, &cell, entry.size_mb, &summary);
                            report
                                .append(&row)
                                .map_err(|e| GridError::Report(report.path().to_path_buf(), e))?;
                            info!(
                                run,
                                succeeded = summary.ops_successful,
                                total = request.total_ops,
                                avg_duration_s = %row.avg_duration,
                                avg_throughput_mib_s = %row.avg_throughput,
                                "Grid test finished"
                            );
                        }
                        Err(e) => error!(run, error = %e, "Batch could not run, no row recorded"),
                    }

                    if !self.shutdown.sleep(cfg.pause_between_tests) {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

/// A server is ready once LIST comes back with status OK.
fn answers_list(driver: &OpDriver) -> bool {
    driver.list().is_ok()
}

/// Make sure the server holds `remote_name` before a download cell.
fn seed(seeder: &OpDriver, source: &std::path::Path, remote_name: &str) {
    match seeder.list() {
        Ok(files) if files.iter().any(|f| f == remote_name) => return,
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, "Could not list server files before seeding");
            return;
        }
    }
    info!(file = remote_name, "Seeding server for download tests");
    if let Err(e) = seeder.upload_as(source, remote_name) {
        warn!(file = remote_name, error = %e, "Seeding failed, downloads will fail");
    }
}
