//! Configuration module for filepool.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::client::{Action, BatchRequest, DriverConfig, PayloadCatalog, DEFAULT_TIMEOUT};
use crate::grid::{GridConfig, StopPolicy};
use crate::pool::PoolKind;
use crate::server::{default_workers, ServerConfig};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "filepool")]
#[command(version = "0.1.0")]
#[command(about = "Pooled file-transfer server and grid-search load tester", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the file server
    Serve(ServeArgs),
    /// Run one batch of operations against a running server
    Batch(BatchArgs),
    /// Run the grid search and write a CSV report
    Grid(GridArgs),
    /// Send a single request to a running server
    Client(ClientArgs),
    /// Worker process entry point
    #[command(hide = true)]
    Worker {
        #[command(subcommand)]
        role: WorkerArgs,
    },
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Worker pool kind
    #[arg(short, long, value_enum)]
    pub mode: Option<PoolKind>,
    /// Number of workers (defaults depend on the mode)
    #[arg(short, long)]
    pub workers: Option<usize>,
    /// Directory holding the served files
    #[arg(long)]
    pub root: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    #[arg(short, long, value_enum)]
    pub action: Action,
    /// Payload key from the catalog
    #[arg(long, default_value = "10MB")]
    pub payload: String,
    #[arg(short, long, default_value_t = 1)]
    pub workers: usize,
    /// Total number of operations
    #[arg(long, default_value_t = 1)]
    pub ops: usize,
    #[arg(short, long, value_enum, default_value = "thread")]
    pub mode: PoolKind,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(short, long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub payload_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct GridArgs {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(short, long)]
    pub port: Option<u16>,
    #[arg(long, value_enum, value_delimiter = ',')]
    pub server_kinds: Option<Vec<PoolKind>>,
    #[arg(long, value_enum, value_delimiter = ',')]
    pub operations: Option<Vec<Action>>,
    #[arg(long, value_delimiter = ',')]
    pub payloads: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub client_workers: Option<Vec<usize>>,
    #[arg(long, value_delimiter = ',')]
    pub server_workers: Option<Vec<usize>>,
    /// Operations per cell (defaults to the client worker count)
    #[arg(long)]
    pub ops_per_cell: Option<usize>,
    #[arg(long, value_enum)]
    pub client_mode: Option<PoolKind>,
    /// CSV report path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    #[arg(long)]
    pub payload_dir: Option<PathBuf>,
    /// Storage root handed to every server
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Directory for server log files
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    /// Seconds to wait before the first readiness probe
    #[arg(long)]
    pub settle_delay: Option<f64>,
    /// Seconds to wait for a server to answer LIST
    #[arg(long)]
    pub startup_wait: Option<f64>,
    #[arg(long)]
    pub readiness_interval: Option<f64>,
    #[arg(long)]
    pub pause_between_tests: Option<f64>,
    #[arg(long)]
    pub pause_between_servers: Option<f64>,
    /// Server executable (defaults to this binary)
    #[arg(long)]
    pub server_bin: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(short, long)]
    pub port: Option<u16>,
    #[command(subcommand)]
    pub request: ClientRequest,
}

/// A one-shot client request
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// List stored files
    List,
    /// Download a file
    Get {
        name: String,
        /// Directory to write the file into
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Upload a local file under its own name
    Upload { path: PathBuf },
    /// Delete a stored file
    Delete { name: String },
}

#[derive(Subcommand, Debug)]
pub enum WorkerArgs {
    /// Serve connections handed over by a process-pool server
    Connection {
        #[arg(long)]
        root: PathBuf,
    },
    /// Run client operations for a process-pool batch
    ClientOp {
        /// JSON-encoded driver configuration
        #[arg(long)]
        driver: String,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub grid: GridSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_mode")]
    pub mode: PoolKind,
    /// Number of workers
    pub workers: Option<usize>,
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_port(),
            mode: default_mode(),
            workers: None,
            root: default_root(),
        }
    }
}

/// Client-side configuration shared by `batch`, `client` and `grid`
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_client_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Socket timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_payload_dir")]
    pub payload_dir: PathBuf,
    #[serde(default)]
    pub payloads: PayloadCatalog,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_client_host(),
            port: default_port(),
            timeout_secs: default_timeout_secs(),
            payload_dir: default_payload_dir(),
            payloads: PayloadCatalog::default(),
        }
    }
}

/// Grid search configuration. Durations are in seconds.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GridSection {
    /// Falls back to `[client]` when unset
    pub host: Option<String>,
    pub port: Option<u16>,
    pub server_kinds: Vec<PoolKind>,
    pub operations: Vec<Action>,
    pub payloads: Vec<String>,
    pub client_workers: Vec<usize>,
    pub server_workers: Vec<usize>,
    pub ops_per_cell: Option<usize>,
    pub client_mode: PoolKind,
    pub output: PathBuf,
    pub root: PathBuf,
    pub log_dir: PathBuf,
    pub settle_delay: f64,
    pub startup_wait: f64,
    pub readiness_interval: f64,
    pub pause_between_tests: f64,
    pub pause_between_servers: f64,
    pub interrupt_grace: f64,
    pub terminate_grace: f64,
    pub kill_grace: f64,
    pub server_bin: Option<PathBuf>,
}

impl Default for GridSection {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            server_kinds: vec![PoolKind::Thread, PoolKind::Process],
            operations: vec![Action::Download, Action::Upload],
            payloads: vec!["10MB".to_string(), "50MB".to_string(), "100MB".to_string()],
            client_workers: vec![1, 5, 50],
            server_workers: vec![1, 5, 50],
            ops_per_cell: None,
            client_mode: PoolKind::Thread,
            output: PathBuf::from("stress_test_results_grid.csv"),
            root: default_root(),
            log_dir: PathBuf::from("."),
            settle_delay: 2.0,
            startup_wait: 30.0,
            readiness_interval: 2.0,
            pause_between_tests: 3.0,
            pause_between_servers: 5.0,
            interrupt_grace: 15.0,
            terminate_grace: 5.0,
            kill_grace: 5.0,
            server_bin: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_client_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6665
}

fn default_mode() -> PoolKind {
    PoolKind::Thread
}

fn default_root() -> PathBuf {
    PathBuf::from("files")
}

fn default_timeout_secs() -> f64 {
    DEFAULT_TIMEOUT.as_secs_f64()
}

fn default_payload_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the process was asked to do, fully resolved
#[derive(Debug, Clone)]
pub enum Role {
    Serve(ServerConfig),
    Batch {
        driver: DriverConfig,
        request: BatchRequest,
    },
    Grid(GridConfig),
    Client {
        driver: DriverConfig,
        request: ClientRequest,
    },
    ConnectionWorker {
        root: PathBuf,
    },
    ClientOpWorker {
        driver: DriverConfig,
    },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub role: Role,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let log_level = cli.log_level.unwrap_or(toml_config.logging.level);
        let role = match cli.command {
            CliCommand::Serve(args) => Role::Serve(serve_config(args, toml_config.server, &log_level)),
            CliCommand::Batch(args) => {
                let client = toml_config.client;
                let host = args.host.unwrap_or_else(|| client.host.clone());
                let port = args.port.unwrap_or(client.port);
                let payload_dir = args.payload_dir.unwrap_or_else(|| client.payload_dir.clone());
                Role::Batch {
                    driver: driver_config(&host, port, payload_dir, client)?,
                    request: BatchRequest {
                        action: args.action,
                        payload_key: args.payload,
                        workers: args.workers,
                        total_ops: args.ops,
                        mode: args.mode,
                    },
                }
            }
            CliCommand::Grid(args) => {
                Role::Grid(grid_config(args, toml_config.grid, toml_config.client, &log_level)?)
            }
            CliCommand::Client(args) => {
                let client = toml_config.client;
                let host = args.host.unwrap_or_else(|| client.host.clone());
                let port = args.port.unwrap_or(client.port);
                let payload_dir = client.payload_dir.clone();
                Role::Client {
                    driver: driver_config(&host, port, payload_dir, client)?,
                    request: args.request,
                }
            }
            CliCommand::Worker { role } => match role {
                WorkerArgs::Connection { root } => Role::ConnectionWorker { root },
                WorkerArgs::ClientOp { driver } => Role::ClientOpWorker {
                    driver: serde_json::from_str(&driver)
                        .map_err(|e| ConfigError::Invalid(format!("--driver: {e}")))?,
                },
            },
        };

        Ok(Config { log_level, role })
    }
}

fn serve_config(args: ServeArgs, section: ServerSection, log_level: &str) -> ServerConfig {
    let mode = args.mode.unwrap_or(section.mode);
    ServerConfig {
        host: args.host.unwrap_or(section.host),
        port: args.port.unwrap_or(section.port),
        mode,
        workers: args
            .workers
            .or(section.workers)
            .unwrap_or_else(|| default_workers(mode)),
        root: args.root.unwrap_or(section.root),
        log_level: log_level.to_string(),
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let addr = format!("{}:{}", host, port);
    addr.to_socket_addrs()
        .map_err(|e| ConfigError::Address(addr.clone(), e))?
        .next()
        .ok_or_else(|| ConfigError::Invalid(format!("'{}' resolved to no address", addr)))
}

fn seconds(name: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConfigError::Invalid(format!("{} must be a non-negative number of seconds, got {}", name, value)))
}

fn driver_config(
    host: &str,
    port: u16,
    payload_dir: PathBuf,
    client: ClientSection,
) -> Result<DriverConfig, ConfigError> {
    let mut driver = DriverConfig::new(resolve(host, port)?);
    driver.timeout = seconds("timeout_secs", client.timeout_secs)?;
    driver.payload_dir = payload_dir;
    driver.payloads = client.payloads;
    Ok(driver)
}

fn non_empty<T>(name: &str, values: Vec<T>) -> Result<Vec<T>, ConfigError> {
    if values.is_empty() {
        Err(ConfigError::Invalid(format!("{} must not be empty", name)))
    } else {
        Ok(values)
    }
}

fn grid_config(
    args: GridArgs,
    grid: GridSection,
    client: ClientSection,
    log_level: &str,
) -> Result<GridConfig, ConfigError> {
    let server_bin = match args.server_bin.or(grid.server_bin) {
        Some(path) => path,
        None => std::env::current_exe()
            .map_err(|e| ConfigError::Invalid(format!("cannot locate server binary: {e}")))?,
    };
    let client_workers = args.client_workers.unwrap_or(grid.client_workers);
    if client_workers.contains(&0) {
        return Err(ConfigError::Invalid("client workers must be positive".to_string()));
    }
    let server_workers = args.server_workers.unwrap_or(grid.server_workers);
    if server_workers.contains(&0) {
        return Err(ConfigError::Invalid("server workers must be positive".to_string()));
    }

    Ok(GridConfig {
        host: args.host.or(grid.host).unwrap_or(client.host),
        port: args.port.or(grid.port).unwrap_or(client.port),
        server_kinds: non_empty("server kinds", args.server_kinds.unwrap_or(grid.server_kinds))?,
        operations: non_empty("operations", args.operations.unwrap_or(grid.operations))?,
        payloads: non_empty("payloads", args.payloads.unwrap_or(grid.payloads))?,
        client_workers: non_empty("client workers", client_workers)?,
        server_workers: non_empty("server workers", server_workers)?,
        ops_per_cell: args.ops_per_cell.or(grid.ops_per_cell),
        client_mode: args.client_mode.unwrap_or(grid.client_mode),
        output: args.output.unwrap_or(grid.output),
        payload_dir: args.payload_dir.unwrap_or(client.payload_dir),
        catalog: client.payloads,
        client_timeout: seconds("timeout_secs", client.timeout_secs)?,
        root: args.root.unwrap_or(grid.root),
        log_dir: args.log_dir.unwrap_or(grid.log_dir),
        settle_delay: seconds("settle_delay", args.settle_delay.unwrap_or(grid.settle_delay))?,
        startup_wait: seconds("startup_wait", args.startup_wait.unwrap_or(grid.startup_wait))?,
        readiness_interval: seconds(
            "readiness_interval",
            args.readiness_interval.unwrap_or(grid.readiness_interval),
        )?,
        pause_between_tests: seconds(
            "pause_between_tests",
            args.pause_between_tests.unwrap_or(grid.pause_between_tests),
        )?,
        pause_between_servers: seconds(
            "pause_between_servers",
            args.pause_between_servers.unwrap_or(grid.pause_between_servers),
        )?,
        stop_policy: StopPolicy {
            interrupt_grace: seconds("interrupt_grace", grid.interrupt_grace)?,
            terminate_grace: seconds("terminate_grace", grid.terminate_grace)?,
            kill_grace: seconds("kill_grace", grid.kill_grace)?,
        },
        server_bin,
        log_level: log_level.to_string(),
    })
}

/// Where a downloaded file lands: `out` joined with the last path component
/// of `name`
pub fn download_target(out: &Path, name: &str) -> PathBuf {
    let file = Path::new(name)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| name.into());
    out.join(file)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Address(String, std::io::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Address(addr, e) => {
                write!(f, "Failed to resolve '{}': {}", addr, e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
