//! Client operation driver.
//!
//! An [`OpDriver`] performs one request/response round trip per call over a
//! fresh TCP connection and measures it. All target settings live in its
//! [`DriverConfig`], so a driver can be rebuilt inside a worker process from
//! that config alone.

pub mod batch;
pub mod payload;

pub use batch::{BatchRequest, BatchRunner, BatchSummary};
pub use payload::{PayloadCatalog, PayloadSpec};

use crate::pool::{RemoteTask, Task};
use crate::protocol::{encode, parse_response, FrameDecoder, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default socket timeout for client round trips
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const READ_CHUNK: usize = 64 * 1024;

/// A client operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Upload,
    Download,
    List,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Upload => "upload",
            Action::Download => "download",
            Action::List => "list",
            Action::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client errors
#[derive(Debug)]
pub enum ClientError {
    Timeout(Duration),
    Refused(SocketAddr),
    ClosedPrematurely,
    Io(io::Error),
    /// The server answered with an `ERROR` response
    Server(String),
    /// The server answered `OK` with an unexpected shape
    UnexpectedResponse(String),
    UnknownPayload(String),
    LocalFile(PathBuf, io::Error),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Timeout(t) => write!(f, "Socket timeout after {}s", t.as_secs_f64()),
            ClientError::Refused(addr) => write!(f, "Connection refused by server {}", addr),
            ClientError::ClosedPrematurely => write!(f, "Connection closed prematurely by server"),
            ClientError::Io(e) => write!(f, "{}", e),
            ClientError::Server(msg) => write!(f, "{}", msg),
            ClientError::UnexpectedResponse(msg) => write!(f, "Unexpected response: {}", msg),
            ClientError::UnknownPayload(key) => write!(f, "Unknown payload key '{}'", key),
            ClientError::LocalFile(path, e) => {
                write!(f, "Failed to access local file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ClientError {}

/// Where and how a driver talks to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub target: SocketAddr,
    pub timeout: Duration,
    pub payload_dir: PathBuf,
    pub payloads: PayloadCatalog,
}

impl DriverConfig {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            timeout: DEFAULT_TIMEOUT,
            payload_dir: PathBuf::from("."),
            payloads: PayloadCatalog::default(),
        }
    }
}

/// Outcome of one measured operation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub duration: Duration,
    pub bytes_transferred: u64,
}

impl OperationResult {
    pub fn failed(duration: Duration) -> Self {
        Self {
            success: false,
            duration,
            bytes_transferred: 0,
        }
    }
}

/// Performs measured round trips against one server.
#[derive(Debug, Clone)]
pub struct OpDriver {
    config: DriverConfig,
}

impl OpDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    fn classify(&self, e: io::Error) -> ClientError {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                ClientError::Timeout(self.config.timeout)
            }
            io::ErrorKind::ConnectionRefused => ClientError::Refused(self.config.target),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ClientError::ClosedPrematurely,
            _ => ClientError::Io(e),
        }
    }

    /// One round trip on a fresh connection.
    pub fn exchange(&self, command_line: &str) -> Result<Response, ClientError> {
        let timeout = self.config.timeout;
        let mut stream = TcpStream::connect_timeout(&self.config.target, timeout)
            .map_err(|e| self.classify(e))?;
        stream.set_read_timeout(Some(timeout)).map_err(ClientError::Io)?;
        stream.set_write_timeout(Some(timeout)).map_err(ClientError::Io)?;

        stream
            .write_all(&encode(command_line))
            .map_err(|e| self.classify(e))?;

        let mut buffer = BytesMut::with_capacity(READ_CHUNK);
        let mut decoder = FrameDecoder::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(frame) = decoder.decode(&mut buffer) {
                return Ok(parse_response(&frame));
            }
            match stream.read(&mut chunk) {
                Ok(0) => {
                    debug!(received = buffer.len(), "Server closed before a full response");
                    return Err(ClientError::ClosedPrematurely);
                }
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.classify(e)),
            }
        }
    }

    fn checked(&self, command_line: &str) -> Result<Response, ClientError> {
        let response = self.exchange(command_line)?;
        if response.is_ok() {
            Ok(response)
        } else {
            Err(ClientError::Server(response.message()))
        }
    }

    pub fn list(&self) -> Result<Vec<String>, ClientError> {
        let response = self.checked("LIST")?;
        match response.data {
            Some(Value::Array(items)) => Ok(items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Fetch a file's decoded contents
    pub fn get(&self, name: &str) -> Result<Vec<u8>, ClientError> {
        let response = self.checked(&format!("GET {}", name))?;
        let content = response
            .data_file
            .ok_or_else(|| ClientError::UnexpectedResponse("missing data_file".to_string()))?;
        STANDARD
            .decode(content)
            .map_err(|e| ClientError::UnexpectedResponse(format!("invalid base64: {e}")))
    }

    /// Upload a local file under its own file name
    pub fn upload(&self, path: &Path) -> Result<u64, ClientError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ClientError::LocalFile(
                    path.to_path_buf(),
                    io::Error::new(io::ErrorKind::InvalidInput, "no file name"),
                )
            })?;
        self.upload_as(path, &name)
    }

    /// Upload a local file under `remote_name`; returns the bytes sent
    pub fn upload_as(&self, path: &Path, remote_name: &str) -> Result<u64, ClientError> {
        let contents =
            std::fs::read(path).map_err(|e| ClientError::LocalFile(path.to_path_buf(), e))?;
        let encoded = STANDARD.encode(&contents);
        self.checked(&format!("UPLOAD {} {}", remote_name, encoded))?;
        Ok(contents.len() as u64)
    }

    pub fn delete(&self, name: &str) -> Result<String, ClientError> {
        Ok(self.checked(&format!("DELETE {}", name))?.message())
    }

    fn payload(&self, key: &str) -> Result<&PayloadSpec, ClientError> {
        self.config
            .payloads
            .get(key)
            .ok_or_else(|| ClientError::UnknownPayload(key.to_string()))
    }

    /// Local path of a payload's source file
    pub fn payload_path(&self, key: &str) -> Result<PathBuf, ClientError> {
        Ok(self.config.payload_dir.join(&self.payload(key)?.file))
    }

    fn attempt(&self, action: Action, payload_key: &str) -> Result<u64, ClientError> {
        match action {
            Action::Upload => {
                let file = self.payload(payload_key)?.file.clone();
                self.upload_as(&self.config.payload_dir.join(&file), &file)
            }
            Action::Download => {
                let file = &self.payload(payload_key)?.file;
                Ok(self.get(file)?.len() as u64)
            }
            Action::List => self.list().map(|_| 0),
            Action::Delete => {
                let file = &self.payload(payload_key)?.file;
                self.delete(file).map(|_| 0)
            }
        }
    }

    /// Perform one measured operation. Never fails; faults give
    /// `success = false` and zero bytes.
    pub fn perform(&self, action: Action, payload_key: &str) -> OperationResult {
        let start = Instant::now();
        let outcome = self.attempt(action, payload_key);
        let duration = start.elapsed();

        match outcome {
            Ok(bytes_transferred) => OperationResult {
                success: true,
                duration,
                bytes_transferred,
            },
            Err(e) => {
                warn!(action = %action, payload = payload_key, error = %e, "Operation failed");
                OperationResult::failed(duration)
            }
        }
    }
}

/// One client operation, schedulable on a thread or process pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOpTask {
    pub action: Action,
    pub payload_key: String,
}

impl Task for ClientOpTask {
    type Context = OpDriver;
    type Output = OperationResult;

    fn run(self, driver: &OpDriver) -> OperationResult {
        driver.perform(self.action, &self.payload_key)
    }
}

impl RemoteTask for ClientOpTask {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::server::connection::{serve_connection, IDLE_TIMEOUT};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    /// Accepts connections forever, serving each on its own thread
    fn spawn_server(root: &Path) -> SocketAddr {
        let dispatcher = Arc::new(Dispatcher::open(root).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    let peer = stream.peer_addr().unwrap();
                    serve_connection(stream, peer, &dispatcher, IDLE_TIMEOUT);
                });
            }
        });
        addr
    }

    fn driver_config(addr: SocketAddr, payload_dir: &Path) -> DriverConfig {
        let mut config = DriverConfig::new(addr);
        config.payload_dir = payload_dir.to_path_buf();
        config.timeout = Duration::from_secs(10);
        config.payloads = PayloadCatalog::from(vec![PayloadSpec::new("small", "small.bin", 1)]);
        config
    }

    fn driver(addr: SocketAddr, payload_dir: &Path) -> OpDriver {
        OpDriver::new(driver_config(addr, payload_dir))
    }

    #[test]
    fn test_typed_helpers() {
        let server_root = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let addr = spawn_server(server_root.path());
        let driver = driver(addr, local.path());

        let path = local.path().join("notes.txt");
        std::fs::write(&path, b"some notes").unwrap();
        assert_eq!(driver.upload(&path).unwrap(), 10);
        assert_eq!(driver.list().unwrap(), vec!["notes.txt"]);
        assert_eq!(driver.get("notes.txt").unwrap(), b"some notes");
        assert!(driver.delete("notes.txt").unwrap().contains("deleted successfully"));

        match driver.get("notes.txt") {
            Err(ClientError::Server(msg)) => assert_eq!(msg, "File 'notes.txt' not found."),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_perform_upload_then_download() {
        let server_root = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let addr = spawn_server(server_root.path());
        let config = driver_config(addr, local.path());
        config.payloads.ensure_files(local.path()).unwrap();
        let driver = OpDriver::new(config);

        let upload = driver.perform(Action::Upload, "small");
        assert!(upload.success);
        assert_eq!(upload.bytes_transferred, 1024 * 1024);
        assert!(upload.duration > Duration::ZERO);

        let download = driver.perform(Action::Download, "small");
        assert!(download.success);
        assert_eq!(download.bytes_transferred, 1024 * 1024);

        let list = driver.perform(Action::List, "small");
        assert!(list.success);
        assert_eq!(list.bytes_transferred, 0);
    }

    #[test]
    fn test_perform_failures_report_zero_bytes() {
        let server_root = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let addr = spawn_server(server_root.path());
        let driver = driver(addr, local.path());

        // Source file was never generated
        let missing = driver.perform(Action::Upload, "small");
        assert!(!missing.success);
        assert_eq!(missing.bytes_transferred, 0);

        // Nothing to download yet
        assert!(!driver.perform(Action::Download, "small").success);
        assert!(!driver.perform(Action::Download, "no-such-key").success);
    }

    #[test]
    fn test_refused_connection() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let local = tempfile::tempdir().unwrap();
        let driver = driver(addr, local.path());

        let err = driver.exchange("LIST").unwrap_err();
        assert!(matches!(err, ClientError::Refused(_)));
        assert_eq!(err.to_string(), format!("Connection refused by server {}", addr));
    }

    #[test]
    fn test_premature_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf);
            stream.write_all(b"{\"status\": \"OK\"").unwrap();
        });

        let local = tempfile::tempdir().unwrap();
        let err = driver(addr, local.path()).exchange("LIST").unwrap_err();
        assert_eq!(err.to_string(), "Connection closed prematurely by server");
    }

    #[test]
    fn test_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            // Hold the connection open without answering
            let _ = done_rx.recv();
        });

        let local = tempfile::tempdir().unwrap();
        let mut config = driver_config(addr, local.path());
        config.timeout = Duration::from_millis(200);
        let err = OpDriver::new(config).exchange("LIST").unwrap_err();
        assert_eq!(err.to_string(), "Socket timeout after 0.2s");
        drop(done_tx);
    }

    #[test]
    fn test_task_serializes_for_workers() {
        let task = ClientOpTask {
            action: Action::Download,
            payload_key: "10MB".to_string(),
        };
        let json = serde_json::to_string(&task).unwrap();
        assert_eq!(json, r#"{"action":"download","payload_key":"10MB"}"#);

        let config = DriverConfig::new("127.0.0.1:6665".parse().unwrap());
        let restored: DriverConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(restored.payloads, config.payloads);
        assert_eq!(restored.timeout, DEFAULT_TIMEOUT);
    }
}
