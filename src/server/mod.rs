//! Pool server.
//!
//! Accepts TCP connections and hands each one to a worker pool as a
//! [`ConnectionTask`]. At most `workers` connections are served at once;
//! the rest wait in the pool queue.
//!
//! The accept loop polls the listener with a one second timeout so the
//! shutdown flag is noticed promptly. Readiness is edge triggered, so a
//! backlog left behind by a failed accept is retried after a short backoff
//! rather than waiting for an event that never comes. On shutdown the
//! listener is closed first, then the pool finishes queued and in-flight
//! connections.

pub mod connection;

pub use connection::ConnectionTask;

use crate::dispatch::Dispatcher;
use crate::pool::{spawn_pool, PoolError, PoolKind, WorkerCommand, WorkerPool};
use crate::signal::ShutdownFlag;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Wait before retrying a backlog after an unexpected accept error
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const BACKLOG: i32 = 128;

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub mode: PoolKind,
    pub workers: usize,
    pub root: PathBuf,
    /// Passed on to worker processes
    pub log_level: String,
}

/// Default pool size for a mode: cores for processes, five per core for
/// threads.
pub fn default_workers(mode: PoolKind) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    match mode {
        PoolKind::Thread => cores * 5,
        PoolKind::Process => cores,
    }
}

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    Bind(String, io::Error),
    Storage(PathBuf, io::Error),
    Pool(PoolError),
    Io(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            ServerError::Storage(root, e) => {
                write!(f, "Failed to open storage '{}': {}", root.display(), e)
            }
            ServerError::Pool(e) => write!(f, "{}", e),
            ServerError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<PoolError> for ServerError {
    fn from(e: PoolError) -> Self {
        ServerError::Pool(e)
    }
}

/// A server with its listening socket bound.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = resolve(&addr)
            .and_then(create_listener)
            .map_err(|e| ServerError::Bind(addr.clone(), e))?;
        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is triggered.
    pub fn run(self, shutdown: &ShutdownFlag) -> Result<(), ServerError> {
        let local_addr = self.local_addr()?;
        let Server { config, listener } = self;

        let worker_command = WorkerCommand::current_exe()?
            .arg("--log-level")
            .arg(&config.log_level)
            .arg("worker")
            .arg("connection")
            .arg("--root")
            .arg(&config.root);

        // Surfaces an unusable root before any connection is accepted
        let root = config.root.clone();
        let dispatcher = Dispatcher::open(&root).map_err(|e| ServerError::Storage(root.clone(), e))?;
        let mut pool: Box<dyn WorkerPool<ConnectionTask>> =
            spawn_pool(config.mode, config.workers, &worker_command, move || Ok(dispatcher))?;

        info!(
            addr = %local_addr,
            mode = %config.mode,
            workers = pool.workers(),
            root = %config.root.display(),
            "Server listening"
        );

        let result = accept_loop(&listener, || listener.accept(), pool.as_ref(), shutdown);

        drop(listener);
        info!("Listener closed, waiting for active connections");
        pool.shutdown();
        info!("Server stopped");
        result
    }
}

/// State of the listen backlog after an accept pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backlog {
    Drained,
    /// Accept failed with connections possibly still queued
    Stalled,
}

fn accept_loop<A>(
    listener: &TcpListener,
    mut accept: A,
    pool: &dyn WorkerPool<ConnectionTask>,
    shutdown: &ShutdownFlag,
) -> Result<(), ServerError>
where
    A: FnMut() -> io::Result<(TcpStream, SocketAddr)>,
{
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(16);
    let fd = listener.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)?;

    let mut backlog = Backlog::Drained;
    while !shutdown.is_triggered() {
        let timeout = match backlog {
            Backlog::Drained => POLL_INTERVAL,
            Backlog::Stalled => ACCEPT_BACKOFF,
        };
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }
        if events.is_empty() && backlog == Backlog::Drained {
            continue;
        }
        backlog = accept_pending(&mut accept, pool)?;
    }

    poll.registry().deregister(&mut SourceFd(&fd))?;
    Ok(())
}

/// Accept until the backlog is empty or accepting fails.
fn accept_pending<A>(
    accept: &mut A,
    pool: &dyn WorkerPool<ConnectionTask>,
) -> Result<Backlog, ServerError>
where
    A: FnMut() -> io::Result<(TcpStream, SocketAddr)>,
{
    loop {
        match accept() {
            Ok((stream, peer)) => {
                // Workers use blocking reads with timeouts
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, error = %e, "Failed to configure connection");
                    continue;
                }
                debug!(%peer, "Accepted connection");
                // Results are logged where the connection runs
                pool.submit(ConnectionTask::new(stream, peer))?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Backlog::Drained),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                ) =>
            {
                debug!(error = %e, "Connection dropped before accept");
            }
            Err(e) => {
                // EMFILE, ENFILE, ENOBUFS: retry once resources free up
                error!(
                    error = %e,
                    retry_ms = ACCEPT_BACKOFF.as_millis() as u64,
                    "Accept failed, retrying"
                );
                return Ok(Backlog::Stalled);
            }
        }
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))
}

/// Create a non-blocking TCP listener with address reuse.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ThreadPool;
    use crate::protocol::{encode, parse_response, FrameDecoder, Response};
    use bytes::BytesMut;
    use std::io::{Read, Write};
    use std::thread;

    fn config(root: PathBuf, workers: usize) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            mode: PoolKind::Thread,
            workers,
            root,
            log_level: "info".to_string(),
        }
    }

    fn round_trip(addr: SocketAddr, request: &str) -> Response {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.write_all(&encode(request)).unwrap();

        let mut buffer = BytesMut::new();
        let mut decoder = FrameDecoder::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = decoder.decode(&mut buffer) {
                return parse_response(&frame);
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed before responding");
            buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn start(workers: usize) -> (tempfile::TempDir, SocketAddr, ShutdownFlag, thread::JoinHandle<()>) {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(config(dir.path().join("files"), workers)).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = ShutdownFlag::new();
        let flag = shutdown.clone();
        let handle = thread::spawn(move || server.run(&flag).unwrap());
        (dir, addr, shutdown, handle)
    }

    #[test]
    fn test_serves_requests() {
        let (dir, addr, shutdown, handle) = start(2);

        let response = round_trip(addr, "UPLOAD hello.txt aGVsbG8=");
        assert!(response.is_ok(), "{:?}", response);
        assert_eq!(std::fs::read(dir.path().join("files/hello.txt")).unwrap(), b"hello");

        let response = round_trip(addr, "list");
        assert_eq!(response.data, Some(serde_json::json!(["hello.txt"])));

        shutdown.trigger();
        handle.join().unwrap();
    }

    #[test]
    fn test_connections_queue_behind_single_worker() {
        let (_dir, addr, shutdown, handle) = start(1);

        let clients: Vec<_> = (0..5)
            .map(|_| thread::spawn(move || round_trip(addr, "LIST")))
            .collect();
        for client in clients {
            assert!(client.join().unwrap().is_ok());
        }

        shutdown.trigger();
        handle.join().unwrap();
    }

    #[test]
    fn test_shutdown_closes_listener() {
        let (_dir, addr, shutdown, handle) = start(1);
        shutdown.trigger();
        handle.join().unwrap();
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_bind_conflict() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path().to_path_buf(), 1);
        cfg.port = taken.local_addr().unwrap().port();
        assert!(matches!(Server::bind(cfg), Err(ServerError::Bind(..))));
    }

    fn out_of_descriptors() -> io::Error {
        io::Error::from_raw_os_error(libc::EMFILE)
    }

    #[test]
    fn test_accept_error_stalls_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool =
            ThreadPool::<ConnectionTask>::new(1, Dispatcher::open(dir.path()).unwrap()).unwrap();

        let mut calls = 0;
        let mut accept = || -> io::Result<(TcpStream, SocketAddr)> {
            calls += 1;
            Err(out_of_descriptors())
        };
        let backlog = accept_pending(&mut accept, &pool).unwrap();
        assert_eq!(backlog, Backlog::Stalled);
        assert_eq!(calls, 1);
        pool.shutdown();
    }

    #[test]
    fn test_accept_loop_retries_stalled_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownFlag::new();
        let flag = shutdown.clone();

        let handle = thread::spawn(move || {
            let mut pool =
                ThreadPool::<ConnectionTask>::new(1, Dispatcher::open(&root).unwrap()).unwrap();
            // The first accept consumes the readiness event and fails
            let mut failures = 1;
            let accept = || {
                if failures > 0 {
                    failures -= 1;
                    return Err(out_of_descriptors());
                }
                listener.accept()
            };
            accept_loop(&listener, accept, &pool, &flag).unwrap();
            pool.shutdown();
        });

        let response = round_trip(addr, "LIST");
        assert!(response.is_ok(), "{:?}", response);

        shutdown.trigger();
        handle.join().unwrap();
    }

    #[test]
    fn test_default_workers() {
        let threads = default_workers(PoolKind::Thread);
        let processes = default_workers(PoolKind::Process);
        assert!(processes >= 1);
        assert_eq!(threads, processes * 5);
    }
}
