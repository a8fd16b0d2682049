//! Per-connection request loop.
//!
//! A connection moves through `Reading -> Dispatching -> Writing -> Reading`
//! until it reaches `Closed`. Frames already buffered are served before the
//! next read, so pipelined requests are answered in order.

use crate::dispatch::Dispatcher;
use crate::pool::{RemoteTask, Task};
use crate::protocol::{encode_response, FrameDecoder};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::OwnedFd;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Close a connection after this long without a complete read
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Receive chunk size
pub const READ_CHUNK: usize = 16 * 1024;

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// Zero-length read
    PeerClosed,
    /// No data within the idle timeout
    IdleTimeout,
    /// Reset, broken pipe or aborted
    Reset,
    /// A frame was not valid UTF-8
    InvalidText,
    /// Any other I/O failure
    Failed(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Reset => write!(f, "connection reset"),
            CloseReason::InvalidText => write!(f, "invalid text"),
            CloseReason::Failed(kind) => write!(f, "failed: {}", kind),
        }
    }
}

/// Counters reported when a connection closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub frames: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub reason: CloseReason,
}

enum ConnState {
    Reading,
    Dispatching(BytesMut),
    Writing(Bytes),
    Closed(CloseReason),
}

fn classify(e: &io::Error) -> CloseReason {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => CloseReason::IdleTimeout,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => CloseReason::Reset,
        kind => CloseReason::Failed(kind.to_string()),
    }
}

/// Serve one connection until it closes.
pub fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: &Dispatcher,
    idle_timeout: Duration,
) -> ConnectionSummary {
    let mut summary = ConnectionSummary {
        frames: 0,
        bytes_in: 0,
        bytes_out: 0,
        reason: CloseReason::PeerClosed,
    };

    if let Err(e) = stream
        .set_read_timeout(Some(idle_timeout))
        .and_then(|_| stream.set_write_timeout(Some(idle_timeout)))
    {
        summary.reason = CloseReason::Failed(e.kind().to_string());
        return summary;
    }

    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut state = ConnState::Reading;

    let reason = loop {
        state = match state {
            ConnState::Reading => match decoder.decode(&mut buffer) {
                Some(frame) => ConnState::Dispatching(frame),
                None => match stream.read(&mut chunk) {
                    Ok(0) => {
                        if !buffer.is_empty() {
                            debug!(%peer, pending = buffer.len(), "Discarding partial frame");
                        }
                        ConnState::Closed(CloseReason::PeerClosed)
                    }
                    Ok(n) => {
                        summary.bytes_in += n as u64;
                        buffer.extend_from_slice(&chunk[..n]);
                        ConnState::Reading
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => ConnState::Reading,
                    Err(e) => ConnState::Closed(classify(&e)),
                },
            },
            ConnState::Dispatching(frame) => match std::str::from_utf8(&frame) {
                Ok(text) => {
                    summary.frames += 1;
                    let response = dispatcher.handle(text);
                    ConnState::Writing(encode_response(&response))
                }
                Err(e) => {
                    warn!(%peer, error = %e, "Received frame is not valid text");
                    ConnState::Closed(CloseReason::InvalidText)
                }
            },
            ConnState::Writing(payload) => match stream.write_all(&payload) {
                Ok(()) => {
                    summary.bytes_out += payload.len() as u64;
                    ConnState::Reading
                }
                Err(e) => ConnState::Closed(classify(&e)),
            },
            ConnState::Closed(reason) => break reason,
        };
    };

    match &reason {
        CloseReason::IdleTimeout => warn!(%peer, "Connection idle, closing"),
        CloseReason::Failed(kind) => warn!(%peer, error = %kind, "Connection failed"),
        _ => {}
    }
    summary.reason = reason;
    summary
}

/// An accepted connection, runnable in a thread or shipped to a worker
/// process.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionTask {
    pub peer: SocketAddr,
    #[serde(skip)]
    pub stream: Option<TcpStream>,
}

impl ConnectionTask {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            peer,
            stream: Some(stream),
        }
    }
}

impl Task for ConnectionTask {
    type Context = Dispatcher;
    type Output = ConnectionSummary;

    fn run(self, dispatcher: &Dispatcher) -> ConnectionSummary {
        let peer = self.peer;
        let Some(stream) = self.stream else {
            warn!(%peer, "Connection task arrived without a socket");
            return ConnectionSummary {
                frames: 0,
                bytes_in: 0,
                bytes_out: 0,
                reason: CloseReason::Failed("missing socket".to_string()),
            };
        };

        debug!(%peer, "Serving connection");
        let summary = serve_connection(stream, peer, dispatcher, IDLE_TIMEOUT);
        info!(
            %peer,
            frames = summary.frames,
            bytes_in = summary.bytes_in,
            bytes_out = summary.bytes_out,
            reason = %summary.reason,
            "Connection closed"
        );
        summary
    }
}

impl RemoteTask for ConnectionTask {
    fn detach_fd(&mut self) -> Option<OwnedFd> {
        self.stream.take().map(OwnedFd::from)
    }

    fn attach_fd(&mut self, fd: OwnedFd) {
        self.stream = Some(TcpStream::from(fd));
    }
}
