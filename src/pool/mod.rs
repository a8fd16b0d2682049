//! Bounded worker pools.
//!
//! Both the server and the batch runner fan work out through the same
//! [`WorkerPool`] interface. Two implementations exist:
//! - `ThreadPool`: N OS threads sharing one task context
//! - `ProcessPool`: N long-lived worker processes, each building its own
//!   context; tasks cross the process boundary as JSON, sockets via
//!   `SCM_RIGHTS`
//!
//! Callers only see `submit`, `TaskHandle::join` and `shutdown`.

mod fdpass;
mod process;
mod thread;

pub use process::{run_worker, ProcessPool};
pub use thread::ThreadPool;

use clap::ValueEnum;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::ffi::OsString;
use std::io;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::mpsc;

/// Which kind of workers back a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    #[value(alias = "mtpool")]
    #[serde(alias = "mtpool")]
    Thread,
    #[value(alias = "mppool")]
    #[serde(alias = "mppool")]
    Process,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Thread => "thread",
            PoolKind::Process => "process",
        }
    }
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work.
pub trait Task: Send + 'static {
    /// Shared state the task runs against
    type Context: Send + Sync + 'static;
    /// Result handed back to the submitter
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn run(self, ctx: &Self::Context) -> Self::Output;
}

/// A task that can be shipped to a worker process.
///
/// A task may carry one file descriptor (an accepted socket) that is passed
/// alongside its serialized form.
pub trait RemoteTask: Task + Serialize + DeserializeOwned {
    /// Take the descriptor to send with this task, if any.
    fn detach_fd(&mut self) -> Option<OwnedFd> {
        None
    }

    /// Re-attach a descriptor received in the worker.
    fn attach_fd(&mut self, _fd: OwnedFd) {}
}

/// Pool errors
#[derive(Debug)]
pub enum PoolError {
    /// The pool no longer accepts work
    Closed,
    /// The task panicked
    Panicked(String),
    /// The worker process died or broke protocol while running the task
    WorkerLost(String),
    /// A worker process could not be started
    Spawn(io::Error),
    /// A task or its result could not be encoded for the worker channel
    Protocol(String),
    /// Pool needs at least one worker
    NoWorkers,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Closed => write!(f, "Worker pool is shut down"),
            PoolError::Panicked(msg) => write!(f, "Task panicked: {}", msg),
            PoolError::WorkerLost(msg) => write!(f, "Worker process lost: {}", msg),
            PoolError::Spawn(e) => write!(f, "Failed to start worker: {}", e),
            PoolError::Protocol(msg) => write!(f, "Worker channel error: {}", msg),
            PoolError::NoWorkers => write!(f, "Worker pool needs at least one worker"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Handle to the eventual result of a submitted task.
pub struct TaskHandle<O> {
    rx: mpsc::Receiver<Result<O, PoolError>>,
}

impl<O> TaskHandle<O> {
    fn channel() -> (mpsc::Sender<Result<O, PoolError>>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }

    /// Block until the task finishes.
    pub fn join(self) -> Result<O, PoolError> {
        match self.rx.recv() {
            Ok(result) => result,
            // The worker dropped the job without answering
            Err(_) => Err(PoolError::Closed),
        }
    }
}

/// A job waiting in a pool queue
struct Job<T: Task> {
    task: T,
    reply: mpsc::Sender<Result<T::Output, PoolError>>,
}

/// Fixed-size executor.
pub trait WorkerPool<T: Task> {
    /// Queue a task. Tasks beyond the worker count wait for a free worker.
    fn submit(&self, task: T) -> Result<TaskHandle<T::Output>, PoolError>;

    /// Number of tasks that may run concurrently
    fn workers(&self) -> usize;

    /// Stop accepting tasks and wait for queued and running ones to finish.
    fn shutdown(&mut self);
}

/// How to start a worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-invoke the running executable
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Build a pool of the requested kind.
///
/// `make_context` runs once, and only for thread pools; worker processes
/// construct their own context.
pub fn spawn_pool<T, F>(
    kind: PoolKind,
    workers: usize,
    worker_command: &WorkerCommand,
    make_context: F,
) -> Result<Box<dyn WorkerPool<T>>, PoolError>
where
    T: RemoteTask,
    F: FnOnce() -> io::Result<T::Context>,
{
    match kind {
        PoolKind::Thread => {
            let ctx = make_context().map_err(PoolError::Spawn)?;
            Ok(Box::new(ThreadPool::new(workers, ctx)?))
        }
        PoolKind::Process => Ok(Box::new(ProcessPool::new(workers, worker_command.clone())?)),
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
