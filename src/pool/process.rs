//! Process-backed worker pool.
//!
//! Each slot thread in the parent owns one worker process and a Unix socket
//! connected to the worker's stdin. Jobs go down as one JSON line (with an
//! optional descriptor attached); the worker answers with one JSON line
//! holding `Ok(output)` or `Err(panic message)`.
//!
//! A worker that dies mid-task fails that task only; the slot starts a
//! fresh worker for its next job.

use super::fdpass::{recv_with_fd, send_with_fd};
use super::{panic_message, Job, PoolError, RemoteTask, TaskHandle, WorkerCommand, WorkerPool};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const RECV_CHUNK: usize = 64 * 1024;

/// Job as sent to a worker
#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    task: T,
    with_fd: bool,
}

/// A live worker process and the parent's end of its channel
struct WorkerProcess {
    child: Child,
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl WorkerProcess {
    fn spawn(command: &WorkerCommand, slot: usize) -> io::Result<Self> {
        let (parent, child_end) = UnixStream::pair()?;
        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::from(OwnedFd::from(child_end)))
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        debug!(slot, pid = child.id(), "Worker process started");

        let reader = BufReader::new(parent.try_clone()?);
        Ok(Self {
            child,
            stream: parent,
            reader,
        })
    }

    /// Send one job and wait for its reply line
    fn run<T: RemoteTask>(&mut self, mut task: T) -> Result<T::Output, PoolError> {
        let fd = task.detach_fd();
        let envelope = Envelope {
            task,
            with_fd: fd.is_some(),
        };
        let mut line = serde_json::to_vec(&envelope)
            .map_err(|e| PoolError::Protocol(format!("failed to encode task: {e}")))?;
        line.push(b'\n');

        send_with_fd(&self.stream, &line, fd.as_ref())
            .map_err(|e| PoolError::WorkerLost(format!("send failed: {e}")))?;
        // The worker holds its own copy now
        drop(fd);

        let mut reply = String::new();
        let n = self
            .reader
            .read_line(&mut reply)
            .map_err(|e| PoolError::WorkerLost(format!("receive failed: {e}")))?;
        if n == 0 {
            return Err(PoolError::WorkerLost(format!(
                "worker {} exited while running a task",
                self.child.id()
            )));
        }

        let result: Result<T::Output, String> = serde_json::from_str(&reply)
            .map_err(|e| PoolError::Protocol(format!("failed to decode reply: {e}")))?;
        result.map_err(PoolError::Panicked)
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill a worker whose channel can no longer be trusted
    fn abandon(mut self) {
        let _ = self.child.kill();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // EOF on its stdin tells the worker to exit
        let _ = self.stream.shutdown(Shutdown::Both);
        match self.child.wait() {
            Ok(status) => debug!(pid = self.child.id(), %status, "Worker process exited"),
            Err(e) => warn!(pid = self.child.id(), error = %e, "Failed to reap worker process"),
        }
    }
}

/// N worker processes, one per slot thread.
pub struct ProcessPool<T: RemoteTask> {
    sender: Option<mpsc::Sender<Job<T>>>,
    slots: Vec<JoinHandle<()>>,
    workers: usize,
}

impl<T: RemoteTask> ProcessPool<T> {
    /// Start `workers` processes up front so spawn failures surface here.
    pub fn new(workers: usize, command: WorkerCommand) -> Result<Self, PoolError> {
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        let mut processes = Vec::with_capacity(workers);
        for slot in 0..workers {
            processes.push(WorkerProcess::spawn(&command, slot).map_err(PoolError::Spawn)?);
        }

        let (sender, receiver) = mpsc::channel::<Job<T>>();
        let receiver = Arc::new(Mutex::new(receiver));
        let command = Arc::new(command);
        let mut slots = Vec::with_capacity(workers);

        for (slot, process) in processes.into_iter().enumerate() {
            let receiver = Arc::clone(&receiver);
            let command = Arc::clone(&command);
            let handle = thread::Builder::new()
                .name(format!("slot-{slot}"))
                .spawn(move || slot_loop(slot, Some(process), &receiver, &command))
                .map_err(PoolError::Spawn)?;
            slots.push(handle);
        }

        info!(workers, program = %command.program.display(), "Process pool started");
        Ok(Self {
            sender: Some(sender),
            slots,
            workers,
        })
    }
}

fn slot_loop<T: RemoteTask>(
    slot: usize,
    mut process: Option<WorkerProcess>,
    receiver: &Mutex<mpsc::Receiver<Job<T>>>,
    command: &WorkerCommand,
) {
    loop {
        let job = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };
        let Ok(Job { task, reply }) = job else {
            break;
        };

        if let Some(mut worker) = process.take() {
            if worker.is_alive() {
                process = Some(worker);
            } else {
                warn!(slot, pid = worker.child.id(), "Worker process died while idle, replacing it");
            }
        }
        if process.is_none() {
            match WorkerProcess::spawn(command, slot) {
                Ok(worker) => process = Some(worker),
                Err(e) => {
                    error!(slot, error = %e, "Failed to restart worker process");
                    let _ = reply.send(Err(PoolError::Spawn(e)));
                    continue;
                }
            }
        }
        let Some(worker) = process.as_mut() else {
            continue;
        };

        let result = worker.run(task);
        if let Err(PoolError::WorkerLost(reason)) | Err(PoolError::Protocol(reason)) = &result {
            warn!(slot, reason = %reason, "Discarding worker process");
            if let Some(lost) = process.take() {
                lost.abandon();
            }
        }
        let _ = reply.send(result);
    }
    debug!(slot, "Slot exiting");
}

impl<T: RemoteTask> WorkerPool<T> for ProcessPool<T> {
    fn submit(&self, task: T) -> Result<TaskHandle<T::Output>, PoolError> {
        let sender = self.sender.as_ref().ok_or(PoolError::Closed)?;
        let (reply, handle) = TaskHandle::channel();
        sender
            .send(Job { task, reply })
            .map_err(|_| PoolError::Closed)?;
        Ok(handle)
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.slots.drain(..) {
            if handle.join().is_err() {
                error!("Slot thread terminated abnormally");
            }
        }
    }
}

impl<T: RemoteTask> Drop for ProcessPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker process main loop.
///
/// Reads jobs from stdin (a Unix socket set up by the parent), runs each
/// against `ctx` and writes the reply back. Returns when the parent closes
/// the channel. Interrupt and terminate signals are ignored so a task in
/// flight always finishes; the parent decides when workers go away.
pub fn run_worker<T: RemoteTask>(ctx: T::Context) -> io::Result<()> {
    ignore_termination_signals();

    let stream = UnixStream::from(io::stdin().as_fd().try_clone_to_owned()?);
    let mut pending: Vec<u8> = Vec::new();
    let mut fds: VecDeque<OwnedFd> = VecDeque::new();
    let mut chunk = vec![0u8; RECV_CHUNK];

    debug!(pid = std::process::id(), "Worker ready");

    loop {
        let line = match pending.iter().position(|&b| b == b'\n') {
            Some(pos) => pending.drain(..=pos).collect::<Vec<u8>>(),
            None => {
                let (n, fd) = recv_with_fd(&stream, &mut chunk)?;
                if n == 0 {
                    debug!(pid = std::process::id(), "Channel closed, worker exiting");
                    return Ok(());
                }
                pending.extend_from_slice(&chunk[..n]);
                fds.extend(fd);
                continue;
            }
        };

        let result = match serde_json::from_slice::<Envelope<T>>(&line) {
            Ok(Envelope { mut task, with_fd }) => {
                if with_fd {
                    match fds.pop_front() {
                        Some(fd) => task.attach_fd(fd),
                        None => warn!("Job announced a descriptor that never arrived"),
                    }
                }
                panic::catch_unwind(AssertUnwindSafe(|| task.run(&ctx)))
                    .map_err(|payload| panic_message(payload.as_ref()))
            }
            Err(e) => Err(format!("undecodable job: {e}")),
        };

        if let Err(msg) = &result {
            error!(error = %msg, "Task failed in worker");
        }

        let mut reply = serde_json::to_vec(&result).map_err(io::Error::other)?;
        reply.push(b'\n');
        (&stream).write_all(&reply)?;
    }
}

fn ignore_termination_signals() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
    }
}
