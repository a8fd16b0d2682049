//! Server subprocess lifecycle.
//!
//! A [`ServerProcess`] runs in its own process group with stdout and stderr
//! redirected to log files. Stopping escalates SIGINT -> SIGTERM -> SIGKILL,
//! each signal sent to the whole group and followed by a grace period.

use super::GridError;
use crate::signal::ShutdownFlag;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const WAIT_POLL: Duration = Duration::from_millis(50);

/// Grace periods for each stop stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub interrupt_grace: Duration,
    pub terminate_grace: Duration,
    pub kill_grace: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            interrupt_grace: Duration::from_secs(15),
            terminate_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Which step ended the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStage {
    AlreadyExited,
    Interrupt,
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    pub stage: StopStage,
    pub status: ExitStatus,
}

/// Why a server never became ready
#[derive(Debug)]
pub enum ReadinessError {
    Exited(ExitStatus),
    TimedOut(Duration),
    Interrupted,
    Io(io::Error),
}

impl std::fmt::Display for ReadinessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessError::Exited(status) => {
                write!(f, "server exited prematurely while checking readiness ({})", status)
            }
            ReadinessError::TimedOut(max) => {
                write!(f, "server did not become ready within {} seconds", max.as_secs())
            }
            ReadinessError::Interrupted => write!(f, "interrupted while waiting for readiness"),
            ReadinessError::Io(e) => write!(f, "failed to query server process: {}", e),
        }
    }
}

impl std::error::Error for ReadinessError {}

/// A running server subprocess and its log files.
pub struct ServerProcess {
    child: Option<Child>,
    pid: u32,
    logs: Option<(File, File)>,
    stdout_log: PathBuf,
    stderr_log: PathBuf,
}

fn open_log(path: &Path, header: &str) -> Result<File, GridError> {
    let mut file = File::create(path).map_err(|e| GridError::LogFile(path.to_path_buf(), e))?;
    writeln!(file, "{}", header).map_err(|e| GridError::LogFile(path.to_path_buf(), e))?;
    Ok(file)
}

impl ServerProcess {
    /// Start `program` in a new process group, logging to
    /// `<log_dir>/<label>.stdout.log` and `<log_dir>/<label>.stderr.log`.
    pub fn spawn(
        program: &Path,
        args: &[OsString],
        log_dir: &Path,
        label: &str,
    ) -> Result<Self, GridError> {
        std::fs::create_dir_all(log_dir).map_err(|e| GridError::LogFile(log_dir.to_path_buf(), e))?;
        let stdout_log = log_dir.join(format!("{label}.stdout.log"));
        let stderr_log = log_dir.join(format!("{label}.stderr.log"));

        let header = format!(
            "=== {} started {} ===",
            label,
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        let stdout = open_log(&stdout_log, &header)?;
        let stderr = open_log(&stderr_log, &header)?;

        let child_stdout = stdout
            .try_clone()
            .map_err(|e| GridError::LogFile(stdout_log.clone(), e))?;
        let child_stderr = stderr
            .try_clone()
            .map_err(|e| GridError::LogFile(stderr_log.clone(), e))?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(child_stdout))
            .stderr(Stdio::from(child_stderr))
            .process_group(0)
            .spawn()
            .map_err(|e| GridError::Spawn(program.display().to_string(), e))?;

        let pid = child.id();
        info!(
            pid,
            stdout = %stdout_log.display(),
            stderr = %stderr_log.display(),
            "Server process started"
        );

        Ok(Self {
            child: Some(child),
            pid,
            logs: Some((stdout, stderr)),
            stdout_log,
            stderr_log,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log_paths(&self) -> (&Path, &Path) {
        (&self.stdout_log, &self.stderr_log)
    }

    /// Exit status if the process has already ended
    pub fn try_status(&mut self) -> io::Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child.try_wait(),
            None => Ok(None),
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.child.is_some() && matches!(self.try_status(), Ok(None))
    }

    /// Poll `probe` until it succeeds, the process exits, `max_wait`
    /// elapses or shutdown is requested.
    pub fn wait_ready<F>(
        &mut self,
        mut probe: F,
        max_wait: Duration,
        interval: Duration,
        shutdown: &ShutdownFlag,
    ) -> Result<(), ReadinessError>
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < max_wait {
            if let Some(status) = self.try_status().map_err(ReadinessError::Io)? {
                return Err(ReadinessError::Exited(status));
            }
            if probe() {
                info!(pid = self.pid, elapsed_ms = start.elapsed().as_millis() as u64, "Server is ready");
                return Ok(());
            }
            debug!(pid = self.pid, "Server not ready yet");
            if !shutdown.sleep(interval) {
                return Err(ReadinessError::Interrupted);
            }
        }
        Err(ReadinessError::TimedOut(max_wait))
    }

    /// Stop the process group, escalating through the policy's stages.
    ///
    /// Log files are closed whichever stage ends the sequence. A process
    /// that outlives SIGKILL is an error.
    pub fn stop(mut self, policy: &StopPolicy) -> Result<StopOutcome, GridError> {
        let result = self.escalate(policy);
        self.logs.take();
        result
    }

    fn escalate(&mut self, policy: &StopPolicy) -> Result<StopOutcome, GridError> {
        let Some(mut child) = self.child.take() else {
            return Err(GridError::Io(io::Error::other("server process already released")));
        };

        if let Some(status) = child.try_wait().map_err(GridError::Io)? {
            debug!(pid = self.pid, %status, "Server process already exited");
            return Ok(StopOutcome {
                stage: StopStage::AlreadyExited,
                status,
            });
        }

        let stages = [
            (StopStage::Interrupt, libc::SIGINT, policy.interrupt_grace),
            (StopStage::Terminate, libc::SIGTERM, policy.terminate_grace),
            (StopStage::Kill, libc::SIGKILL, policy.kill_grace),
        ];

        for (stage, signal, grace) in stages {
            match stage {
                StopStage::Interrupt => info!(pid = self.pid, "Stopping server process"),
                StopStage::Terminate => warn!(
                    pid = self.pid,
                    grace_s = policy.interrupt_grace.as_secs(),
                    "Server did not stop after SIGINT, sending SIGTERM"
                ),
                _ => error!(pid = self.pid, "Server did not terminate, sending SIGKILL"),
            }

            signal_group(self.pid, signal).map_err(GridError::Io)?;
            if let Some(status) = wait_timeout(&mut child, grace).map_err(GridError::Io)? {
                info!(pid = self.pid, %status, ?stage, "Server process stopped");
                return Ok(StopOutcome { stage, status });
            }
        }

        // Keep the handle so drop can make a last attempt
        self.child = Some(child);
        Err(GridError::Unkillable(self.pid))
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        warn!(pid = self.pid, "Server process still running on release, killing");
        let _ = signal_group(self.pid, libc::SIGKILL);
        if !matches!(wait_timeout(&mut child, Duration::from_secs(2)), Ok(Some(_))) {
            error!(pid = self.pid, "Server process could not be reaped");
        }
    }
}

/// Send `signal` to the process group led by `pid`.
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // Group already gone
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL);
    }
}
