//! Cooperative shutdown.
//!
//! Long-running loops poll a [`ShutdownFlag`]; `watch_signals` flips it on
//! SIGINT or SIGTERM. A second signal kills the tracked child process group,
//! if any, and ends the process at once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, warn};

/// Granularity of interruptible sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    triggered: Arc<AtomicBool>,
    /// Process group that must not outlive a forced exit, 0 when none
    child_group: Arc<AtomicU32>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Remember the process group led by `pgid` until `release_group`.
    pub fn track_group(&self, pgid: u32) {
        self.child_group.store(pgid, Ordering::SeqCst);
    }

    pub fn release_group(&self) {
        self.child_group.store(0, Ordering::SeqCst);
    }

    /// SIGKILL the tracked process group. Returns the group that was killed.
    pub fn kill_tracked_group(&self) -> Option<u32> {
        let pgid = self.child_group.swap(0, Ordering::SeqCst);
        if pgid == 0 {
            return None;
        }
        let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            // Group already gone
            if e.raw_os_error() != Some(libc::ESRCH) {
                error!(pgid, error = %e, "Failed to kill child process group");
            }
        }
        Some(pgid)
    }

    /// Sleep for `duration` or until the flag is set.
    ///
    /// Returns `false` if the sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Trigger `flag` on the first SIGINT/SIGTERM. On the second, kill the
/// group tracked by `flag` and exit.
pub fn watch_signals(flag: ShutdownFlag) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;

    // Register on the caller's thread so no signal slips past startup
    let (mut interrupt, mut terminate) = {
        let _guard = runtime.enter();
        (signal(SignalKind::interrupt())?, signal(SignalKind::terminate())?)
    };

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let mut received = 0u32;
                loop {
                    let name = tokio::select! {
                        _ = interrupt.recv() => "SIGINT",
                        _ = terminate.recv() => "SIGTERM",
                    };
                    received += 1;
                    if received == 1 {
                        warn!(signal = name, "Shutdown requested");
                        flag.trigger();
                    } else {
                        error!(signal = name, "Second signal, exiting immediately");
                        if let Some(pgid) = flag.kill_tracked_group() {
                            warn!(pgid, "Killed child process group before exit");
                        }
                        std::process::exit(130);
                    }
                }
            })
        })?;

    Ok(())
}
