//! Batch runner: fan a number of identical operations over a worker pool and
//! aggregate the results.

use super::{Action, ClientOpTask, DriverConfig, OpDriver, OperationResult};
use crate::pool::{spawn_pool, PoolError, PoolKind, WorkerCommand};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{error, info};

const MIB: f64 = 1024.0 * 1024.0;

/// One batch of operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub action: Action,
    pub payload_key: String,
    pub workers: usize,
    pub total_ops: usize,
    pub mode: PoolKind,
}

/// Aggregated batch outcome.
///
/// Averages cover successful operations only and are zero when nothing
/// succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub ops_successful: u64,
    pub ops_failed: u64,
    pub avg_duration: Duration,
    /// Bytes per second over successful operations
    pub avg_throughput: f64,
    pub wall_time: Duration,
    pub total_bytes: u64,
}

impl BatchSummary {
    pub fn from_results(results: &[OperationResult], wall_time: Duration) -> Self {
        let successes: Vec<&OperationResult> = results.iter().filter(|r| r.success).collect();
        let ops_successful = successes.len() as u64;
        let ops_failed = results.len() as u64 - ops_successful;

        let total_duration: Duration = successes.iter().map(|r| r.duration).sum();
        let total_bytes: u64 = successes.iter().map(|r| r.bytes_transferred).sum();

        let avg_duration = mean_duration(total_duration, ops_successful);
        let avg_throughput = if total_duration > Duration::ZERO {
            total_bytes as f64 / total_duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            ops_successful,
            ops_failed,
            avg_duration,
            avg_throughput,
            wall_time,
            total_bytes,
        }
    }

    pub fn avg_throughput_mib(&self) -> f64 {
        self.avg_throughput / MIB
    }
}

/// Mean of `count` durations summing to `total`; zero when `count` is zero.
fn mean_duration(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        // Duration only divides by u32
        Err(_) => total.div_f64(count as f64),
    }
}

/// Runs batches against the server described by a [`DriverConfig`].
pub struct BatchRunner {
    driver: DriverConfig,
    log_level: String,
}

impl BatchRunner {
    pub fn new(driver: DriverConfig, log_level: impl Into<String>) -> Self {
        Self {
            driver,
            log_level: log_level.into(),
        }
    }

    fn worker_command(&self) -> Result<WorkerCommand, PoolError> {
        let driver = serde_json::to_string(&self.driver)
            .map_err(|e| PoolError::Protocol(format!("failed to encode driver config: {e}")))?;
        Ok(WorkerCommand::current_exe()
            .map_err(PoolError::Spawn)?
            .arg("--log-level")
            .arg(&self.log_level)
            .arg("worker")
            .arg("client-op")
            .arg("--driver")
            .arg(driver))
    }

    /// Run `total_ops` operations on a pool of `workers`.
    ///
    /// Pool failures for individual operations count as failed operations;
    /// only a pool that cannot be started is an error.
    pub fn run(&self, request: &BatchRequest) -> Result<BatchSummary, PoolError> {
        info!(
            server = %self.driver.target,
            action = %request.action,
            payload = %request.payload_key,
            workers = request.workers,
            total_ops = request.total_ops,
            mode = %request.mode,
            "Starting batch"
        );

        if request.action == Action::Upload {
            match OpDriver::new(self.driver.clone()).payload_path(&request.payload_key) {
                Ok(path) if !path.exists() => error!(
                    path = %path.display(),
                    "Upload source missing, every operation in this batch will fail"
                ),
                Err(e) => error!(error = %e, "Upload payload not configured"),
                Ok(_) => {}
            }
        }

        let command = self.worker_command()?;
        let mut pool = spawn_pool::<ClientOpTask, _>(request.mode, request.workers, &command, || {
            Ok(OpDriver::new(self.driver.clone()))
        })?;

        let start = Instant::now();
        let mut handles = Vec::with_capacity(request.total_ops);
        for _ in 0..request.total_ops {
            handles.push(pool.submit(ClientOpTask {
                action: request.action,
                payload_key: request.payload_key.clone(),
            })?);
        }

        let results: Vec<OperationResult> = handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|e| {
                    error!(error = %e, "Operation lost");
                    OperationResult::failed(Duration::ZERO)
                })
            })
            .collect();
        let wall_time = start.elapsed();
        pool.shutdown();

        let summary = BatchSummary::from_results(&results, wall_time);
        info!(
            wall_time_s = %format!("{:.2}", summary.wall_time.as_secs_f64()),
            succeeded = summary.ops_successful,
            failed = summary.ops_failed,
            avg_duration_s = %format!("{:.4}", summary.avg_duration.as_secs_f64()),
            avg_throughput_mib_s = %format!("{:.4}", summary.avg_throughput_mib()),
            "Batch finished"
        );
        Ok(summary)
    }
}
