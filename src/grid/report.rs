//! CSV report of grid results.
//!
//! The file is created with the first row and flushed after every row, so an
//! interrupted run keeps every completed cell. A run without rows leaves no
//! file behind.

use crate::client::BatchSummary;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One grid cell's result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    #[serde(rename = "Run")]
    pub run: u64,
    #[serde(rename = "Server Type")]
    pub server_type: String,
    #[serde(rename = "Operation")]
    pub operation: String,
    #[serde(rename = "Volume (MB)")]
    pub volume_mb: u64,
    #[serde(rename = "Client Concurrency Mode")]
    pub client_mode: String,
    #[serde(rename = "Client Workers")]
    pub client_workers: usize,
    #[serde(rename = "Server Workers")]
    pub server_workers: usize,
    #[serde(rename = "Avg Op Duration (s)")]
    pub avg_duration: String,
    #[serde(rename = "Avg Op Throughput (MB/s)")]
    pub avg_throughput: String,
    #[serde(rename = "Client Successes")]
    pub client_successes: u64,
    #[serde(rename = "Client Failures")]
    pub client_failures: u64,
    // No server-side accounting exists; these mirror the client counts
    #[serde(rename = "Server Successes")]
    pub server_successes: u64,
    #[serde(rename = "Server Failures")]
    pub server_failures: u64,
    #[serde(rename = "Batch Wall Time (s)")]
    pub wall_time: String,
}

impl ReportRow {
    pub fn new(run: u64, cell: &super::GridCell, volume_mb: u64, summary: &BatchSummary) -> Self {
        Self {
            run,
            server_type: cell.server_kind.to_string(),
            operation: cell.operation.to_string(),
            volume_mb,
            client_mode: cell.client_mode.to_string(),
            client_workers: cell.client_workers,
            server_workers: cell.server_workers,
            avg_duration: format!("{:.4}", summary.avg_duration.as_secs_f64()),
            avg_throughput: format!("{:.4}", summary.avg_throughput_mib()),
            client_successes: summary.ops_successful,
            client_failures: summary.ops_failed,
            server_successes: summary.ops_successful,
            server_failures: summary.ops_failed,
            wall_time: format!("{:.2}", summary.wall_time.as_secs_f64()),
        }
    }
}

/// Appends rows to a CSV file, creating it on first use
pub struct ReportWriter {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows: u64,
}

impl ReportWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            rows: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn append(&mut self, row: &ReportRow) -> Result<(), csv::Error> {
        if self.writer.is_none() {
            debug!(path = %self.path.display(), "Creating report");
            self.writer = Some(csv::Writer::from_path(&self.path)?);
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.serialize(row)?;
            writer.flush()?;
            self.rows += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Action;
    use crate::grid::GridCell;
    use crate::pool::PoolKind;
    use std::time::Duration;

    fn cell() -> GridCell {
        GridCell {
            server_kind: PoolKind::Process,
            server_workers: 5,
            operation: Action::Download,
            payload_key: "10MB".to_string(),
            client_workers: 50,
            client_mode: PoolKind::Thread,
        }
    }

    fn summary() -> BatchSummary {
        BatchSummary {
            ops_successful: 48,
            ops_failed: 2,
            avg_duration: Duration::from_micros(1_234_567),
            avg_throughput: 8.1 * 1024.0 * 1024.0,
            wall_time: Duration::from_millis(12_346),
            total_bytes: 48 * 10 * 1024 * 1024,
        }
    }

    #[test]
    fn test_row_formatting() {
        let row = ReportRow::new(7, &cell(), 10, &summary());
        assert_eq!(row.server_type, "process");
        assert_eq!(row.operation, "download");
        assert_eq!(row.avg_duration, "1.2346");
        assert_eq!(row.avg_throughput, "8.1000");
        assert_eq!(row.wall_time, "12.35");
        assert_eq!(row.server_successes, row.client_successes);
        assert_eq!(row.server_failures, row.client_failures);
    }

    #[test]
    fn test_no_rows_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let report = ReportWriter::new(dir.path().join("results.csv"));
        assert_eq!(report.rows(), 0);
        assert!(!report.path().exists());
    }

    #[test]
    fn test_rows_visible_after_each_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let mut report = ReportWriter::new(&path);

        report.append(&ReportRow::new(1, &cell(), 10, &summary())).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Run,Server Type,Operation,Volume (MB),Client Concurrency Mode,Client Workers,\
             Server Workers,Avg Op Duration (s),Avg Op Throughput (MB/s),Client Successes,\
             Client Failures,Server Successes,Server Failures,Batch Wall Time (s)"
        );
        assert_eq!(
            lines.next().unwrap(),
            "1,process,download,10,thread,50,5,1.2346,8.1000,48,2,48,2,12.35"
        );

        report.append(&ReportRow::new(2, &cell(), 10, &summary())).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert_eq!(report.rows(), 2);
    }
}
