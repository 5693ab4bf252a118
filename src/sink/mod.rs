//! Outcome log and summary persistence
//!
//! The log is the authoritative record of a run: one CSV row per outcome, in
//! the order outcomes arrived. Any failure to persist it is fatal.

/// Per-operation summary file
pub mod summary;

pub use summary::write_summary;

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::batch::Outcome;

/// Timestamp layout used in log and summary files
pub const TIMESTAMP_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// Written in place of an empty error detail
pub const NO_ERROR_PLACEHOLDER: &str = "-";

const LOG_HEADER: [&str; 7] = [
    "SOL_ID",
    "PROCEDURE",
    "START_TIME",
    "END_TIME",
    "EXECUTION_SECONDS",
    "STATUS",
    "ERROR_DETAILS",
];

/// Errors that stop the run because a record could not be persisted
#[derive(Error, Debug)]
pub enum SinkError {
    /// Log or summary file could not be created
    #[error("Failed to create {}: {source}", .path.display())]
    Create {
        /// File being created
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// A record could not be written
    #[error("Failed to write record: {0}")]
    Write(#[from] csv::Error),

    /// Buffered records could not be flushed or synced
    #[error("Failed to flush: {0}")]
    Flush(#[from] io::Error),

    /// Sink task stopped unexpectedly
    #[error("Log sink task failed: {0}")]
    Task(String),
}

/// Single consumer that appends every outcome to the CSV log
pub struct LogSink {
    writer: csv::Writer<BufWriter<File>>,
    path: PathBuf,
    records: usize,
}

impl LogSink {
    /// Create (or truncate) the log file and write the header
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = create_file(&path)?;

        let mut writer = csv::Writer::from_writer(BufWriter::new(file));
        writer.write_record(LOG_HEADER)?;

        Ok(Self {
            writer,
            path,
            records: 0,
        })
    }

    /// Log file being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one outcome
    pub fn write(&mut self, outcome: &Outcome) -> Result<(), SinkError> {
        let detail = if outcome.error_detail.is_empty() {
            NO_ERROR_PLACEHOLDER
        } else {
            outcome.error_detail.as_str()
        };
        let start = outcome.start.format(TIMESTAMP_FORMAT).to_string();
        let end = outcome.end.format(TIMESTAMP_FORMAT).to_string();
        let seconds = format!("{:.3}", outcome.duration().as_secs_f64());

        self.writer.write_record([
            outcome.entity_id.as_str(),
            outcome.operation.as_str(),
            start.as_str(),
            end.as_str(),
            seconds.as_str(),
            outcome.status.as_str(),
            detail,
        ])?;
        self.records += 1;
        Ok(())
    }

    /// Drain `outcomes` until every sender is gone, then flush and sync.
    /// Blocks the calling thread; use [`spawn`](Self::spawn) from async code.
    pub fn drain(mut self, mut outcomes: mpsc::Receiver<Outcome>) -> Result<usize, SinkError> {
        while let Some(outcome) = outcomes.blocking_recv() {
            self.write(&outcome)?;
        }
        self.finish()
    }

    /// Run [`drain`](Self::drain) on the blocking pool
    pub fn spawn(self, outcomes: mpsc::Receiver<Outcome>) -> JoinHandle<Result<usize, SinkError>> {
        tokio::task::spawn_blocking(move || self.drain(outcomes))
    }

    fn finish(self) -> Result<usize, SinkError> {
        let Self {
            writer,
            path,
            records,
        } = self;
        close_csv(writer)?;

        info!(path = %path.display(), records = records, "Outcome log written");
        Ok(records)
    }
}

/// Flush every buffer layer and sync the file to disk
pub(crate) fn close_csv(mut writer: csv::Writer<BufWriter<File>>) -> Result<(), SinkError> {
    writer.flush()?;
    let buffered = writer
        .into_inner()
        .map_err(|e| SinkError::Flush(io::Error::new(e.error().kind(), e.error().to_string())))?;
    let file = buffered
        .into_inner()
        .map_err(|e| SinkError::Flush(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

pub(crate) fn create_file(path: &Path) -> Result<File, SinkError> {
    let create_err = |source| SinkError::Create {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(create_err)?;
    }
    debug!(path = %path.display(), "Creating output file");
    File::create(path).map_err(create_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Outcome;
    use chrono::{Local, TimeZone};

    #[tokio::test]
    async fn test_sink_writes_every_outcome_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("PKG_insert.csv");
        let sink = LogSink::create(&path).unwrap();

        let (tx, rx) = mpsc::channel(2);
        let handle = sink.spawn(rx);

        let start = Local.with_ymd_and_hms(2024, 3, 5, 9, 15, 0).unwrap();
        let end = start + chrono::Duration::milliseconds(1500);
        for i in 0..5 {
            let outcome = if i == 2 {
                Outcome::failure(format!("S{}", i), "P1", start, end, "ORA-00942: table missing")
            } else {
                Outcome::success(format!("S{}", i), "P1", start, end)
            };
            tx.send(outcome).await.unwrap();
        }
        drop(tx);

        assert_eq!(handle.await.unwrap().unwrap(), 5);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(
            lines[0],
            "SOL_ID,PROCEDURE,START_TIME,END_TIME,EXECUTION_SECONDS,STATUS,ERROR_DETAILS"
        );
        assert_eq!(lines[1], "S0,P1,05-03-2024 09:15:00,05-03-2024 09:15:01,1.500,SUCCESS,-");
        assert_eq!(
            lines[3],
            "S2,P1,05-03-2024 09:15:00,05-03-2024 09:15:01,1.500,FAIL,ORA-00942: table missing"
        );
        assert!(lines[5].starts_with("S4,"));
    }

    #[test]
    fn test_create_fails_on_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let result = LogSink::create(blocker.join("log.csv"));
        assert!(matches!(result, Err(SinkError::Create { .. })));
    }
}
