use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::spool::SpoolDirectory;

/// Errors that abort consolidation of one operation
#[derive(Error, Debug)]
pub enum ConsolidationError {
    /// The operation's spool directory could not be read
    #[error("Failed to list spools in {}: {source}", .path.display())]
    List {
        /// Directory being listed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Staging the merged output failed
    #[error("Failed to write merged output {}: {source}", .path.display())]
    Write {
        /// Final output the merge was staged for
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Renaming the staged output over the final name failed
    #[error("Failed to publish {}: {source}", .path.display())]
    Publish {
        /// Final output path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The blocking consolidation task did not complete
    #[error("Consolidation task failed: {0}")]
    Task(String),
}

/// What consolidating one operation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsolidationOutcome {
    /// Spools were merged into `output` and removed
    Merged {
        /// Path of the published `<operation>.txt`
        output: PathBuf,
        /// Number of spools merged
        files: usize,
        /// Bytes written to the output
        bytes: u64,
        /// Spools that could not be deleted after the merge; they are marked
        /// consumed and skipped by later passes
        leftover: Vec<PathBuf>,
    },
    /// No spools; any existing output was left as is
    NothingToMerge,
}

/// Per-operation result of [`OutputConsolidator::consolidate_all`]
#[derive(Debug)]
pub struct ConsolidationReport {
    /// Operation that was consolidated
    pub operation: String,
    /// What happened to it
    pub result: Result<ConsolidationOutcome, ConsolidationError>,
}

/// Merges every entity's spool for an operation into `<operation>.txt`.
///
/// The merged bytes go to a temporary file in the spool root which is synced
/// and then renamed over the final name. Spools are only deleted after the
/// rename, so a failure at any point leaves the previous output and all
/// spools untouched. A spool that cannot be deleted after the rename is
/// marked consumed so a later pass never publishes it on its own.
#[derive(Debug, Clone)]
pub struct OutputConsolidator {
    spool: SpoolDirectory,
}

impl OutputConsolidator {
    /// Consolidator over the given spool root
    pub fn new(spool: SpoolDirectory) -> Self {
        Self { spool }
    }

    /// Consolidate every operation in parallel. Reports come back in the
    /// order of `operations`; one failure never stops the others.
    pub async fn consolidate_all(&self, operations: &[String]) -> Vec<ConsolidationReport> {
        let mut tasks = JoinSet::new();
        for (index, operation) in operations.iter().enumerate() {
            let consolidator = self.clone();
            let operation = operation.clone();
            tasks.spawn_blocking(move || {
                let result = consolidator.consolidate(&operation);
                (index, ConsolidationReport { operation, result })
            });
        }

        let mut reports: Vec<Option<ConsolidationReport>> =
            operations.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => reports[index] = Some(report),
                Err(e) => error!(error = %e, "Consolidation task panicked"),
            }
        }

        reports
            .into_iter()
            .zip(operations)
            .map(|(report, operation)| {
                report.unwrap_or_else(|| ConsolidationReport {
                    operation: operation.clone(),
                    result: Err(ConsolidationError::Task("task did not complete".to_string())),
                })
            })
            .collect()
    }

    /// Consolidate one operation (blocking I/O)
    #[instrument(skip(self))]
    pub fn consolidate(&self, operation: &str) -> Result<ConsolidationOutcome, ConsolidationError> {
        let started = Instant::now();
        let still_present = self.spool.retire_consumed(operation);
        if !still_present.is_empty() {
            warn!(operation = %operation, count = still_present.len(), "Merged spools remain on disk");
        }

        let spools = self
            .spool
            .list_spools(operation)
            .map_err(|source| ConsolidationError::List {
                path: self.spool.operation_dir(operation),
                source,
            })?;

        if spools.is_empty() {
            debug!(operation = %operation, "No spool files to merge");
            return Ok(ConsolidationOutcome::NothingToMerge);
        }

        let output = self.spool.final_path(operation);
        let bytes = self.merge_into(&output, &spools)?;

        let mut leftover = Vec::new();
        for spool in &spools {
            if let Err(e) = fs::remove_file(spool) {
                warn!(path = %spool.display(), error = %e, "Failed to delete spool file");
                if let Err(e) = self.spool.mark_consumed(operation, spool) {
                    error!(path = %spool.display(), error = %e, "Failed to mark spool as consumed");
                }
                leftover.push(spool.clone());
            }
        }
        // Only succeeds once the directory is empty; stray partials keep it.
        let _ = fs::remove_dir(self.spool.operation_dir(operation));

        info!(
            operation = %operation,
            files = spools.len(),
            bytes = bytes,
            output = %output.display(),
            duration_ms = started.elapsed().as_millis(),
            "Merged spool files"
        );

        Ok(ConsolidationOutcome::Merged {
            output,
            files: spools.len(),
            bytes,
            leftover,
        })
    }

    fn merge_into(&self, output: &Path, spools: &[PathBuf]) -> Result<u64, ConsolidationError> {
        let write_err = |source| ConsolidationError::Write {
            path: output.to_path_buf(),
            source,
        };

        let prefix = format!(
            ".{}.",
            output.file_name().unwrap_or_default().to_string_lossy()
        );
        let mut staged = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(self.spool.root())
            .map_err(write_err)?;

        let bytes = {
            let mut out = BufWriter::new(staged.as_file_mut());
            let bytes = concatenate(&mut out, spools).map_err(write_err)?;
            out.flush().map_err(write_err)?;
            bytes
        };
        staged.as_file().sync_all().map_err(write_err)?;

        staged
            .persist(output)
            .map_err(|e| ConsolidationError::Publish {
                path: output.to_path_buf(),
                source: e.error,
            })?;
        sync_dir(self.spool.root());
        Ok(bytes)
    }
}

/// Copy spools back to back. A newline is added between two files only when
/// the earlier one does not already end with one; empty files add nothing.
fn concatenate<W: Write>(out: &mut W, spools: &[PathBuf]) -> io::Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    let mut last_byte: Option<u8> = None;

    for path in spools {
        let mut file = File::open(path)?;
        let mut first_chunk = true;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if first_chunk {
                if last_byte.is_some_and(|b| b != b'\n') {
                    out.write_all(b"\n")?;
                    total += 1;
                }
                first_chunk = false;
            }
            out.write_all(&buf[..n])?;
            total += n as u64;
            last_byte = Some(buf[n - 1]);
        }
    }
    Ok(total)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(path = %dir.display(), error = %e, "Directory sync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
