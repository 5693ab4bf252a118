//! Run orchestration
//!
//! Wires the outcome log, the aggregator, the executor for the run mode and
//! the dispatcher together, then writes the summary and (for extraction)
//! consolidates the spools once every entity is done.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::batch::dispatcher::{EntityDispatcher, ProgressCallback};
use crate::batch::pool::EntityWorkerPool;
use crate::batch::types::{OperationAggregate, RunMode};
use crate::batch::SummaryAggregator;
use crate::config::{AppConfig, RunConfig};
use crate::engine::{ExtractExecutor, InvokeExecutor, OperationExecutor};
use crate::format::RowFormat;
use crate::layout::{CsvLayoutSource, LayoutSource};
use crate::sink::{write_summary, LogSink, SinkError};
use crate::spool::{ConsolidationOutcome, ConsolidationReport, OutputConsolidator, SpoolDirectory};
use crate::transport::Transport;
use crate::{Result, SolBatchError};

/// What a finished run produced
#[derive(Debug)]
pub struct RunReport {
    /// Mode the run executed in
    pub mode: RunMode,
    /// Entities submitted
    pub entities: usize,
    /// Outcomes logged
    pub outcomes: usize,
    /// Failed outcomes
    pub failures: usize,
    /// Per-operation summary, keyed by operation name
    pub summary: BTreeMap<String, OperationAggregate>,
    /// Empty in invoke mode
    pub consolidation: Vec<ConsolidationReport>,
    /// Outcome log written by the run
    pub log_path: PathBuf,
    /// Summary file written by the run
    pub summary_path: PathBuf,
    /// Wall time from start to report
    pub elapsed: Duration,
}

/// Runs one configured batch end to end
pub struct BatchRunner {
    app: AppConfig,
    run: RunConfig,
    mode: RunMode,
    transport: Arc<dyn Transport>,
    layouts: Option<Arc<dyn LayoutSource>>,
    progress: Option<ProgressCallback>,
}

impl BatchRunner {
    /// Runner for one mode over the given backend
    pub fn new(app: AppConfig, run: RunConfig, mode: RunMode, transport: Arc<dyn Transport>) -> Self {
        Self {
            app,
            run,
            mode,
            transport,
            layouts: None,
            progress: None,
        }
    }

    /// Use `source` instead of the CSV templates under `template_path`
    pub fn with_layout_source(mut self, source: Arc<dyn LayoutSource>) -> Self {
        self.layouts = Some(source);
        self
    }

    /// Report (completed, total) entities as the run progresses
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    /// `<log dir>/<package>_<insert|extract>.csv`
    pub fn log_path(&self) -> PathBuf {
        self.app.log_file_path.join(self.run.log_file_name(self.mode))
    }

    /// `<log dir>/<package>_<insert|extract>_summary.csv`
    pub fn summary_path(&self) -> PathBuf {
        self.app.log_file_path.join(self.run.summary_file_name(self.mode))
    }

    fn spool(&self) -> SpoolDirectory {
        SpoolDirectory::new(&self.run.spool_output_path)
    }

    fn executor(&self) -> Arc<dyn OperationExecutor> {
        match self.mode {
            RunMode::Invoke => Arc::new(InvokeExecutor::new(
                self.transport.clone(),
                self.run.package_name.clone(),
            )),
            RunMode::Extract => {
                let layouts = self
                    .layouts
                    .clone()
                    .unwrap_or_else(|| Arc::new(CsvLayoutSource::new(&self.run.template_path)));
                Arc::new(ExtractExecutor::new(
                    self.transport.clone(),
                    layouts,
                    RowFormat::from_config(&self.run.format, &self.run.delimiter),
                    self.spool(),
                    self.run.entity_column.clone(),
                ))
            }
        }
    }

    /// Process every entity, then persist the summary and merge spools.
    ///
    /// Failing operations only show up in the report and the files. The
    /// returned error is reserved for invalid configuration and for the log
    /// or summary not being persisted.
    #[instrument(skip(self, entities), fields(mode = ?self.mode, entities = entities.len()))]
    pub async fn run(mut self, entities: Vec<String>) -> Result<RunReport> {
        let started = Instant::now();
        self.app.validate()?;
        self.run.validate()?;

        let log_path = self.log_path();
        let summary_path = self.summary_path();
        let entity_count = entities.len();
        let concurrency = self.app.effective_concurrency(&self.run, self.mode);
        info!(
            package = %self.run.package_name,
            operations = self.run.procedures.len(),
            concurrency = concurrency,
            workers = self.run.worker_count,
            log = %log_path.display(),
            "Starting run"
        );

        let sink = LogSink::create(&log_path)?;
        let (outcomes_tx, outcomes_rx) = mpsc::channel(self.run.log_channel_capacity);
        let mut sink_task = sink.spawn(outcomes_rx);
        let aggregator = Arc::new(SummaryAggregator::new());

        let pool = EntityWorkerPool::new(
            self.executor(),
            self.run.procedures.clone(),
            self.run.worker_count,
            outcomes_tx,
            aggregator.clone(),
        );
        let mut dispatcher = EntityDispatcher::new(Arc::new(pool), concurrency);
        if let Some(progress) = self.progress.take() {
            dispatcher = dispatcher.with_progress_callback(progress);
        }

        let dispatched = {
            let dispatch = dispatcher.dispatch(entities);
            tokio::pin!(dispatch);
            tokio::select! {
                report = &mut dispatch => report?,
                stopped = &mut sink_task => {
                    let err = match stopped {
                        Ok(Err(e)) => SolBatchError::Sink(e),
                        Ok(Ok(_)) => SolBatchError::Sink(SinkError::Task(
                            "log sink stopped before the run finished".to_string(),
                        )),
                        Err(e) => SolBatchError::Join(e),
                    };
                    error!(error = %err, "Outcome log failed; aborting run");
                    return Err(err);
                }
            }
        };

        // Last sender goes with the pool, which closes the log channel.
        drop(dispatcher);
        let logged = sink_task.await??;
        if logged != dispatched.outcomes {
            warn!(logged = logged, produced = dispatched.outcomes, "Outcome count mismatch");
        }

        let summary = aggregator.snapshot();
        let summary_result = {
            let path = summary_path.clone();
            let snapshot = summary.clone();
            tokio::task::spawn_blocking(move || write_summary(path, &snapshot)).await?
        };
        if let Err(e) = &summary_result {
            error!(error = %e, path = %summary_path.display(), "Failed to write summary");
        }

        let consolidation = match self.mode {
            RunMode::Extract => self.consolidate().await,
            RunMode::Invoke => Vec::new(),
        };
        summary_result?;

        let report = RunReport {
            mode: self.mode,
            entities: entity_count,
            outcomes: dispatched.outcomes,
            failures: dispatched.failures,
            summary,
            consolidation,
            log_path,
            summary_path,
            elapsed: started.elapsed(),
        };
        info!(
            entities = report.entities,
            outcomes = report.outcomes,
            failures = report.failures,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Run finished"
        );
        Ok(report)
    }

    async fn consolidate(&self) -> Vec<ConsolidationReport> {
        let consolidator = OutputConsolidator::new(self.spool());
        let reports = consolidator.consolidate_all(&self.run.procedures).await;
        for report in &reports {
            match &report.result {
                Ok(ConsolidationOutcome::Merged { output, files, leftover, .. }) => {
                    info!(
                        operation = %report.operation,
                        output = %output.display(),
                        files = files,
                        leftover = leftover.len(),
                        "Operation output consolidated"
                    );
                }
                Ok(ConsolidationOutcome::NothingToMerge) => {
                    info!(operation = %report.operation, "No spools to consolidate");
                }
                Err(e) => {
                    error!(operation = %report.operation, error = %e, "Consolidation failed");
                }
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::OperationStatus;
    use crate::transport::memory::MemoryTransport;

    fn configs(dir: &std::path::Path) -> (AppConfig, RunConfig) {
        let app = AppConfig {
            concurrency: 2,
            log_file_path: dir.join("logs"),
            ..AppConfig::default()
        };
        let mut run = RunConfig::new("PKG", vec!["P1".to_string(), "P2".to_string()]);
        run.spool_output_path = dir.join("spool");
        run.worker_count = 2;
        (app, run)
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_any_call() {
        let dir = tempfile::tempdir().unwrap();
        let (app, mut run) = configs(dir.path());
        run.worker_count = 0;
        let transport = Arc::new(MemoryTransport::new());

        let result = BatchRunner::new(app, run, RunMode::Invoke, transport.clone())
            .run(vec!["S1".to_string()])
            .await;

        assert!(matches!(result, Err(SolBatchError::Config(_))));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unwritable_log_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, run) = configs(dir.path());
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        app.log_file_path = blocker;

        let result = BatchRunner::new(app, run, RunMode::Invoke, Arc::new(MemoryTransport::new()))
            .run(vec!["S1".to_string()])
            .await;

        assert!(matches!(result, Err(SolBatchError::Sink(SinkError::Create { .. }))));
    }

    #[tokio::test]
    async fn test_invoke_run_reports_failures_without_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let (app, run) = configs(dir.path());
        let transport = Arc::new(MemoryTransport::new().with_operation_failure("P1"));

        let report = BatchRunner::new(app, run, RunMode::Invoke, transport)
            .run(vec!["S1".to_string(), "S2".to_string()])
            .await
            .unwrap();

        assert_eq!(report.outcomes, 4);
        assert_eq!(report.failures, 2);
        assert_eq!(report.summary["P1"].status, OperationStatus::Fail);
        assert_eq!(report.summary["P2"].status, OperationStatus::Success);
        assert!(report.consolidation.is_empty());
        assert!(report.log_path.ends_with("PKG_insert.csv"));
        assert!(report.summary_path.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_log_write_failure_mid_run_aborts_dispatch() {
        let full = std::path::Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (app, mut run) = configs(dir.path());
        run.procedures = (1..=10).map(|i| format!("P{}", i)).collect();
        run.log_channel_capacity = 1;
        std::fs::create_dir_all(&app.log_file_path).unwrap();
        // Every write to the log fails with ENOSPC once the buffers spill.
        std::os::unix::fs::symlink(full, app.log_file_path.join("PKG_insert.csv")).unwrap();

        let transport = Arc::new(MemoryTransport::new().with_latency(std::time::Duration::from_millis(1)));
        let entities: Vec<String> = (0..1000).map(|i| format!("S{:04}", i)).collect();

        let result = BatchRunner::new(app, run, RunMode::Invoke, transport.clone())
            .run(entities)
            .await;

        assert!(matches!(result, Err(SolBatchError::Sink(SinkError::Write(_)))));
        assert!(transport.call_count() < 10_000);
    }
}
