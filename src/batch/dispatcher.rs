use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::batch::pool::{EntityReport, EntityWorkerPool};
use crate::{Result, SolBatchError};

/// Called with (completed, total) each time an entity finishes
pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Totals for one dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Entities submitted
    pub entities: usize,
    /// Entities whose pool finished
    pub completed: usize,
    /// Outcomes produced across all entities
    pub outcomes: usize,
    /// How many of them failed
    pub failures: usize,
    /// Wall time of the dispatch
    pub elapsed: Duration,
}

/// Keeps at most `concurrency` entities in flight, one worker pool run each
pub struct EntityDispatcher {
    pool: Arc<EntityWorkerPool>,
    concurrency: usize,
    progress: Option<Arc<ProgressCallback>>,
}

impl EntityDispatcher {
    /// At most `concurrency` entities (at least one) run at the same time
    pub fn new(pool: Arc<EntityWorkerPool>, concurrency: usize) -> Self {
        Self {
            pool,
            concurrency: concurrency.max(1),
            progress: None,
        }
    }

    /// Called with (completed, total) after each entity finishes
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(Box::new(callback)));
        self
    }

    /// Entities allowed in flight
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every entity and wait for all of them.
    ///
    /// A permit is taken before an entity's task is spawned and released when
    /// its pool returns, so entities past the limit wait here in list order.
    #[instrument(skip(self, entities), fields(entities = entities.len(), concurrency = self.concurrency))]
    pub async fn dispatch(&self, entities: Vec<String>) -> Result<DispatchReport> {
        let started = Instant::now();
        let total = entities.len();
        info!(total = total, concurrency = self.concurrency, "Dispatching entities");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for entity in entities {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SolBatchError::Dispatch(e.to_string()))?;

            let pool = self.pool.clone();
            let completed = completed.clone();
            let progress = self.progress.clone();
            tasks.spawn(async move {
                debug!(entity = %entity, "Entity started");
                let report = pool.run(&entity).await;
                drop(permit);

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    entity = %entity,
                    completed = done,
                    total = total,
                    failures = report.failures,
                    "Entity finished"
                );
                if let Some(callback) = progress {
                    callback(done, total);
                }
                report
            });
        }

        let mut totals = EntityReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    totals.outcomes += report.outcomes;
                    totals.failures += report.failures;
                }
                Err(e) => error!(error = %e, "Entity task failed"),
            }
        }

        let report = DispatchReport {
            entities: total,
            completed: completed.load(Ordering::SeqCst),
            outcomes: totals.outcomes,
            failures: totals.failures,
            elapsed: started.elapsed(),
        };
        info!(
            completed = report.completed,
            outcomes = report.outcomes,
            failures = report.failures,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "All entities finished"
        );
        Ok(report)
    }
}
