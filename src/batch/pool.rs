//! Per-entity worker pool
//!
//! Each entity gets a queue seeded with every operation name and closed right
//! after seeding. `W` workers pull from it until it is empty, so every
//! operation runs exactly once and at most `W` run at the same time.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::batch::aggregation::SummaryAggregator;
use crate::batch::types::Outcome;
use crate::engine::{ExecutionError, OperationExecutor};

/// Counts produced by one entity's pool run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityReport {
    /// Outcomes produced
    pub outcomes: usize,
    /// How many of them failed
    pub failures: usize,
}

impl EntityReport {
    fn add(&mut self, other: EntityReport) {
        self.outcomes += other.outcomes;
        self.failures += other.failures;
    }
}

/// Runs the fixed operation list for one entity with `workers` workers
pub struct EntityWorkerPool {
    executor: Arc<dyn OperationExecutor>,
    operations: Arc<[String]>,
    workers: usize,
    outcomes: mpsc::Sender<Outcome>,
    aggregator: Arc<SummaryAggregator>,
}

impl EntityWorkerPool {
    /// `workers` is clamped to at least one
    pub fn new(
        executor: Arc<dyn OperationExecutor>,
        operations: Vec<String>,
        workers: usize,
        outcomes: mpsc::Sender<Outcome>,
        aggregator: Arc<SummaryAggregator>,
    ) -> Self {
        Self {
            executor,
            operations: operations.into(),
            workers: workers.max(1),
            outcomes,
            aggregator,
        }
    }

    /// Operations run for every entity, in queue order
    pub fn operations(&self) -> &[String] {
        &self.operations
    }

    /// Workers per entity
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Process every operation for `entity_id`; returns once each one has
    /// produced its outcome.
    pub async fn run(&self, entity_id: &str) -> EntityReport {
        let (tx, rx) = mpsc::unbounded_channel();
        for operation in self.operations.iter() {
            // The receiver is alive until the workers below finish.
            let _ = tx.send(operation.clone());
        }
        drop(tx);

        let queue = Arc::new(Mutex::new(rx));
        let entity: Arc<str> = Arc::from(entity_id);
        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            workers.spawn(worker_loop(
                worker,
                entity.clone(),
                queue.clone(),
                self.executor.clone(),
                self.outcomes.clone(),
                self.aggregator.clone(),
            ));
        }

        let mut report = EntityReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(worker_report) => report.add(worker_report),
                Err(e) => error!(entity = %entity_id, error = %e, "Worker task failed"),
            }
        }
        report
    }
}

async fn worker_loop(
    worker: usize,
    entity: Arc<str>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    executor: Arc<dyn OperationExecutor>,
    outcomes: mpsc::Sender<Outcome>,
    aggregator: Arc<SummaryAggregator>,
) -> EntityReport {
    let mut report = EntityReport::default();
    loop {
        let next = queue.lock().await.recv().await;
        let Some(operation) = next else {
            break;
        };

        let outcome = execute_one(executor.as_ref(), &entity, &operation).await;
        report.outcomes += 1;
        if outcome.status.is_fail() {
            report.failures += 1;
        }

        // The summary only counts what was handed to the log first.
        let logged = outcome.clone();
        if let Err(e) = outcomes.send(outcome).await {
            error!(
                entity = %entity,
                operation = %e.0.operation,
                "Outcome log closed; outcome not persisted"
            );
        }
        aggregator.record(&logged);
    }
    debug!(worker = worker, entity = %entity, "Worker drained queue");
    report
}

/// Time one execution and turn whatever happens, panics included, into an outcome
async fn execute_one(executor: &dyn OperationExecutor, entity: &str, operation: &str) -> Outcome {
    let start = Local::now();
    let clock = Instant::now();
    let result = AssertUnwindSafe(executor.execute(operation, entity))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ExecutionError::Panicked(panic_message(panic.as_ref()))));
    let end = Local::now();

    match result {
        Ok(()) => {
            debug!(
                entity = %entity,
                operation = %operation,
                duration_ms = clock.elapsed().as_millis() as u64,
                "Operation succeeded"
            );
            Outcome::success(entity, operation, start, end)
        }
        Err(e) => {
            warn!(
                entity = %entity,
                operation = %operation,
                duration_ms = clock.elapsed().as_millis() as u64,
                error = %e,
                "Operation failed"
            );
            Outcome::failure(entity, operation, start, end, e.to_string())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
