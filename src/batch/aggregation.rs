use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Local};
use parking_lot::Mutex;

use crate::batch::types::{OperationAggregate, OperationStatus, Outcome};

/// Cross-entity summary keyed by operation name.
///
/// Every mutation happens under one exclusive lock. The fold is min/max/OR, so
/// the final state does not depend on the order in which entities report.
#[derive(Debug, Default)]
pub struct SummaryAggregator {
    operations: Mutex<HashMap<String, OperationAggregate>>,
}

impl SummaryAggregator {
    /// Empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one execution into the operation's aggregate
    pub fn update(
        &self,
        operation: &str,
        start: DateTime<Local>,
        end: DateTime<Local>,
        status: OperationStatus,
    ) {
        let mut operations = self.operations.lock();
        match operations.get_mut(operation) {
            Some(aggregate) => aggregate.absorb(start, end, status),
            None => {
                operations.insert(
                    operation.to_string(),
                    OperationAggregate::new(operation, start, end, status),
                );
            }
        }
    }

    /// Shorthand for [`update`](Self::update) with an outcome's fields
    pub fn record(&self, outcome: &Outcome) {
        self.update(&outcome.operation, outcome.start, outcome.end, outcome.status);
    }

    /// Copy of the current mapping, ordered by operation name
    pub fn snapshot(&self) -> BTreeMap<String, OperationAggregate> {
        self.operations
            .lock()
            .iter()
            .map(|(name, aggregate)| (name.clone(), aggregate.clone()))
            .collect()
    }

    /// Number of operations seen so far
    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    /// Whether nothing was recorded yet
    pub fn is_empty(&self) -> bool {
        self.operations.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Local> {
        Local.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_first_update_inserts() {
        let aggregator = SummaryAggregator::new();
        aggregator.update("P1", at(1), at(2), OperationStatus::Success);

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["P1"].earliest_start, at(1));
        assert_eq!(snapshot["P1"].status, OperationStatus::Success);
    }

    #[test]
    fn test_failure_is_sticky() {
        let aggregator = SummaryAggregator::new();
        aggregator.update("P2", at(0), at(1), OperationStatus::Fail);
        for i in 0..10 {
            aggregator.update("P2", at(i), at(i + 5), OperationStatus::Success);
        }

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot["P2"].status, OperationStatus::Fail);
        assert_eq!(snapshot["P2"].latest_end, at(14));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let aggregator = SummaryAggregator::new();
        aggregator.update("P1", at(0), at(1), OperationStatus::Success);
        let before = aggregator.snapshot();

        aggregator.update("P1", at(0), at(9), OperationStatus::Fail);
        assert_eq!(before["P1"].status, OperationStatus::Success);
        assert_eq!(aggregator.snapshot()["P1"].status, OperationStatus::Fail);
    }

    #[test]
    fn test_concurrent_updates_keep_one_entry_per_operation() {
        let aggregator = Arc::new(SummaryAggregator::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let aggregator = Arc::clone(&aggregator);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let status = if t == 3 && i == 50 {
                            OperationStatus::Fail
                        } else {
                            OperationStatus::Success
                        };
                        aggregator.update(&format!("P{}", i % 3), at(t * 100 + i), at(t * 100 + i + 1), status);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot["P0"].earliest_start, at(0));
        assert_eq!(snapshot["P2"].status, OperationStatus::Fail);
        assert_eq!(snapshot["P1"].status, OperationStatus::Success);
    }
}
