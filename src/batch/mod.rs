/// Per-operation summary aggregation
pub mod aggregation;
/// Bounded entity dispatch
pub mod dispatcher;
pub mod pool;
pub mod runner;
/// Run modes, outcomes and summary records
pub mod types;

pub use aggregation::SummaryAggregator;
pub use dispatcher::{DispatchReport, EntityDispatcher, ProgressCallback};
pub use pool::{EntityReport, EntityWorkerPool};
pub use runner::{BatchRunner, RunReport};
pub use types::*;
