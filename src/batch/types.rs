use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// What each operation does for an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Call `<namespace>.<operation>(entity)`
    Invoke,
    /// Select the layout's columns for the entity and spool formatted rows
    Extract,
}

impl RunMode {
    /// Tag used in log and summary file names
    pub fn file_tag(self) -> &'static str {
        match self {
            RunMode::Invoke => "insert",
            RunMode::Extract => "extract",
        }
    }
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "i" | "invoke" | "insert" => Ok(RunMode::Invoke),
            "e" | "extract" => Ok(RunMode::Extract),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

/// Status of one execution, or of an operation across all entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Operation completed
    Success,
    /// Operation failed or panicked
    Fail,
}

impl OperationStatus {
    /// Failure wins: `Fail` merged with anything stays `Fail`
    #[inline]
    pub fn merge(self, other: OperationStatus) -> OperationStatus {
        if self.is_fail() || other.is_fail() {
            OperationStatus::Fail
        } else {
            OperationStatus::Success
        }
    }

    /// True for [`OperationStatus::Fail`]
    #[inline]
    pub fn is_fail(self) -> bool {
        matches!(self, OperationStatus::Fail)
    }

    /// `SUCCESS` or `FAIL`, as written to the log
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Success => "SUCCESS",
            OperationStatus::Fail => "FAIL",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timed result of one operation for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Entity the operation ran for
    pub entity_id: String,
    /// Operation name
    pub operation: String,
    /// When execution started
    pub start: DateTime<Local>,
    /// When execution ended
    pub end: DateTime<Local>,
    /// Success or failure
    pub status: OperationStatus,
    /// Empty unless the status is `Fail`
    pub error_detail: String,
}

impl Outcome {
    /// Successful outcome
    pub fn success(
        entity_id: impl Into<String>,
        operation: impl Into<String>,
        start: DateTime<Local>,
        end: DateTime<Local>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            operation: operation.into(),
            start,
            end,
            status: OperationStatus::Success,
            error_detail: String::new(),
        }
    }

    /// Failed outcome carrying the error text verbatim
    pub fn failure(
        entity_id: impl Into<String>,
        operation: impl Into<String>,
        start: DateTime<Local>,
        end: DateTime<Local>,
        error_detail: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            operation: operation.into(),
            start,
            end,
            status: OperationStatus::Fail,
            error_detail: error_detail.into(),
        }
    }

    /// Wall time between start and end, zero if the clock went backwards
    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or_default()
    }
}

/// Running aggregate of every outcome seen for one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationAggregate {
    /// Operation name
    pub operation: String,
    /// Earliest start over all entities
    pub earliest_start: DateTime<Local>,
    /// Latest end over all entities
    pub latest_end: DateTime<Local>,
    /// `Fail` once any entity failed
    pub status: OperationStatus,
}

impl OperationAggregate {
    /// Aggregate seeded from a single execution
    pub fn new(
        operation: impl Into<String>,
        start: DateTime<Local>,
        end: DateTime<Local>,
        status: OperationStatus,
    ) -> Self {
        Self {
            operation: operation.into(),
            earliest_start: start,
            latest_end: end,
            status,
        }
    }

    /// Fold one more execution in. Start only moves earlier, end only later,
    /// and a failure is never undone.
    pub fn absorb(&mut self, start: DateTime<Local>, end: DateTime<Local>, status: OperationStatus) {
        if start < self.earliest_start {
            self.earliest_start = start;
        }
        if end > self.latest_end {
            self.latest_end = end;
        }
        self.status = self.status.merge(status);
    }

    /// Span from the earliest start to the latest end
    pub fn elapsed(&self) -> Duration {
        (self.latest_end - self.earliest_start)
            .to_std()
            .unwrap_or_default()
    }
}
