//! Operation execution
//!
//! An executor runs one named operation for one entity and reports success or
//! a failure description. Nothing below this boundary escapes as a crash.

/// Extraction into spool files
pub mod extract;
/// Stored procedure invocation
pub mod invoke;

pub use extract::ExtractExecutor;
pub use invoke::InvokeExecutor;

use async_trait::async_trait;
use thiserror::Error;

use crate::format::FormatError;
use crate::layout::LayoutError;
use crate::spool::SpoolError;
use crate::transport::TransportError;

/// Why one execution failed; the `Display` text becomes the outcome's detail
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Backend call failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Layout missing or malformed
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// Spool file could not be written
    #[error(transparent)]
    Spool(#[from] SpoolError),

    /// Output format misconfigured
    #[error(transparent)]
    Format(#[from] FormatError),

    /// Executor panicked; holds the panic message
    #[error("Operation panicked: {0}")]
    Panicked(String),
}

/// Runs one named operation for one entity
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Run `operation` for one entity
    async fn execute(&self, operation: &str, entity_id: &str) -> Result<(), ExecutionError>;
}
