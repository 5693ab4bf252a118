//! Backend access
//!
//! The batch engine only needs two things from the backend: run a named
//! procedure for an entity, and stream the rows of a parameterized query.

/// Scripted in-memory backend
pub mod memory;
/// PostgreSQL backend
pub mod postgres;

pub use memory::MemoryTransport;
pub use postgres::PgTransport;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// One result row, column values rendered as text; `None` is a backend NULL
pub type Row = Vec<Option<String>>;

/// Row cursor returned by [`Transport::query`]
pub type RowStream<'a> = BoxStream<'a, Result<Row, TransportError>>;

/// Errors raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Driver or server error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Name is not safe to splice into SQL
    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// Failure reported by a non-SQL backend
    #[error("{0}")]
    Remote(String),
}

/// Remote-call transport shared by every worker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `<namespace>.<operation>` with the entity ID as its only argument
    async fn invoke(&self, namespace: &str, operation: &str, entity_id: &str) -> Result<(), TransportError>;

    /// Run `sql` with the entity ID bound to its single parameter. Errors while
    /// executing the statement arrive as the first item of the stream.
    fn query<'a>(&'a self, sql: &'a str, entity_id: &'a str) -> RowStream<'a>;
}
