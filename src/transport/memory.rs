use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use crate::transport::{Row, RowStream, Transport, TransportError};

/// Kind of call recorded by [`MemoryTransport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// [`Transport::invoke`](crate::transport::Transport::invoke)
    Invoke,
    /// [`Transport::query`](crate::transport::Transport::query)
    Query,
}

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    /// Invoke or query
    pub kind: CallKind,
    /// Procedure name for invokes, table name for queries
    pub target: String,
    /// Entity the call was made for
    pub entity_id: String,
}

/// In-memory transport for tests and dry runs.
///
/// Failures, result rows and latency are scripted up front; every call is
/// recorded, and the highest number of simultaneous calls is tracked.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    failures: HashSet<(String, Option<String>)>,
    rows: HashMap<(String, String), Vec<Row>>,
    scan_failures: HashMap<(String, String), usize>,
    latency: Option<Duration>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryTransport {
    /// Transport where every call succeeds with no rows
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `operation` fail for one entity
    pub fn with_failure(mut self, operation: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.failures.insert((operation.into(), Some(entity_id.into())));
        self
    }

    /// Make `operation` fail for every entity
    pub fn with_operation_failure(mut self, operation: impl Into<String>) -> Self {
        self.failures.insert((operation.into(), None));
        self
    }

    /// Rows returned when querying `table` for `entity_id`
    pub fn with_rows(mut self, table: impl Into<String>, entity_id: impl Into<String>, rows: Vec<Row>) -> Self {
        self.rows.insert((table.into(), entity_id.into()), rows);
        self
    }

    /// Fail the row cursor after `after` rows have been delivered
    pub fn with_scan_failure(mut self, table: impl Into<String>, entity_id: impl Into<String>, after: usize) -> Self {
        self.scan_failures.insert((table.into(), entity_id.into()), after);
        self
    }

    /// Hold every call for `latency` before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Number of calls so far
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of calls observed running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    async fn answer(&self, kind: CallKind, target: &str, entity_id: &str) -> Result<(), TransportError> {
        let _in_flight = self.enter();
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.calls.lock().push(Call {
            kind,
            target: target.to_string(),
            entity_id: entity_id.to_string(),
        });

        let scripted = self
            .failures
            .contains(&(target.to_string(), Some(entity_id.to_string())))
            || self.failures.contains(&(target.to_string(), None));
        if scripted {
            return Err(TransportError::Remote(format!(
                "{} failed for {}",
                target, entity_id
            )));
        }
        Ok(())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Table named after the first `FROM` keyword
fn table_name(sql: &str) -> Option<&str> {
    let mut tokens = sql.split_whitespace();
    tokens.find(|t| t.eq_ignore_ascii_case("from"))?;
    tokens.next()
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn invoke(&self, _namespace: &str, operation: &str, entity_id: &str) -> Result<(), TransportError> {
        self.answer(CallKind::Invoke, operation, entity_id).await
    }

    fn query<'a>(&'a self, sql: &'a str, entity_id: &'a str) -> RowStream<'a> {
        let fetch = async move {
            let table = table_name(sql)
                .ok_or_else(|| TransportError::Remote(format!("no table in query: {}", sql)))?;
            self.answer(CallKind::Query, table, entity_id).await?;

            let key = (table.to_string(), entity_id.to_string());
            let rows = self.rows.get(&key).cloned().unwrap_or_default();
            let mut items: Vec<Result<Row, TransportError>> = match self.scan_failures.get(&key) {
                Some(&after) => rows.into_iter().take(after).map(Ok).collect(),
                None => rows.into_iter().map(Ok).collect(),
            };
            if self.scan_failures.contains_key(&key) {
                items.push(Err(TransportError::Remote(format!(
                    "row scan failed for {}",
                    entity_id
                ))));
            }
            Ok::<_, TransportError>(items)
        };

        stream::once(fetch)
            .flat_map(|fetched| match fetched {
                Ok(items) => stream::iter(items),
                Err(e) => stream::iter(vec![Err(e)]),
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::sync::Arc;

    fn row(values: &[&str]) -> Row {
        values.iter().map(|v| Some(v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let transport = MemoryTransport::new()
            .with_failure("P2", "S1")
            .with_operation_failure("P3");

        assert!(transport.invoke("PKG", "P1", "S1").await.is_ok());
        assert!(transport.invoke("PKG", "P2", "S1").await.is_err());
        assert!(transport.invoke("PKG", "P2", "S2").await.is_ok());
        assert!(transport.invoke("PKG", "P3", "S9").await.is_err());
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test]
    async fn test_query_streams_rows() {
        let transport = MemoryTransport::new().with_rows("P1", "S1", vec![row(&["7", "42"])]);

        let rows: Vec<Row> = transport
            .query("SELECT a FROM P1 WHERE sol_id = $1", "S1")
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows, vec![row(&["7", "42"])]);

        let empty: Vec<Row> = transport
            .query("SELECT a FROM P1 WHERE sol_id = $1", "S2")
            .try_collect()
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_after_rows() {
        let transport = MemoryTransport::new()
            .with_rows("P1", "S1", vec![row(&["1"]), row(&["2"]), row(&["3"])])
            .with_scan_failure("P1", "S1", 2);

        let items: Vec<_> = transport.query("SELECT a FROM P1", "S1").collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok() && items[1].is_ok());
        assert!(items[2].is_err());
    }

    #[tokio::test]
    async fn test_peak_in_flight() {
        let transport = Arc::new(MemoryTransport::new().with_latency(Duration::from_millis(20)));
        let calls: Vec<_> = (0..3)
            .map(|i| {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move { transport.invoke("PKG", "P1", &format!("S{}", i)).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }

        assert_eq!(transport.peak_in_flight(), 3);
    }
}
