use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, error};

use crate::engine::{ExecutionError, OperationExecutor};
use crate::format::{FormatError, RowFormat, RowFormatter};
use crate::layout::{ColumnLayout, LayoutCache, LayoutSource};
use crate::spool::{SpoolDirectory, SpoolWriter};
use crate::transport::Transport;

/// Selects an operation's layout columns for the entity and spools the
/// formatted rows to `<spool>/<operation>/<entity>.spool`.
pub struct ExtractExecutor {
    transport: Arc<dyn Transport>,
    layouts: LayoutCache,
    formatter: Result<RowFormatter, FormatError>,
    spool: SpoolDirectory,
    entity_column: String,
}

impl ExtractExecutor {
    /// An unknown format is reported here, once; every extraction then fails
    /// with that error without touching the backend.
    pub fn new(
        transport: Arc<dyn Transport>,
        layouts: Arc<dyn LayoutSource>,
        format: Result<RowFormat, FormatError>,
        spool: SpoolDirectory,
        entity_column: impl Into<String>,
    ) -> Self {
        if let Err(e) = &format {
            error!(error = %e, "Output format misconfigured; extractions will fail");
        }
        Self {
            transport,
            layouts: LayoutCache::new(layouts),
            formatter: format.map(RowFormatter::new),
            spool,
            entity_column: entity_column.into(),
        }
    }

    /// `SELECT CAST(c AS TEXT) AS c, ... FROM <operation> WHERE <entity_column> = $1`
    pub fn select_statement(&self, operation: &str, layout: &ColumnLayout) -> String {
        let columns: Vec<String> = layout
            .column_names()
            .map(|c| format!("CAST({c} AS TEXT) AS {c}"))
            .collect();
        format!(
            "SELECT {} FROM {} WHERE {} = $1",
            columns.join(", "),
            operation,
            self.entity_column
        )
    }

    async fn spool_rows(
        &self,
        writer: &mut SpoolWriter,
        formatter: &RowFormatter,
        layout: &ColumnLayout,
        sql: &str,
        entity_id: &str,
    ) -> Result<(), ExecutionError> {
        let mut rows = self.transport.query(sql, entity_id);
        while let Some(row) = rows.next().await {
            let line = formatter.render(layout, &row?);
            writer.append(&line).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OperationExecutor for ExtractExecutor {
    async fn execute(&self, operation: &str, entity_id: &str) -> Result<(), ExecutionError> {
        // Rows from an earlier run must not outlive a failure in this one.
        self.spool.discard(operation, entity_id).await?;

        let formatter = self.formatter.as_ref().map_err(|e| e.clone())?;
        let layout = self.layouts.get(operation).await?;
        let sql = self.select_statement(operation, &layout);

        let mut writer = self.spool.writer(operation, entity_id).await?;
        match self
            .spool_rows(&mut writer, formatter, &layout, &sql, entity_id)
            .await
        {
            Ok(()) => {
                let rows = writer.commit().await?;
                debug!(operation = %operation, entity = %entity_id, rows = rows, "Spooled rows");
                Ok(())
            }
            Err(e) => {
                writer.abort().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Alignment, ColumnSpec, StaticLayoutSource};
    use crate::transport::memory::MemoryTransport;
    use crate::transport::Row;

    fn row(values: &[&str]) -> Row {
        values.iter().map(|v| Some(v.to_string())).collect()
    }

    fn layouts() -> Arc<dyn LayoutSource> {
        Arc::new(StaticLayoutSource::new().with_layout(
            "P1",
            ColumnLayout::new(vec![
                ColumnSpec::new("ID", 5, Alignment::Left),
                ColumnSpec::new("AMT", 6, Alignment::Right),
            ]),
        ))
    }

    fn executor(transport: MemoryTransport, format: &str, spool: &SpoolDirectory) -> ExtractExecutor {
        ExtractExecutor::new(
            Arc::new(transport),
            layouts(),
            RowFormat::from_config(format, "|"),
            spool.clone(),
            "sol_id",
        )
    }

    #[test]
    fn test_select_statement_uses_layout_columns() {
        let spool = SpoolDirectory::new("/tmp/unused");
        let executor = executor(MemoryTransport::new(), "fixed", &spool);
        let layout = ColumnLayout::new(vec![
            ColumnSpec::new("ID", 5, Alignment::Left),
            ColumnSpec::new("AMT", 6, Alignment::Right),
        ]);

        assert_eq!(
            executor.select_statement("P1", &layout),
            "SELECT CAST(ID AS TEXT) AS ID, CAST(AMT AS TEXT) AS AMT FROM P1 WHERE sol_id = $1"
        );
    }

    #[tokio::test]
    async fn test_fixed_extraction_spools_rows() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolDirectory::new(dir.path());
        let transport = MemoryTransport::new().with_rows("P1", "S1", vec![row(&["7", "42"])]);

        executor(transport, "fixed", &spool).execute("P1", "S1").await.unwrap();

        let written = std::fs::read_to_string(spool.spool_path("P1", "S1").unwrap()).unwrap();
        assert_eq!(written, "7        42\n");
    }

    #[tokio::test]
    async fn test_empty_result_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolDirectory::new(dir.path());

        executor(MemoryTransport::new(), "delimited", &spool)
            .execute("P1", "S1")
            .await
            .unwrap();

        let written = std::fs::read_to_string(spool.spool_path("P1", "S1").unwrap()).unwrap();
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_discards_partial_spool() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolDirectory::new(dir.path());
        let transport = MemoryTransport::new()
            .with_rows("P1", "S1", vec![row(&["1", "2"]), row(&["3", "4"])])
            .with_scan_failure("P1", "S1", 1);

        let err = executor(transport, "fixed", &spool)
            .execute("P1", "S1")
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Transport(_)));
        assert!(spool.list_spools("P1").unwrap().is_empty());
        assert_eq!(std::fs::read_dir(spool.operation_dir("P1")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_layout_fails_without_query() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolDirectory::new(dir.path());
        let transport = Arc::new(MemoryTransport::new());
        let executor = ExtractExecutor::new(
            transport.clone(),
            layouts(),
            RowFormat::from_config("fixed", "|"),
            spool,
            "sol_id",
        );

        let err = executor.execute("P9", "S1").await.unwrap_err();
        assert!(matches!(err, ExecutionError::Layout(_)));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_format_fails_every_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolDirectory::new(dir.path());
        let transport = Arc::new(MemoryTransport::new());
        let executor = ExtractExecutor::new(
            transport.clone(),
            layouts(),
            RowFormat::from_config("xml", "|"),
            spool,
            "sol_id",
        );

        let err = executor.execute("P1", "S1").await.unwrap_err();
        assert!(err.to_string().contains("xml"));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_extraction_removes_earlier_spool() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolDirectory::new(dir.path());
        let stale = spool.spool_path("P1", "S1").unwrap();
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "STALE\n").unwrap();

        let transport = MemoryTransport::new().with_failure("P1", "S1");
        let err = executor(transport, "fixed", &spool)
            .execute("P1", "S1")
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Transport(_)));
        assert!(!stale.exists());
        assert!(spool.list_spools("P1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_layout_failure_removes_earlier_spool() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolDirectory::new(dir.path());
        let stale = spool.spool_path("P9", "S1").unwrap();
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "STALE\n").unwrap();

        let err = executor(MemoryTransport::new(), "fixed", &spool)
            .execute("P9", "S1")
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Layout(_)));
        assert!(!stale.exists());
    }
}
