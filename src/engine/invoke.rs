use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::{ExecutionError, OperationExecutor};
use crate::transport::Transport;

/// Calls `<namespace>.<operation>(entity)` and nothing else
pub struct InvokeExecutor {
    transport: Arc<dyn Transport>,
    namespace: String,
}

impl InvokeExecutor {
    /// Calls `<namespace>.<operation>(entity)` on `transport`
    pub fn new(transport: Arc<dyn Transport>, namespace: impl Into<String>) -> Self {
        Self {
            transport,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl OperationExecutor for InvokeExecutor {
    async fn execute(&self, operation: &str, entity_id: &str) -> Result<(), ExecutionError> {
        self.transport
            .invoke(&self.namespace, operation, entity_id)
            .await?;
        Ok(())
    }
}
