use async_trait::async_trait;
use common::{BatchRequest, Operation, OperationError};
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{DispatchError, Result};

/// External batch-compute provider.
#[async_trait]
pub trait BatchCompute: Send + Sync {
    /// Starts a run; the returned operation is usually not done yet.
    async fn submit(&self, req: &BatchRequest) -> Result<Operation>;

    async fn get_operation(&self, name: &str) -> Result<Operation>;
}

/* ---------------- in-memory ---------------- */

#[derive(Debug, Default)]
struct MemoryState {
    submitted: Vec<BatchRequest>,
    operations: HashMap<String, Operation>,
    fail_next: Option<String>,
    next_id: u64,
}

/// Keeps every request and lets callers finish operations by hand.
#[derive(Debug, Default)]
pub struct MemoryBatch {
    state: Mutex<MemoryState>,
}

impl MemoryBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `submit` fails with this message.
    pub async fn fail_next_submit(&self, message: impl Into<String>) {
        self.state.lock().await.fail_next = Some(message.into());
    }

    pub async fn submitted(&self) -> Vec<BatchRequest> {
        self.state.lock().await.submitted.clone()
    }

    /// Marks an operation done, with an error when `error` is set.
    pub async fn finish(&self, name: &str, error: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        let op = state
            .operations
            .get_mut(name)
            .ok_or_else(|| DispatchError::not_found(format!("operation {name}")))?;
        op.done = true;
        op.error = error.map(|message| OperationError {
            code: 10,
            message: message.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl BatchCompute for MemoryBatch {
    async fn submit(&self, req: &BatchRequest) -> Result<Operation> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.fail_next.take() {
            return Err(DispatchError::Upstream(message));
        }
        state.next_id += 1;
        let name = format!("op/{}", state.next_id);
        let op = Operation {
            name: name.clone(),
            metadata: json!({"containerName": req.container_name, "imageUri": req.image_uri}),
            done: false,
            error: None,
        };
        state.submitted.push(req.clone());
        state.operations.insert(name, op.clone());
        Ok(op)
    }

    async fn get_operation(&self, name: &str) -> Result<Operation> {
        self.state
            .lock()
            .await
            .operations
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::not_found(format!("operation {name}")))
    }
}
