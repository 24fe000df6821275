pub mod memory;

use crate::catalog::types::{Record, Value};
use crate::query::plan::Selection;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("storage timed out")]
    Timeout,
}

/// Backend that runs compiled selections and record mutations.
///
/// A missing record is `Ok(None)` / `Ok(false)`, never an error.
#[async_trait]
pub trait RecordExecutor: Send + Sync {
    async fn fetch(&self, kind: &str, id: &Value) -> Result<Option<Record>, StorageError>;

    async fn select(&self, kind: &str, selection: &Selection) -> Result<Vec<Record>, StorageError>;

    /// Merges `changes` into the stored record and returns the result.
    async fn update(
        &self,
        kind: &str,
        id: &Value,
        changes: &Record,
    ) -> Result<Option<Record>, StorageError>;

    async fn delete(&self, kind: &str, id: &Value) -> Result<bool, StorageError>;
}
