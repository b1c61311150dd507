//! Storage interface for the two persisted records.
//!
//! Policy-light: a store only reads and writes whole records. Every
//! consistency rule lives in the [`Coordinator`](crate::Coordinator).

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{Batch, BatchId, MachineState};

/// Document-style storage keyed by unique identifier.
///
/// Implementations must be safe to share across tasks. Writes are upserts.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load the machine state singleton, if it has been created.
    async fn load_machine_state(&self) -> Result<Option<MachineState>>;

    /// Create or replace the machine state singleton.
    async fn save_machine_state(&self, state: &MachineState) -> Result<()>;

    async fn load_batch(&self, id: BatchId) -> Result<Option<Batch>>;

    /// Create or replace a batch.
    async fn save_batch(&self, batch: &Batch) -> Result<()>;

    /// Remove a batch. Returns false if it did not exist.
    async fn delete_batch(&self, id: BatchId) -> Result<bool>;

    /// All batches, newest first by creation time.
    async fn list_batches(&self) -> Result<Vec<Batch>>;
}
