//! In-memory [`Store`] for tests and single-process deployments.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::model::{Batch, BatchId, MachineState};
use crate::store::Store;

/// In-process store. Cloning shares the underlying data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    machine: Arc<RwLock<Option<MachineState>>>,
    batches: Arc<DashMap<BatchId, Batch>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_machine_state(&self) -> Result<Option<MachineState>> {
        Ok(self.machine.read().await.clone())
    }

    async fn save_machine_state(&self, state: &MachineState) -> Result<()> {
        *self.machine.write().await = Some(state.clone());
        Ok(())
    }

    async fn load_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        Ok(self.batches.get(&id).map(|entry| entry.value().clone()))
    }

    async fn save_batch(&self, batch: &Batch) -> Result<()> {
        self.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn delete_batch(&self, id: BatchId) -> Result<bool> {
        Ok(self.batches.remove(&id).is_some())
    }

    async fn list_batches(&self) -> Result<Vec<Batch>> {
        let mut batches: Vec<Batch> = self
            .batches
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(batches)
    }
}
