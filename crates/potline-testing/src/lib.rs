//! Testing utilities for potline.
//!
//! - [`RecordingNotifier`] captures controller calls and can simulate an
//!   unreachable controller
//! - [`FlakyStore`] wraps any [`Store`] and fails chosen operations on demand
//! - [`check_invariants`] verifies the cross-record invariants against a store

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use potline::{
    Batch, BatchId, BatchStatus, HardwareNotifier, MachineState, NotifyError, Store,
};

/// A call made to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareCall {
    Start(BatchId),
    Stop,
}

/// Notifier that records every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    calls: Arc<Mutex<Vec<HardwareCall>>>,
    unreachable: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records calls but reports every one of them as failed.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<HardwareCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: HardwareCall) -> Result<(), NotifyError> {
        self.calls.lock().unwrap().push(call);
        if self.unreachable {
            return Err(NotifyError::Unreachable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl HardwareNotifier for RecordingNotifier {
    async fn notify_start(&self, batch_id: BatchId) -> Result<(), NotifyError> {
        self.record(HardwareCall::Start(batch_id))
    }

    async fn notify_stop(&self) -> Result<(), NotifyError> {
        self.record(HardwareCall::Stop)
    }
}

/// Store operations that [`FlakyStore`] can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    LoadMachineState,
    SaveMachineState,
    LoadBatch,
    SaveBatch,
    DeleteBatch,
    ListBatches,
}

/// Store wrapper that injects failures.
///
/// Each armed operation fails the given number of times, then passes through.
#[derive(Debug, Clone)]
pub struct FlakyStore<S> {
    inner: S,
    armed: Arc<Mutex<HashMap<StoreOp, usize>>>,
}

impl<S: Store> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            armed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail(&self, op: StoreOp, times: usize) {
        self.armed.lock().unwrap().insert(op, times);
    }

    pub fn fail_next(&self, op: StoreOp) {
        self.fail(op, 1);
    }

    fn trip(&self, op: StoreOp) -> Result<()> {
        let mut armed = self.armed.lock().unwrap();
        match armed.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(anyhow!("injected {op:?} failure"))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<S: Store> Store for FlakyStore<S> {
    async fn load_machine_state(&self) -> Result<Option<MachineState>> {
        self.trip(StoreOp::LoadMachineState)?;
        self.inner.load_machine_state().await
    }

    async fn save_machine_state(&self, state: &MachineState) -> Result<()> {
        self.trip(StoreOp::SaveMachineState)?;
        self.inner.save_machine_state(state).await
    }

    async fn load_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        self.trip(StoreOp::LoadBatch)?;
        self.inner.load_batch(id).await
    }

    async fn save_batch(&self, batch: &Batch) -> Result<()> {
        self.trip(StoreOp::SaveBatch)?;
        self.inner.save_batch(batch).await
    }

    async fn delete_batch(&self, id: BatchId) -> Result<bool> {
        self.trip(StoreOp::DeleteBatch)?;
        self.inner.delete_batch(id).await
    }

    async fn list_batches(&self) -> Result<Vec<Batch>> {
        self.trip(StoreOp::ListBatches)?;
        self.inner.list_batches().await
    }
}

/// Verify the cross-record invariants:
///
/// - the active id is set iff exactly one batch is `Ongoing` or `Paused`,
///   and names that batch
/// - every batch has `pots_done_count <= output_count`
/// - every finished batch reached its target
pub async fn check_invariants(store: &dyn Store) -> Result<()> {
    let state = store.load_machine_state().await?.unwrap_or_default();
    let batches = store.list_batches().await?;

    let live: Vec<&Batch> = batches.iter().filter(|b| !b.is_terminal()).collect();
    if live.len() > 1 {
        bail!("{} live batches", live.len());
    }
    let expected = live.first().map(|b| b.id);
    if state.active_batch_id != expected {
        bail!(
            "active batch is {:?} but live batch is {:?}",
            state.active_batch_id,
            expected
        );
    }

    for batch in &batches {
        if batch.pots_done_count > batch.output_count {
            bail!(
                "batch {} has {} of {} pots",
                batch.id,
                batch.pots_done_count,
                batch.output_count
            );
        }
        if batch.status == BatchStatus::Finished && batch.pots_done_count != batch.output_count {
            bail!("batch {} finished short of its target", batch.id);
        }
    }

    Ok(())
}

/// Panicking form of [`check_invariants`].
pub async fn assert_invariants(store: &dyn Store) {
    if let Err(violation) = check_invariants(store).await {
        panic!("invariant violated: {violation}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use potline::{MemoryStore, NewBatch};

    #[tokio::test]
    async fn flaky_store_fails_then_recovers() {
        let store = FlakyStore::new(MemoryStore::new());
        store.fail(StoreOp::ListBatches, 2);

        assert!(store.list_batches().await.is_err());
        assert!(store.list_batches().await.is_err());
        assert!(store.list_batches().await.is_ok());
    }

    #[tokio::test]
    async fn invariants_catch_orphan_live_batch() {
        let store = MemoryStore::new();
        let batch = Batch::start(NewBatch::new("orphan", 1, 3));
        store.save_batch(&batch).await.unwrap();

        assert!(check_invariants(&store).await.is_err());

        let mut state = MachineState::default();
        state.active_batch_id = Some(batch.id);
        store.save_machine_state(&state).await.unwrap();
        assert!(check_invariants(&store).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_notifier_still_records() {
        let notifier = RecordingNotifier::unreachable();
        assert!(notifier.notify_stop().await.is_err());
        assert_eq!(notifier.calls(), vec![HardwareCall::Stop]);
    }
}
