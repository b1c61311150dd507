//! Operations that evolve the machine state and batches together.
//!
//! Every operation that reads and then writes the machine state holds the
//! coordinator's lock for its whole read, validate, mutate, persist
//! sequence. Since every batch mutation also touches the machine state, this
//! serializes all mutations. Read-only batch queries skip the lock.
//!
//! Hardware notifications and event emission happen after the lock is
//! released and never affect the outcome of the operation.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::bus::{BatchEvent, EventBus};
use crate::error::{CoordinatorError, Result};
use crate::lifecycle::{self, Transition};
use crate::model::{
    Batch, BatchId, MachineState, MachineStatus, NewBatch, ProgressReport, SupplyReading,
};
use crate::notifier::HardwareNotifier;
use crate::store::Store;

/// Coordinates batches with the machine state singleton.
pub struct Coordinator {
    store: Arc<dyn Store>,
    notifier: Arc<dyn HardwareNotifier>,
    bus: EventBus,
    machine_lock: Mutex<()>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn HardwareNotifier>) -> Self {
        Self {
            store,
            notifier,
            bus: EventBus::new(),
            machine_lock: Mutex::new(()),
        }
    }

    /// Publish events on an existing bus instead of a private one.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Current machine state, created with defaults on first access.
    pub async fn machine_state(&self) -> Result<MachineState> {
        let _guard = self.machine_lock.lock().await;
        self.resolve_machine_state().await
    }

    /// Machine state plus the flags a dashboard needs.
    pub async fn machine_status(&self) -> Result<MachineStatus> {
        self.machine_state().await.map(MachineStatus::from)
    }

    pub async fn list_batches(&self) -> Result<Vec<Batch>> {
        Ok(self.store.list_batches().await?)
    }

    pub async fn get_batch(&self, id: BatchId) -> Result<Batch> {
        self.store
            .load_batch(id)
            .await?
            .ok_or(CoordinatorError::NotFound(id))
    }

    /// Start a new batch. Requires a free machine and sufficient supplies.
    pub async fn create_batch(&self, request: NewBatch) -> Result<Batch> {
        let request = request.validate()?;

        let batch = {
            let _guard = self.machine_lock.lock().await;
            let mut state = self.resolve_machine_state().await?;

            if let Some(active) = state.active_batch_id {
                return Err(CoordinatorError::AlreadyActive(active));
            }
            if let Some(orphan) = self.find_unreferenced_live_batch().await? {
                return Err(CoordinatorError::AlreadyActive(orphan));
            }
            let supplies = state.supplies();
            if !supplies.is_sufficient() {
                return Err(CoordinatorError::SuppliesLow(supplies));
            }

            let batch = Batch::start(request);
            let previous = state.clone();
            state.active_batch_id = Some(batch.id);
            state.touch();

            self.commit(&previous, Some(&state), Some(&batch)).await?;
            batch
        };

        info!(
            batch_id = %batch.id,
            title = %batch.title,
            output_count = batch.output_count,
            "Batch started"
        );
        self.bus.emit(BatchEvent::BatchCreated {
            batch_id: batch.id,
            output_count: batch.output_count,
        });
        self.notify_start(batch.id).await;

        Ok(batch)
    }

    /// Record completed pots, applying any sensor levels sent alongside.
    pub async fn report_progress(&self, id: BatchId, report: ProgressReport) -> Result<Batch> {
        let increment = report.increment()?;

        let (batch, transition, supplies_changed) = {
            let _guard = self.machine_lock.lock().await;
            let mut state = self.resolve_machine_state().await?;
            let mut batch = self.load_existing(id).await?;

            let previous = state.clone();
            let supplies_changed = state.apply_reading(report.reading);
            let transition = lifecycle::record_progress(&mut batch, increment, state.supplies())?;

            let mut state_changed = supplies_changed;
            if transition == Some(Transition::Finished) && state.is_active(id) {
                state.active_batch_id = None;
                state_changed = true;
            }
            if state_changed {
                state.touch();
            }

            self.commit(&previous, state_changed.then_some(&state), Some(&batch))
                .await?;
            (batch, transition, supplies_changed.then(|| state.supplies()))
        };

        info!(
            batch_id = %id,
            increment,
            pots_done_count = batch.pots_done_count,
            output_count = batch.output_count,
            status = %batch.status,
            "Progress recorded"
        );
        if let Some(supplies) = supplies_changed {
            self.bus.emit(BatchEvent::supplies_changed(supplies));
        }
        self.bus.emit(BatchEvent::ProgressRecorded {
            batch_id: id,
            pots_done_count: batch.pots_done_count,
            output_count: batch.output_count,
        });
        self.announce(id, transition);

        Ok(batch)
    }

    /// Apply a sensor reading, pausing or resuming the active batch.
    pub async fn apply_supply_reading(&self, reading: SupplyReading) -> Result<MachineState> {
        let (state, changed, transition) = {
            let _guard = self.machine_lock.lock().await;
            let mut state = self.resolve_machine_state().await?;

            let previous = state.clone();
            let changed = state.apply_reading(reading);
            if changed {
                state.touch();
            }

            let mut active = None;
            let mut transition = None;
            if let Some(active_id) = state.active_batch_id {
                if let Some(mut batch) = self.store.load_batch(active_id).await? {
                    if !batch.is_terminal() {
                        transition = lifecycle::reconcile_supplies(&mut batch, state.supplies())?
                            .map(|t| (active_id, t));
                        if transition.is_some() {
                            active = Some(batch);
                        }
                    }
                }
            }

            self.commit(&previous, changed.then_some(&state), active.as_ref())
                .await?;
            (state, changed, transition)
        };

        if changed {
            info!(
                soil_level = %state.soil_level,
                cup_level = %state.cup_level,
                "Supply levels updated"
            );
            self.bus.emit(BatchEvent::supplies_changed(state.supplies()));
        }
        if let Some((id, transition)) = transition {
            self.announce(id, Some(transition));
        }

        Ok(state)
    }

    /// Cancel a running or paused batch and stop the machine.
    pub async fn cancel_batch(&self, id: BatchId) -> Result<Batch> {
        let batch = {
            let _guard = self.machine_lock.lock().await;
            let mut state = self.resolve_machine_state().await?;
            let mut batch = self.load_existing(id).await?;

            lifecycle::cancel(&mut batch)?;

            let previous = state.clone();
            let freed = state.is_active(id);
            if freed {
                state.active_batch_id = None;
                state.touch();
            }

            self.commit(&previous, freed.then_some(&state), Some(&batch))
                .await?;
            batch
        };

        info!(batch_id = %id, pots_done_count = batch.pots_done_count, "Batch cancelled");
        self.bus.emit(BatchEvent::BatchCancelled { batch_id: id });
        self.notify_stop(id).await;

        Ok(batch)
    }

    /// Permanently remove a batch that is not the active one.
    pub async fn delete_batch(&self, id: BatchId) -> Result<()> {
        {
            let _guard = self.machine_lock.lock().await;
            let state = self.resolve_machine_state().await?;

            if state.is_active(id) {
                return Err(CoordinatorError::ActiveBatchDeletion(id));
            }
            if !self.store.delete_batch(id).await? {
                return Err(CoordinatorError::NotFound(id));
            }
        }

        info!(batch_id = %id, "Batch deleted");
        self.bus.emit(BatchEvent::BatchDeleted { batch_id: id });
        Ok(())
    }

    /// Load the singleton, creating it if absent, and drop an active
    /// reference that points at a missing or finished batch.
    ///
    /// Callers must hold `machine_lock`.
    async fn resolve_machine_state(&self) -> Result<MachineState> {
        let mut state = match self.store.load_machine_state().await? {
            Some(state) => state,
            None => {
                let state = MachineState::default();
                self.store.save_machine_state(&state).await?;
                info!("Machine state created with default supply levels");
                state
            }
        };

        if let Some(active) = state.active_batch_id {
            let stale = match self.store.load_batch(active).await? {
                Some(batch) => batch.is_terminal(),
                None => true,
            };
            if stale {
                warn!(batch_id = %active, "Clearing stale active batch reference");
                state.active_batch_id = None;
                state.touch();
                self.store.save_machine_state(&state).await?;
            }
        }

        Ok(state)
    }

    /// A live batch the machine state does not point at. Only reachable when
    /// a batch write and the state rollback after it both failed.
    ///
    /// Callers must hold `machine_lock` and have found no active reference.
    async fn find_unreferenced_live_batch(&self) -> Result<Option<BatchId>> {
        let batches = self.store.list_batches().await?;
        let orphan = batches.iter().find(|batch| !batch.is_terminal()).map(|batch| batch.id);
        if let Some(id) = orphan {
            warn!(batch_id = %id, "Live batch has no active reference; refusing to start another");
        }
        Ok(orphan)
    }

    async fn load_existing(&self, id: BatchId) -> Result<Batch> {
        self.store
            .load_batch(id)
            .await?
            .ok_or(CoordinatorError::NotFound(id))
    }

    /// Persist the machine state (if changed) and then the batch (if any).
    ///
    /// If the batch write fails after the state was written, the previous
    /// state is written back so the pair stays consistent.
    async fn commit(
        &self,
        previous: &MachineState,
        state: Option<&MachineState>,
        batch: Option<&Batch>,
    ) -> Result<()> {
        if let Some(state) = state {
            self.store.save_machine_state(state).await?;
        }

        let Some(batch) = batch else {
            return Ok(());
        };

        if let Err(err) = self.store.save_batch(batch).await {
            if state.is_some() {
                if let Err(rollback) = self.store.save_machine_state(previous).await {
                    error!(
                        batch_id = %batch.id,
                        error = %rollback,
                        "Failed to restore machine state after batch write failure"
                    );
                }
            }
            return Err(err.into());
        }

        Ok(())
    }

    fn announce(&self, id: BatchId, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };
        info!(batch_id = %id, status = %transition.target(), "Batch status changed");
        let event = match transition {
            Transition::Finished => BatchEvent::BatchFinished { batch_id: id },
            Transition::Paused => BatchEvent::BatchPaused { batch_id: id },
            Transition::Resumed => BatchEvent::BatchResumed { batch_id: id },
        };
        self.bus.emit(event);
    }

    async fn notify_start(&self, id: BatchId) {
        if let Err(err) = self.notifier.notify_start(id).await {
            error!(batch_id = %id, error = %err, "Failed to send start command to controller");
        }
    }

    async fn notify_stop(&self, id: BatchId) {
        if let Err(err) = self.notifier.notify_stop().await {
            error!(batch_id = %id, error = %err, "Failed to send stop command to controller");
        }
    }
}
