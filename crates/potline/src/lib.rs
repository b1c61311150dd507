//! # Potline
//!
//! Coordination for a single potting machine: consumable supply levels, one
//! production batch at a time, and best-effort start/stop commands to the
//! machine's network controller.
//!
//! ## Core Concepts
//!
//! - [`MachineState`] = the singleton: soil and cup levels plus the id of the
//!   active batch, if any
//! - [`Batch`] = one production run with a target pot count and progress
//! - [`lifecycle`] = pure rules that decide batch status
//! - [`Coordinator`] = the only writer; evolves both records together
//! - [`HardwareNotifier`] = fire-and-forget side channel to the controller
//!
//! ## Architecture
//!
//! ```text
//! Edge (HTTP / sensors)
//!     │
//!     ▼
//! Coordinator ── lock ──────────────────────────────┐
//!     │                                             │
//!     ├─► Store.load (machine state, batch)         │
//!     ├─► lifecycle::* decides the transition       │
//!     ├─► Store.save machine state, then batch      │
//!     │                                             │
//!     └─────────────────────────────────── unlock ──┘
//!     │
//!     ├─► EventBus.emit(fact)
//!     └─► HardwareNotifier (logged on failure, never rolled back)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One live batch** - `active_batch_id` is set iff exactly one batch is
//!    `Ongoing` or `Paused`, and it names that batch
//! 2. **Bounded progress** - `pots_done_count <= output_count`, clamped on finish
//! 3. **Terminal is final** - `Finished` and `Cancelled` batches never change
//! 4. **Finish beats pause** - reaching the target finishes the batch even if
//!    supplies read low in the same update
//! 5. **Hardware is best-effort** - controller failures are logged, the logical
//!    change stands
//!
//! ## Example
//!
//! ```ignore
//! use potline::{Coordinator, MemoryStore, NewBatch, NoOpNotifier, ProgressReport};
//! use std::sync::Arc;
//!
//! let coordinator = Coordinator::new(Arc::new(MemoryStore::new()), Arc::new(NoOpNotifier));
//!
//! let batch = coordinator.create_batch(NewBatch::new("Basil", 1, 5)).await?;
//! let batch = coordinator.report_progress(batch.id, ProgressReport::pots(5)).await?;
//! assert!(batch.is_terminal());
//! ```

mod bus;
mod coordinator;
mod error;
mod memory;
mod model;
mod notifier;
mod store;

pub mod lifecycle;


pub use bus::{BatchEvent, EventBus};
pub use coordinator::Coordinator;
pub use error::{CoordinatorError, ErrorCategory, Result};
pub use memory::MemoryStore;
pub use model::{
    Batch, BatchId, BatchStatus, MachineState, MachineStatus, NewBatch, ProgressReport, Supplies,
    SupplyLevel, SupplyReading, MACHINE_STATE_KEY,
};
pub use notifier::{
    HardwareNotifier, HttpNotifier, NoOpNotifier, NotifyError, DEFAULT_HARDWARE_TIMEOUT,
};
pub use store::Store;

pub use async_trait::async_trait;
