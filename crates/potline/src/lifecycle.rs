//! Batch status rules.
//!
//! Pure: no IO, no async. The [`Coordinator`](crate::Coordinator) loads the
//! records, calls in here to decide, and persists whatever changed.
//!
//! Precedence, evaluated after any progress increment:
//!
//! 1. `pots_done_count >= output_count` finishes the batch (count clamped).
//!    Wins over a low supply reading in the same update.
//! 2. Either supply low pauses the batch.
//! 3. Otherwise the batch runs, resuming it if it was paused.

use crate::error::CoordinatorError;
use crate::model::{Batch, BatchStatus, Supplies};

/// Status change produced by applying the rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Finished,
    Paused,
    Resumed,
}

impl Transition {
    pub fn target(self) -> BatchStatus {
        match self {
            Self::Finished => BatchStatus::Finished,
            Self::Paused => BatchStatus::Paused,
            Self::Resumed => BatchStatus::Ongoing,
        }
    }
}

/// Status the rules select for the given progress and supplies.
pub fn next_status(pots_done: u32, output_count: u32, supplies: Supplies) -> BatchStatus {
    if pots_done >= output_count {
        BatchStatus::Finished
    } else if !supplies.is_sufficient() {
        BatchStatus::Paused
    } else {
        BatchStatus::Ongoing
    }
}

/// Add `increment` completed pots and apply rules 1-3.
pub fn record_progress(
    batch: &mut Batch,
    increment: u32,
    supplies: Supplies,
) -> Result<Option<Transition>, CoordinatorError> {
    ensure_live(batch)?;
    batch.pots_done_count = batch.pots_done_count.saturating_add(increment);
    Ok(settle(batch, supplies))
}

/// Re-apply the supply rules (2-3) without touching progress.
pub fn reconcile_supplies(
    batch: &mut Batch,
    supplies: Supplies,
) -> Result<Option<Transition>, CoordinatorError> {
    ensure_live(batch)?;
    let next = if supplies.is_sufficient() {
        BatchStatus::Ongoing
    } else {
        BatchStatus::Paused
    };
    Ok(move_to(batch, next))
}

/// Move a live batch to `Cancelled`.
pub fn cancel(batch: &mut Batch) -> Result<(), CoordinatorError> {
    ensure_live(batch)?;
    batch.status = BatchStatus::Cancelled;
    batch.touch();
    Ok(())
}

fn settle(batch: &mut Batch, supplies: Supplies) -> Option<Transition> {
    let next = next_status(batch.pots_done_count, batch.output_count, supplies);
    if next == BatchStatus::Finished {
        batch.pots_done_count = batch.output_count;
    }
    let transition = move_to(batch, next);
    // progress alone still changes the record
    batch.touch();
    transition
}

fn move_to(batch: &mut Batch, next: BatchStatus) -> Option<Transition> {
    if batch.status == next {
        return None;
    }
    let transition = match next {
        BatchStatus::Finished => Transition::Finished,
        BatchStatus::Paused => Transition::Paused,
        BatchStatus::Ongoing => Transition::Resumed,
        BatchStatus::Cancelled => return None,
    };
    batch.status = next;
    batch.touch();
    Some(transition)
}

fn ensure_live(batch: &Batch) -> Result<(), CoordinatorError> {
    if batch.is_terminal() {
        return Err(CoordinatorError::AlreadyTerminal {
            batch_id: batch.id,
            status: batch.status,
        });
    }
    Ok(())
}
