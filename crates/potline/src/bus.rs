//! Broadcast of committed facts.
//!
//! Events are emitted only after the records they describe were persisted.
//! Delivery is at-most-once: receivers that fall behind lose events, and
//! emitting with no subscribers is fine.

use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{BatchId, Supplies, SupplyLevel};

const DEFAULT_CAPACITY: usize = 256;

/// Something that happened to a batch or to the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BatchEvent {
    #[serde(rename_all = "camelCase")]
    BatchCreated { batch_id: BatchId, output_count: u32 },

    #[serde(rename_all = "camelCase")]
    ProgressRecorded {
        batch_id: BatchId,
        pots_done_count: u32,
        output_count: u32,
    },

    #[serde(rename_all = "camelCase")]
    BatchPaused { batch_id: BatchId },

    #[serde(rename_all = "camelCase")]
    BatchResumed { batch_id: BatchId },

    #[serde(rename_all = "camelCase")]
    BatchFinished { batch_id: BatchId },

    #[serde(rename_all = "camelCase")]
    BatchCancelled { batch_id: BatchId },

    #[serde(rename_all = "camelCase")]
    BatchDeleted { batch_id: BatchId },

    #[serde(rename_all = "camelCase")]
    SuppliesChanged {
        soil_level: SupplyLevel,
        cup_level: SupplyLevel,
    },
}

impl BatchEvent {
    pub(crate) fn supplies_changed(supplies: Supplies) -> Self {
        Self::SuppliesChanged {
            soil_level: supplies.soil,
            cup_level: supplies.cup,
        }
    }

    /// Short name, used for server-sent event types.
    pub fn name(&self) -> &'static str {
        match self {
            Self::BatchCreated { .. } => "batchCreated",
            Self::ProgressRecorded { .. } => "progressRecorded",
            Self::BatchPaused { .. } => "batchPaused",
            Self::BatchResumed { .. } => "batchResumed",
            Self::BatchFinished { .. } => "batchFinished",
            Self::BatchCancelled { .. } => "batchCancelled",
            Self::BatchDeleted { .. } => "batchDeleted",
            Self::SuppliesChanged { .. } => "suppliesChanged",
        }
    }
}

/// Cloneable handle to the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BatchEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: BatchEvent) {
        // no subscribers is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a stream. Lagged events are skipped; the stream ends
    /// when every bus handle is dropped.
    pub fn stream(&self) -> impl Stream<Item = BatchEvent> + Send + 'static {
        stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }
}
