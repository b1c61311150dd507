use thiserror::Error;

use crate::model::{BatchId, BatchStatus, Supplies};

/// Coarse error class used by transports to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The addressed batch does not exist.
    NotFound,
    /// A business rule rejected the operation. Nothing was written.
    Rejected,
    /// Storage failed. The operation was aborted.
    Internal,
}

/// Errors surfaced by [`Coordinator`](crate::Coordinator) operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("batch not found: {0}")]
    NotFound(BatchId),

    #[error("a batch is already in progress: {0}")]
    AlreadyActive(BatchId),

    #[error("cannot start: supplies are low ({0})")]
    SuppliesLow(Supplies),

    #[error("batch {batch_id} is already complete (status {status})")]
    AlreadyTerminal { batch_id: BatchId, status: BatchStatus },

    #[error("cannot delete the active batch {0}; cancel it first")]
    ActiveBatchDeletion(BatchId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl CoordinatorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::AlreadyActive(_)
            | Self::SuppliesLow(_)
            | Self::AlreadyTerminal { .. }
            | Self::ActiveBatchDeletion(_)
            | Self::InvalidInput(_) => ErrorCategory::Rejected,
            Self::Storage(_) => ErrorCategory::Internal,
        }
    }

    /// Stable machine-readable name of the error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyActive(_) => "already_active",
            Self::SuppliesLow(_) => "supplies_low",
            Self::AlreadyTerminal { .. } => "already_terminal",
            Self::ActiveBatchDeletion(_) => "active_batch_deletion",
            Self::InvalidInput(_) => "invalid_input",
            Self::Storage(_) => "storage_failure",
        }
    }
}

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SupplyLevel;
    use uuid::Uuid;

    #[test]
    fn categories() {
        let id = Uuid::new_v4();
        assert_eq!(CoordinatorError::NotFound(id).category(), ErrorCategory::NotFound);
        assert_eq!(
            CoordinatorError::ActiveBatchDeletion(id).category(),
            ErrorCategory::Rejected
        );
        assert_eq!(
            CoordinatorError::from(anyhow::anyhow!("disk gone")).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn supplies_low_message_names_levels() {
        let err = CoordinatorError::SuppliesLow(Supplies::new(
            SupplyLevel::Low,
            SupplyLevel::Sufficient,
        ));
        assert_eq!(
            err.to_string(),
            "cannot start: supplies are low (soil low, cups sufficient)"
        );
    }
}
