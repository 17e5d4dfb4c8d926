use thiserror::Error;

use super::coordinator::MutationState;
use crate::error::{
    AppError, INVOICE_CONFLICT, INVOICE_NOT_FOUND, PIPELINE_ILLEGAL_TRANSITION,
    STORAGE_FAILED, STORAGE_RETRY_EXHAUSTED,
};

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("invoice {id} not found")]
    NotFound { id: String },
    #[error("invalid update: {0}")]
    Validation(AppError),
    #[error("invoice {id} was modified concurrently")]
    Conflict { id: String },
    #[error("storage failure: {0}")]
    Storage(AppError),
    #[error("storage unavailable after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: AppError },
    #[error("illegal pipeline transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: MutationState,
        to: MutationState,
    },
}

impl MutationError {
    /// Sorts a fatal storage error into the taxonomy by its code.
    pub(crate) fn from_storage(id: &str, error: AppError) -> Self {
        if error.is_validation() {
            return MutationError::Validation(error);
        }
        match error.code() {
            INVOICE_NOT_FOUND => MutationError::NotFound { id: id.to_string() },
            INVOICE_CONFLICT => MutationError::Conflict { id: id.to_string() },
            _ => MutationError::Storage(error),
        }
    }

    /// NotFound and Validation are the caller's fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MutationError::NotFound { .. } | MutationError::Validation(_)
        )
    }
}

impl From<MutationError> for AppError {
    fn from(err: MutationError) -> Self {
        match err {
            MutationError::NotFound { id } => {
                AppError::new(INVOICE_NOT_FOUND, "Invoice not found").with_context("invoice_id", id)
            }
            MutationError::Validation(error) => error,
            MutationError::Conflict { id } => AppError::new(
                INVOICE_CONFLICT,
                "Invoice was modified by another request; reload and retry.",
            )
            .with_context("invoice_id", id),
            MutationError::Storage(error) => {
                if error.code() == STORAGE_FAILED {
                    error
                } else {
                    AppError::new(STORAGE_FAILED, "Storage operation failed").with_cause(error)
                }
            }
            MutationError::RetryExhausted { attempts, last } => AppError::new(
                STORAGE_RETRY_EXHAUSTED,
                "Storage is temporarily unavailable.",
            )
            .with_context("attempts", attempts.to_string())
            .with_cause(last),
            MutationError::IllegalTransition { from, to } => AppError::new(
                PIPELINE_ILLEGAL_TRANSITION,
                "Internal pipeline error",
            )
            .with_context("from", format!("{from:?}"))
            .with_context("to", format!("{to:?}")),
        }
    }
}
