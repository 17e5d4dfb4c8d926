//! Invoice mutation pipeline: diff, persist with retry, audit.

pub mod change;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod retry;

pub use change::{detect_changes, ChangeSet, Detection, FieldChange};
pub use coordinator::{MutationCoordinator, MutationOutcome, MutationState};
pub use error::MutationError;
pub use history::{AuditFailure, AuditPolicy, AuditReport, HistoryEntry, HistoryRecorder};
pub use retry::{Classification, RetryError, RetryExecutor, RetryPolicy, TransientSignatures};
