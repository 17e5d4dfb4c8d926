//! Invoice tracking core: the partial-update pipeline behind the dashboard's
//! invoice edit form, with change detection, retried persistence and an
//! audit trail of lifecycle moves.

pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod identity;
pub mod invoice;
pub mod logging;
pub mod migrate;
pub mod patch;
pub mod pipeline;
pub mod store;
pub mod time;

pub use config::PipelineConfig;
pub use error::{AppError, AppResult};
pub use identity::{Anonymous, FixedActor, IdentityProvider, SessionUser, SYSTEM_ACTOR};
pub use invoice::{
    Currency, FieldValue, Invoice, InvoiceField, InvoicePosition, InvoiceStatus, WorkRegion,
    WriteStamps,
};
pub use logging::init_logging;
pub use patch::{PartialUpdate, Patch};
pub use pipeline::{
    AuditPolicy, ChangeSet, HistoryEntry, HistoryRecorder, MutationCoordinator, MutationError,
    MutationOutcome, MutationState, RetryExecutor, RetryPolicy, TransientSignatures,
};
pub use store::{InvoiceStore, MemoryStore, SqliteStore};

use std::sync::Arc;

/// Coordinator wired from configuration.
pub fn coordinator_from_config<S: InvoiceStore>(
    store: S,
    config: &PipelineConfig,
    identity: Arc<dyn IdentityProvider>,
) -> MutationCoordinator<S> {
    MutationCoordinator::new(store)
        .with_retry(config.retry_executor())
        .with_recorder(HistoryRecorder::new(config.audit.clone()))
        .with_identity(identity)
}
