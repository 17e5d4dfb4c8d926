//! Drives one invoice mutation from request to terminal state.
//!
//! ```text
//! Pending -> Validating -> Diffing -> Persisting -> Auditing -> Completed
//!                              \           \
//!                               Completed   Degraded
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::change::{detect_changes, ChangeSet};
use super::error::MutationError;
use super::history::{list_history, HistoryEntry, HistoryRecorder};
use super::retry::{RetryError, RetryExecutor};
use crate::id::validate_invoice_id;
use crate::identity::{resolve_actor, Anonymous, IdentityProvider};
use crate::invoice::{Invoice, WriteStamps};
use crate::patch::PartialUpdate;
use crate::store::{InvoiceStore, UpdateRequest};
use crate::time::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationState {
    Pending,
    Validating,
    Diffing,
    Persisting,
    Auditing,
    Completed,
    Degraded,
}

impl MutationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MutationState::Completed | MutationState::Degraded)
    }

    pub fn can_transition_to(self, next: MutationState) -> bool {
        use MutationState::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, Diffing)
                | (Diffing, Completed)
                | (Diffing, Persisting)
                | (Persisting, Auditing)
                | (Persisting, Degraded)
                | (Auditing, Completed)
        )
    }
}

struct Transitions<'a> {
    invoice_id: &'a str,
    state: MutationState,
}

impl<'a> Transitions<'a> {
    fn new(invoice_id: &'a str) -> Self {
        Self {
            invoice_id,
            state: MutationState::Pending,
        }
    }

    fn advance(&mut self, next: MutationState) -> Result<(), MutationError> {
        if !self.state.can_transition_to(next) {
            error!(
                target: "invoice_tracker",
                event = "mutation_illegal_transition",
                invoice_id = self.invoice_id,
                from = ?self.state,
                to = ?next
            );
            return Err(MutationError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(
            target: "invoice_tracker",
            event = "mutation_transition",
            invoice_id = self.invoice_id,
            from = ?self.state,
            to = ?next
        );
        self.state = next;
        Ok(())
    }
}

/// Result of a mutation that reached a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct MutationOutcome {
    pub record: Invoice,
    /// The write was not durably confirmed; `record` is the in-memory merge.
    pub degraded: bool,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub changes: ChangeSet,
    #[serde(skip)]
    pub history: Vec<HistoryEntry>,
    #[serde(skip)]
    pub state: MutationState,
}

pub struct MutationCoordinator<S> {
    store: S,
    retry: RetryExecutor,
    recorder: HistoryRecorder,
    identity: Arc<dyn IdentityProvider>,
}

impl<S: InvoiceStore> MutationCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            retry: RetryExecutor::default(),
            recorder: HistoryRecorder::default(),
            identity: Arc::new(Anonymous),
        }
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_recorder(mut self, recorder: HistoryRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Apply `update` to the invoice and record its lifecycle history.
    pub async fn mutate(
        &self,
        invoice_id: &str,
        update: &PartialUpdate,
        actor: Option<&str>,
        note: Option<&str>,
    ) -> Result<MutationOutcome, MutationError> {
        let mut machine = Transitions::new(invoice_id);
        machine.advance(MutationState::Validating)?;

        validate_invoice_id(invoice_id).map_err(MutationError::Validation)?;
        let current = self.load(invoice_id).await?;

        machine.advance(MutationState::Diffing)?;
        let detection = detect_changes(&current, update).map_err(MutationError::Validation)?;
        for warning in &detection.warnings {
            warn!(
                target: "invoice_tracker",
                event = "mutation_value_dropped",
                invoice_id,
                warning = warning.as_str()
            );
        }
        let mut warnings = detection.warnings;
        let changes = detection.changes;

        if changes.is_empty() {
            machine.advance(MutationState::Completed)?;
            info!(
                target: "invoice_tracker",
                event = "mutation_noop",
                invoice_id
            );
            return Ok(MutationOutcome {
                record: current,
                degraded: false,
                warnings,
                changes,
                history: Vec::new(),
                state: machine.state,
            });
        }

        let actor = resolve_actor(actor, self.identity.as_ref());
        let stamps = WriteStamps::after(actor.clone(), current.updated_at, now_ms());
        let request = UpdateRequest {
            id: invoice_id,
            expected_updated_at: current.updated_at,
            changes: &changes,
            stamps: &stamps,
        };

        machine.advance(MutationState::Persisting)?;
        let written = self
            .retry
            .run("apply_partial_update", || {
                self.store.apply_partial_update(request)
            })
            .await;

        let record = match written {
            Ok(retried) => retried.value,
            Err(RetryError::Fatal { error, .. }) => {
                error!(
                    target: "invoice_tracker",
                    event = "mutation_write_failed",
                    invoice_id,
                    error = %error
                );
                return Err(MutationError::from_storage(invoice_id, error));
            }
            Err(RetryError::Exhausted { attempts, last, .. }) => {
                let mut merged = current;
                if merged.apply_changes(&changes, &stamps).is_err() {
                    return Err(MutationError::RetryExhausted { attempts, last });
                }
                machine.advance(MutationState::Degraded)?;
                warn!(
                    target: "invoice_tracker",
                    event = "mutation_degraded",
                    invoice_id,
                    attempts,
                    fields = ?changes.fields(),
                    error = %last
                );
                warnings.push(format!(
                    "update to invoice {invoice_id} was not confirmed by storage after {attempts} attempts; the returned record reflects the requested changes but may not be saved"
                ));
                return Ok(MutationOutcome {
                    record: merged,
                    degraded: true,
                    warnings,
                    changes,
                    history: Vec::new(),
                    state: machine.state,
                });
            }
        };

        machine.advance(MutationState::Auditing)?;
        let report = self
            .recorder
            .record(
                &self.store,
                &self.retry,
                invoice_id,
                &changes,
                Some(actor.as_str()),
                note.filter(|n| !n.trim().is_empty()),
            )
            .await;
        warnings.extend(report.failures.iter().map(|failure| failure.warning()));

        machine.advance(MutationState::Completed)?;
        info!(
            target: "invoice_tracker",
            event = "mutation_completed",
            invoice_id,
            actor = actor.as_str(),
            fields = ?changes.fields(),
            history_written = report.written.len(),
            audit_failures = report.failures.len()
        );
        Ok(MutationOutcome {
            record,
            degraded: false,
            warnings,
            changes,
            history: report.written,
            state: machine.state,
        })
    }

    /// The audit trail of one invoice, newest first.
    ///
    /// An invoice that does not exist is `NotFound`, not an empty trail.
    pub async fn history(&self, invoice_id: &str) -> Result<Vec<HistoryEntry>, MutationError> {
        validate_invoice_id(invoice_id).map_err(MutationError::Validation)?;
        self.load(invoice_id).await?;
        list_history(&self.store, &self.retry, invoice_id)
            .await
            .map_err(|err| MutationError::from_storage(invoice_id, err))
    }

    async fn load(&self, invoice_id: &str) -> Result<Invoice, MutationError> {
        let found = self
            .retry
            .run("get_by_id", || self.store.get_by_id(invoice_id))
            .await;
        match found {
            Ok(retried) => retried.value.ok_or_else(|| MutationError::NotFound {
                id: invoice_id.to_string(),
            }),
            Err(RetryError::Fatal { error, .. }) => {
                Err(MutationError::from_storage(invoice_id, error))
            }
            Err(RetryError::Exhausted { attempts, last, .. }) => {
                error!(
                    target: "invoice_tracker",
                    event = "mutation_read_exhausted",
                    invoice_id,
                    attempts,
                    error = %last
                );
                Err(MutationError::RetryExhausted { attempts, last })
            }
        }
    }
}
