//! Append-only audit trail of lifecycle field changes.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::change::ChangeSet;
use super::retry::RetryExecutor;
use crate::error::{AppError, AppResult};
use crate::id::new_uuid_v7;
use crate::identity::SYSTEM_ACTOR;
use crate::invoice::InvoiceField;
use crate::store::InvoiceStore;
use crate::time::now_ms;

/// One field transition. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct HistoryEntry {
    pub id: String,
    pub invoice_id: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    #[sqlx(rename = "changed_by")]
    pub actor: String,
    #[sqlx(rename = "changed_at")]
    pub timestamp: i64,
    pub note: Option<String>,
}

/// Which fields are audit-worthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditPolicy {
    pub fields: Vec<InvoiceField>,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self {
            fields: vec![InvoiceField::Status, InvoiceField::Position],
        }
    }
}

impl AuditPolicy {
    pub fn is_audited(&self, field: InvoiceField) -> bool {
        self.fields.contains(&field)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditFailure {
    pub field: InvoiceField,
    pub error: AppError,
}

impl AuditFailure {
    pub fn warning(&self) -> String {
        format!(
            "history for `{}` was not recorded: {}",
            self.field, self.error
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditReport {
    pub written: Vec<HistoryEntry>,
    pub failures: Vec<AuditFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryRecorder {
    policy: AuditPolicy,
}

impl HistoryRecorder {
    pub fn new(policy: AuditPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AuditPolicy {
        &self.policy
    }

    /// Entries a change set produces, stamped with `at`.
    pub fn entries_for(
        &self,
        invoice_id: &str,
        changes: &ChangeSet,
        actor: Option<&str>,
        note: Option<&str>,
        at: i64,
    ) -> Vec<(InvoiceField, HistoryEntry)> {
        let actor = actor.unwrap_or(SYSTEM_ACTOR);
        changes
            .iter()
            .filter(|change| self.policy.is_audited(change.field))
            .map(|change| {
                let entry = HistoryEntry {
                    id: new_uuid_v7(),
                    invoice_id: invoice_id.to_string(),
                    field: change.field.as_str().to_string(),
                    old_value: change.old.render(),
                    new_value: change.new.render(),
                    actor: actor.to_string(),
                    timestamp: at,
                    note: note.map(str::to_string),
                };
                (change.field, entry)
            })
            .collect()
    }

    /// Append one entry per audited change. Never fails as a whole.
    pub async fn record<S: InvoiceStore + ?Sized>(
        &self,
        store: &S,
        retry: &RetryExecutor,
        invoice_id: &str,
        changes: &ChangeSet,
        actor: Option<&str>,
        note: Option<&str>,
    ) -> AuditReport {
        let mut report = AuditReport::default();
        for (field, mut entry) in self.entries_for(invoice_id, changes, actor, note, now_ms()) {
            // Earlier appends may have spent time in backoff.
            entry.timestamp = now_ms();
            let appended = retry
                .run("append_history_entry", || store.append_history_entry(&entry))
                .await;
            match appended {
                Ok(_) => {
                    info!(
                        target: "invoice_tracker",
                        event = "history_appended",
                        invoice_id,
                        field = entry.field.as_str(),
                        old_value = entry.old_value.as_deref(),
                        new_value = entry.new_value.as_deref(),
                        actor = entry.actor.as_str()
                    );
                    report.written.push(entry);
                }
                Err(err) => {
                    warn!(
                        target: "invoice_tracker",
                        event = "history_append_failed",
                        invoice_id,
                        field = entry.field.as_str(),
                        error = %err
                    );
                    report.failures.push(AuditFailure {
                        field,
                        error: err.error().clone(),
                    });
                }
            }
        }
        report
    }
}

/// The audit trail for one invoice, newest first.
///
/// Concurrent mutations append in no particular order, so the sort is on the
/// timestamp and then the time-ordered id.
pub async fn list_history<S: InvoiceStore + ?Sized>(
    store: &S,
    retry: &RetryExecutor,
    invoice_id: &str,
) -> AppResult<Vec<HistoryEntry>> {
    let mut entries = retry
        .run("list_history", || store.list_history(invoice_id))
        .await
        .map_err(|err| err.error().clone().with_context("invoice_id", invoice_id.to_string()))?
        .value;
    sort_newest_first(&mut entries);
    Ok(entries)
}

pub fn sort_newest_first(entries: &mut [HistoryEntry]) {
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
}
