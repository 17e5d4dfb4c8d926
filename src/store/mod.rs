//! Storage seam for invoices and their audit trail.
//!
//! The pipeline only sees [`InvoiceStore`]; the SQLite store is used in the
//! application and the in-memory store in tests and dry runs.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::AppResult;
use crate::invoice::{Invoice, WriteStamps};
use crate::pipeline::change::ChangeSet;
use crate::pipeline::history::HistoryEntry;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One compare-and-swap write of a change set.
#[derive(Debug, Clone, Copy)]
pub struct UpdateRequest<'a> {
    pub id: &'a str,
    /// `updated_at` of the snapshot the change set was computed against.
    pub expected_updated_at: i64,
    pub changes: &'a ChangeSet,
    pub stamps: &'a WriteStamps,
}

pub trait InvoiceStore: Send + Sync {
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, AppResult<Option<Invoice>>>;

    /// Apply the changes if the row still carries `expected_updated_at`.
    ///
    /// Fails with `INVOICE/NOT_FOUND` when the row is gone and
    /// `INVOICE/CONFLICT` when another write got there first.
    fn apply_partial_update<'a>(
        &'a self,
        request: UpdateRequest<'a>,
    ) -> BoxFuture<'a, AppResult<Invoice>>;

    fn append_history_entry<'a>(&'a self, entry: &'a HistoryEntry) -> BoxFuture<'a, AppResult<()>>;

    fn list_history<'a>(&'a self, invoice_id: &'a str)
        -> BoxFuture<'a, AppResult<Vec<HistoryEntry>>>;

    /// Seed a record. Creation proper belongs to the dashboard.
    fn create<'a>(&'a self, invoice: &'a Invoice) -> BoxFuture<'a, AppResult<()>>;
}

impl<T> InvoiceStore for Arc<T>
where
    T: InvoiceStore + ?Sized,
{
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, AppResult<Option<Invoice>>> {
        (**self).get_by_id(id)
    }

    fn apply_partial_update<'a>(
        &'a self,
        request: UpdateRequest<'a>,
    ) -> BoxFuture<'a, AppResult<Invoice>> {
        (**self).apply_partial_update(request)
    }

    fn append_history_entry<'a>(&'a self, entry: &'a HistoryEntry) -> BoxFuture<'a, AppResult<()>> {
        (**self).append_history_entry(entry)
    }

    fn list_history<'a>(
        &'a self,
        invoice_id: &'a str,
    ) -> BoxFuture<'a, AppResult<Vec<HistoryEntry>>> {
        (**self).list_history(invoice_id)
    }

    fn create<'a>(&'a self, invoice: &'a Invoice) -> BoxFuture<'a, AppResult<()>> {
        (**self).create(invoice)
    }
}
