use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;

use super::{InvoiceStore, UpdateRequest};
use crate::error::{AppError, AppResult, INVOICE_CONFLICT, INVOICE_NOT_FOUND, STORAGE_FAILED};
use crate::invoice::Invoice;
use crate::pipeline::history::HistoryEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Update,
    AppendHistory,
    ListHistory,
}

#[derive(Default)]
struct Inner {
    invoices: HashMap<String, Invoice>,
    history: Vec<HistoryEntry>,
    scripted: HashMap<StoreOp, VecDeque<AppError>>,
    broken_history_fields: HashMap<String, AppError>,
    calls: HashMap<StoreOp, u32>,
}

impl Inner {
    fn enter(&mut self, op: StoreOp) -> AppResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.scripted.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// In-process store with scripted failures.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_invoices(invoices: impl IntoIterator<Item = Invoice>) -> Self {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.lock() {
            for invoice in invoices {
                inner.invoices.insert(invoice.id.clone(), invoice);
            }
        }
        store
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| AppError::new(STORAGE_FAILED, "memory store lock poisoned"))
    }

    /// Make the next `times` calls of `op` fail with `error`.
    pub fn fail_next(&self, op: StoreOp, error: AppError, times: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            let queue = inner.scripted.entry(op).or_default();
            queue.extend(std::iter::repeat(error).take(times));
        }
    }

    /// Make every history append for `field` fail with `error`.
    pub fn break_history_for(&self, field: &str, error: AppError) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.broken_history_fields.insert(field.to_string(), error);
        }
    }

    pub fn calls(&self, op: StoreOp) -> u32 {
        self.inner
            .lock()
            .map(|inner| inner.calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn snapshot(&self, id: &str) -> Option<Invoice> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.invoices.get(id).cloned())
    }

    /// History in append order, for assertions.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner
            .lock()
            .map(|inner| inner.history.clone())
            .unwrap_or_default()
    }

    fn update_sync(&self, request: UpdateRequest<'_>) -> AppResult<Invoice> {
        let mut inner = self.lock()?;
        inner.enter(StoreOp::Update)?;
        let current = inner.invoices.get_mut(request.id).ok_or_else(|| {
            AppError::new(INVOICE_NOT_FOUND, "Record not found")
                .with_context("invoice_id", request.id.to_string())
        })?;
        if current.updated_at != request.expected_updated_at {
            return Err(
                AppError::new(INVOICE_CONFLICT, "Invoice was modified by another request.")
                    .with_context("invoice_id", request.id.to_string())
                    .with_context("expected_updated_at", request.expected_updated_at.to_string())
                    .with_context("actual_updated_at", current.updated_at.to_string()),
            );
        }
        let mut next = current.clone();
        next.apply_changes(request.changes, request.stamps)?;
        *current = next.clone();
        Ok(next)
    }

    fn append_sync(&self, entry: &HistoryEntry) -> AppResult<()> {
        let mut inner = self.lock()?;
        inner.enter(StoreOp::AppendHistory)?;
        if let Some(err) = inner.broken_history_fields.get(&entry.field) {
            return Err(err.clone());
        }
        if !inner.invoices.contains_key(&entry.invoice_id) {
            return Err(AppError::new("Sqlite/787", "FOREIGN KEY constraint failed")
                .with_context("invoice_id", entry.invoice_id.clone()));
        }
        if inner.history.iter().any(|existing| existing.id == entry.id) {
            return Err(AppError::new("Sqlite/1555", "UNIQUE constraint failed: invoice_history.id"));
        }
        inner.history.push(entry.clone());
        Ok(())
    }
}

impl InvoiceStore for MemoryStore {
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, AppResult<Option<Invoice>>> {
        async move {
            let mut inner = self.lock()?;
            inner.enter(StoreOp::Get)?;
            Ok(inner.invoices.get(id).cloned())
        }
        .boxed()
    }

    fn apply_partial_update<'a>(
        &'a self,
        request: UpdateRequest<'a>,
    ) -> BoxFuture<'a, AppResult<Invoice>> {
        async move { self.update_sync(request) }.boxed()
    }

    fn append_history_entry<'a>(&'a self, entry: &'a HistoryEntry) -> BoxFuture<'a, AppResult<()>> {
        async move { self.append_sync(entry) }.boxed()
    }

    fn list_history<'a>(
        &'a self,
        invoice_id: &'a str,
    ) -> BoxFuture<'a, AppResult<Vec<HistoryEntry>>> {
        async move {
            let mut inner = self.lock()?;
            inner.enter(StoreOp::ListHistory)?;
            Ok(inner
                .history
                .iter()
                .filter(|entry| entry.invoice_id == invoice_id)
                .cloned()
                .collect())
        }
        .boxed()
    }

    fn create<'a>(&'a self, invoice: &'a Invoice) -> BoxFuture<'a, AppResult<()>> {
        async move {
            let mut inner = self.lock()?;
            if inner.invoices.contains_key(&invoice.id) {
                return Err(AppError::new(
                    "Sqlite/1555",
                    "UNIQUE constraint failed: invoices.id",
                ));
            }
            inner.invoices.insert(invoice.id.clone(), invoice.clone());
            Ok(())
        }
        .boxed()
    }
}
