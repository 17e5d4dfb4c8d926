#![allow(clippy::unwrap_used, clippy::expect_used)]

#[path = "util.rs"]
mod util;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tokio::time::Instant;

use invoice_tracker::error::{INVOICE_CONFLICT, STORAGE_RETRY_EXHAUSTED};
use invoice_tracker::pipeline::detect_changes;
use invoice_tracker::store::memory::StoreOp;
use invoice_tracker::store::UpdateRequest;
use invoice_tracker::time::now_ms;
use invoice_tracker::{
    AppError, AppResult, FieldValue, FixedActor, HistoryEntry, Invoice, InvoiceField,
    InvoicePosition, InvoiceStatus, InvoiceStore, MemoryStore, MutationCoordinator,
    MutationError, MutationState, PartialUpdate, WriteStamps, SYSTEM_ACTOR,
};
use util::sample_invoice;

fn busy() -> AppError {
    AppError::new("Sqlite/5", "database is locked")
}

fn seeded() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::with_invoices([sample_invoice("inv-1")]))
}

fn submit_to_area() -> PartialUpdate {
    PartialUpdate::new()
        .set(InvoiceField::Status, "SUBMITTED")
        .set(InvoiceField::Position, "AREA")
}

#[tokio::test(start_paused = true)]
async fn lifecycle_move_records_one_entry_per_field() {
    let store = seeded();
    let coordinator = MutationCoordinator::new(store.clone());

    let outcome = coordinator
        .mutate("inv-1", &submit_to_area(), Some("alice"), Some("sent to area"))
        .await
        .expect("mutation succeeds");

    assert!(!outcome.degraded);
    assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
    assert_eq!(outcome.state, MutationState::Completed);
    assert_eq!(outcome.record.status, InvoiceStatus::Submitted);
    assert_eq!(outcome.record.position, InvoicePosition::Area);
    assert_eq!(outcome.record.position_updated_by.as_deref(), Some("alice"));
    assert!(outcome.record.position_updated_at.is_some());
    assert_eq!(
        outcome.changes.fields(),
        vec![InvoiceField::Status, InvoiceField::Position]
    );

    let history = store.history();
    assert_eq!(history.len(), 2);
    let status = history.iter().find(|e| e.field == "status").expect("status entry");
    assert_eq!(status.old_value.as_deref(), Some("DRAFT"));
    assert_eq!(status.new_value.as_deref(), Some("SUBMITTED"));
    assert_eq!(status.actor, "alice");
    let position = history.iter().find(|e| e.field == "position").expect("position entry");
    assert_eq!(position.old_value.as_deref(), Some("MITRA"));
    assert_eq!(position.new_value.as_deref(), Some("AREA"));
    assert!(history.iter().all(|e| e.note.as_deref() == Some("sent to area")));
    assert_eq!(outcome.history, history);

    assert_eq!(store.snapshot("inv-1"), Some(outcome.record));
}

#[tokio::test(start_paused = true)]
async fn transient_write_failures_are_absorbed() {
    let store = seeded();
    store.fail_next(StoreOp::Update, busy(), 2);
    let coordinator = MutationCoordinator::new(store.clone());

    let started = Instant::now();
    let outcome = coordinator
        .mutate("inv-1", &submit_to_area(), Some("alice"), None)
        .await
        .expect("mutation succeeds");
    let waited = started.elapsed();

    assert!(!outcome.degraded);
    assert!(outcome.warnings.is_empty());
    assert_eq!(store.calls(StoreOp::Update), 3);
    // 100ms then 200ms of backoff, and nothing more.
    assert!(waited >= Duration::from_millis(300), "{waited:?}");
    assert!(waited < Duration::from_millis(700), "{waited:?}");
    assert_eq!(store.history().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_write_degrades_to_in_memory_merge() {
    let store = seeded();
    store.fail_next(StoreOp::Update, busy(), 3);
    let coordinator = MutationCoordinator::new(store.clone());

    let outcome = coordinator
        .mutate("inv-1", &submit_to_area(), Some("alice"), None)
        .await
        .expect("degraded outcome is still a success");

    assert!(outcome.degraded);
    assert_eq!(outcome.state, MutationState::Degraded);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("not confirmed"), "{:?}", outcome.warnings);
    assert_eq!(outcome.record.status, InvoiceStatus::Submitted);
    assert_eq!(outcome.record.position, InvoicePosition::Area);
    assert_eq!(store.calls(StoreOp::Update), 3);

    assert!(store.history().is_empty());
    assert!(outcome.history.is_empty());
    assert_eq!(store.snapshot("inv-1"), Some(sample_invoice("inv-1")));
}

#[tokio::test(start_paused = true)]
async fn degraded_merge_matches_a_durable_write() {
    let update = PartialUpdate::from_json(
        json!({
            "status": "AWAITING_PAYMENT",
            "position": "HEAD_OFFICE",
            "totalAmount": "13000000.50",
            "dueDate": "2025-03-01",
            "notes": "revised after review",
            "workPeriod": ""
        })
        .as_object()
        .cloned()
        .unwrap(),
    );

    let durable = MutationCoordinator::new(seeded())
        .mutate("inv-1", &update, Some("bob"), None)
        .await
        .unwrap();

    let failing = seeded();
    failing.fail_next(StoreOp::Update, busy(), 3);
    let degraded = MutationCoordinator::new(failing)
        .mutate("inv-1", &update, Some("bob"), None)
        .await
        .unwrap();

    assert!(!durable.degraded);
    assert!(degraded.degraded);
    for field in InvoiceField::ALL {
        assert_eq!(
            durable.record.get(field),
            degraded.record.get(field),
            "{field} differs"
        );
    }
    assert_eq!(degraded.record.work_period, None);
    assert_eq!(degraded.record.position_updated_by.as_deref(), Some("bob"));
    assert_eq!(durable.changes, degraded.changes);
}

#[tokio::test(start_paused = true)]
async fn out_of_domain_value_is_dropped_with_warning() {
    let store = seeded();
    let coordinator = MutationCoordinator::new(store.clone());
    let update = PartialUpdate::new()
        .set(InvoiceField::Status, "PAID")
        .set(InvoiceField::Notes, "waiting on PO");

    let outcome = coordinator
        .mutate("inv-1", &update, Some("alice"), None)
        .await
        .unwrap();

    assert_eq!(outcome.changes.fields(), vec![InvoiceField::Notes]);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("PAID"));
    assert_eq!(outcome.record.status, InvoiceStatus::Draft);
    assert_eq!(outcome.record.notes.as_deref(), Some("waiting on PO"));
    assert!(store.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unchanged_values_skip_the_write() {
    let store = seeded();
    let coordinator = MutationCoordinator::new(store.clone());
    let update = PartialUpdate::new()
        .set(InvoiceField::Status, "DRAFT")
        .set(InvoiceField::Position, "MITRA");

    let outcome = coordinator.mutate("inv-1", &update, None, None).await.unwrap();

    assert!(outcome.changes.is_empty());
    assert_eq!(outcome.state, MutationState::Completed);
    assert_eq!(outcome.record, sample_invoice("inv-1"));
    assert_eq!(store.calls(StoreOp::Update), 0);
    assert!(store.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn resubmitting_the_same_update_is_a_noop() {
    let store = seeded();
    let coordinator = MutationCoordinator::new(store.clone());

    coordinator
        .mutate("inv-1", &submit_to_area(), Some("alice"), None)
        .await
        .unwrap();
    let second = coordinator
        .mutate("inv-1", &submit_to_area(), Some("alice"), None)
        .await
        .unwrap();

    assert!(second.changes.is_empty());
    assert!(second.history.is_empty());
    assert_eq!(store.calls(StoreOp::Update), 1);
    assert_eq!(store.history().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn audit_failure_becomes_a_warning() {
    let store = seeded();
    store.break_history_for(
        "status",
        AppError::new("Sqlite/19", "CHECK constraint failed: invoice_history"),
    );
    let coordinator = MutationCoordinator::new(store.clone());

    let outcome = coordinator
        .mutate("inv-1", &submit_to_area(), Some("alice"), None)
        .await
        .unwrap();

    assert!(!outcome.degraded);
    assert_eq!(outcome.state, MutationState::Completed);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("status"));
    assert_eq!(outcome.record.status, InvoiceStatus::Submitted);

    let history = store.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].field, "position");
}

#[tokio::test(start_paused = true)]
async fn transient_audit_failure_is_retried() {
    let store = seeded();
    store.fail_next(StoreOp::AppendHistory, busy(), 1);
    let coordinator = MutationCoordinator::new(store.clone());

    let outcome = coordinator
        .mutate("inv-1", &submit_to_area(), Some("alice"), None)
        .await
        .unwrap();

    assert!(outcome.warnings.is_empty());
    assert_eq!(store.history().len(), 2);
    assert_eq!(store.calls(StoreOp::AppendHistory), 3);
}

#[tokio::test(start_paused = true)]
async fn actor_falls_back_to_provider_then_system() {
    let store = seeded();
    let coordinator = MutationCoordinator::new(store.clone())
        .with_identity(Arc::new(FixedActor("finance-ops".into())));
    coordinator
        .mutate("inv-1", &submit_to_area(), None, None)
        .await
        .unwrap();
    assert!(store.history().iter().all(|e| e.actor == "finance-ops"));

    let anonymous = seeded();
    MutationCoordinator::new(anonymous.clone())
        .mutate("inv-1", &submit_to_area(), None, None)
        .await
        .unwrap();
    assert!(anonymous.history().iter().all(|e| e.actor == SYSTEM_ACTOR));

    let blank = seeded();
    MutationCoordinator::new(blank.clone())
        .with_identity(Arc::new(FixedActor("   ".into())))
        .mutate("inv-1", &submit_to_area(), None, None)
        .await
        .unwrap();
    assert!(blank.history().iter().all(|e| e.actor == SYSTEM_ACTOR));
    assert_eq!(
        blank.snapshot("inv-1").unwrap().position_updated_by.as_deref(),
        Some(SYSTEM_ACTOR)
    );
}

#[tokio::test(start_paused = true)]
async fn missing_invoice_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = MutationCoordinator::new(store.clone());

    let err = coordinator
        .mutate("inv-404", &submit_to_area(), None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, MutationError::NotFound { ref id } if id == "inv-404"));
    assert_eq!(store.calls(StoreOp::Get), 1);
    assert_eq!(store.calls(StoreOp::Update), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_id_never_reaches_storage() {
    let store = seeded();
    let coordinator = MutationCoordinator::new(store.clone());

    let err = coordinator
        .mutate("inv 1; drop", &submit_to_area(), None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, MutationError::Validation(_)));
    assert!(err.is_client_error());
    assert_eq!(store.calls(StoreOp::Get), 0);
}

#[tokio::test(start_paused = true)]
async fn clearing_a_required_field_is_rejected_before_writing() {
    let store = seeded();
    let coordinator = MutationCoordinator::new(store.clone());
    let update = PartialUpdate::new().clear(InvoiceField::ClientName);

    let err = coordinator.mutate("inv-1", &update, None, None).await.unwrap_err();

    assert!(matches!(err, MutationError::Validation(_)));
    assert_eq!(store.calls(StoreOp::Update), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_read_propagates() {
    let store = seeded();
    store.fail_next(StoreOp::Get, busy(), 3);
    let coordinator = MutationCoordinator::new(store.clone());

    let err = coordinator
        .mutate("inv-1", &submit_to_area(), None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, MutationError::RetryExhausted { attempts: 3, .. }));
    let app: AppError = err.into();
    assert_eq!(app.code(), STORAGE_RETRY_EXHAUSTED);
    assert_eq!(store.calls(StoreOp::Update), 0);
}

/// Hands out a snapshot that is one write behind the stored row.
struct StaleReads {
    inner: MemoryStore,
}

impl InvoiceStore for StaleReads {
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, AppResult<Option<Invoice>>> {
        Box::pin(async move {
            let current = self.inner.get_by_id(id).await?;
            Ok(current.map(|mut invoice| {
                invoice.updated_at -= 1;
                invoice
            }))
        })
    }

    fn apply_partial_update<'a>(
        &'a self,
        request: UpdateRequest<'a>,
    ) -> BoxFuture<'a, AppResult<Invoice>> {
        self.inner.apply_partial_update(request)
    }

    fn append_history_entry<'a>(&'a self, entry: &'a HistoryEntry) -> BoxFuture<'a, AppResult<()>> {
        self.inner.append_history_entry(entry)
    }

    fn list_history<'a>(
        &'a self,
        invoice_id: &'a str,
    ) -> BoxFuture<'a, AppResult<Vec<HistoryEntry>>> {
        self.inner.list_history(invoice_id)
    }

    fn create<'a>(&'a self, invoice: &'a Invoice) -> BoxFuture<'a, AppResult<()>> {
        self.inner.create(invoice)
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_modification_is_a_conflict() {
    let store = Arc::new(StaleReads {
        inner: MemoryStore::with_invoices([sample_invoice("inv-1")]),
    });
    let coordinator = MutationCoordinator::new(store.clone());

    let err = coordinator
        .mutate("inv-1", &submit_to_area(), Some("alice"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, MutationError::Conflict { .. }));
    // Conflicts are not retried and leave the row alone.
    assert_eq!(store.inner.calls(StoreOp::Update), 1);
    assert_eq!(store.inner.snapshot("inv-1"), Some(sample_invoice("inv-1")));
    let app: AppError = err.into();
    assert_eq!(app.code(), INVOICE_CONFLICT);
}

#[tokio::test(start_paused = true)]
async fn history_reads_back_newest_first() {
    let store = seeded();
    let coordinator = MutationCoordinator::new(store.clone());

    coordinator
        .mutate("inv-1", &submit_to_area(), Some("alice"), None)
        .await
        .unwrap();
    std::thread::sleep(Duration::from_millis(5));
    coordinator
        .mutate(
            "inv-1",
            &PartialUpdate::new().set(InvoiceField::Status, "INTERNAL_VALIDATION"),
            Some("bob"),
            None,
        )
        .await
        .unwrap();

    let history = coordinator.history("inv-1").await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].new_value.as_deref(), Some("INTERNAL_VALIDATION"));
    assert_eq!(history[0].actor, "bob");
    assert!(history
        .windows(2)
        .all(|pair| (pair[0].timestamp, &pair[0].id) >= (pair[1].timestamp, &pair[1].id)));
}

#[tokio::test(start_paused = true)]
async fn settlement_fields_round_trip_through_the_pipeline() {
    let store = seeded();
    let coordinator = MutationCoordinator::new(store.clone());
    let update = PartialUpdate::from_json(
        json!({
            "status": "SETTLED",
            "position": "TERBAYAR",
            "settlementDate": "2025-02-20",
            "settlementAmount": 12_500_000,
            "paymentMethod": "TRANSFER"
        })
        .as_object()
        .cloned()
        .unwrap(),
    );

    let outcome = coordinator
        .mutate("inv-1", &update, Some("finance"), Some("paid in full"))
        .await
        .unwrap();

    assert_eq!(outcome.changes.len(), 5);
    assert_eq!(
        outcome.record.get(InvoiceField::SettlementDate),
        FieldValue::Timestamp(1_740_009_600_000)
    );
    assert_eq!(outcome.record.settlement_amount, Some(12_500_000.0));
    assert_eq!(outcome.history.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn every_write_moves_the_concurrency_token() {
    // A row stamped this millisecond, and one stamped ahead of this host's clock.
    for offset in [0, 3_600_000] {
        let mut row = sample_invoice("inv-1");
        row.updated_at = now_ms() + offset;
        let snapshot = row.clone();
        let store = Arc::new(MemoryStore::with_invoices([row]));
        let coordinator = MutationCoordinator::new(store.clone());

        let first = coordinator
            .mutate(
                "inv-1",
                &PartialUpdate::new().set(InvoiceField::Position, "USER"),
                Some("alice"),
                None,
            )
            .await
            .unwrap();
        assert!(first.record.updated_at > snapshot.updated_at);

        // Second writer still holds the snapshot taken before the first write.
        let changes = detect_changes(
            &snapshot,
            &PartialUpdate::new().set(InvoiceField::Position, "APM"),
        )
        .unwrap()
        .changes;
        let stamps = WriteStamps::after("bob", snapshot.updated_at, now_ms());
        let err = store
            .apply_partial_update(UpdateRequest {
                id: "inv-1",
                expected_updated_at: snapshot.updated_at,
                changes: &changes,
                stamps: &stamps,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), INVOICE_CONFLICT);
        assert_eq!(
            store.snapshot("inv-1").unwrap().position,
            InvoicePosition::User
        );
    }
}

#[tokio::test(start_paused = true)]
async fn history_of_missing_invoice_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = MutationCoordinator::new(store.clone());

    let err = coordinator.history("inv-404").await.unwrap_err();

    assert!(matches!(err, MutationError::NotFound { ref id } if id == "inv-404"));
    assert_eq!(store.calls(StoreOp::ListHistory), 0);
    let app: AppError = err.into();
    assert_eq!(app.code(), invoice_tracker::error::INVOICE_NOT_FOUND);
}

/// Fails the first history append after stalling on the wall clock.
struct StalledFirstAppend {
    inner: MemoryStore,
    stalled: AtomicBool,
}

impl InvoiceStore for StalledFirstAppend {
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, AppResult<Option<Invoice>>> {
        self.inner.get_by_id(id)
    }

    fn apply_partial_update<'a>(
        &'a self,
        request: UpdateRequest<'a>,
    ) -> BoxFuture<'a, AppResult<Invoice>> {
        self.inner.apply_partial_update(request)
    }

    fn append_history_entry<'a>(&'a self, entry: &'a HistoryEntry) -> BoxFuture<'a, AppResult<()>> {
        Box::pin(async move {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
                return Err(busy());
            }
            self.inner.append_history_entry(entry).await
        })
    }

    fn list_history<'a>(
        &'a self,
        invoice_id: &'a str,
    ) -> BoxFuture<'a, AppResult<Vec<HistoryEntry>>> {
        self.inner.list_history(invoice_id)
    }

    fn create<'a>(&'a self, invoice: &'a Invoice) -> BoxFuture<'a, AppResult<()>> {
        self.inner.create(invoice)
    }
}

#[tokio::test(start_paused = true)]
async fn history_entries_are_stamped_when_appended() {
    let store = Arc::new(StalledFirstAppend {
        inner: MemoryStore::with_invoices([sample_invoice("inv-1")]),
        stalled: AtomicBool::new(false),
    });
    let coordinator = MutationCoordinator::new(store.clone());

    let outcome = coordinator
        .mutate("inv-1", &submit_to_area(), Some("alice"), None)
        .await
        .unwrap();
    assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);

    let history = store.inner.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].field, "status");
    assert_eq!(history[1].field, "position");
    assert!(history[1].timestamp > history[0].timestamp, "{history:?}");
}
