#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use invoice_tracker::{Currency, Invoice, InvoicePosition, InvoiceStatus, WorkRegion};

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

pub async fn migrated_pool() -> SqlitePool {
    let pool = temp_pool().await;
    invoice_tracker::migrate::apply_migrations(&pool)
        .await
        .expect("apply migrations");
    pool
}

/// A fresh DRAFT invoice sitting with the partner.
pub fn sample_invoice(id: &str) -> Invoice {
    Invoice {
        id: id.into(),
        invoice_number: format!("INV/{id}"),
        client_name: "PT Telkom Akses".into(),
        issue_date: 1_735_689_600_000,
        due_date: 1_738_368_000_000,
        total_amount: 12_500_000.0,
        currency: Currency::Idr,
        description: "Pasang baru ODP".into(),
        status: InvoiceStatus::Draft,
        position: InvoicePosition::Mitra,
        work_region: WorkRegion::Tarakan,
        job_title: Some("ODP-TRK-014".into()),
        work_period: Some("Jan 2025".into()),
        category: Some("PASANG_BARU".into()),
        notes: None,
        settlement_date: None,
        settlement_amount: None,
        payment_method: None,
        settlement_notes: None,
        position_updated_at: None,
        position_updated_by: None,
        created_by_id: "user-1".into(),
        created_at: 1_735_689_600_000,
        updated_at: 1_735_689_600_000,
    }
}
