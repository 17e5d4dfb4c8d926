use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::query_builder::Separated;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use super::{InvoiceStore, UpdateRequest};
use crate::db::run_in_tx;
use crate::error::{AppError, AppResult, INVOICE_CONFLICT, INVOICE_NOT_FOUND};
use crate::invoice::{FieldValue, Invoice, InvoiceField};
use crate::pipeline::history::HistoryEntry;

const INVOICE_COLUMNS: &str = "id, invoice_number, client_name, issue_date, due_date, \
    total_amount, currency, description, status, position, work_region, job_title, \
    work_period, category, notes, settlement_date, settlement_amount, payment_method, \
    settlement_notes, position_updated_at, position_updated_by, created_by_id, created_at, \
    updated_at";

const HISTORY_COLUMNS: &str =
    "id, invoice_id, field, old_value, new_value, changed_by, changed_at, note";

fn push_value(sep: &mut Separated<'_, '_, Sqlite, &'static str>, value: FieldValue) {
    match value {
        FieldValue::Null => sep.push_bind_unseparated(None::<String>),
        FieldValue::Text(text) => sep.push_bind_unseparated(text),
        FieldValue::Amount(amount) => sep.push_bind_unseparated(amount),
        FieldValue::Timestamp(ms) => sep.push_bind_unseparated(ms),
    };
}

fn not_found(id: &str) -> AppError {
    AppError::new(INVOICE_NOT_FOUND, "Record not found").with_context("invoice_id", id.to_string())
}

/// [`InvoiceStore`] over a SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch(&self, id: &str) -> AppResult<Option<Invoice>> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?");
        let invoice = sqlx::query_as::<_, Invoice>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(invoice)
    }

    async fn update(&self, request: UpdateRequest<'_>) -> AppResult<Invoice> {
        let id = request.id.to_string();
        let expected = request.expected_updated_at;
        let mut columns: Vec<(&'static str, FieldValue)> = request
            .changes
            .iter()
            .map(|change| (change.field.as_str(), change.new.clone()))
            .collect();
        columns.extend(request.stamps.derived_columns(request.changes));

        run_in_tx::<_, AppError, _>(&self.pool, move |tx| {
            async move {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE invoices SET ");
                {
                    let mut sep = qb.separated(", ");
                    for (column, value) in columns {
                        sep.push(column);
                        sep.push_unseparated(" = ");
                        push_value(&mut sep, value);
                    }
                }
                qb.push(" WHERE id = ")
                    .push_bind(id.clone())
                    .push(" AND updated_at = ")
                    .push_bind(expected);

                let affected = qb.build().execute(&mut **tx).await?.rows_affected();
                if affected == 0 {
                    let actual: Option<i64> =
                        sqlx::query_scalar("SELECT updated_at FROM invoices WHERE id = ?")
                            .bind(&id)
                            .fetch_optional(&mut **tx)
                            .await?;
                    return Err(match actual {
                        None => not_found(&id),
                        Some(actual) => AppError::new(
                            INVOICE_CONFLICT,
                            "Invoice was modified by another request.",
                        )
                        .with_context("invoice_id", id.clone())
                        .with_context("expected_updated_at", expected.to_string())
                        .with_context("actual_updated_at", actual.to_string()),
                    });
                }

                let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?");
                let invoice = sqlx::query_as::<_, Invoice>(&sql)
                    .bind(&id)
                    .fetch_one(&mut **tx)
                    .await?;
                debug!(
                    target: "invoice_tracker",
                    event = "invoice_row_updated",
                    invoice_id = %id,
                    updated_at = invoice.updated_at
                );
                Ok(invoice)
            }
            .boxed()
        })
        .await
    }

    async fn insert_history(&self, entry: &HistoryEntry) -> AppResult<()> {
        let sql = format!("INSERT INTO invoice_history ({HISTORY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)");
        sqlx::query(&sql)
            .bind(&entry.id)
            .bind(&entry.invoice_id)
            .bind(&entry.field)
            .bind(&entry.old_value)
            .bind(&entry.new_value)
            .bind(&entry.actor)
            .bind(entry.timestamp)
            .bind(&entry.note)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn select_history(&self, invoice_id: &str) -> AppResult<Vec<HistoryEntry>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM invoice_history WHERE invoice_id = ? \
             ORDER BY changed_at DESC, id DESC"
        );
        let entries = sqlx::query_as::<_, HistoryEntry>(&sql)
            .bind(invoice_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    async fn insert(&self, invoice: &Invoice) -> AppResult<()> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO invoices ({INVOICE_COLUMNS}) VALUES ("));
        {
            let mut sep = qb.separated(", ");
            sep.push_bind(invoice.id.clone());
            sep.push_bind(invoice.invoice_number.clone());
            for field in InvoiceField::ALL {
                sep.push("");
                push_value(&mut sep, invoice.get(field));
            }
            sep.push_bind(invoice.position_updated_at);
            sep.push_bind(invoice.position_updated_by.clone());
            sep.push_bind(invoice.created_by_id.clone());
            sep.push_bind(invoice.created_at);
            sep.push_bind(invoice.updated_at);
        }
        qb.push(")");
        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}

impl InvoiceStore for SqliteStore {
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, AppResult<Option<Invoice>>> {
        self.fetch(id).boxed()
    }

    fn apply_partial_update<'a>(
        &'a self,
        request: UpdateRequest<'a>,
    ) -> BoxFuture<'a, AppResult<Invoice>> {
        self.update(request).boxed()
    }

    fn append_history_entry<'a>(&'a self, entry: &'a HistoryEntry) -> BoxFuture<'a, AppResult<()>> {
        self.insert_history(entry).boxed()
    }

    fn list_history<'a>(
        &'a self,
        invoice_id: &'a str,
    ) -> BoxFuture<'a, AppResult<Vec<HistoryEntry>>> {
        self.select_history(invoice_id).boxed()
    }

    fn create<'a>(&'a self, invoice: &'a Invoice) -> BoxFuture<'a, AppResult<()>> {
        self.insert(invoice).boxed()
    }
}
