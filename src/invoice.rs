use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::{AppError, AppResult, VALIDATION_INVALID_VALUE, VALIDATION_REQUIRED_FIELD};
use crate::pipeline::change::ChangeSet;
use crate::time::format_ms;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {domain} value: {value}")]
pub struct DomainError {
    domain: &'static str,
    value: String,
}

impl DomainError {
    pub fn new(domain: &'static str, value: impl Into<String>) -> Self {
        Self {
            domain,
            value: value.into(),
        }
    }

    pub fn domain(&self) -> &'static str {
        self.domain
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Declares a closed set of upper-case slugs shared with the dashboard.
macro_rules! invoice_domain {
    ($name:ident, $label:literal, { $( $variant:ident => $slug:literal ),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $( $variant ),+
        }

        impl $name {
            pub const NAMES: &'static [&'static str] = &[$( $slug ),+];

            pub const fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $slug ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $slug => Ok($name::$variant), )+
                    other => Err(DomainError::new($label, other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

invoice_domain!(InvoiceStatus, "status", {
    Draft => "DRAFT",
    Submitted => "SUBMITTED",
    InternalValidation => "INTERNAL_VALIDATION",
    AwaitingPayment => "AWAITING_PAYMENT",
    Settled => "SETTLED",
    Delayed => "DELAYED",
});

invoice_domain!(InvoicePosition, "position", {
    Mitra => "MITRA",
    User => "USER",
    Area => "AREA",
    Regional => "REGIONAL",
    HeadOffice => "HEAD_OFFICE",
    Apm => "APM",
    Terbayar => "TERBAYAR",
});

invoice_domain!(WorkRegion, "work_region", {
    Tarakan => "TARAKAN",
    Balikpapan => "BALIKPAPAN",
    Samarinda => "SAMARINDA",
});

invoice_domain!(Currency, "currency", {
    Idr => "IDR",
    Usd => "USD",
    Eur => "EUR",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Amount,
    Timestamp,
    Enumerated(&'static [&'static str]),
}

/// Fields a partial update may touch, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceField {
    ClientName,
    IssueDate,
    DueDate,
    TotalAmount,
    Currency,
    Description,
    Status,
    Position,
    WorkRegion,
    JobTitle,
    WorkPeriod,
    Category,
    Notes,
    SettlementDate,
    SettlementAmount,
    PaymentMethod,
    SettlementNotes,
}

impl InvoiceField {
    pub const ALL: [InvoiceField; 17] = [
        InvoiceField::ClientName,
        InvoiceField::IssueDate,
        InvoiceField::DueDate,
        InvoiceField::TotalAmount,
        InvoiceField::Currency,
        InvoiceField::Description,
        InvoiceField::Status,
        InvoiceField::Position,
        InvoiceField::WorkRegion,
        InvoiceField::JobTitle,
        InvoiceField::WorkPeriod,
        InvoiceField::Category,
        InvoiceField::Notes,
        InvoiceField::SettlementDate,
        InvoiceField::SettlementAmount,
        InvoiceField::PaymentMethod,
        InvoiceField::SettlementNotes,
    ];

    /// Column name in the `invoices` table; also the wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            InvoiceField::ClientName => "client_name",
            InvoiceField::IssueDate => "issue_date",
            InvoiceField::DueDate => "due_date",
            InvoiceField::TotalAmount => "total_amount",
            InvoiceField::Currency => "currency",
            InvoiceField::Description => "description",
            InvoiceField::Status => "status",
            InvoiceField::Position => "position",
            InvoiceField::WorkRegion => "work_region",
            InvoiceField::JobTitle => "job_title",
            InvoiceField::WorkPeriod => "work_period",
            InvoiceField::Category => "category",
            InvoiceField::Notes => "notes",
            InvoiceField::SettlementDate => "settlement_date",
            InvoiceField::SettlementAmount => "settlement_amount",
            InvoiceField::PaymentMethod => "payment_method",
            InvoiceField::SettlementNotes => "settlement_notes",
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            InvoiceField::IssueDate | InvoiceField::DueDate | InvoiceField::SettlementDate => {
                FieldKind::Timestamp
            }
            InvoiceField::TotalAmount | InvoiceField::SettlementAmount => FieldKind::Amount,
            InvoiceField::Currency => FieldKind::Enumerated(Currency::NAMES),
            InvoiceField::Status => FieldKind::Enumerated(InvoiceStatus::NAMES),
            InvoiceField::Position => FieldKind::Enumerated(InvoicePosition::NAMES),
            InvoiceField::WorkRegion => FieldKind::Enumerated(WorkRegion::NAMES),
            _ => FieldKind::Text,
        }
    }

    pub fn nullable(self) -> bool {
        matches!(
            self,
            InvoiceField::JobTitle
                | InvoiceField::WorkPeriod
                | InvoiceField::Category
                | InvoiceField::Notes
                | InvoiceField::SettlementDate
                | InvoiceField::SettlementAmount
                | InvoiceField::PaymentMethod
                | InvoiceField::SettlementNotes
        )
    }

    /// Accepts the snake_case column name or the camelCase name the dashboard posts.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|field| field.as_str() == name || field.camel_case() == name)
    }

    fn camel_case(self) -> String {
        let mut out = String::new();
        let mut upper = false;
        for ch in self.as_str().chars() {
            if ch == '_' {
                upper = true;
            } else if upper {
                out.push(ch.to_ascii_uppercase());
                upper = false;
            } else {
                out.push(ch);
            }
        }
        out
    }
}

impl FromStr for InvoiceField {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InvoiceField::parse(s).ok_or_else(|| DomainError::new("field", s))
    }
}

impl fmt::Display for InvoiceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalised field value as compared by the change detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Text(String),
    Amount(f64),
    Timestamp(i64),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Text form stored in the audit trail; `None` for null.
    pub fn render(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(text) => Some(text.clone()),
            FieldValue::Amount(amount) => Some(amount.to_string()),
            FieldValue::Timestamp(ms) => Some(format_ms(*ms)),
        }
    }

    fn text_opt(value: &Option<String>) -> Self {
        value
            .as_ref()
            .map(|text| FieldValue::Text(text.clone()))
            .unwrap_or(FieldValue::Null)
    }

    fn amount_opt(value: Option<f64>) -> Self {
        value.map(FieldValue::Amount).unwrap_or(FieldValue::Null)
    }

    fn timestamp_opt(value: Option<i64>) -> Self {
        value.map(FieldValue::Timestamp).unwrap_or(FieldValue::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Some(text) => f.write_str(&text),
            None => f.write_str("null"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: String,
    pub invoice_number: String,
    pub client_name: String,
    pub issue_date: i64,
    pub due_date: i64,
    pub total_amount: f64,
    #[sqlx(try_from = "String")]
    pub currency: Currency,
    pub description: String,
    #[sqlx(try_from = "String")]
    pub status: InvoiceStatus,
    #[sqlx(try_from = "String")]
    pub position: InvoicePosition,
    #[sqlx(try_from = "String")]
    pub work_region: WorkRegion,
    pub job_title: Option<String>,
    pub work_period: Option<String>,
    pub category: Option<String>,
    pub notes: Option<String>,
    pub settlement_date: Option<i64>,
    pub settlement_amount: Option<f64>,
    pub payment_method: Option<String>,
    pub settlement_notes: Option<String>,
    pub position_updated_at: Option<i64>,
    pub position_updated_by: Option<String>,
    pub created_by_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

macro_rules! try_from_string {
    ($($ty:ty),+) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = DomainError;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    value.parse()
                }
            }
        )+
    };
}

try_from_string!(InvoiceStatus, InvoicePosition, WorkRegion, Currency);

/// Values stamped by every durable write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteStamps {
    pub actor: String,
    pub at: i64,
}

impl WriteStamps {
    /// Stamps for a write over a row whose `updated_at` is `previous`.
    ///
    /// `updated_at` is the compare-and-swap token, so `at` is always strictly
    /// after `previous`, even when the clock has not moved or runs behind.
    pub fn after(actor: impl Into<String>, previous: i64, now: i64) -> Self {
        Self {
            actor: actor.into(),
            at: now.max(previous.saturating_add(1)),
        }
    }

    /// Columns outside the change set that a write of `changes` also sets.
    pub fn derived_columns(&self, changes: &ChangeSet) -> Vec<(&'static str, FieldValue)> {
        let mut columns = vec![("updated_at", FieldValue::Timestamp(self.at))];
        if changes.contains(InvoiceField::Position) {
            columns.push(("position_updated_at", FieldValue::Timestamp(self.at)));
            columns.push(("position_updated_by", FieldValue::Text(self.actor.clone())));
        }
        columns
    }
}

fn invalid(field: InvoiceField, value: &FieldValue) -> AppError {
    AppError::new(VALIDATION_INVALID_VALUE, "Value does not fit the field.")
        .with_context("field", field.as_str())
        .with_context("value", value.to_string())
}

fn required(field: InvoiceField) -> AppError {
    AppError::new(VALIDATION_REQUIRED_FIELD, "Field cannot be cleared.")
        .with_context("field", field.as_str())
}

fn parse_domain<T: FromStr<Err = DomainError>>(
    field: InvoiceField,
    value: &FieldValue,
) -> AppResult<T> {
    match value {
        FieldValue::Text(text) => text.parse().map_err(|_| invalid(field, value)),
        FieldValue::Null => Err(required(field)),
        _ => Err(invalid(field, value)),
    }
}

fn expect_text(field: InvoiceField, value: FieldValue) -> AppResult<String> {
    match value {
        FieldValue::Text(text) => Ok(text),
        FieldValue::Null => Err(required(field)),
        other => Err(invalid(field, &other)),
    }
}

fn expect_opt_text(field: InvoiceField, value: FieldValue) -> AppResult<Option<String>> {
    match value {
        FieldValue::Null => Ok(None),
        other => expect_text(field, other).map(Some),
    }
}

fn expect_amount(field: InvoiceField, value: &FieldValue) -> AppResult<Option<f64>> {
    match value {
        FieldValue::Amount(amount) => Ok(Some(*amount)),
        FieldValue::Null => Ok(None),
        other => Err(invalid(field, other)),
    }
}

fn expect_timestamp(field: InvoiceField, value: &FieldValue) -> AppResult<Option<i64>> {
    match value {
        FieldValue::Timestamp(ms) => Ok(Some(*ms)),
        FieldValue::Null => Ok(None),
        other => Err(invalid(field, other)),
    }
}

impl Invoice {
    pub fn get(&self, field: InvoiceField) -> FieldValue {
        match field {
            InvoiceField::ClientName => FieldValue::Text(self.client_name.clone()),
            InvoiceField::IssueDate => FieldValue::Timestamp(self.issue_date),
            InvoiceField::DueDate => FieldValue::Timestamp(self.due_date),
            InvoiceField::TotalAmount => FieldValue::Amount(self.total_amount),
            InvoiceField::Currency => FieldValue::Text(self.currency.as_str().into()),
            InvoiceField::Description => FieldValue::Text(self.description.clone()),
            InvoiceField::Status => FieldValue::Text(self.status.as_str().into()),
            InvoiceField::Position => FieldValue::Text(self.position.as_str().into()),
            InvoiceField::WorkRegion => FieldValue::Text(self.work_region.as_str().into()),
            InvoiceField::JobTitle => FieldValue::text_opt(&self.job_title),
            InvoiceField::WorkPeriod => FieldValue::text_opt(&self.work_period),
            InvoiceField::Category => FieldValue::text_opt(&self.category),
            InvoiceField::Notes => FieldValue::text_opt(&self.notes),
            InvoiceField::SettlementDate => FieldValue::timestamp_opt(self.settlement_date),
            InvoiceField::SettlementAmount => FieldValue::amount_opt(self.settlement_amount),
            InvoiceField::PaymentMethod => FieldValue::text_opt(&self.payment_method),
            InvoiceField::SettlementNotes => FieldValue::text_opt(&self.settlement_notes),
        }
    }

    pub fn set(&mut self, field: InvoiceField, value: FieldValue) -> AppResult<()> {
        if value.is_null() && !field.nullable() {
            return Err(required(field));
        }
        match field {
            InvoiceField::ClientName => self.client_name = expect_text(field, value)?,
            InvoiceField::Description => self.description = expect_text(field, value)?,
            InvoiceField::IssueDate => {
                self.issue_date = expect_timestamp(field, &value)?.ok_or_else(|| required(field))?
            }
            InvoiceField::DueDate => {
                self.due_date = expect_timestamp(field, &value)?.ok_or_else(|| required(field))?
            }
            InvoiceField::TotalAmount => {
                self.total_amount = expect_amount(field, &value)?.ok_or_else(|| required(field))?
            }
            InvoiceField::Currency => self.currency = parse_domain(field, &value)?,
            InvoiceField::Status => self.status = parse_domain(field, &value)?,
            InvoiceField::Position => self.position = parse_domain(field, &value)?,
            InvoiceField::WorkRegion => self.work_region = parse_domain(field, &value)?,
            InvoiceField::JobTitle => self.job_title = expect_opt_text(field, value)?,
            InvoiceField::WorkPeriod => self.work_period = expect_opt_text(field, value)?,
            InvoiceField::Category => self.category = expect_opt_text(field, value)?,
            InvoiceField::Notes => self.notes = expect_opt_text(field, value)?,
            InvoiceField::SettlementDate => {
                self.settlement_date = expect_timestamp(field, &value)?
            }
            InvoiceField::SettlementAmount => {
                self.settlement_amount = expect_amount(field, &value)?
            }
            InvoiceField::PaymentMethod => self.payment_method = expect_opt_text(field, value)?,
            InvoiceField::SettlementNotes => {
                self.settlement_notes = expect_opt_text(field, value)?
            }
        }
        Ok(())
    }

    /// Apply a change set plus the write stamps, as a durable write would.
    pub fn apply_changes(&mut self, changes: &ChangeSet, stamps: &WriteStamps) -> AppResult<()> {
        for change in changes.iter() {
            self.set(change.field, change.new.clone())?;
        }
        if changes.contains(InvoiceField::Position) {
            self.position_updated_at = Some(stamps.at);
            self.position_updated_by = Some(stamps.actor.clone());
        }
        self.updated_at = stamps.at;
        Ok(())
    }
}
