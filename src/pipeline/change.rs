//! Field-level diff between a partial update and the persisted invoice.

use serde::Serialize;
use serde_json::Value;

use crate::error::{AppError, AppResult, VALIDATION_INVALID_VALUE, VALIDATION_REQUIRED_FIELD};
use crate::invoice::{FieldKind, FieldValue, Invoice, InvoiceField};
use crate::patch::{PartialUpdate, Patch};
use crate::time::parse_date_ms;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: InvoiceField,
    pub old: FieldValue,
    pub new: FieldValue,
}

/// Changed fields in canonical field order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ChangeSet {
    changes: Vec<FieldChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldChange> {
        self.changes.iter()
    }

    pub fn get(&self, field: InvoiceField) -> Option<&FieldChange> {
        self.changes.iter().find(|change| change.field == field)
    }

    pub fn contains(&self, field: InvoiceField) -> bool {
        self.get(field).is_some()
    }

    pub fn fields(&self) -> Vec<InvoiceField> {
        self.changes.iter().map(|change| change.field).collect()
    }

    fn push(&mut self, change: FieldChange) {
        debug_assert!(!self.contains(change.field));
        self.changes.push(change);
        self.changes.sort_by_key(|change| change.field);
    }
}

impl FromIterator<FieldChange> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = FieldChange>>(iter: I) -> Self {
        let mut set = ChangeSet::default();
        for change in iter {
            set.push(change);
        }
        set
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub changes: ChangeSet,
    /// Values that were dropped rather than rejected.
    pub warnings: Vec<String>,
}

/// Compute the change set for `update` against `current`.
///
/// Out-of-domain enumerated values are dropped with a warning. Clearing a
/// required field or supplying a value of the wrong shape is a validation error.
pub fn detect_changes(current: &Invoice, update: &PartialUpdate) -> AppResult<Detection> {
    let mut detection = Detection::default();
    for key in update.ignored() {
        detection
            .warnings
            .push(format!("ignored `{key}`: not an updatable invoice field"));
    }

    for (field, patch) in update.iter() {
        let new = match patch {
            Patch::Unset => continue,
            Patch::Clear if field.nullable() => FieldValue::Null,
            Patch::Clear => {
                return Err(
                    AppError::new(VALIDATION_REQUIRED_FIELD, "Field cannot be cleared.")
                        .with_context("field", field.as_str()),
                )
            }
            Patch::Value(raw) => match normalise(field, raw)? {
                Normalised::Value(value) => value,
                Normalised::OutOfDomain(value) => {
                    detection.warnings.push(format!(
                        "dropped `{field}`: {value:?} is not one of {}",
                        domain_list(field)
                    ));
                    continue;
                }
            },
        };

        let old = current.get(field);
        if old != new {
            detection.changes.push(FieldChange { field, old, new });
        }
    }
    Ok(detection)
}

enum Normalised {
    Value(FieldValue),
    OutOfDomain(String),
}

fn normalise(field: InvoiceField, raw: &Value) -> AppResult<Normalised> {
    let value = match (field.kind(), raw) {
        (FieldKind::Text, Value::String(text)) => FieldValue::Text(text.clone()),
        (FieldKind::Enumerated(domain), Value::String(text)) => {
            if !domain.contains(&text.as_str()) {
                return Ok(Normalised::OutOfDomain(text.clone()));
            }
            FieldValue::Text(text.clone())
        }
        (FieldKind::Enumerated(_), other) => return Ok(Normalised::OutOfDomain(other.to_string())),
        (FieldKind::Amount, Value::Number(number)) => number
            .as_f64()
            .filter(|amount| amount.is_finite())
            .map(FieldValue::Amount)
            .ok_or_else(|| invalid(field, raw))?,
        (FieldKind::Amount, Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|amount| amount.is_finite())
            .map(FieldValue::Amount)
            .ok_or_else(|| invalid(field, raw))?,
        (FieldKind::Timestamp, Value::Number(number)) => number
            .as_i64()
            .map(FieldValue::Timestamp)
            .ok_or_else(|| invalid(field, raw))?,
        (FieldKind::Timestamp, Value::String(text)) => parse_date_ms(text)
            .map(FieldValue::Timestamp)
            .ok_or_else(|| invalid(field, raw))?,
        _ => return Err(invalid(field, raw)),
    };
    Ok(Normalised::Value(value))
}

fn invalid(field: InvoiceField, raw: &Value) -> AppError {
    AppError::new(VALIDATION_INVALID_VALUE, "Value does not fit the field.")
        .with_context("field", field.as_str())
        .with_context("value", raw.to_string())
}

fn domain_list(field: InvoiceField) -> String {
    match field.kind() {
        FieldKind::Enumerated(domain) => domain.join(", "),
        _ => String::new(),
    }
}
