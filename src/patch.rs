//! Per-field partial updates as posted by the invoice edit form.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::invoice::{FieldKind, InvoiceField};

/// Per-field intent of a partial update.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch<T> {
    Unset,
    Clear,
    Value(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Unset
    }
}

impl<T> Patch<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Patch::Unset)
    }
}

/// A partial update keyed by field. Fields that are absent are `Unset`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialUpdate {
    fields: BTreeMap<InvoiceField, Patch<Value>>,
    ignored: Vec<String>,
}

impl PartialUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the JSON object a client posted.
    ///
    /// `null` clears a field, an empty string clears a nullable text field, and
    /// keys that are not updatable fields are remembered in [`Self::ignored`].
    pub fn from_json(object: Map<String, Value>) -> Self {
        let mut update = PartialUpdate::new();
        for (key, value) in object {
            match InvoiceField::parse(&key) {
                Some(field) => update.insert(field, patch_from_json(field, value)),
                None => update.ignored.push(key),
            }
        }
        update
    }

    pub fn set(mut self, field: InvoiceField, value: impl Into<Value>) -> Self {
        self.insert(field, Patch::Value(value.into()));
        self
    }

    pub fn clear(mut self, field: InvoiceField) -> Self {
        self.insert(field, Patch::Clear);
        self
    }

    pub fn insert(&mut self, field: InvoiceField, patch: Patch<Value>) {
        if patch.is_unset() {
            self.fields.remove(&field);
        } else {
            self.fields.insert(field, patch);
        }
    }

    pub fn get(&self, field: InvoiceField) -> Option<&Patch<Value>> {
        self.fields.get(&field)
    }

    /// Supplied fields in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (InvoiceField, &Patch<Value>)> {
        self.fields.iter().map(|(field, patch)| (*field, patch))
    }

    pub fn ignored(&self) -> &[String] {
        &self.ignored
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn patch_from_json(field: InvoiceField, value: Value) -> Patch<Value> {
    match value {
        Value::Null => Patch::Clear,
        Value::String(text)
            if text.is_empty() && field.nullable() && field.kind() == FieldKind::Text =>
        {
            Patch::Clear
        }
        other => Patch::Value(other),
    }
}
