use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::error::{AppError, AppResult, VALIDATION_INVALID_ID};

// UUIDs from this crate and cuid-style ids from the legacy dashboard both fit.
static INVOICE_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("invoice id validation pattern to compile")
});

pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

pub fn validate_invoice_id(id: &str) -> AppResult<()> {
    if INVOICE_ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(
            AppError::new(VALIDATION_INVALID_ID, "Invoice identifier is malformed.")
                .with_context("invoice_id", id.to_string()),
        )
    }
}
