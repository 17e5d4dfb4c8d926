use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult, VALIDATION_CONFIG};
use crate::pipeline::history::AuditPolicy;
use crate::pipeline::retry::{RetryExecutor, RetryPolicy, TransientSignatures};

pub const ENV_CONFIG: &str = "INVOICE_TRACKER_CONFIG";
pub const ENV_DB: &str = "INVOICE_TRACKER_DB";
pub const ENV_MAX_ATTEMPTS: &str = "INVOICE_TRACKER_MAX_ATTEMPTS";
pub const ENV_BASE_DELAY_MS: &str = "INVOICE_TRACKER_BASE_DELAY_MS";
pub const ENV_DEADLINE_MS: &str = "INVOICE_TRACKER_DEADLINE_MS";
pub const ENV_LOG_DIR: &str = "INVOICE_TRACKER_LOG_DIR";

const APP_DIR: &str = "invoice-tracker";
const DB_FILE: &str = "invoices.sqlite3";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retry: RetryPolicy,
    pub transient: TransientSignatures,
    pub audit: AuditPolicy,
    pub database_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl PipelineConfig {
    /// Defaults, then the JSON file, then the environment.
    pub fn load(file: Option<&Path>) -> AppResult<Self> {
        let file = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_CONFIG).map(PathBuf::from));
        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::from(e).with_context("path", path.display().to_string()))?;
        serde_json::from_str(&raw)
            .map_err(|e| AppError::from(e).with_context("path", path.display().to_string()))
    }

    /// Overlay values from `lookup`; unparsable numbers are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DB).filter(|v| !v.trim().is_empty()) {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup(ENV_LOG_DIR).filter(|v| !v.trim().is_empty()) {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup(ENV_MAX_ATTEMPTS).and_then(|v| v.trim().parse::<u32>().ok()) {
            self.retry.max_attempts = value;
        }
        if let Some(value) = lookup(ENV_BASE_DELAY_MS).and_then(|v| v.trim().parse::<u64>().ok()) {
            self.retry.base_delay_ms = value;
        }
        if let Some(value) = lookup(ENV_DEADLINE_MS).and_then(|v| v.trim().parse::<u64>().ok()) {
            self.retry.deadline_ms = Some(value).filter(|ms| *ms > 0);
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.retry.max_attempts < 1 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        let multiplier = self.retry.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier", "must be at least 1.0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid(
                "retry.max_delay_ms",
                "must not be below retry.base_delay_ms",
            ));
        }
        Ok(())
    }

    pub fn retry_executor(&self) -> RetryExecutor {
        RetryExecutor::new(self.retry.clone(), self.transient.clone())
    }

    pub fn database_path(&self) -> AppResult<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => default_db_path(),
        }
    }
}

fn invalid(key: &str, reason: &str) -> AppError {
    AppError::new(VALIDATION_CONFIG, format!("Invalid configuration: {key} {reason}."))
        .with_context("key", key)
}

pub fn default_db_path() -> AppResult<PathBuf> {
    let base = match dirs::data_dir() {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    Ok(base.join(APP_DIR).join(DB_FILE))
}
