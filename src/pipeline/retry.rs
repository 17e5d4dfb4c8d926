//! Bounded exponential backoff around a single storage operation.
//!
//! Failures are classified against [`TransientSignatures`]; anything that does
//! not match is fatal and returned after the first attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Total budget across attempts and waits; `None` means attempts alone bound it.
    pub deadline_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
            deadline_ms: Some(30_000),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// Error signatures that an identical retry is expected to clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransientSignatures {
    /// Exact matches on [`AppError::code`] anywhere in the cause chain.
    pub codes: Vec<String>,
    /// Case-insensitive fragments of [`AppError::message`].
    pub message_fragments: Vec<String>,
}

impl Default for TransientSignatures {
    fn default() -> Self {
        let codes = [
            "SQLX/POOL_TIMEOUT",
            "Sqlite/5",
            "Sqlite/6",
            "Sqlite/517",
            "IO/ConnectionReset",
            "IO/ConnectionAborted",
            "IO/BrokenPipe",
            "IO/TimedOut",
            // Postgres behind a transaction pooler: stale or duplicated
            // prepared statements and dropped sessions.
            "26000",
            "42P05",
            "08003",
            "08006",
            "57P01",
        ];
        let fragments = [
            "prepared statement",
            "connection reset",
            "database is locked",
            "server closed the connection",
        ];
        Self {
            codes: codes.iter().map(|c| c.to_string()).collect(),
            message_fragments: fragments.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Transient,
    Fatal,
}

impl TransientSignatures {
    pub fn classify(&self, error: &AppError) -> Classification {
        let transient = error.chain().any(|err| {
            if self.codes.iter().any(|code| code == err.code()) {
                return true;
            }
            let message = err.message().to_ascii_lowercase();
            self.message_fragments
                .iter()
                .any(|fragment| message.contains(&fragment.to_ascii_lowercase()))
        });
        if transient {
            Classification::Transient
        } else {
            Classification::Fatal
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{operation} failed: {error}")]
    Fatal {
        operation: &'static str,
        error: AppError,
    },
    #[error("{operation} still failing after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        delays: Vec<Duration>,
        last: AppError,
    },
}

impl RetryError {
    pub fn error(&self) -> &AppError {
        match self {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// A successful run with the attempts it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    pub delays: Vec<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    signatures: TransientSignatures,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, signatures: TransientSignatures) -> Self {
        Self { policy, signatures }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classify(&self, error: &AppError) -> Classification {
        self.signatures.classify(error)
    }

    /// Run `op` until it succeeds, fails fatally, or the policy is used up.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> Result<Retried<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut delays = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            target: "invoice_tracker",
                            event = "retry_recovered",
                            operation,
                            attempts = attempt
                        );
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                        delays,
                    });
                }
                Err(error) => error,
            };

            if self.classify(&error) == Classification::Fatal {
                return Err(RetryError::Fatal { operation, error });
            }

            if attempt >= max_attempts {
                warn!(
                    target: "invoice_tracker",
                    event = "retry_exhausted",
                    operation,
                    attempts = attempt,
                    error = %error
                );
                return Err(RetryError::Exhausted {
                    operation,
                    attempts: attempt,
                    delays,
                    last: error,
                });
            }

            let delay = self.policy.delay_for(attempt);
            if let Some(deadline) = self.policy.deadline() {
                if started.elapsed() + delay > deadline {
                    warn!(
                        target: "invoice_tracker",
                        event = "retry_deadline_reached",
                        operation,
                        attempts = attempt,
                        deadline_ms = deadline.as_millis() as u64,
                        error = %error
                    );
                    return Err(RetryError::Exhausted {
                        operation,
                        attempts: attempt,
                        delays,
                        last: error,
                    });
                }
            }

            warn!(
                target: "invoice_tracker",
                event = "retry_transient_failure",
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error
            );
            tokio::time::sleep(delay).await;
            delays.push(delay);
        }
    }
}
