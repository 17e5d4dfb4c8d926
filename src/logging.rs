use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

pub const DEFAULT_FILTER: &str = "invoice_tracker=info,sqlx=warn";
pub const ENV_LOG_FORMAT: &str = "INVOICE_TRACKER_LOG_FORMAT";
pub const LOG_FILE_PREFIX: &str = "invoice-tracker";

/// Keeps the file sink flushing until dropped.
#[must_use = "dropping the guard stops the file sink"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber: stderr (JSON when
/// `INVOICE_TRACKER_LOG_FORMAT=json`) plus a daily file under `log_dir`.
///
/// Later calls leave the first subscriber in place.
pub fn init_logging(log_dir: Option<&Path>) -> LogGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var(ENV_LOG_FORMAT)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let console: Box<dyn Layer<Registry> + Send + Sync> = if json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, file_guard) = match log_dir.map(file_appender) {
        Some(Ok(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Some(Err(err)) => {
            eprintln!("invoice-tracker: file logging disabled: {err}");
            (None, None)
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(filter);

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return LogGuard { _file: None };
    }
    let _ = tracing_log::LogTracer::init();

    LogGuard { _file: file_guard }
}

fn file_appender(dir: &Path) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
}
