use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;

use invoice_tracker::error::INVOICE_NOT_FOUND;
use invoice_tracker::id::validate_invoice_id;
use invoice_tracker::{
    coordinator_from_config, db, migrate, AppError, Anonymous, Invoice, InvoiceStore,
    MutationCoordinator, MutationError, PartialUpdate, PipelineConfig, SqliteStore,
};

const EXIT_ERROR: i32 = 1;
const EXIT_CLIENT_ERROR: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "invoice-tracker", about = "Invoice tracking pipeline", version)]
struct Cli {
    /// JSON configuration file (overrides INVOICE_TRACKER_CONFIG).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// SQLite database file (overrides configuration and INVOICE_TRACKER_DB).
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Database maintenance commands.
    #[command(subcommand)]
    Db(DbCommand),
    /// Inspect and edit invoices.
    #[command(subcommand)]
    Invoice(InvoiceCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply pending schema migrations.
    Migrate,
}

#[derive(Debug, Subcommand)]
enum InvoiceCommand {
    /// Insert a complete invoice record given as JSON.
    Create {
        #[arg(long)]
        data: String,
    },
    /// Print one invoice as JSON.
    Show { id: String },
    /// Apply a partial update through the mutation pipeline.
    Update {
        id: String,
        /// JSON object of fields to change; `null` or "" clears optional fields.
        #[arg(long)]
        data: String,
        #[arg(long)]
        actor: Option<String>,
        /// Note attached to every history entry of this update.
        #[arg(long)]
        note: Option<String>,
    },
    /// Print the lifecycle history of an invoice, newest first.
    History { id: String },
}

/// Failure with the exit code it maps to.
struct CliFailure {
    code: i32,
    error: AppError,
}

impl From<AppError> for CliFailure {
    fn from(error: AppError) -> Self {
        let code = if error.is_validation() || error.code() == INVOICE_NOT_FOUND {
            EXIT_CLIENT_ERROR
        } else {
            EXIT_ERROR
        };
        Self { code, error }
    }
}

impl From<MutationError> for CliFailure {
    fn from(error: MutationError) -> Self {
        let code = if error.is_client_error() {
            EXIT_CLIENT_ERROR
        } else {
            EXIT_ERROR
        };
        Self {
            code,
            error: error.into(),
        }
    }
}

impl From<anyhow::Error> for CliFailure {
    fn from(error: anyhow::Error) -> Self {
        AppError::from(error).into()
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(EXIT_CLIENT_ERROR);
        }
    };
    let log_guard = invoice_tracker::init_logging(config.log_dir.as_deref());
    tracing::debug!(target: "invoice_tracker", event = "cli_start", command = ?cli.command);

    let code = match run(cli.command, &config).await {
        Ok(()) => 0,
        Err(failure) => {
            tracing::error!(
                target: "invoice_tracker",
                event = "cli_failed",
                code = failure.error.code(),
                error = %failure.error
            );
            match serde_json::to_string(&failure.error) {
                Ok(payload) => eprintln!("{payload}"),
                Err(_) => eprintln!("Error: {}", failure.error),
            }
            failure.code
        }
    };
    drop(log_guard);
    process::exit(code);
}

fn load_config(cli: &Cli) -> invoice_tracker::AppResult<PipelineConfig> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.database_path = Some(db.clone());
    }
    Ok(config)
}

async fn open_store(config: &PipelineConfig) -> Result<SqliteStore> {
    let db_path = config.database_path().context("determine database path")?;
    let pool: SqlitePool = db::open_sqlite_pool(&db_path)
        .await
        .with_context(|| format!("open database {}", db_path.display()))?;
    migrate::apply_migrations(&pool)
        .await
        .context("apply migrations")?;
    Ok(SqliteStore::new(pool))
}

async fn run(command: Commands, config: &PipelineConfig) -> Result<(), CliFailure> {
    let store = open_store(config).await?;
    let result = match command {
        Commands::Db(DbCommand::Migrate) => {
            let versions: Vec<String> = sqlx::query_scalar(
                "SELECT version FROM schema_migrations ORDER BY version",
            )
            .fetch_all(store.pool())
            .await
            .map_err(AppError::from)?;
            print_json(&serde_json::json!({ "applied": versions }))
        }
        Commands::Invoice(command) => {
            let coordinator = coordinator_from_config(store.clone(), config, Arc::new(Anonymous));
            run_invoice(command, &coordinator).await
        }
    };
    store.pool().close().await;
    result
}

async fn run_invoice(
    command: InvoiceCommand,
    coordinator: &MutationCoordinator<SqliteStore>,
) -> Result<(), CliFailure> {
    match command {
        InvoiceCommand::Create { data } => {
            let invoice: Invoice = serde_json::from_str(&data).map_err(bad_payload)?;
            validate_invoice_id(&invoice.id)?;
            coordinator.store().create(&invoice).await?;
            print_json(&invoice)
        }
        InvoiceCommand::Show { id } => {
            validate_invoice_id(&id)?;
            let invoice = coordinator
                .store()
                .get_by_id(&id)
                .await?
                .ok_or_else(|| MutationError::NotFound { id: id.clone() })?;
            print_json(&invoice)
        }
        InvoiceCommand::Update {
            id,
            data,
            actor,
            note,
        } => {
            let update = parse_update(&data)?;
            let outcome = coordinator
                .mutate(&id, &update, actor.as_deref(), note.as_deref())
                .await?;
            print_json(&outcome)
        }
        InvoiceCommand::History { id } => {
            let entries = coordinator.history(&id).await?;
            print_json(&entries)
        }
    }
}

fn parse_update(data: &str) -> Result<PartialUpdate, CliFailure> {
    match serde_json::from_str::<Value>(data).map_err(bad_payload)? {
        Value::Object(object) => Ok(PartialUpdate::from_json(object)),
        other => Err(AppError::new(
            invoice_tracker::error::VALIDATION_INVALID_VALUE,
            "Update payload must be a JSON object.",
        )
        .with_context("payload_type", json_type(&other))
        .into()),
    }
}

fn bad_payload(error: serde_json::Error) -> CliFailure {
    CliFailure {
        code: EXIT_CLIENT_ERROR,
        error: AppError::from(error).with_context("argument", "--data"),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliFailure> {
    let rendered = serde_json::to_string_pretty(value).map_err(AppError::from)?;
    println!("{rendered}");
    Ok(())
}
