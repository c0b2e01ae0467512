//! `trulens-db`: inspect and maintain a TruLens store database from the shell.
//!
//! Every command prints JSON on stdout. Diagnostics go to stderr through
//! `tracing`, filtered by `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use trulens_store_core::{
    AppId, FeedbackDefinitionId, FeedbackFilter, FeedbackResultId, FeedbackResultStatus,
    RecordId, Table, TruDb,
};
use trulens_store_sqlite::{LocalSqlite, SqliteConfig};

#[derive(Debug, Parser)]
#[command(name = "trulens-db")]
#[command(about = "TruLens store database CLI")]
pub struct Cli {
    #[arg(long, env = "TRULENS_DB", default_value = "default.sqlite")]
    db: PathBuf,

    #[arg(long, env = "TRULENS_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    busy_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Version markers and other metadata.
    Meta,
    /// Drop every record, app, definition and result. Requires `--yes`.
    Reset(ResetArgs),
    /// Stored JSON of one app.
    App(AppArgs),
    FeedbackDefs(FeedbackDefsArgs),
    /// Feedback results joined with their record, definition and app.
    Feedback(FeedbackArgs),
    /// One row per record with a column per feedback function.
    Records(RecordsArgs),
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Args)]
pub struct AppArgs {
    app_id: String,
}

#[derive(Debug, Args)]
pub struct FeedbackDefsArgs {
    #[arg(long)]
    id: Option<String>,
}

#[derive(Debug, Args)]
pub struct FeedbackArgs {
    #[arg(long)]
    record_id: Option<String>,
    #[arg(long)]
    feedback_result_id: Option<String>,
    #[arg(long)]
    feedback_definition_id: Option<String>,
    /// Repeat to match any of several statuses.
    #[arg(long = "status")]
    statuses: Vec<String>,
    /// RFC 3339 timestamp; results updated at or before it match.
    #[arg(long)]
    last_ts_before: Option<String>,
}

#[derive(Debug, Args)]
pub struct RecordsArgs {
    /// Repeat to include several apps; all apps when omitted.
    #[arg(long = "app-id")]
    app_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RecordsView {
    names: Vec<String>,
    #[serde(flatten)]
    table: Table,
}

/// Installs the stderr subscriber. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes a parsed command against the configured database.
///
/// # Errors
/// Returns an error when the database cannot be opened, an argument is
/// invalid, or the requested operation fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = SqliteConfig::new(cli.db)
        .with_busy_timeout(Duration::from_millis(cli.busy_timeout_ms));
    let db = LocalSqlite::open(config)?;
    tracing::debug!("opened {}", db);
    run_command(cli.command, &db)
}

/// Executes `command` against any store.
///
/// # Errors
/// Returns an error when an argument is invalid or the store operation fails.
pub fn run_command(command: Command, db: &impl TruDb) -> Result<()> {
    match command {
        Command::Meta => {
            let meta = db.get_meta()?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Command::Reset(args) => {
            if !args.yes {
                return Err(anyhow!("refusing to reset without --yes"));
            }
            db.reset_database()?;
            println!("{}", serde_json::json!({ "reset": true }));
        }
        Command::App(args) => {
            let app_id = AppId::from(args.app_id);
            let app = db
                .get_app(&app_id)?
                .ok_or_else(|| anyhow!("app not found: {app_id}"))?;
            println!("{}", serde_json::to_string_pretty(&app)?);
        }
        Command::FeedbackDefs(args) => {
            let id = args.id.map(FeedbackDefinitionId::from);
            let definitions = db.get_feedback_defs(id.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&definitions)?);
        }
        Command::Feedback(args) => {
            let filter = feedback_filter(args)?;
            let rows = db.get_feedback(&filter)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Records(args) => {
            let app_ids = args
                .app_ids
                .into_iter()
                .map(AppId::from)
                .collect::<Vec<_>>();
            let (table, names) = db.get_records_and_feedback(&app_ids)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&RecordsView { names, table })?
            );
        }
    }

    Ok(())
}

fn feedback_filter(args: FeedbackArgs) -> Result<FeedbackFilter> {
    let mut filter = FeedbackFilter::default();
    if let Some(record_id) = args.record_id {
        filter = filter.record_id(RecordId::from(record_id));
    }
    if let Some(feedback_result_id) = args.feedback_result_id {
        filter = filter.feedback_result_id(FeedbackResultId::from(feedback_result_id));
    }
    if let Some(feedback_definition_id) = args.feedback_definition_id {
        filter = filter.feedback_definition_id(FeedbackDefinitionId::from(feedback_definition_id));
    }
    filter = match args.statuses.as_slice() {
        [] => filter,
        [single] => filter.status(single.parse::<FeedbackResultStatus>()?),
        many => filter.statuses_from_names(many)?,
    };
    if let Some(raw) = args.last_ts_before {
        let bound = OffsetDateTime::parse(&raw, &Rfc3339)
            .with_context(|| format!("invalid RFC3339 timestamp for --last-ts-before: {raw}"))?;
        filter = filter.last_ts_before(bound);
    }
    Ok(filter)
}
