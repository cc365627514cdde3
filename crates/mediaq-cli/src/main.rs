//! `mediaq-db`: operator tool for the mediaq queue database.
//!
//! Every subcommand prints JSON on stdout; logs go to stderr.

mod settings;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use mediaq_store::{
    ConfigRepo, DatabaseLocation, MediaType, MigrationManager, Pool, QueryCriteria,
    QueueItemPatch, QueueRepo, QueueStatus, StorageContext, StorageError, Value,
};

use crate::settings::Settings;

#[derive(Parser)]
#[command(name = "mediaq-db", about = "Inspect and maintain the mediaq queue database")]
struct Cli {
    /// JSON settings file.
    #[arg(long, global = true, default_value = "mediaq.json")]
    config: PathBuf,

    /// Database file, overriding the settings file.
    #[arg(long, global = true, conflicts_with = "memory")]
    database: Option<PathBuf>,

    /// Use a throwaway in-memory database.
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply, inspect or roll back schema migrations.
    Migrate(MigrateArgs),
    /// Print pool counters.
    Pool,
    /// Queue inspection and maintenance.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Key/value settings stored in the database.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the query plan for a statement.
    Explain(SqlArgs),
    /// Plan-based advice for a statement.
    Analyze(SqlArgs),
    /// Replay a workload and propose missing indexes.
    SuggestIndexes {
        /// File with one SQL statement per line (`--` lines are skipped).
        #[arg(long)]
        workload: PathBuf,
    },
}

#[derive(Args)]
struct MigrateArgs {
    /// Report versions without applying anything.
    #[arg(long, conflicts_with = "rollback_to")]
    status: bool,

    /// Undo applied migrations above this version.
    #[arg(long)]
    rollback_to: Option<u32>,
}

#[derive(Subcommand)]
enum QueueCommand {
    /// List items, newest first.
    List {
        #[arg(long, value_parser = QueueStatus::from_str)]
        status: Option<QueueStatus>,
        #[arg(long = "type", value_parser = MediaType::from_str)]
        media_type: Option<MediaType>,
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },
    /// Items waiting or in progress, oldest first.
    Active,
    /// Item counts for every status.
    Counts,
    /// Queue a new item.
    Add {
        #[arg(long = "type", value_parser = MediaType::from_str)]
        media_type: MediaType,
        #[arg(long)]
        name: String,
        #[arg(long)]
        tmdb_id: Option<i64>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long, requires = "tmdb_id")]
        season: Option<i32>,
        /// Episode number; without it `--season` queues a season pack.
        #[arg(long, requires = "season")]
        episode: Option<i32>,
    },
    /// Move an item to another status.
    SetStatus {
        id: i64,
        #[arg(value_parser = QueueStatus::from_str)]
        status: QueueStatus,
        #[arg(long)]
        error: Option<String>,
    },
    /// Delete one item.
    Remove { id: i64 },
    /// Delete every item with a status.
    Purge {
        #[arg(value_parser = QueueStatus::from_str)]
        status: QueueStatus,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print one value (`null` when unset).
    Get { key: String },
    /// Insert or replace a value.
    Set { key: String, value: String },
    /// Remove a key.
    Delete { key: String },
    /// List entries, optionally under a prefix.
    List {
        #[arg(long)]
        prefix: Option<String>,
    },
}

#[derive(Args)]
struct SqlArgs {
    /// Statement to inspect.
    sql: String,
    /// Positional parameters: integers, reals, `null`, otherwise text.
    #[arg(long = "param")]
    params: Vec<String>,
}

#[derive(Serialize)]
struct MigrationReport {
    applied: Vec<u32>,
    rolled_back: Vec<u32>,
    current_version: u32,
    latest_version: u32,
    pending: Vec<u32>,
}

#[derive(Serialize)]
struct Affected {
    rows_affected: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(Some(&cli.config))
        .with_context(|| format!("failed to load settings from {}", cli.config.display()))?;
    if cli.memory {
        settings.storage.database = DatabaseLocation::Memory;
    } else if let Some(path) = cli.database {
        settings.storage.database = DatabaseLocation::File(path);
    }
    mediaq_telemetry::init_logging(&settings.logging).context("failed to initialise logging")?;

    match cli.command {
        Command::Migrate(args) => migrate(&settings, &args).await,
        Command::Queue(command) => queue(open(settings).await?, command).await,
        Command::Config(command) => config(open(settings).await?, command).await,
        Command::Pool => {
            let ctx = open(settings).await?;
            print_json(&ctx.stats())
        }
        Command::Explain(args) => {
            let ctx = open_with_diagnostics(settings).await?;
            let optimizer = diagnostics(&ctx)?;
            let params = parse_params(&args.params);
            let plan = ctx
                .with_connection(move |conn| optimizer.get_query_plan(conn, &args.sql, &params))
                .await
                .context("failed to explain statement")?;
            print_json(&plan)
        }
        Command::Analyze(args) => {
            let ctx = open_with_diagnostics(settings).await?;
            let optimizer = diagnostics(&ctx)?;
            let params = parse_params(&args.params);
            let advice = ctx
                .with_connection(move |conn| optimizer.analyze_query(conn, &args.sql, &params))
                .await
                .context("failed to analyze statement")?;
            print_json(&advice)
        }
        Command::SuggestIndexes { workload } => suggest_indexes(settings, workload).await,
    }
}

async fn open(settings: Settings) -> Result<StorageContext> {
    StorageContext::open(settings.storage)
        .await
        .context("failed to open storage")
}

async fn open_with_diagnostics(mut settings: Settings) -> Result<StorageContext> {
    settings.storage.diagnostics_enabled = true;
    open(settings).await
}

fn diagnostics(ctx: &StorageContext) -> Result<std::sync::Arc<mediaq_store::QueryOptimizer>> {
    ctx.optimizer()
        .cloned()
        .context("query diagnostics are not available")
}

/// Migrations run on a bare pool so `--status` sees the schema as it is.
async fn migrate(settings: &Settings, args: &MigrateArgs) -> Result<()> {
    settings.storage.validate()?;
    let pool = Pool::open(&settings.storage, None).context("failed to open pool")?;
    let manager = MigrationManager::with_builtin();
    let (status, rollback_to) = (args.status, args.rollback_to);

    let report = pool
        .with_connection(move |conn| {
            let mut report = MigrationReport {
                applied: Vec::new(),
                rolled_back: Vec::new(),
                current_version: 0,
                latest_version: manager.latest_version(),
                pending: Vec::new(),
            };
            if let Some(target) = rollback_to {
                report.rolled_back = manager.rollback_to(conn, target)?;
            } else if !status {
                report.applied = manager.migrate(conn)?;
            }
            report.current_version = manager.current_version(conn)?;
            report.pending = manager.pending(conn)?.iter().map(|m| m.version).collect();
            Ok::<_, StorageError>(report)
        })
        .await;
    pool.shutdown();
    let report = report.context("migration failed")?;

    info!(
        applied = report.applied.len(),
        rolled_back = report.rolled_back.len(),
        version = report.current_version,
        "migrate finished"
    );
    print_json(&report)
}

async fn queue(ctx: StorageContext, command: QueueCommand) -> Result<()> {
    match command {
        QueueCommand::List {
            status,
            media_type,
            limit,
        } => {
            let mut criteria = QueryCriteria::new()
                .order_by("created_at DESC, id DESC")
                .limit(limit);
            if let Some(status) = status {
                criteria = criteria.eq("status", status);
            }
            if let Some(media_type) = media_type {
                criteria = criteria.eq("type", media_type);
            }
            let items = ctx
                .with_connection(move |conn| QueueRepo::list(conn, &criteria))
                .await?;
            print_json(&items)
        }
        QueueCommand::Active => print_json(&ctx.with_connection(QueueRepo::find_active).await?),
        QueueCommand::Counts => print_json(&ctx.with_connection(QueueRepo::count_by_status).await?),
        QueueCommand::Add {
            media_type,
            name,
            tmdb_id,
            year,
            season,
            episode,
        } => {
            let mut patch = QueueItemPatch::new_item(media_type, name);
            if let Some(tmdb_id) = tmdb_id {
                patch = patch.tmdb_id(tmdb_id);
            }
            if let Some(year) = year {
                patch = patch.year(year);
            }
            patch = match (season, episode) {
                (Some(season), Some(episode)) => patch.episode(season, episode),
                (Some(season), None) => patch.season_pack(season),
                _ => patch,
            };
            let item = ctx
                .with_connection(move |conn| QueueRepo::create(conn, &patch))
                .await?;
            print_json(&item)
        }
        QueueCommand::SetStatus { id, status, error } => {
            let item = ctx
                .with_connection(move |conn| {
                    QueueRepo::update_status(conn, id, status, error.as_deref())
                })
                .await?;
            print_json(&item)
        }
        QueueCommand::Remove { id } => {
            ctx.with_connection(move |conn| QueueRepo::delete(conn, id))
                .await?;
            print_json(&Affected { rows_affected: 1 })
        }
        QueueCommand::Purge { status } => {
            let rows_affected = ctx
                .with_connection(move |conn| QueueRepo::delete_by_status(conn, status))
                .await?;
            print_json(&Affected { rows_affected })
        }
    }
}

async fn config(ctx: StorageContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Get { key } => {
            let value = ctx
                .with_connection(move |conn| ConfigRepo::get_value(conn, &key))
                .await?;
            print_json(&value)
        }
        ConfigCommand::Set { key, value } => {
            let entry = ctx
                .with_connection(move |conn| {
                    ConfigRepo::set_value(conn, &key, &value)?;
                    ConfigRepo::get_entry(conn, &key)
                })
                .await?;
            print_json(&entry)
        }
        ConfigCommand::Delete { key } => {
            ctx.with_connection(move |conn| ConfigRepo::delete_value(conn, &key))
                .await?;
            print_json(&Affected { rows_affected: 1 })
        }
        ConfigCommand::List { prefix } => {
            let entries = ctx
                .with_connection(move |conn| match prefix {
                    Some(prefix) => ConfigRepo::get_by_prefix(conn, &prefix),
                    None => ConfigRepo::get_all(conn),
                })
                .await?;
            print_json(&entries)
        }
    }
}

#[derive(Serialize)]
struct IndexReport {
    replayed: usize,
    failed: usize,
    suggestions: Vec<mediaq_store::diagnostics::IndexSuggestion>,
    stats: mediaq_store::diagnostics::PerformanceStats,
}

/// Replays `workload` through a pooled connection, then reports indexes
/// the recorded statements would use but the schema lacks.
async fn suggest_indexes(settings: Settings, workload: PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(&workload)
        .with_context(|| format!("failed to read workload {}", workload.display()))?;
    let statements: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("--"))
        .map(|line| line.trim_end_matches(';').to_string())
        .collect();
    if statements.is_empty() {
        bail!("workload {} has no statements", workload.display());
    }

    let ctx = open_with_diagnostics(settings).await?;
    let optimizer = diagnostics(&ctx)?;
    optimizer.clear();

    let report = ctx
        .with_connection(move |conn| {
            let mut failed = 0;
            for sql in &statements {
                if let Err(e) = conn.query_many(sql, &[], |_| Ok(())) {
                    warn!(sql = %sql, error = %e, "workload statement failed");
                    failed += 1;
                }
            }
            Ok::<_, StorageError>(IndexReport {
                replayed: statements.len(),
                failed,
                suggestions: optimizer.suggest_missing_indexes(conn)?,
                stats: optimizer.get_performance_stats(),
            })
        })
        .await
        .context("failed to replay workload")?;
    print_json(&report)
}

fn parse_params(raw: &[String]) -> Vec<Value> {
    raw.iter().map(|s| parse_param(s)).collect()
}

fn parse_param(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else if let Ok(n) = raw.parse::<i64>() {
        Value::Integer(n)
    } else if let Ok(x) = raw.parse::<f64>() {
        Value::Real(x)
    } else {
        Value::Text(raw.to_string())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{out}");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
