//! jobtrack CLI - Command line interface for the offline-first record store.
//!
//! Records are written to local storage first and pushed to the remote
//! tracker whenever it is reachable.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use jobtrack_common::{Record, RecordId, RecordKind};
use jobtrack_sync::{
    build_engine, ConnectivityState, EndpointCandidate, HttpTransport, SyncConfig, SyncContext,
    SyncEngine, TierConfig,
};

/// Remote tracker used when no configuration exists.
const DEFAULT_ENDPOINT: &str = "http://localhost:3000";

#[derive(Parser)]
#[command(name = "jobtrack")]
#[command(about = "jobtrack - Offline-first job application tracker")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a record and submit it if the tracker is reachable.
    Add {
        /// Record kind: "application" or "contact".
        #[arg(short, long)]
        kind: RecordKind,

        /// Record payload as a JSON object.
        #[arg(short, long)]
        payload: String,

        /// Caller-assigned record id.
        #[arg(long)]
        id: Option<String>,
    },

    /// List stored records.
    List {
        /// Only records not yet delivered.
        #[arg(long)]
        pending: bool,
    },

    /// Show one record as JSON.
    Show {
        /// Record id.
        id: String,
    },

    /// Delete a record locally.
    Remove {
        /// Record id.
        id: String,
    },

    /// Check which endpoint is reachable.
    Probe,

    /// Submit every pending record now.
    Sync,

    /// Show record counts and connectivity.
    Status,

    /// Keep syncing in the background until interrupted.
    Run,

    /// Manage the configuration file.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write the default configuration.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.command {
        Commands::Add { kind, payload, id } => {
            cmd_add(&config_path, kind, &payload, id.as_deref()).await
        }

        Commands::List { pending } => cmd_list(&config_path, pending).await,

        Commands::Show { id } => cmd_show(&config_path, &id).await,

        Commands::Remove { id } => cmd_remove(&config_path, &id).await,

        Commands::Probe => cmd_probe(&config_path).await,

        Commands::Sync => cmd_sync(&config_path).await,

        Commands::Status => cmd_status(&config_path).await,

        Commands::Run => cmd_run(&config_path).await,

        Commands::Config { command } => match command {
            ConfigCommand::Init { force } => cmd_config_init(&config_path, force).await,
            ConfigCommand::Show => cmd_config_show(&config_path).await,
        },
    }
}

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("No configuration directory on this platform")?;
    Ok(dir.join("jobtrack").join("sync.json"))
}

/// Configuration used when no file exists: a file tier backed by SQLite,
/// both under the platform data dir.
fn default_config() -> Result<SyncConfig> {
    let data = dirs::data_dir()
        .context("No data directory on this platform")?
        .join("jobtrack");

    Ok(SyncConfig {
        endpoints: vec![EndpointCandidate::new(
            Url::parse(DEFAULT_ENDPOINT).context("Invalid default endpoint")?,
            0,
        )],
        tiers: vec![
            TierConfig::new(
                "file",
                json!({ "root": data.join("records").to_string_lossy() }),
            ),
            TierConfig::new(
                "sqlite",
                json!({ "path": data.join("records.db").to_string_lossy() }),
            ),
        ],
        ..SyncConfig::default()
    })
}

async fn load_config(path: &Path) -> Result<SyncConfig> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        SyncConfig::load(path)
            .await
            .with_context(|| format!("Failed to load configuration {}", path.display()))
    } else {
        default_config()
    }
}

async fn open_engine(config: &SyncConfig) -> Result<Arc<SyncEngine>> {
    let transport = HttpTransport::new(config.attempt_timeout())
        .context("Failed to create HTTP transport")?;
    build_engine(config, Arc::new(transport)).context("Failed to open local storage")
}

fn print_record(record: &Record) {
    println!(
        "{:<38} {:<12} {:<9} {}",
        record.id.to_string(),
        record.kind.to_string(),
        record.sync_status.to_string(),
        record.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

/// Store a record and submit it if possible.
async fn cmd_add(config_path: &Path, kind: RecordKind, payload: &str, id: Option<&str>) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    if !payload.is_object() {
        anyhow::bail!("Payload must be a JSON object");
    }

    let config = load_config(config_path).await?;
    let engine = open_engine(&config).await?;
    engine.prober().probe().await;

    let record = match id {
        Some(id) => {
            let id = RecordId::new(id).context("Invalid record id")?;
            engine.add_record_with_id(id, kind, payload).await
        }
        None => engine.add_record(kind, payload).await,
    }
    .context("Failed to store record")?;

    println!("Record stored: {} ({})", record.id, record.sync_status);
    if let Some(error) = &record.last_error {
        println!("  Last error: {}", error);
    }

    Ok(())
}

/// List records.
async fn cmd_list(config_path: &Path, pending: bool) -> Result<()> {
    let config = load_config(config_path).await?;
    let engine = open_engine(&config).await?;

    let records: Vec<Record> = if pending {
        engine.pending().await?.into_iter().collect()
    } else {
        engine.records().await?
    };

    if records.is_empty() {
        println!("(no records)");
        return Ok(());
    }

    for record in &records {
        print_record(record);
    }
    println!();
    println!("Total: {} record(s)", records.len());

    Ok(())
}

/// Show one record.
async fn cmd_show(config_path: &Path, id: &str) -> Result<()> {
    let config = load_config(config_path).await?;
    let engine = open_engine(&config).await?;
    let id = RecordId::new(id).context("Invalid record id")?;

    let record = engine
        .record(&id)
        .await?
        .with_context(|| format!("No record with id {}", id))?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

/// Remove a record locally.
async fn cmd_remove(config_path: &Path, id: &str) -> Result<()> {
    info!("Removing: {}", id);

    let config = load_config(config_path).await?;
    let engine = open_engine(&config).await?;
    let id = RecordId::new(id).context("Invalid record id")?;

    if engine.remove_record(&id).await? {
        println!("Removed: {}", id);
    } else {
        println!("No record with id {}", id);
    }

    Ok(())
}

/// Probe connectivity.
async fn cmd_probe(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;
    let engine = open_engine(&config).await?;

    for candidate in engine.prober().candidates() {
        println!("Candidate: {} (priority {})", candidate.address, candidate.priority);
    }

    match engine.prober().probe().await {
        ConnectivityState::Online(endpoint) => println!("Online via {}", endpoint.address),
        state => println!("Connectivity: {}", state),
    }

    Ok(())
}

/// Reconcile once.
async fn cmd_sync(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;
    let engine = open_engine(&config).await?;

    let report = engine.reconcile().await.context("Reconciliation failed")?;

    println!("Pending:  {}", report.pending);
    println!("Synced:   {}", report.synced);
    println!("Failed:   {}", report.failed);
    println!("Skipped:  {}", report.skipped);
    println!("Deferred: {}", report.deferred);
    println!("Took:     {:?}", report.duration);

    Ok(())
}

/// Show counts and connectivity.
async fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;
    let engine = open_engine(&config).await?;

    let counts = engine.status_counts().await?;
    let tier = engine
        .chain()
        .authoritative_tier()
        .await
        .unwrap_or_else(|| "none".to_string());
    let state = engine.prober().probe().await;

    println!("Configuration: {}", config_path.display());
    println!("Storage tier:  {}", tier);
    println!("Connectivity:  {}", state);
    println!();
    println!("Unsynced: {}", counts.unsynced);
    println!("Syncing:  {}", counts.syncing);
    println!("Synced:   {}", counts.synced);
    println!("Failed:   {}", counts.failed);
    println!("Total:    {}", counts.total());

    Ok(())
}

/// Run a long-lived sync context.
async fn cmd_run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;
    let engine = open_engine(&config).await?;

    let context = SyncContext::start(engine, &config).await;
    println!("Syncing in the background. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down...");
    context.shutdown().await;

    Ok(())
}

/// Write the default configuration file.
async fn cmd_config_init(config_path: &Path, force: bool) -> Result<()> {
    if !force && tokio::fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            config_path.display()
        );
    }

    default_config()?
        .save(config_path)
        .await
        .context("Failed to write configuration")?;

    println!("Configuration written: {}", config_path.display());
    Ok(())
}

/// Print the effective configuration.
async fn cmd_config_show(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add() {
        let cli = Cli::parse_from([
            "jobtrack",
            "add",
            "--kind",
            "contact",
            "--payload",
            "{\"name\":\"Jo\"}",
        ]);
        match cli.command {
            Commands::Add { kind, id, .. } => {
                assert_eq!(kind, RecordKind::Contact);
                assert!(id.is_none());
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = default_config().unwrap();
        config.validate().unwrap();
        assert_eq!(config.tiers.len(), 2);
        assert_eq!(config.endpoints[0].address.as_str(), "http://localhost:3000/");
    }
}
