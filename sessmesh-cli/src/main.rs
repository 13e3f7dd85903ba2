//! `sessmesh`: inspect a SQLite session store and run local replication
//! simulations.
//!
//! Usage:
//!   sessmesh list
//!   sessmesh show 01J9Z3K4T0F6M6N8R2B7C5D1QX
//!   sessmesh --db /tmp/sessions.db purge-expired
//!   sessmesh simulate --nodes 4 --sessions 20 --writes 200 --deferred

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sessmesh_core::replica::meta;
use sessmesh_core::{AttrValue, KeyValueBackend, ManagerConfig, SqliteBackend};
use tracing_subscriber::EnvFilter;

mod simulate;

#[derive(Parser, Debug)]
#[command(name = "sessmesh", about = "Replicated session store tools")]
struct Cli {
    /// SQLite store file
    #[arg(long, env = "SESSMESH_DB")]
    db: Option<PathBuf>,

    /// TOML file with manager settings
    #[arg(long, env = "SESSMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Key prefix (overrides the config file)
    #[arg(long, env = "SESSMESH_KEY_PREFIX")]
    key_prefix: Option<String>,

    /// Scope name (overrides the config file)
    #[arg(long, env = "SESSMESH_SCOPE")]
    scope: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List live sessions in the store
    List,
    /// Print one session's metadata and attributes
    Show { id: String },
    /// Delete one session
    Delete { id: String },
    /// Drop every collection whose expiry has passed
    PurgeExpired,
    /// Run several in-process nodes against one store and check they converge
    Simulate(simulate::Args),
}

fn init_tracing() -> Result<()> {
    // JSON logs with SESSMESH_LOG_JSON=1, human-readable otherwise
    let json_logs = std::env::var("SESSMESH_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("sessmesh=info".parse()?)
        .add_directive("sessmesh_core=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sessmesh")
        .join("sessions.db")
}

fn open_store(path: &Path) -> Result<SqliteBackend> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    SqliteBackend::open(path).with_context(|| format!("opening store {}", path.display()))
}

fn format_millis(value: Option<&AttrValue>) -> String {
    value
        .and_then(AttrValue::as_i64)
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl Cli {
    fn manager_config(&self) -> Result<ManagerConfig> {
        let mut config = match &self.config {
            Some(path) => ManagerConfig::from_toml_file(path)?,
            None => ManagerConfig::default(),
        };
        if let Some(prefix) = &self.key_prefix {
            config.key_prefix = prefix.clone();
        }
        if let Some(scope) = &self.scope {
            config.scope = scope.clone();
        }
        Ok(config)
    }

    fn db_path(&self) -> PathBuf {
        self.db.clone().unwrap_or_else(default_db_path)
    }
}

async fn list(store: &SqliteBackend, config: &ManagerConfig) -> Result<()> {
    let prefix = config.collection_name("");
    let collections = store.collections(&prefix).await?;
    if collections.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    println!("{:<28} {:>6}  {}", "SESSION", "ATTRS", "LAST ACCESS");
    for collection in collections {
        let id = collection.strip_prefix(&prefix).unwrap_or(&collection);
        let entries = store.read_all(&collection).await?;
        let attrs = entries.keys().filter(|k| !meta::is_reserved(k)).count();
        println!(
            "{id:<28} {attrs:>6}  {}",
            format_millis(entries.get(meta::LAST_ACCESSED_TIME))
        );
    }
    Ok(())
}

async fn show(store: &SqliteBackend, config: &ManagerConfig, id: &str) -> Result<()> {
    let entries = store.read_all(&config.collection_name(id)).await?;
    if entries.is_empty() {
        anyhow::bail!("no session {id}");
    }
    println!("Session {id}");
    if let Some(issued) = sessmesh_core::ids::ulid_timestamp_ms(id) {
        let issued = i64::try_from(issued).ok().map(AttrValue::from);
        println!("  id issued:     {}", format_millis(issued.as_ref()));
    }
    println!("  created:       {}", format_millis(entries.get(meta::CREATION_TIME)));
    println!("  last access:   {}", format_millis(entries.get(meta::LAST_ACCESSED_TIME)));
    let max_inactive = entries
        .get(meta::MAX_INACTIVE_INTERVAL)
        .and_then(AttrValue::as_i64)
        .map_or_else(|| "-".to_string(), |s| if s > 0 { format!("{s}s") } else { "never".to_string() });
    println!("  max inactive:  {max_inactive}");
    let valid = entries.get(meta::IS_VALID).and_then(AttrValue::as_bool).unwrap_or(false);
    println!("  valid:         {valid}");

    let mut names: Vec<&String> = entries.keys().filter(|k| !meta::is_reserved(k)).collect();
    names.sort();
    println!("  attributes:    {}", names.len());
    for name in names {
        println!("    {name} = {}", serde_json::to_string(&entries[name])?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = cli.manager_config()?;

    match &cli.command {
        Command::List => list(&open_store(&cli.db_path())?, &config).await,
        Command::Show { id } => show(&open_store(&cli.db_path())?, &config, id).await,
        Command::Delete { id } => {
            let store = open_store(&cli.db_path())?;
            if store.delete(&config.collection_name(id)).await? {
                println!("Deleted {id}");
            } else {
                println!("No session {id}");
            }
            Ok(())
        }
        Command::PurgeExpired => {
            let store = open_store(&cli.db_path())?;
            let n = store.purge_expired().await?;
            println!("Purged {n} expired session(s)");
            Ok(())
        }
        Command::Simulate(args) => {
            let backend: Arc<dyn KeyValueBackend> = match &cli.db {
                Some(path) => Arc::new(open_store(path)?),
                None => Arc::new(sessmesh_core::MemoryBackend::new()),
            };
            simulate::run(args, config, backend).await
        }
    }
}
