/*!
 * Tollgate CLI - Command Line Interface
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tollgate::{
    config::TollgateConfig,
    error::{TollgateError, EXIT_FATAL, EXIT_SUCCESS},
    logging, EngagementEvent, ListQuery, ResilientClient,
};

/// Config file read when `--config` is not given
const DEFAULT_CONFIG_PATH: &str = "tollgate.toml";

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(version, about = "Resilient client for quota-limited, throttling upstream services", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print breaker, quota and degradation state as JSON
    Status,

    /// List records from a table
    List {
        table: String,

        /// Server-side filter expression
        #[arg(long)]
        filter: Option<String>,

        /// Sort field (can be specified multiple times)
        #[arg(long = "sort")]
        sort: Vec<String>,

        /// Field to return (can be specified multiple times)
        #[arg(long = "field")]
        fields: Vec<String>,

        /// Maximum number of records
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Fetch a single record
    Get { table: String, id: String },

    /// Push an engagement event (best effort)
    Engage {
        /// Event kind, e.g. "view"
        kind: String,

        /// Record the event refers to
        #[arg(long)]
        record: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<TollgateError>()
                .map_or(EXIT_FATAL, TollgateError::exit_code)
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Init { force } => {
            let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
            init_config(path, force)?;
        }
        Commands::Status => {
            let client = connect(config_path, cli.verbose)?;
            print_json(&client.health().await)?;
        }
        Commands::List {
            table,
            filter,
            sort,
            fields,
            limit,
        } => {
            let client = connect(config_path, cli.verbose)?;
            let query = ListQuery {
                filter,
                sort,
                fields,
                limit,
            };
            let records = client
                .list_records(&table, &query)
                .await
                .map_err(TollgateError::from)?;
            print_json(&records)?;
        }
        Commands::Get { table, id } => {
            let client = connect(config_path, cli.verbose)?;
            let record = client
                .get_record(&table, &id)
                .await
                .map_err(TollgateError::from)?;
            print_json(&record)?;
        }
        Commands::Engage { kind, record } => {
            let client = connect(config_path, cli.verbose)?;
            let mut event = EngagementEvent::new(kind);
            event.record_id = record;
            client.record_engagement(&event).await;
        }
    }

    Ok(())
}

/// Load configuration, start logging and build the client
fn connect(config_path: Option<&Path>, verbose: bool) -> anyhow::Result<ResilientClient> {
    let mut config = load_config(config_path)?;
    config.apply_env_overrides();
    config.logging.verbose |= verbose;

    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    ResilientClient::from_config(&config).context("Failed to build client")
}

/// Explicit paths must exist; the default path is optional
fn load_config(explicit: Option<&Path>) -> anyhow::Result<TollgateConfig> {
    match explicit {
        Some(path) => TollgateConfig::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display())),
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                TollgateConfig::from_file(default_path).with_context(|| {
                    format!("Failed to load config file {}", default_path.display())
                })
            } else {
                Ok(TollgateConfig::default())
            }
        }
    }
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        return Err(TollgateError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ))
        .into());
    }

    TollgateConfig::default()
        .to_file(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(TollgateError::from)?;
    println!("{json}");
    Ok(())
}
