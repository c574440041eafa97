use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kpi_fulfillment::{
    catalog::{BulkLoad, Catalog},
    config::{Config, LogFormat},
    evaluation::Evaluator,
    model::KpiDefinition,
    server::{AppState, Monitor},
    storage::{DefinitionStorage, SqliteStorage},
    stream::UpdateBatch,
};

#[derive(Debug, Parser)]
#[command(name = "kpi-fulfillment", version, about = "KPI fulfillment monitoring for IoT device fleets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a bulk snapshot and apply update batches read from stdin
    Monitor {
        /// Bulk load file; defaults to BULK_LOAD_PATH
        #[arg(long)]
        bulk: Option<PathBuf>,
        /// Ignore definitions kept in the database
        #[arg(long)]
        no_stored: bool,
    },
    /// Check KPI definitions without storing them
    Validate {
        /// JSON file holding one definition or an array of definitions
        path: PathBuf,
    },
    /// Evaluate every definition against the instances' parameter snapshots
    Evaluate {
        /// Bulk load file
        #[arg(long)]
        bulk: PathBuf,
    },
    /// Print instance, group and fleet statistics of a bulk load
    Stats {
        /// Bulk load file
        #[arg(long)]
        bulk: PathBuf,
        /// Only report this group
        #[arg(long)]
        group: Option<u32>,
    },
    /// Manage stored KPI definitions
    Definitions {
        #[command(subcommand)]
        action: DefinitionsAction,
    },
}

#[derive(Debug, Subcommand)]
enum DefinitionsAction {
    /// Validate and store definitions from a JSON file
    Import { path: PathBuf },
    /// List stored definitions
    List,
    /// Print one stored definition
    Show { id: u32 },
    /// Delete one stored definition
    Delete { id: u32 },
}

/// One definition or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DefinitionDocument {
    Many(Vec<KpiDefinition>),
    One(Box<KpiDefinition>),
}

impl DefinitionDocument {
    fn into_vec(self) -> Vec<KpiDefinition> {
        match self {
            Self::Many(definitions) => definitions,
            Self::One(definition) => vec![*definition],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationOutcome {
    user_identifier: String,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "KPI fulfillment starting");

    let result = match cli.command {
        Command::Monitor { bulk, no_stored } => monitor(config, bulk, no_stored).await,
        Command::Validate { path } => validate(&path).await,
        Command::Evaluate { bulk } => evaluate(&bulk).await,
        Command::Stats { bulk, group } => stats(config, &bulk, group).await,
        Command::Definitions { action } => definitions(&config, action).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

async fn monitor(config: Config, bulk: Option<PathBuf>, no_stored: bool) -> anyhow::Result<()> {
    let path = bulk
        .or_else(|| config.bulk_load.path.clone())
        .context("no bulk load given; pass --bulk or set BULK_LOAD_PATH")?;
    let mut bulk = BulkLoad::from_path(&path).await?;

    if !no_stored {
        let storage = open_storage(&config).await?;
        let stored = storage.load_definitions().await?;
        let merged = bulk.merge_definitions(stored);
        info!(merged, "Stored KPI definitions merged");
    }

    let state = Arc::new(AppState::new(config, &bulk));
    Monitor::new(Arc::clone(&state)).run_stdin().await?;

    print_json(&state.fleet_report())?;
    info!("Monitor shutdown complete");
    Ok(())
}

async fn validate(path: &Path) -> anyhow::Result<()> {
    let definitions = read_definitions(path).await?;

    let outcomes: Vec<ValidationOutcome> = definitions
        .iter()
        .map(|definition| match definition.prepared_for_submission() {
            Ok(prepared) => ValidationOutcome {
                user_identifier: definition.user_identifier.clone(),
                valid: true,
                node_count: Some(prepared.nodes.len()),
                error: None,
            },
            Err(e) => ValidationOutcome {
                user_identifier: definition.user_identifier.clone(),
                valid: false,
                node_count: None,
                error: Some(e.to_string()),
            },
        })
        .collect();
    print_json(&outcomes)?;

    let invalid = outcomes.iter().filter(|o| !o.valid).count();
    if invalid > 0 {
        bail!("{} of {} definition(s) invalid", invalid, outcomes.len());
    }
    Ok(())
}

async fn evaluate(bulk: &Path) -> anyhow::Result<()> {
    let bulk = BulkLoad::from_path(bulk).await?;
    let catalog = Catalog::from_bulk(&bulk);
    let results = Evaluator::new(&catalog).evaluate_fleet();
    info!(results = results.len(), "Fleet evaluated");

    // A single line, so the output can be piped straight into `monitor`.
    let line = serde_json::to_string(&UpdateBatch::new(results))?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    Ok(())
}

async fn stats(config: Config, bulk: &Path, group: Option<u32>) -> anyhow::Result<()> {
    let bulk = BulkLoad::from_path(bulk).await?;
    let state = AppState::new(config, &bulk);
    match group {
        Some(id) => {
            let report = state
                .group_report(id)
                .with_context(|| format!("unknown group {}", id))?;
            print_json(&report)
        }
        None => print_json(&state.fleet_report()),
    }
}

async fn definitions(config: &Config, action: DefinitionsAction) -> anyhow::Result<()> {
    let storage = open_storage(config).await?;
    match action {
        DefinitionsAction::Import { path } => {
            let prepared = read_definitions(&path)
                .await?
                .iter()
                .map(|d| {
                    d.prepared_for_submission()
                        .with_context(|| format!("definition '{}' rejected", d.user_identifier))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let mut imported = Vec::with_capacity(prepared.len());
            for definition in &prepared {
                let id = storage.create_definition(definition).await?;
                info!(id, definition = %definition.user_identifier, "KPI definition stored");
                imported.push(KpiDefinition {
                    id: Some(id),
                    ..definition.clone()
                });
            }
            print_json(&imported)
        }
        DefinitionsAction::List => print_json(&storage.list_definitions().await?),
        DefinitionsAction::Show { id } => {
            let definition = storage
                .get_definition(id)
                .await?
                .with_context(|| format!("KPI definition {} not found", id))?;
            print_json(&definition)
        }
        DefinitionsAction::Delete { id } => {
            storage.delete_definition(id).await?;
            info!(id, "KPI definition deleted");
            Ok(())
        }
    }
}

async fn open_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            Ok(s)
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            Err(e.into())
        }
    }
}

async fn read_definitions(path: &Path) -> anyhow::Result<Vec<KpiDefinition>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let document: DefinitionDocument = serde_json::from_str(&json)
        .with_context(|| format!("{} is not a KPI definition document", path.display()))?;
    Ok(document.into_vec())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
