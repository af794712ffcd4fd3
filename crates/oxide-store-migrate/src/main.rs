//! oxide-store-migrate CLI
//!
//! Command-line tool for inspecting a database schema and migrating it to
//! an expected schema.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use oxide_store_core::{DatabaseSchema, RenameDirectives, SchemaDifference};
use oxide_store_migrate::prelude::*;
use oxide_store_migrate::version;

/// Schema-diff driven migrations for oxide-store databases.
#[derive(Parser)]
#[command(name = "oxide-store-migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (SQLite path or connection string).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:db.sqlite3")]
    database: String,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the expected schema and rename directives come from.
#[derive(clap::Args)]
struct Target {
    /// JSON file holding the expected `DatabaseSchema`.
    #[arg(short, long)]
    expected: PathBuf,

    /// JSON file holding `RenameDirectives`.
    #[arg(short, long)]
    renames: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the existing schema as JSON.
    Inspect,

    /// Show the differences between the database and the expected schema.
    Diff {
        #[command(flatten)]
        target: Target,
    },

    /// Show the SQL a migration would run, without executing it.
    Plan {
        #[command(flatten)]
        target: Target,
    },

    /// Apply an automatic migration and record a version tag.
    Migrate {
        #[command(flatten)]
        target: Target,

        /// Version tag to record.
        #[arg(long)]
        version: String,
    },

    /// List recorded version tags.
    Versions,
}

#[derive(Serialize)]
struct DiffEntry<'a> {
    auto: bool,
    difference: &'a SchemaDifference,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn load(target: &Target) -> Result<(DatabaseSchema, RenameDirectives)> {
    let schema: DatabaseSchema = read_json(&target.expected)?;
    let renames = match &target.renames {
        Some(path) => read_json(path)?,
        None => RenameDirectives::default(),
    };
    Ok((schema, renames))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut backend = SqliteBackend::connect(&cli.database).await?;

    match cli.command {
        Commands::Inspect => {
            let schema = DatabaseSchema {
                tables: backend.existing_tables().await?,
            };
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }

        Commands::Diff { target } => {
            let (schema, renames) = load(&target)?;
            let differences = pending_differences(&mut backend, &schema.tables, &renames).await?;
            let entries: Vec<DiffEntry<'_>> = differences
                .iter()
                .map(|difference| DiffEntry {
                    auto: is_auto_migratable(difference),
                    difference,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }

        Commands::Plan { target } => {
            let (schema, renames) = load(&target)?;
            let differences = pending_differences(&mut backend, &schema.tables, &renames).await?;
            let actions = plan(differences, &MigrationPolicy::new().renames(renames))?;
            let report = MigrationExecutor::new(&mut backend)
                .dry_run(true)
                .execute(&actions, None)
                .await?;
            if report.statements.is_empty() {
                info!("Schema is up to date.");
            }
            for sql in report.statements {
                println!("{sql};");
            }
        }

        Commands::Migrate { target, version } => {
            let (schema, renames) = load(&target)?;
            let policy = MigrationPolicy::new().renames(renames);
            let report = migrate(&mut backend, &schema.tables, &policy, Some(&version)).await?;
            if report.is_empty() {
                info!(version = %version, "Schema was already up to date.");
            } else {
                info!(
                    version = %version,
                    tables = %report.tables.join(", "),
                    "Migration applied."
                );
            }
        }

        Commands::Versions => {
            for tag in version::recorded(&mut backend).await? {
                println!("{tag}");
            }
        }
    }

    backend.close().await;
    Ok(())
}
