mod config;
mod serve;
mod status_cmd;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use conductor_core::decompose::llm::{HttpLlmClient, LlmClient, LlmConfig};
use conductor_core::orchestrator::Orchestrator;
use conductor_db::pool;

use config::ConductorConfig;

#[derive(Parser)]
#[command(name = "conductor", about = "Distributed orchestrator for fleets of AI-tool workers")]
struct Cli {
    /// Database URL (overrides CONDUCTOR_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a conductor config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/conductor")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the conductor database (create + migrate)
    DbInit,
    /// Run the orchestration server: control API, worker channel, events
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Listen port
        #[arg(long, default_value_t = 8700)]
        port: u16,
    },
    /// Show task status (omit task_id to list all tasks)
    Status {
        /// Task ID to show (omit to list all)
        task_id: Option<String>,
    },
    /// Approve a pending checkpoint
    Approve {
        /// Checkpoint ID
        checkpoint_id: String,
        /// Decision notes
        #[arg(long)]
        notes: Option<String>,
    },
    /// Reject a pending checkpoint (fails the task)
    Reject {
        /// Checkpoint ID
        checkpoint_id: String,
        /// Decision notes
        #[arg(long)]
        notes: Option<String>,
    },
}

/// Execute the `conductor init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        core: Default::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `conductor db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `conductor db-init` command: create database and run
/// migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = ConductorConfig::resolve(cli_db_url)?;

    println!("Initializing conductor database...");

    let db_pool = pool::prepare_database(&resolved.db_config).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("conductor db-init complete.");
    Ok(())
}

/// Build the LLM client for decomposition when an API key is available;
/// without one the decomposer uses its rule-based fallbacks.
fn build_llm() -> Option<Arc<dyn LlmClient>> {
    let llm_config = LlmConfig::default();
    match HttpLlmClient::from_config(&llm_config) {
        Ok(client) => Some(Arc::new(client)),
        Err(_) => {
            tracing::warn!(
                "no LLM credentials found; decomposition will use template fallbacks"
            );
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved = ConductorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            pool::run_migrations(&db_pool)
                .await
                .context("run `conductor db-init` first")?;

            let orchestrator =
                Orchestrator::new(db_pool.clone(), resolved.core_config, build_llm())
                    .map_err(|e| anyhow::anyhow!("failed to build orchestrator: {e}"))?;
            let state = serve::AppState {
                orchestrator,
                pool: db_pool.clone(),
            };
            let result = serve::run_serve(state, &bind, port).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { task_id } => {
            let resolved = ConductorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, task_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Approve {
            checkpoint_id,
            notes,
        } => {
            let resolved = ConductorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let id = uuid::Uuid::parse_str(&checkpoint_id)
                .with_context(|| format!("invalid checkpoint ID: {checkpoint_id}"))?;
            let orchestrator = Orchestrator::new(db_pool.clone(), resolved.core_config, None)
                .map_err(|e| anyhow::anyhow!("failed to build orchestrator: {e}"))?;
            let result = orchestrator.approve_checkpoint(id, notes.as_deref()).await;
            db_pool.close().await;
            result.map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("Checkpoint {checkpoint_id} approved.");
        }
        Commands::Reject {
            checkpoint_id,
            notes,
        } => {
            let resolved = ConductorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let id = uuid::Uuid::parse_str(&checkpoint_id)
                .with_context(|| format!("invalid checkpoint ID: {checkpoint_id}"))?;
            let orchestrator = Orchestrator::new(db_pool.clone(), resolved.core_config, None)
                .map_err(|e| anyhow::anyhow!("failed to build orchestrator: {e}"))?;
            let result = orchestrator.reject_checkpoint(id, notes.as_deref()).await;
            db_pool.close().await;
            result.map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("Checkpoint {checkpoint_id} rejected.");
        }
    }

    Ok(())
}
