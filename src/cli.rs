//! CLI interface for bao-server

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::client;
use crate::config::{self, Config, DEFAULT_CONFIG_FILE};
use crate::error::{ExperimentError, StoreError};
use crate::experiment::{ExperimentRunner, ExperimentSettings, PgConnector};
use crate::model::{PlanRegressor, SwapOutcome, Trainer};
use crate::regression::RegressionGate;
use crate::storage::ExperienceStore;

#[derive(Parser)]
#[command(name = "bao-server")]
#[command(about = "Serving and safety-control plane for the Bao learned query optimizer", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "BAO_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the protocol server
    Serve,
    /// Check a saved model and ask the running server to load it
    Load {
        path: PathBuf,
    },
    /// Train a model from collected experience and save it
    Train {
        path: PathBuf,
    },
    /// Retrain, swap in the new model if it passes the regression gate, and
    /// tell the running server to load it
    Retrain,
    /// Test the connection to PostgreSQL
    TestConnection,
    /// Add the SQL query in the file at PATH to the experimental query list
    AddTestQuery {
        path: PathBuf,
    },
    /// Print experiment backlog information
    Status,
    /// Run experiments on the experimental queries for up to SECONDS seconds
    Experiment {
        seconds: u64,
    },
    /// Show the effective configuration
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    run_command(cli.command, &config, &cli.config).await
}

async fn open_store(config: &Config) -> Result<ExperienceStore> {
    ExperienceStore::open(&config.storage.database_path)
        .await
        .with_context(|| format!("Failed to open experience store {}", config.storage.database_path.display()))
}

fn experiment_runner(store: ExperienceStore, config: &Config) -> ExperimentRunner<PgConnector> {
    ExperimentRunner::new(
        store,
        PgConnector::new(config.postgres.connect_string.clone()),
        ExperimentSettings::from_config(config),
    )
}

async fn run_command(command: Commands, config: &Config, config_path: &Path) -> Result<()> {
    match command {
        Commands::Serve => crate::server::start(config).await?,
        Commands::Load { path } => load(&path, config).await?,
        Commands::Train { path } => {
            println!("Training Bao model from collected experience");
            let trainer = Trainer::new(open_store(config).await?, config.training.clone());
            trainer.train_and_save_model(&path, 0).await?;
            println!("Model saved to {}", path.display());
        }
        Commands::Retrain => retrain(config).await?,
        Commands::TestConnection => {
            let runner = experiment_runner(open_store(config).await?, config);
            match runner.test_connection().await {
                Ok(()) => println!("Connection successful!"),
                Err(e) => anyhow::bail!("Could not connect to PostgreSQL: {}", e),
            }
        }
        Commands::AddTestQuery { path } => add_test_query(&path, config).await?,
        Commands::Status => {
            let runner = experiment_runner(open_store(config).await?, config);
            println!("{}", runner.status().await?);
        }
        Commands::Experiment { seconds } => {
            let runner = experiment_runner(open_store(config).await?, config);
            let summary = runner.explore(Duration::from_secs(seconds)).await?;
            println!("Completed {} experiment(s), {} timed out{}",
                summary.completed,
                summary.penalized,
                if summary.budget_exhausted { ", time budget exhausted" } else { "" });
        }
        Commands::Config => config::show_config(config_path)?,
    }

    Ok(())
}

async fn load(path: &Path, config: &Config) -> Result<()> {
    println!("Attempting to load the Bao model...");
    PlanRegressor::load(path)
        .with_context(|| format!("{} is not a saved Bao model", path.display()))?;

    println!("Model loaded. Sending message to Bao server...");
    client::send_model_load(&config.server.address(), path).await?;
    println!("Message sent to server.");
    Ok(())
}

async fn retrain(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let trainer = Trainer::new(store.clone(), config.training.clone());
    let gate = RegressionGate::new(store);

    match trainer.train_and_swap(&config.models, &gate).await? {
        SwapOutcome::Promoted { retries } => {
            info!("Retrained model promoted after {} retries", retries);
            client::send_model_load(&config.server.address(), &config.models.default_path).await?;
            println!("New model saved to {} and sent to the Bao server", config.models.default_path.display());
        }
        SwapOutcome::Rejected { retries } => {
            println!("No retrained model passed the regression gate after {} retries; keeping {}",
                retries, config.models.default_path.display());
        }
    }
    Ok(())
}

async fn add_test_query(path: &Path, config: &Config) -> Result<()> {
    let sql = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let runner = experiment_runner(open_store(config).await?, config);
    match runner.add_experimental_query(&sql).await {
        Ok(id) => println!("Added experimental query {}", id),
        Err(ExperimentError::Store(StoreError::DuplicateQuery)) => {
            println!("Query in {} was already added", path.display());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
