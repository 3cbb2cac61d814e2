//! Bao Server Library
//!
//! The serving and safety-control plane of the Bao learned query optimizer:
//! - Protocol server answering plan-selection, prediction and reward traffic
//! - SQLite experience store with experimental query catalog
//! - Live experiment runner executing canary queries under fixed planner arms
//! - Regression gate deciding whether a retrained model may be served
//!
//! # Example
//!
//! ```ignore
//! use bao_server::{Config, ExperienceStore, ProtocolServer, ServerState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let store = ExperienceStore::open(&config.storage.database_path).await?;
//!     let server = ProtocolServer::bind(&config.server.address(), ServerState::new(store)).await?;
//!     server.run().await
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod error;
pub mod config;
pub mod storage;
pub mod model;
pub mod regression;
pub mod serving;
pub mod experiment;
pub mod server;
pub mod client;
pub mod cli;

// Re-export commonly used types for convenience
pub use types::{Arm, BufferSnapshot, Plan, PlanNode, RewardObservation};

pub use config::Config;

pub use storage::{ExperienceStore, ExperimentGroup, ExperimentResult, PendingExperiment};

pub use model::{PlanRegressor, Predictor, Trainer};

pub use regression::{compute_regressions, RegressionGate, RegressionProfile};

pub use serving::{BaoModel, LoadOutcome};

pub use experiment::{ExperimentRunner, ExperimentSettings, ExplorationSummary};

pub use server::{
    ProtocolServer,
    ServerState,
    start as start_server,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Bao learned optimizer server", NAME, VERSION)
}
