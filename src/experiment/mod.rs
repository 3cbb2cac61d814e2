//! Live experimentation
//!
//! Runs every pending (experimental query, arm) pair against a live PostgreSQL
//! session, one at a time. Rewards for completed executions are posted by the
//! Bao extension through the protocol server, so after each execution the
//! runner waits for a new experience row from its backend pid to appear and
//! links that row to the experiment. Timeouts and backend crashes are recorded
//! here directly as penalty rewards.

pub mod arms;
pub mod session;

use rand::seq::SliceRandom;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ExperimentError, SessionError};
use crate::storage::{ExperienceStore, PendingExperiment};
use crate::types::{Arm, BufferSnapshot, Plan};

pub use arms::{arm_hints, PLANNER_OPTIONS};
pub use session::{DatabaseSession, PgConnector, PgSession, SessionConnector};

/// Session settings that turn on Bao's EXPLAIN augmentation and reward
/// reporting without letting Bao pick plans
pub const SESSION_SETUP: [&str; 5] = [
    "SET bao_include_json_in_explain TO on",
    "SET enable_bao TO on",
    "SET enable_bao_selection TO off",
    "SET enable_bao_rewards TO on",
    "commit",
];

pub type Result<T> = std::result::Result<T, ExperimentError>;

/// Runner limits
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSettings {
    /// Cap on a single execution; penalties are twice this
    pub max_query_time: Duration,
    pub reward_poll_attempts: u32,
    pub reward_poll_interval: Duration,
}

impl ExperimentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_query_time: config.postgres.max_query_time(),
            reward_poll_attempts: config.experiments.reward_poll_attempts,
            reward_poll_interval: config.experiments.reward_poll_interval(),
        }
    }

    fn max_query_ms(&self) -> u64 {
        self.max_query_time.as_millis() as u64
    }

    /// Reward recorded for an execution that timed out or crashed, in ms
    pub fn penalty(&self) -> f64 {
        2.0 * self.max_query_ms() as f64
    }
}

/// What an exploration run did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExplorationSummary {
    /// Experiments linked to an experience
    pub completed: usize,
    /// Of those, how many were recorded as cap timeouts
    pub penalized: usize,
    /// The run stopped because the time budget ran out
    pub budget_exhausted: bool,
}

/// Backlog counters for operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExperimentStatus {
    pub unexecuted_experiments: usize,
    pub completed_experiments: usize,
    pub exploration_queries: usize,
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Unexecuted experiments : {}", self.unexecuted_experiments)?;
        writeln!(f, "Completed experiments  : {}", self.completed_experiments)?;
        write!(f, "Exploration queries    : {}", self.exploration_queries)
    }
}

/// How one execution ended
enum Execution {
    Completed,
    /// Hit the per-query cap; penalty recorded
    Penalized,
    /// Hit the run's remaining budget
    OutOfBudget,
}

pub struct ExperimentRunner<C: SessionConnector> {
    store: ExperienceStore,
    connector: C,
    settings: ExperimentSettings,
}

impl<C: SessionConnector> ExperimentRunner<C> {
    pub fn new(store: ExperienceStore, connector: C, settings: ExperimentSettings) -> Self {
        Self { store, connector, settings }
    }

    async fn connect(&self) -> Result<Box<dyn DatabaseSession>> {
        self.connector.connect().await.map_err(ExperimentError::Connection)
    }

    /// Check that a session can be opened and used
    pub async fn test_connection(&self) -> Result<()> {
        let mut session = self.connect().await?;
        session.query_scalar("SELECT 1").await.map_err(ExperimentError::Connection)?;
        info!("Connection to PostgreSQL successful");
        Ok(())
    }

    /// Register a SELECT query as a regression canary. The query is explained
    /// first so broken SQL never enters the catalog.
    pub async fn add_experimental_query(&self, sql: &str) -> Result<i64> {
        let sql = sql.trim();
        let is_select = sql.get(..6).is_some_and(|prefix| prefix.eq_ignore_ascii_case("select"));
        if !is_select {
            return Err(ExperimentError::InvalidQuery(
                "experimental queries must be SELECT statements".to_string(),
            ));
        }

        let mut session = self.connect().await?;
        session.execute(&format!("EXPLAIN {}", sql)).await
            .map_err(|e| ExperimentError::InvalidQuery(e.to_string()))?;

        let id = self.store.record_experimental_query(sql).await?;
        info!("Added experimental query {}", id);
        Ok(id)
    }

    pub async fn status(&self) -> Result<ExperimentStatus> {
        Ok(ExperimentStatus {
            unexecuted_experiments: self.store.unexecuted_experiments().await?.len(),
            completed_experiments: self.store.experiment_experience().await?.len(),
            exploration_queries: self.store.num_experimental_queries().await?,
        })
    }

    /// Execute pending experiments until none remain or `time_limit` is spent
    pub async fn explore(&self, time_limit: Duration) -> Result<ExplorationSummary> {
        let start = Instant::now();
        let mut summary = ExplorationSummary::default();

        let mut pending = self.store.unexecuted_experiments().await?;
        if pending.is_empty() {
            info!("All experiments have been executed");
            return Ok(summary);
        }
        info!("{} unexecuted experiment(s)", pending.len());
        pending.shuffle(&mut rand::rng());

        let mut session = self.connect().await?;
        let pid = backend_pid(session.as_mut()).await?;
        info!("Running on backend pid {}", pid);

        for statement in SESSION_SETUP {
            session.execute(statement).await?;
        }

        let max_ms = self.settings.max_query_ms();

        for experiment in pending {
            let prev_id = self.store.last_reward_id_for_pid(pid).await?;

            let remaining_ms = time_limit.saturating_sub(start.elapsed()).as_millis() as u64;
            debug!("Time remaining: {}ms", remaining_ms);
            // statement_timeout = 0 would disable the timeout entirely
            if remaining_ms == 0 {
                summary.budget_exhausted = true;
                break;
            }

            let budget_driven = remaining_ms < max_ms;
            let statement_timeout = remaining_ms.min(max_ms);

            match self.run_one(session.as_mut(), &experiment, pid, statement_timeout, budget_driven).await? {
                Execution::OutOfBudget => {
                    info!("Hit experimental timeout, stopping");
                    summary.budget_exhausted = true;
                    break;
                }
                Execution::Penalized => summary.penalized += 1,
                Execution::Completed => {}
            }

            let experience_id = self.await_reward(pid, prev_id).await?;
            self.store.record_experiment(experiment.experimental_id, experience_id, experiment.arm).await?;
            summary.completed += 1;
        }

        info!("Finished experiments: {} completed, {} timed out", summary.completed, summary.penalized);
        Ok(summary)
    }

    async fn run_one(
        &self,
        session: &mut dyn DatabaseSession,
        experiment: &PendingExperiment,
        pid: i64,
        statement_timeout: u64,
        budget_driven: bool,
    ) -> Result<Execution> {
        info!("Experimental query {} with {} (timeout {}ms)",
            experiment.experimental_id, experiment.arm, statement_timeout);

        session.execute(&format!("SET statement_timeout TO {}", statement_timeout)).await?;
        for hint in arm_hints(experiment.arm) {
            session.execute(&hint).await?;
        }

        // captured up front so a penalty can be recorded if execution never finishes
        let explain = session.query_scalar(&format!("EXPLAIN (FORMAT JSON) {}", experiment.query)).await?
            .ok_or_else(|| ExperimentError::MissingBaoExplain("empty EXPLAIN output".to_string()))?;
        let plan = parse_bao_explain(&explain)?;

        match session.execute(&experiment.query).await {
            Ok(()) => Ok(Execution::Completed),
            Err(SessionError::Canceled(_)) if budget_driven => Ok(Execution::OutOfBudget),
            Err(SessionError::Canceled(reason)) => {
                info!("Query hit timeout ({}), recording {}ms as the reward", reason, self.settings.penalty());
                self.store.record_reward(&plan, self.settings.penalty(), pid).await?;
                session.execute("rollback").await?;
                Ok(Execution::Penalized)
            }
            Err(source @ SessionError::Connection(_)) => {
                warn!("Server down after experiment with {}", experiment.arm);
                if experiment.arm != Arm::NATIVE {
                    warn!("Treating this as a timeout and ceasing further experiments");
                    self.store.record_reward(&plan, self.settings.penalty(), pid).await?;
                }
                Err(ExperimentError::BackendCrash { arm: experiment.arm, source })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for an experience row newer than `prev_id` from this backend.
    /// Reads the store at most `reward_poll_attempts` times, sleeping between reads.
    async fn await_reward(&self, pid: i64, prev_id: Option<i64>) -> Result<i64> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            if let Some(id) = self.store.last_reward_id_for_pid(pid).await? {
                if Some(id) != prev_id {
                    return Ok(id);
                }
            }

            if attempts >= self.settings.reward_poll_attempts {
                return Err(ExperimentError::RewardMissing { attempts });
            }
            tokio::time::sleep(self.settings.reward_poll_interval).await;
        }
    }
}

async fn backend_pid(session: &mut dyn DatabaseSession) -> Result<i64> {
    session.query_scalar("SELECT pg_backend_pid()").await?
        .and_then(|pid| pid.trim().parse().ok())
        .ok_or_else(|| SessionError::Query("pg_backend_pid() returned no usable value".to_string()).into())
}

/// Extract the plan (with its buffer snapshot attached) that the Bao extension
/// embeds in `EXPLAIN (FORMAT JSON)` output
pub fn parse_bao_explain(explain: &str) -> Result<Plan> {
    let missing = |reason: &str| ExperimentError::MissingBaoExplain(reason.to_string());

    let document: Value = serde_json::from_str(explain).map_err(|e| missing(&e.to_string()))?;
    let entries = match document {
        Value::Array(entries) => entries,
        other => vec![other],
    };

    let bao = entries.iter()
        .find_map(|entry| entry.get("Bao"))
        .ok_or_else(|| missing("no Bao entry"))?;

    let plan_json = bao.get("Bao plan JSON").and_then(Value::as_str)
        .ok_or_else(|| missing("no Bao plan JSON"))?;
    let buffer_json = bao.get("Bao buffer JSON").and_then(Value::as_str)
        .ok_or_else(|| missing("no Bao buffer JSON"))?;

    let plan = Plan::from_json_str(plan_json).map_err(|e| missing(&e.to_string()))?;
    let buffers: BufferSnapshot = serde_json::from_str(buffer_json).map_err(|e| missing(&e.to_string()))?;

    Ok(plan.with_buffers(&buffers))
}
