//! Experience store
//!
//! SQLite-backed log of (plan, reward) observations plus the catalog of curated
//! experimental queries and the links recording which experience came from
//! which (query, arm) experiment. Every method is a single statement or a
//! single read, so each call is individually atomic; nothing is cached, and the
//! pending experiment backlog is always recomputed from the tables.

use rusqlite::{ffi, params, Connection, OptionalExtension};
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::types::{Arm, Plan};

pub type Result<T> = std::result::Result<T, StoreError>;

/// An (experimental query, arm) pair that has no linked experience yet
#[derive(Debug, Clone, PartialEq)]
pub struct PendingExperiment {
    pub experimental_id: i64,
    pub query: String,
    pub arm: Arm,
}

/// One executed arm of an experimental query
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentResult {
    pub reward: f64,
    pub plan: Plan,
    pub arm: Arm,
}

/// All executed arms of one experimental query, ordered by arm
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentGroup {
    pub experimental_id: i64,
    pub results: Vec<ExperimentResult>,
}

/// Handle to the experience database. Cheap to clone.
#[derive(Clone)]
pub struct ExperienceStore {
    conn: Arc<Mutex<Connection>>,
}

impl ExperienceStore {
    /// Open (or create) the store at the given path
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;
        Self::migrate_experience_ids(&conn)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        debug!("Opened experience store at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS experience (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pg_pid INTEGER,
                plan TEXT,
                reward REAL
            );

            CREATE TABLE IF NOT EXISTS experimental_query (
                id INTEGER PRIMARY KEY,
                query TEXT UNIQUE
            );

            CREATE TABLE IF NOT EXISTS experience_for_experimental (
                experience_id INTEGER,
                experimental_id INTEGER,
                arm_idx INTEGER CHECK (arm_idx BETWEEN 0 AND 4),
                FOREIGN KEY (experience_id) REFERENCES experience(id) ON DELETE CASCADE,
                FOREIGN KEY (experimental_id) REFERENCES experimental_query(id),
                PRIMARY KEY (experience_id, experimental_id, arm_idx)
            );

            CREATE INDEX IF NOT EXISTS idx_experience_pid ON experience(pg_pid, id);
        "#)?;

        Ok(())
    }

    /// Databases created without AUTOINCREMENT on `experience` hand out
    /// freed ids again after a clear. Rebuild the table so they never do.
    /// Must run while foreign key enforcement is off.
    fn migrate_experience_ids(conn: &Connection) -> Result<()> {
        let ddl: String = conn.query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'experience'",
            [],
            |row| row.get(0),
        )?;
        if ddl.to_ascii_uppercase().contains("AUTOINCREMENT") {
            return Ok(());
        }

        warn!("experience table hands out reusable ids, rebuilding it with AUTOINCREMENT");
        conn.execute_batch(r#"
            BEGIN;
            CREATE TABLE experience_autoincrement (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pg_pid INTEGER,
                plan TEXT,
                reward REAL
            );
            INSERT INTO experience_autoincrement (id, pg_pid, plan, reward)
                SELECT id, pg_pid, plan, reward FROM experience;
            DROP TABLE experience;
            ALTER TABLE experience_autoincrement RENAME TO experience;
            CREATE INDEX IF NOT EXISTS idx_experience_pid ON experience(pg_pid, id);
            COMMIT;
        "#)?;

        Ok(())
    }

    /// Append one observation. The id is not returned; callers that need it
    /// look it up later through [`last_reward_id_for_pid`](Self::last_reward_id_for_pid).
    pub async fn record_reward(&self, plan: &Plan, reward: f64, pid: i64) -> Result<()> {
        let plan_json = plan.to_json_string()?;
        let conn = self.conn.lock().await;

        conn.execute(
            "INSERT INTO experience (plan, reward, pg_pid) VALUES (?1, ?2, ?3)",
            params![plan_json, reward, pid],
        )?;

        info!("Logged reward of {} for pid {}", reward, pid);
        Ok(())
    }

    /// Most recent experience id reported by the given backend
    pub async fn last_reward_id_for_pid(&self, pid: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;

        let id = conn.query_row(
            "SELECT id FROM experience WHERE pg_pid = ?1 ORDER BY id DESC LIMIT 1",
            params![pid],
            |row| row.get(0),
        ).optional()?;

        Ok(id)
    }

    /// Every (plan, reward) pair in the log
    pub async fn experience(&self) -> Result<Vec<(Plan, f64)>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare_cached("SELECT id, plan, reward FROM experience ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
        })?;

        let mut experience = Vec::new();
        for row in rows {
            let (id, plan_json, reward) = row?;
            experience.push((decode_plan(id, &plan_json)?, reward));
        }

        Ok(experience)
    }

    pub async fn experience_size(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT count(*) FROM experience", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Erase the whole experience log. Experiment links go with their
    /// experience rows, so those experiments become pending again.
    pub async fn clear_experience(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;

        let tx = conn.transaction()?;
        let unlinked = tx.execute("DELETE FROM experience_for_experimental", [])?;
        let removed = tx.execute("DELETE FROM experience", [])?;
        tx.commit()?;

        info!("Cleared {} experience rows and {} experiment links", removed, unlinked);
        Ok(())
    }

    /// Register a new experimental query, returning its id
    pub async fn record_experimental_query(&self, sql: &str) -> Result<i64> {
        let conn = self.conn.lock().await;

        match conn.execute("INSERT INTO experimental_query (query) VALUES (?1)", params![sql]) {
            Ok(_) => {}
            Err(e) if constraint_code(&e) == Some(ffi::SQLITE_CONSTRAINT_UNIQUE) => {
                return Err(StoreError::DuplicateQuery);
            }
            Err(e) => return Err(e.into()),
        }

        info!("Added new test query");
        Ok(conn.last_insert_rowid())
    }

    pub async fn num_experimental_queries(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT count(*) FROM experimental_query", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Cross product of experimental queries and arms, minus linked pairs
    pub async fn unexecuted_experiments(&self) -> Result<Vec<PendingExperiment>> {
        let arms = Arm::ALL.iter()
            .map(|arm| format!("({})", arm.index()))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            r#"WITH arms(arm_idx) AS (VALUES {arms})
               SELECT eq.id, eq.query, arms.arm_idx
               FROM experimental_query eq
               CROSS JOIN arms
               LEFT OUTER JOIN experience_for_experimental efe
                    ON eq.id = efe.experimental_id AND arms.arm_idx = efe.arm_idx
               WHERE efe.experience_id IS NULL
               ORDER BY eq.id, arms.arm_idx"#
        );

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut pending = Vec::new();
        for row in rows {
            let (experimental_id, query, arm_idx) = row?;
            pending.push(PendingExperiment {
                experimental_id,
                query,
                arm: Arm::try_from(arm_idx)?,
            });
        }

        Ok(pending)
    }

    /// Executed arms grouped per experimental query, ordered by query id then arm
    pub async fn experiment_results(&self) -> Result<Vec<ExperimentGroup>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare_cached(
            r#"SELECT eq.id, e.id, e.reward, e.plan, efe.arm_idx
               FROM experimental_query eq,
                    experience_for_experimental efe,
                    experience e
               WHERE eq.id = efe.experimental_id AND e.id = efe.experience_id
               ORDER BY eq.id, efe.arm_idx"#
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut groups: Vec<ExperimentGroup> = Vec::new();
        for row in rows {
            let (experimental_id, experience_id, reward, plan_json, arm_idx) = row?;
            let result = ExperimentResult {
                reward,
                plan: decode_plan(experience_id, &plan_json)?,
                arm: Arm::try_from(arm_idx)?,
            };

            match groups.last_mut() {
                Some(group) if group.experimental_id == experimental_id => group.results.push(result),
                _ => groups.push(ExperimentGroup {
                    experimental_id,
                    results: vec![result],
                }),
            }
        }

        Ok(groups)
    }

    /// Experiment outcomes flattened into training pairs
    pub async fn experiment_experience(&self) -> Result<Vec<(Plan, f64)>> {
        let groups = self.experiment_results().await?;
        Ok(groups.into_iter()
            .flat_map(|group| group.results)
            .map(|result| (result.plan, result.reward))
            .collect())
    }

    /// Link an experience row to the experiment that produced it
    pub async fn record_experiment(&self, experimental_id: i64, experience_id: i64, arm: Arm) -> Result<()> {
        let conn = self.conn.lock().await;

        let inserted = conn.execute(
            "INSERT INTO experience_for_experimental (experience_id, experimental_id, arm_idx) VALUES (?1, ?2, ?3)",
            params![experience_id, experimental_id, i64::from(arm)],
        );

        match inserted {
            Ok(_) => {
                debug!("Linked experience {} to experimental query {} ({})", experience_id, experimental_id, arm);
                Ok(())
            }
            Err(e) if constraint_code(&e) == Some(ffi::SQLITE_CONSTRAINT_PRIMARYKEY) => {
                Err(StoreError::DuplicateExperiment { experience_id, experimental_id, arm })
            }
            Err(e) if constraint_code(&e) == Some(ffi::SQLITE_CONSTRAINT_FOREIGNKEY) => {
                Err(StoreError::UnknownReference { experience_id, experimental_id })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn decode_plan(id: i64, plan_json: &str) -> Result<Plan> {
    Plan::from_json_str(plan_json).map_err(|source| StoreError::CorruptPlan { id, source })
}

/// Extended SQLite result code of a constraint violation, if that is what this is
fn constraint_code(err: &rusqlite::Error) -> Option<c_int> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            Some(e.extended_code)
        }
        _ => None,
    }
}
