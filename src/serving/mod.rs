//! Serving gate
//!
//! Owns the single active predictor. Selection and prediction take a read
//! lock and clone the `Arc`, so they run in parallel and never observe a half
//! swapped model; `load_model` builds and vets the candidate before taking the
//! write lock for the swap itself.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::ModelError;
use crate::model::{argmin, PlanRegressor, Predictor};
use crate::regression::RegressionGate;
use crate::storage::ExperienceStore;
use crate::types::{BufferSnapshot, Plan};

/// Index returned when no model is loaded: let PostgreSQL choose
pub const NATIVE_OPTIMIZER_INDEX: u32 = 0;

/// Result of offering a new model to the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Accepted,
    /// The candidate regressed; the served model is unchanged
    Rejected,
}

pub struct BaoModel {
    current: RwLock<Option<Arc<dyn Predictor>>>,
    gate: RegressionGate,
    load_lock: Mutex<()>,
}

impl BaoModel {
    pub fn new(store: ExperienceStore) -> Self {
        Self {
            current: RwLock::new(None),
            gate: RegressionGate::new(store),
            load_lock: Mutex::new(()),
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.current.read().await.is_some()
    }

    async fn active(&self) -> Option<Arc<dyn Predictor>> {
        self.current.read().await.clone()
    }

    /// Pick the candidate plan with the lowest predicted reward
    pub async fn select_plan(&self, mut arms: Vec<Plan>, buffers: &BufferSnapshot) -> Result<u32, ModelError> {
        let Some(model) = self.active().await else {
            return Ok(NATIVE_OPTIMIZER_INDEX);
        };

        let start = Instant::now();
        for plan in arms.iter_mut() {
            plan.attach_buffers(buffers);
        }

        let predictions = model.predict(&arms)?;
        let Some(selected) = argmin(&predictions) else {
            return Ok(NATIVE_OPTIMIZER_INDEX);
        };

        let native = predictions[0];
        info!("Selected index {} after {}ms, predicted reward {:.3} ({:+.3} vs native)",
            selected, start.elapsed().as_millis(), predictions[selected], predictions[selected] - native);
        debug!("Arm predictions: {:?}", predictions);

        Ok(selected as u32)
    }

    /// Predicted reward for one plan; NaN when no model is loaded
    pub async fn predict(&self, mut plan: Plan, buffers: &BufferSnapshot) -> Result<f64, ModelError> {
        let Some(model) = self.active().await else {
            return Ok(f64::NAN);
        };

        plan.attach_buffers(buffers);
        let prediction = model.predict(std::slice::from_ref(&plan))?;
        Ok(prediction.first().copied().unwrap_or(f64::NAN))
    }

    /// Load a saved model and serve it if the regression gate accepts it
    pub async fn load_model(&self, path: &Path) -> Result<LoadOutcome> {
        let _guard = self.load_lock.lock().await;

        let candidate = PlanRegressor::load(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;
        let current = self.active().await;

        let decision = self.gate.evaluate(current.as_deref(), &candidate).await?;
        if !decision.accepted {
            info!("Did not accept new model from {}: {} (served model has {})",
                path.display(), decision.new, decision.old);
            return Ok(LoadOutcome::Rejected);
        }

        *self.current.write().await = Some(Arc::new(candidate));
        info!("Accepted new model from {}", path.display());
        Ok(LoadOutcome::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn plan(node_type: &str) -> Plan {
        serde_json::from_value(serde_json::json!({
            "Plan": {"Node Type": node_type, "Relation Name": "title", "Total Cost": 1.0, "Plan Rows": 1.0}
        })).unwrap()
    }

    #[tokio::test]
    async fn test_no_model_defaults() {
        let dir = tempdir().unwrap();
        let store = ExperienceStore::open(dir.path().join("bao.db")).await.unwrap();
        let model = BaoModel::new(store);

        let buffers = BufferSnapshot::new();
        assert!(!model.is_loaded().await);
        assert_eq!(model.select_plan(vec![plan("Seq Scan"); 5], &buffers).await.unwrap(), 0);
        assert_eq!(model.select_plan(Vec::new(), &buffers).await.unwrap(), 0);
        assert!(model.predict(plan("Seq Scan"), &buffers).await.unwrap().is_nan());
    }

    #[tokio::test]
    async fn test_failed_load_keeps_no_model() {
        let dir = tempdir().unwrap();
        let store = ExperienceStore::open(dir.path().join("bao.db")).await.unwrap();
        let model = BaoModel::new(store);

        assert!(model.load_model(&dir.path().join("missing")).await.is_err());
        assert!(!model.is_loaded().await);
    }
}
