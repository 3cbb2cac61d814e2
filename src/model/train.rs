//! Training pipeline
//!
//! Trains a fresh model from the experience store and, for a retrain, keeps
//! retraining with increasing emphasis on experiment outcomes until the
//! regression gate accepts it or the retry budget runs out.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use super::{PlanRegressor, Predictor};
use crate::config::{ModelsConfig, TrainingConfig};
use crate::error::ModelError;
use crate::regression::RegressionGate;
use crate::storage::ExperienceStore;

/// Result of a retrain-and-swap cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The new model now lives at the default path
    Promoted { retries: u32 },
    /// Every attempt regressed; the default model was left in place
    Rejected { retries: u32 },
}

pub struct Trainer {
    store: ExperienceStore,
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(store: ExperienceStore, config: TrainingConfig) -> Self {
        Self { store, config }
    }

    /// Train on all experience (plus `emphasize_experiments` extra copies of
    /// the experiment outcomes) and save the model at `path`
    pub async fn train_and_save_model(&self, path: &Path, emphasize_experiments: u32) -> Result<PlanRegressor> {
        let mut experience = self.store.experience().await?;

        if emphasize_experiments > 0 {
            let experiments = self.store.experiment_experience().await?;
            for _ in 0..emphasize_experiments {
                experience.extend(experiments.iter().cloned());
            }
        }

        if experience.is_empty() {
            return Err(ModelError::EmptyTrainingSet.into());
        }
        if experience.len() < self.config.min_experience_warning {
            warn!("Training a model with only {} datapoints (fewer than {})",
                experience.len(), self.config.min_experience_warning);
        }

        let (plans, rewards): (Vec<_>, Vec<_>) = experience.into_iter().unzip();

        let mut model = PlanRegressor::new();
        model.fit(&plans, &rewards)?;
        model.save(path)
            .with_context(|| format!("Failed to save model to {}", path.display()))?;
        Ok(model)
    }

    /// Retrain until the gate accepts, then rotate the model directories:
    /// default → previous, tmp → default
    pub async fn train_and_swap(&self, paths: &ModelsConfig, gate: &RegressionGate) -> Result<SwapOutcome> {
        let old_model = if paths.default_path.exists() {
            Some(PlanRegressor::load(&paths.default_path)
                .with_context(|| format!("Failed to load current model from {}", paths.default_path.display()))?)
        } else {
            None
        };
        let old_ref = old_model.as_ref().map(|m| m as &dyn Predictor);

        let mut new_model = self.train_and_save_model(&paths.tmp_path, 0).await?;
        let mut current_retry: u32 = 1;

        while !gate.should_replace_model(old_ref, &new_model).await? {
            if current_retry > self.config.max_retries {
                warn!("Could not train a model with a better regression profile after {} retries",
                    self.config.max_retries);
                return Ok(SwapOutcome::Rejected { retries: current_retry - 1 });
            }

            info!("New model rejected, retraining with emphasis on regressions (retry #{})", current_retry);
            new_model = self.train_and_save_model(&paths.tmp_path, current_retry).await?;
            current_retry += 1;
        }

        rotate(&paths.default_path, &paths.previous_path, &paths.tmp_path)?;
        info!("Promoted retrained model to {}", paths.default_path.display());
        Ok(SwapOutcome::Promoted { retries: current_retry - 1 })
    }
}

fn rotate(default: &Path, previous: &Path, tmp: &Path) -> Result<()> {
    if default.exists() {
        if previous.exists() {
            std::fs::remove_dir_all(previous)
                .with_context(|| format!("Failed to remove {}", previous.display()))?;
        }
        std::fs::rename(default, previous)
            .with_context(|| format!("Failed to move {} to {}", default.display(), previous.display()))?;
    }
    std::fs::rename(tmp, default)
        .with_context(|| format!("Failed to move {} to {}", tmp.display(), default.display()))?;
    Ok(())
}
