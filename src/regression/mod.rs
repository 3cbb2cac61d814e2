//! Regression gate
//!
//! Decides whether a candidate model may replace the served one by replaying
//! the stored experiment outcomes: for every experimental query, the arm a
//! model would pick is compared against the best arm actually observed.

use anyhow::Result;
use tracing::info;

use crate::error::ModelError;
use crate::model::{argmin, Predictor};
use crate::storage::{ExperienceStore, ExperimentGroup};
use crate::types::Arm;

/// A selection within this factor of the best observed reward is not a regression
pub const REGRESSION_SLACK: f64 = 1.01;

/// How badly a selection policy does on the experimental queries
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegressionProfile {
    pub regressed: usize,
    pub total_excess: f64,
}

impl std::fmt::Display for RegressionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} regressions, {:.3} excess", self.regressed, self.total_excess)
    }
}

/// Score a selection policy against grouped experiment results.
///
/// With no predictor the policy is "always use the native optimizer", so the
/// arm 0 result is the selection (or the first executed arm if arm 0 has not
/// run yet).
pub fn compute_regressions(
    groups: &[ExperimentGroup],
    predictor: Option<&dyn Predictor>,
) -> Result<RegressionProfile, ModelError> {
    let mut profile = RegressionProfile::default();

    for group in groups {
        let Some(best) = group.results.iter().map(|r| r.reward).reduce(f64::min) else {
            continue;
        };

        let selected = match predictor {
            Some(model) => {
                let plans: Vec<_> = group.results.iter().map(|r| r.plan.clone()).collect();
                let predictions = model.predict(&plans)?;
                if predictions.len() != plans.len() {
                    return Err(ModelError::DimensionMismatch {
                        expected: plans.len(),
                        actual: predictions.len(),
                    });
                }
                argmin(&predictions).unwrap_or(0)
            }
            None => group.results.iter()
                .position(|r| r.arm == Arm::NATIVE)
                .unwrap_or(0),
        };
        let selected_reward = group.results[selected].reward;

        if selected_reward > best * REGRESSION_SLACK {
            profile.regressed += 1;
        }
        profile.total_excess += selected_reward - best;
    }

    Ok(profile)
}

/// The promotion rule: zero regressions always wins, otherwise the new model
/// must be no worse on both count and excess
pub fn accepts(old: RegressionProfile, new: RegressionProfile) -> bool {
    if new.regressed == 0 {
        return true;
    }
    old.regressed >= new.regressed && old.total_excess >= new.total_excess
}

/// Outcome of a gate evaluation, with both profiles for reporting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateDecision {
    pub accepted: bool,
    pub old: RegressionProfile,
    pub new: RegressionProfile,
}

/// Gate backed by the experience store. Holds no state of its own.
#[derive(Clone)]
pub struct RegressionGate {
    store: ExperienceStore,
}

impl RegressionGate {
    pub fn new(store: ExperienceStore) -> Self {
        Self { store }
    }

    /// Compare both models over one snapshot of the experiment results
    pub async fn evaluate(&self, old: Option<&dyn Predictor>, new: &dyn Predictor) -> Result<GateDecision> {
        let groups = self.store.experiment_results().await?;

        let old_profile = compute_regressions(&groups, old)?;
        let new_profile = compute_regressions(&groups, Some(new))?;

        info!("Old model: {}", old_profile);
        info!("New model: {}", new_profile);

        Ok(GateDecision {
            accepted: accepts(old_profile, new_profile),
            old: old_profile,
            new: new_profile,
        })
    }

    pub async fn should_replace_model(&self, old: Option<&dyn Predictor>, new: &dyn Predictor) -> Result<bool> {
        Ok(self.evaluate(old, new).await?.accepted)
    }
}
