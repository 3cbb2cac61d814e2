//! Plan cost prediction
//!
//! The server only depends on the [`Predictor`] contract: score a batch of
//! plans, persist and restore trained state. [`PlanRegressor`] is the
//! implementation shipped with the server; it featurizes plans with a
//! [`TreeFeaturizer`] and fits a regularized linear model on pooled tree
//! features.

pub mod featurize;
pub mod regressor;
pub mod train;

use std::path::Path;

use crate::error::ModelError;
use crate::types::Plan;

pub use featurize::{FeatureTree, TreeFeaturizer};
pub use regressor::PlanRegressor;
pub use train::{SwapOutcome, Trainer};

/// Turns raw plans into feature trees
pub trait Featurizer {
    /// Learn normalization statistics and the relation vocabulary
    fn fit(&mut self, plans: &[Plan]) -> Result<(), ModelError>;

    fn transform(&self, plans: &[Plan]) -> Result<Vec<FeatureTree>, ModelError>;
}

/// A trained reward model
#[cfg_attr(test, mockall::automock)]
pub trait Predictor: Send + Sync {
    fn fit(&mut self, plans: &[Plan], rewards: &[f64]) -> Result<(), ModelError>;

    /// One reward estimate per plan, in input order
    fn predict(&self, plans: &[Plan]) -> Result<Vec<f64>, ModelError>;

    fn save(&self, path: &Path) -> Result<(), ModelError>;

    /// Number of experiences the model was fitted on
    fn trained_on_count(&self) -> usize;
}

/// Index of the smallest value. Ties go to the lowest index and NaN never
/// beats a real number.
pub fn argmin(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &value) in values.iter().enumerate() {
        match best {
            None => best = Some((idx, value)),
            Some((_, current)) if value < current || (current.is_nan() && !value.is_nan()) => {
                best = Some((idx, value));
            }
            _ => {}
        }
    }
    best.map(|(idx, _)| idx)
}
