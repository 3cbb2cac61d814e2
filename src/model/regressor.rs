//! Ridge regression over pooled feature trees
//!
//! Each feature tree is pooled into a fixed-width vector (per-channel sum,
//! per-channel max, log node count). Targets are `log1p`-transformed and
//! min-max scaled before fitting, and the closed-form ridge solution keeps
//! training deterministic: the same experience always yields the same model.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use super::{Featurizer, FeatureTree, Predictor, TreeFeaturizer};
use crate::error::ModelError;
use crate::types::Plan;

const RIDGE_PENALTY: f64 = 1e-3;

const FEATURIZER_FILE: &str = "featurizer.json";
const WEIGHTS_FILE: &str = "weights.json";
const META_FILE: &str = "meta.json";

/// `log1p` followed by min-max scaling
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct TargetTransform {
    lo: f64,
    hi: f64,
}

impl TargetTransform {
    fn fit(rewards: &[f64]) -> Self {
        let logs = rewards.iter().map(|r| r.max(0.0).ln_1p());
        let (lo, hi) = logs.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
        Self { lo, hi }
    }

    fn scale(&self) -> f64 {
        let range = self.hi - self.lo;
        if range > 0.0 { range } else { 1.0 }
    }

    fn forward(&self, reward: f64) -> f64 {
        (reward.max(0.0).ln_1p() - self.lo) / self.scale()
    }

    fn inverse(&self, value: f64) -> f64 {
        (value * self.scale() + self.lo).exp_m1()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LinearWeights {
    weights: Vec<f64>,
    bias: f64,
    target: TargetTransform,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelMeta {
    trained_on: usize,
    pooled_width: usize,
    trained_at: DateTime<Utc>,
}

/// The default [`Predictor`] implementation
#[derive(Debug, Clone, Default)]
pub struct PlanRegressor {
    featurizer: TreeFeaturizer,
    weights: Option<LinearWeights>,
    trained_on: usize,
}

impl PlanRegressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a model previously written with [`Predictor::save`]
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let meta: ModelMeta = read_json(&path.join(META_FILE))?;
        let featurizer: TreeFeaturizer = read_json(&path.join(FEATURIZER_FILE))?;
        let weights: LinearWeights = read_json(&path.join(WEIGHTS_FILE))?;

        if weights.weights.len() != meta.pooled_width {
            return Err(ModelError::DimensionMismatch {
                expected: meta.pooled_width,
                actual: weights.weights.len(),
            });
        }

        debug!("Loaded model from {} (trained on {} experiences at {})",
            path.display(), meta.trained_on, meta.trained_at);
        Ok(Self {
            featurizer,
            weights: Some(weights),
            trained_on: meta.trained_on,
        })
    }

    fn pooled_width(&self) -> usize {
        2 * self.featurizer.num_features() + 1
    }

    fn pool(&self, tree: &FeatureTree) -> Vec<f64> {
        let width = self.featurizer.num_features();
        let mut sum = vec![0.0; width];
        let mut max = vec![f64::NEG_INFINITY; width];
        let mut count = 0usize;

        tree.for_each_node(|features, _depth| {
            count += 1;
            for (i, &value) in features.iter().enumerate().take(width) {
                sum[i] += value;
                max[i] = max[i].max(value);
            }
        });

        let mut pooled = sum;
        pooled.extend(max.into_iter().map(|m| if m.is_finite() { m } else { 0.0 }));
        pooled.push((count as f64).ln_1p());
        pooled
    }

    fn pooled_features(&self, plans: &[Plan]) -> Result<Vec<Vec<f64>>, ModelError> {
        Ok(self.featurizer.transform(plans)?
            .iter()
            .map(|tree| self.pool(tree))
            .collect())
    }
}

impl Predictor for PlanRegressor {
    fn fit(&mut self, plans: &[Plan], rewards: &[f64]) -> Result<(), ModelError> {
        if plans.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        if plans.len() != rewards.len() {
            return Err(ModelError::DimensionMismatch {
                expected: plans.len(),
                actual: rewards.len(),
            });
        }

        let mut featurizer = TreeFeaturizer::new();
        featurizer.fit(plans)?;
        self.featurizer = featurizer;

        let x = self.pooled_features(plans)?;
        let target = TargetTransform::fit(rewards);
        let y: Vec<f64> = rewards.iter().map(|&r| target.forward(r)).collect();

        let (weights, bias) = solve_ridge(&x, &y, self.pooled_width(), RIDGE_PENALTY)?;
        self.weights = Some(LinearWeights { weights, bias, target });
        self.trained_on = plans.len();

        info!("Fitted plan regressor on {} experiences ({} pooled features)", plans.len(), self.pooled_width());
        Ok(())
    }

    fn predict(&self, plans: &[Plan]) -> Result<Vec<f64>, ModelError> {
        let model = self.weights.as_ref().ok_or(ModelError::NotFitted)?;

        Ok(self.pooled_features(plans)?
            .iter()
            .map(|x| {
                let raw = x.iter().zip(&model.weights).map(|(a, b)| a * b).sum::<f64>() + model.bias;
                model.target.inverse(raw)
            })
            .collect())
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        let weights = self.weights.as_ref().ok_or(ModelError::NotFitted)?;

        std::fs::create_dir_all(path).map_err(|source| io_error(path, source))?;

        let meta = ModelMeta {
            trained_on: self.trained_on,
            pooled_width: self.pooled_width(),
            trained_at: Utc::now(),
        };
        write_json(&path.join(FEATURIZER_FILE), &self.featurizer)?;
        write_json(&path.join(WEIGHTS_FILE), weights)?;
        write_json(&path.join(META_FILE), &meta)?;

        info!("Saved model to {}", path.display());
        Ok(())
    }

    fn trained_on_count(&self) -> usize {
        self.trained_on
    }
}

/// Solve `(XᵀX + λI) w = Xᵀy` with an unpenalized bias column appended
fn solve_ridge(x: &[Vec<f64>], y: &[f64], width: usize, penalty: f64) -> Result<(Vec<f64>, f64), ModelError> {
    let dim = width + 1;
    let mut a = vec![vec![0.0; dim]; dim];
    let mut b = vec![0.0; dim];

    for (row, &target) in x.iter().zip(y) {
        if row.len() != width {
            return Err(ModelError::DimensionMismatch { expected: width, actual: row.len() });
        }
        let augmented = row.iter().copied().chain(std::iter::once(1.0));
        let augmented: Vec<f64> = augmented.collect();
        for i in 0..dim {
            b[i] += augmented[i] * target;
            for j in 0..dim {
                a[i][j] += augmented[i] * augmented[j];
            }
        }
    }
    for (i, row) in a.iter_mut().enumerate().take(width) {
        row[i] += penalty;
    }

    let solution = gaussian_elimination(a, b);
    if solution.iter().any(|v| !v.is_finite()) {
        warn!("Ridge solve produced non-finite weights");
        return Err(ModelError::Featurize("training data produced a degenerate model".to_string()));
    }

    let bias = solution[width];
    Ok((solution[..width].to_vec(), bias))
}

/// Gaussian elimination with partial pivoting on a square system
fn gaussian_elimination(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Vec<f64> {
    let n = b.len();

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        a.swap(col, pivot);
        b.swap(col, pivot);

        let diag = a[col][col];
        if diag.abs() < f64::EPSILON {
            continue;
        }

        for row in (col + 1)..n {
            let factor = a[row][col] / diag;
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut solution = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * solution[k]).sum();
        let diag = a[row][row];
        solution[row] = if diag.abs() < f64::EPSILON { 0.0 } else { (b[row] - tail) / diag };
    }
    solution
}

fn io_error(path: &Path, source: std::io::Error) -> ModelError {
    ModelError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ModelError> {
    let contents = serde_json::to_string_pretty(value)?;
    std::fs::write(path, contents).map_err(|source| io_error(path, source))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ModelError> {
    let contents = std::fs::read_to_string(path).map_err(|source| io_error(path, source))?;
    Ok(serde_json::from_str(&contents)?)
}
