//! Tree featurization
//!
//! Every join and scan becomes a vector: a one-hot operator encoding followed
//! by log-scaled, min-max normalized statistics (buffer count when the
//! training data carried buffer snapshots, total cost, plan rows). Nodes with
//! exactly one child are transparent and replaced by that child.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::Featurizer;
use crate::error::ModelError;
use crate::types::{NodeKind, Plan, PlanNode, ScanKind};

/// Binary tree of node feature vectors
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureTree {
    Join {
        features: Vec<f64>,
        left: Box<FeatureTree>,
        right: Box<FeatureTree>,
    },
    Scan {
        features: Vec<f64>,
        relation: String,
    },
}

impl FeatureTree {
    pub fn features(&self) -> &[f64] {
        match self {
            FeatureTree::Join { features, .. } | FeatureTree::Scan { features, .. } => features,
        }
    }

    /// Visit every node's features along with its depth (root = 1)
    pub fn for_each_node(&self, mut visit: impl FnMut(&[f64], usize)) {
        let mut stack = vec![(self, 1usize)];
        while let Some((node, depth)) = stack.pop() {
            visit(node.features(), depth);
            if let FeatureTree::Join { left, right, .. } = node {
                stack.push((right, depth + 1));
                stack.push((left, depth + 1));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum StatField {
    Buffers,
    TotalCost,
    PlanRows,
}

impl StatField {
    fn read(self, node: &PlanNode) -> Option<f64> {
        match self {
            StatField::Buffers => node.buffers.map(|b| b as f64),
            StatField::TotalCost => Some(node.total_cost),
            StatField::PlanRows => Some(node.plan_rows),
        }
    }
}

/// Log-min-max normalizer for node statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StatExtractor {
    fields: Vec<StatField>,
    mins: Vec<f64>,
    maxs: Vec<f64>,
}

impl StatExtractor {
    fn extract(&self, node: &PlanNode) -> Vec<f64> {
        self.fields.iter()
            .zip(self.mins.iter().zip(&self.maxs))
            .map(|(field, (&lo, &hi))| match field.read(node) {
                Some(value) => normalize(value, lo, hi),
                None => 0.0,
            })
            .collect()
    }
}

fn normalize(value: f64, lo: f64, hi: f64) -> f64 {
    let range = hi - lo;
    if range <= 0.0 {
        return 0.0;
    }
    ((value + 1.0).ln() - lo) / range
}

fn log_range(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    values
        .map(|v| (v + 1.0).ln())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Featurizer fitted on a corpus of plans
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeFeaturizer {
    stats: Option<StatExtractor>,
    /// Known relations, longest first
    relations: Vec<String>,
}

impl TreeFeaturizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fitted(&self) -> bool {
        self.stats.is_some()
    }

    /// Width of each node's feature vector
    pub fn num_features(&self) -> usize {
        NodeKind::OPERATOR_COUNT + self.stats.as_ref().map_or(0, |s| s.fields.len())
    }

    pub fn has_buffer_channel(&self) -> bool {
        self.stats.as_ref()
            .is_some_and(|s| s.fields.contains(&StatField::Buffers))
    }

    fn prepared(plans: &[Plan]) -> Vec<Plan> {
        plans.iter()
            .cloned()
            .map(|mut plan| {
                plan.distribute_leaf_buffers();
                plan
            })
            .collect()
    }

    fn node_features(&self, stats: &StatExtractor, node: &PlanNode, kind: NodeKind) -> Vec<f64> {
        let mut features = vec![0.0; NodeKind::OPERATOR_COUNT];
        if let Some(idx) = kind.operator_index() {
            features[idx] = 1.0;
        }
        features.extend(stats.extract(node));
        features
    }

    fn relation_name(&self, node: &PlanNode, kind: NodeKind) -> Result<String, ModelError> {
        if let Some(name) = &node.relation_name {
            return Ok(name.clone());
        }

        if kind == NodeKind::Scan(ScanKind::BitmapIndexScan) {
            let index = node.index_name.as_deref().ok_or_else(|| {
                ModelError::Featurize("bitmap index scan has neither an index nor a relation name".to_string())
            })?;
            return self.relations.iter()
                .find(|rel| index.contains(rel.as_str()))
                .cloned()
                .ok_or_else(|| ModelError::Featurize(format!("no known relation matches index {}", index)));
        }

        Err(ModelError::Featurize(format!("cannot extract relation from {} node", node.node_type)))
    }

    fn build_tree(&self, stats: &StatExtractor, root: &PlanNode) -> Result<FeatureTree, ModelError> {
        enum Frame<'a> {
            Enter(&'a PlanNode),
            Join(&'a PlanNode, NodeKind),
        }

        let mut frames = vec![Frame::Enter(root)];
        let mut built: Vec<FeatureTree> = Vec::new();

        while let Some(frame) = frames.pop() {
            match frame {
                Frame::Enter(mut node) => {
                    while node.children.len() == 1 {
                        node = &node.children[0];
                    }

                    match node.kind() {
                        kind @ NodeKind::Join(_) => {
                            if node.children.len() != 2 {
                                return Err(ModelError::Featurize(format!(
                                    "{} node has {} children, expected 2",
                                    node.node_type,
                                    node.children.len()
                                )));
                            }
                            frames.push(Frame::Join(node, kind));
                            frames.push(Frame::Enter(&node.children[1]));
                            frames.push(Frame::Enter(&node.children[0]));
                        }
                        kind @ NodeKind::Scan(_) => {
                            if !node.is_leaf() {
                                return Err(ModelError::Featurize(format!(
                                    "{} node unexpectedly has children",
                                    node.node_type
                                )));
                            }
                            built.push(FeatureTree::Scan {
                                features: self.node_features(stats, node, kind),
                                relation: self.relation_name(node, kind)?,
                            });
                        }
                        NodeKind::Other => {
                            return Err(ModelError::Featurize(format!(
                                "node wasn't transparent, a join, or a scan: {}",
                                node.node_type
                            )));
                        }
                    }
                }
                Frame::Join(node, kind) => {
                    let (Some(right), Some(left)) = (built.pop(), built.pop()) else {
                        return Err(ModelError::Featurize("join is missing a subtree".to_string()));
                    };
                    built.push(FeatureTree::Join {
                        features: self.node_features(stats, node, kind),
                        left: Box::new(left),
                        right: Box::new(right),
                    });
                }
            }
        }

        built.pop()
            .ok_or_else(|| ModelError::Featurize("plan produced no tree".to_string()))
    }
}

impl Featurizer for TreeFeaturizer {
    fn fit(&mut self, plans: &[Plan]) -> Result<(), ModelError> {
        if plans.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }

        let plans = Self::prepared(plans);
        let nodes = || plans.iter().flat_map(|plan| plan.nodes());

        let mut relations: Vec<String> = plans.iter()
            .flat_map(|plan| plan.relations())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        // stable sort keeps alphabetical order among equal lengths
        relations.sort_by_key(|rel| std::cmp::Reverse(rel.len()));

        let costs = log_range(nodes().map(|n| n.total_cost)).unwrap_or((0.0, 0.0));
        let rows = log_range(nodes().map(|n| n.plan_rows)).unwrap_or((0.0, 0.0));
        let buffers = log_range(nodes().filter_map(|n| n.buffers).map(|b| b as f64));

        let stats = match buffers {
            Some(bufs) => StatExtractor {
                fields: vec![StatField::Buffers, StatField::TotalCost, StatField::PlanRows],
                mins: vec![bufs.0, costs.0, rows.0],
                maxs: vec![bufs.1, costs.1, rows.1],
            },
            None => StatExtractor {
                fields: vec![StatField::TotalCost, StatField::PlanRows],
                mins: vec![costs.0, rows.0],
                maxs: vec![costs.1, rows.1],
            },
        };

        self.stats = Some(stats);
        self.relations = relations;
        Ok(())
    }

    fn transform(&self, plans: &[Plan]) -> Result<Vec<FeatureTree>, ModelError> {
        let stats = self.stats.as_ref().ok_or(ModelError::NotFitted)?;
        Self::prepared(plans)
            .iter()
            .map(|plan| self.build_tree(stats, &plan.root))
            .collect()
    }
}
