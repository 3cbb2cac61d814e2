//! Shared types used across modules
//!
//! Plans arrive from the PostgreSQL extension as JSON trees. Only the fields the
//! server actually reads are typed; everything else is carried through untouched
//! so a stored plan round-trips byte-for-byte in meaning.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::InvalidArm;

/// Per-execution buffer access counts, keyed by relation or index name
pub type BufferSnapshot = BTreeMap<String, u64>;

/// A candidate (or executed) query plan with its optional buffer snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "Plan")]
    pub root: PlanNode,
    #[serde(rename = "Buffers", default, skip_serializing_if = "Option::is_none")]
    pub buffers: Option<BufferSnapshot>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One node of a plan tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    #[serde(rename = "Node Type")]
    pub node_type: String,
    #[serde(rename = "Total Cost", default)]
    pub total_cost: f64,
    #[serde(rename = "Plan Rows", default)]
    pub plan_rows: f64,
    #[serde(rename = "Plans", default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<PlanNode>,
    #[serde(rename = "Relation Name", default, skip_serializing_if = "Option::is_none")]
    pub relation_name: Option<String>,
    #[serde(rename = "Index Name", default, skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    /// Buffer count attached to leaves during featurization
    #[serde(rename = "Buffers", default, skip_serializing_if = "Option::is_none")]
    pub buffers: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Join operators the featurizer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    NestedLoop,
    HashJoin,
    MergeJoin,
}

/// Scan operators the featurizer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    SeqScan,
    IndexScan,
    IndexOnlyScan,
    BitmapIndexScan,
}

/// Classification of a plan node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Join(JoinKind),
    Scan(ScanKind),
    /// Anything else (sorts, aggregates, bitmap heap scans, ...)
    Other,
}

impl NodeKind {
    /// Number of distinct join + scan operators
    pub const OPERATOR_COUNT: usize = 7;

    /// Classify a PostgreSQL node type string
    pub fn from_node_type(node_type: &str) -> Self {
        match node_type {
            "Nested Loop" => NodeKind::Join(JoinKind::NestedLoop),
            "Hash Join" => NodeKind::Join(JoinKind::HashJoin),
            "Merge Join" => NodeKind::Join(JoinKind::MergeJoin),
            "Seq Scan" => NodeKind::Scan(ScanKind::SeqScan),
            "Index Scan" => NodeKind::Scan(ScanKind::IndexScan),
            "Index Only Scan" => NodeKind::Scan(ScanKind::IndexOnlyScan),
            "Bitmap Index Scan" => NodeKind::Scan(ScanKind::BitmapIndexScan),
            _ => NodeKind::Other,
        }
    }

    /// Position of this operator in the one-hot encoding, if it has one
    pub fn operator_index(&self) -> Option<usize> {
        match self {
            NodeKind::Join(JoinKind::NestedLoop) => Some(0),
            NodeKind::Join(JoinKind::HashJoin) => Some(1),
            NodeKind::Join(JoinKind::MergeJoin) => Some(2),
            NodeKind::Scan(ScanKind::SeqScan) => Some(3),
            NodeKind::Scan(ScanKind::IndexScan) => Some(4),
            NodeKind::Scan(ScanKind::IndexOnlyScan) => Some(5),
            NodeKind::Scan(ScanKind::BitmapIndexScan) => Some(6),
            NodeKind::Other => None,
        }
    }
}

impl PlanNode {
    pub fn kind(&self) -> NodeKind {
        NodeKind::from_node_type(&self.node_type)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Buffer count for a leaf: relation hits plus index hits
    fn buffer_count(&self, snapshot: &BufferSnapshot) -> u64 {
        let relation = self.relation_name.as_ref()
            .and_then(|name| snapshot.get(name))
            .copied()
            .unwrap_or(0);
        let index = self.index_name.as_ref()
            .and_then(|name| snapshot.get(name))
            .copied()
            .unwrap_or(0);
        relation + index
    }
}

/// Pre-order iterator over plan nodes
pub struct PlanNodes<'a> {
    stack: Vec<&'a PlanNode>,
}

impl<'a> Iterator for PlanNodes<'a> {
    type Item = &'a PlanNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        // reversed so the leftmost child is visited first
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

impl Plan {
    /// Parse a plan from its stored JSON text
    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Attach a buffer snapshot to this plan, replacing any previous one
    pub fn attach_buffers(&mut self, buffers: &BufferSnapshot) {
        self.buffers = Some(buffers.clone());
    }

    pub fn with_buffers(mut self, buffers: &BufferSnapshot) -> Self {
        self.attach_buffers(buffers);
        self
    }

    /// Walk every node in pre-order
    pub fn nodes(&self) -> PlanNodes<'_> {
        PlanNodes { stack: vec![&self.root] }
    }

    /// All relation names referenced anywhere in the tree
    pub fn relations(&self) -> BTreeSet<String> {
        self.nodes()
            .filter_map(|node| node.relation_name.clone())
            .collect()
    }

    /// Copy per-relation buffer counts from the snapshot onto each leaf.
    /// No-op when no snapshot is attached.
    pub fn distribute_leaf_buffers(&mut self) {
        let Some(snapshot) = self.buffers.as_ref() else {
            return;
        };

        let mut stack: Vec<&mut PlanNode> = vec![&mut self.root];
        while let Some(node) = stack.pop() {
            if node.is_leaf() {
                node.buffers = Some(node.buffer_count(snapshot));
            } else {
                stack.extend(node.children.iter_mut());
            }
        }
    }
}

/// Observed execution outcome reported alongside a plan
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardObservation {
    pub reward: f64,
    pub pid: i64,
}

/// One of the five fixed planner-hint profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Arm(u8);

impl Arm {
    pub const COUNT: usize = 5;

    /// The native PostgreSQL optimizer's choice
    pub const NATIVE: Arm = Arm(0);

    pub const ALL: [Arm; Arm::COUNT] = [Arm(0), Arm(1), Arm(2), Arm(3), Arm(4)];

    pub fn new(index: usize) -> Option<Self> {
        if index < Self::COUNT {
            Some(Arm(index as u8))
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<i64> for Arm {
    type Error = InvalidArm;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(Arm::new)
            .ok_or(InvalidArm(value))
    }
}

impl From<Arm> for i64 {
    fn from(arm: Arm) -> Self {
        arm.0 as i64
    }
}

impl std::fmt::Display for Arm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "arm {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> Plan {
        serde_json::from_value(serde_json::json!({
            "Plan": {
                "Node Type": "Hash Join",
                "Node Type ID": "38",
                "Total Cost": 120.5,
                "Plan Rows": 40.0,
                "Plans": [
                    {"Node Type": "Seq Scan", "Relation Name": "title", "Total Cost": 50.0, "Plan Rows": 1000.0},
                    {"Node Type": "Hash", "Total Cost": 30.0, "Plan Rows": 10.0, "Plans": [
                        {"Node Type": "Index Scan", "Relation Name": "cast_info", "Index Name": "ci_idx",
                         "Total Cost": 25.0, "Plan Rows": 10.0}
                    ]}
                ]
            }
        })).unwrap()
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let plan = sample_plan();
        let text = plan.to_json_string().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["Plan"]["Node Type ID"], "38");
        assert_eq!(Plan::from_json_str(&text).unwrap(), plan);
    }

    #[test]
    fn test_preorder_walk() {
        let plan = sample_plan();
        let types: Vec<&str> = plan.nodes().map(|n| n.node_type.as_str()).collect();
        assert_eq!(types, vec!["Hash Join", "Seq Scan", "Hash", "Index Scan"]);
        assert_eq!(plan.relations().into_iter().collect::<Vec<_>>(), vec!["cast_info", "title"]);
    }

    #[test]
    fn test_distribute_leaf_buffers() {
        let mut buffers = BufferSnapshot::new();
        buffers.insert("title".to_string(), 7);
        buffers.insert("cast_info".to_string(), 3);
        buffers.insert("ci_idx".to_string(), 2);

        let mut plan = sample_plan().with_buffers(&buffers);
        plan.distribute_leaf_buffers();

        let leaves: Vec<Option<u64>> = plan.nodes()
            .filter(|n| n.is_leaf())
            .map(|n| n.buffers)
            .collect();
        assert_eq!(leaves, vec![Some(7), Some(5)]);
        assert_eq!(plan.root.buffers, None);
    }

    #[test]
    fn test_node_kind() {
        assert_eq!(NodeKind::from_node_type("Merge Join"), NodeKind::Join(JoinKind::MergeJoin));
        assert_eq!(NodeKind::from_node_type("Sort"), NodeKind::Other);
        assert_eq!(NodeKind::from_node_type("Bitmap Index Scan").operator_index(), Some(6));
    }

    #[test]
    fn test_arm_bounds() {
        assert_eq!(Arm::try_from(4).unwrap().index(), 4);
        assert!(Arm::try_from(5).is_err());
        assert!(Arm::try_from(-1).is_err());
        let arm: Arm = serde_json::from_str("2").unwrap();
        assert_eq!(arm, Arm::new(2).unwrap());
        assert!(serde_json::from_str::<Arm>("9").is_err());
    }
}
