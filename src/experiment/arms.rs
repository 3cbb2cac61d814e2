//! Planner hint profiles for the five experiment arms

use crate::types::Arm;

/// The six planner strategy toggles every arm sets
pub const PLANNER_OPTIONS: [&str; 6] = [
    "enable_nestloop",
    "enable_hashjoin",
    "enable_mergejoin",
    "enable_seqscan",
    "enable_indexscan",
    "enable_indexonlyscan",
];

/// Toggles switched back on for each arm
fn enabled_options(arm: Arm) -> &'static [&'static str] {
    match arm.index() {
        0 => &[],
        1 => &PLANNER_OPTIONS,
        2 => &["enable_hashjoin", "enable_indexonlyscan", "enable_nestloop", "enable_seqscan"],
        3 => &["enable_hashjoin", "enable_indexonlyscan", "enable_seqscan"],
        _ => &["enable_hashjoin", "enable_indexonlyscan", "enable_indexscan", "enable_nestloop", "enable_seqscan"],
    }
}

/// Session statements applying an arm: everything off, then the arm's subset on
pub fn arm_hints(arm: Arm) -> Vec<String> {
    let mut hints: Vec<String> = PLANNER_OPTIONS.iter()
        .map(|option| format!("SET {} TO off", option))
        .collect();
    hints.extend(enabled_options(arm).iter().map(|option| format!("SET {} TO on", option)));
    hints
}
