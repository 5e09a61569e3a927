use std::collections::HashMap;

use perfweave_metadata::types::AppMetadata;

pub use perfweave_metadata::process::Pid;

/// Folded stack (`comm;root;...;leaf`) to number of samples.
pub type StackCounts = HashMap<String, u64>;

pub type ProcessToStacks = HashMap<Pid, StackCounts>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfileData {
    pub stacks: StackCounts,
    pub app_id: Option<String>,
    pub metadata: Option<AppMetadata>,
}

/// Everything one sampling round produced, keyed by pid.
pub type RoundResult = HashMap<Pid, ProfileData>;

pub fn total_samples(stacks: &StackCounts) -> u64 {
    stacks.values().sum()
}

/// Renders stacks in the collapsed format understood by flamegraph tooling,
/// sorted so the output is stable.
pub fn fold_stacks(stacks: &StackCounts) -> String {
    let mut lines: Vec<_> = stacks
        .iter()
        .map(|(stack, count)| format!("{} {}", stack, count))
        .collect();
    lines.sort();
    lines.join("\n")
}
