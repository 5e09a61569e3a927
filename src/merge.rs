use std::collections::HashSet;

use tracing::debug;

use crate::profile::{total_samples, ProcessToStacks, StackCounts};
use crate::script::{is_unresolved_frame, parse_perf_script, stack_frames};

/// Resolution ratios closer than this are considered equally good, and the
/// source with more samples wins instead.
pub const RESOLUTION_TIE_THRESHOLD: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    FramePointer,
    Dwarf,
}

/// Picks, per process, which of the two perf outputs to keep.
#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy {
    pub tie_threshold: f64,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy {
            tie_threshold: RESOLUTION_TIE_THRESHOLD,
        }
    }
}

impl SelectionPolicy {
    pub fn choose(&self, fp: &StackCounts, dwarf: &StackCounts) -> Source {
        let fp_ratio = resolved_ratio(fp);
        let dwarf_ratio = resolved_ratio(dwarf);

        if (fp_ratio - dwarf_ratio).abs() > self.tie_threshold {
            return if fp_ratio > dwarf_ratio {
                Source::FramePointer
            } else {
                Source::Dwarf
            };
        }

        if total_samples(dwarf) > total_samples(fp) {
            Source::Dwarf
        } else {
            Source::FramePointer
        }
    }
}

/// Share of frames perf could name, weighted by how often each stack was
/// sampled. Stacks without frames count for nothing.
pub fn resolved_ratio(stacks: &StackCounts) -> f64 {
    let mut resolved = 0u64;
    let mut total = 0u64;
    for (stack, count) in stacks {
        for frame in stack_frames(stack) {
            total += count;
            if !is_unresolved_frame(frame) {
                resolved += count;
            }
        }
    }

    if total == 0 {
        0.0
    } else {
        resolved as f64 / total as f64
    }
}

/// Merges the outputs of the frame pointer and DWARF perfs into one set of
/// stacks per process, keeping the whole collection of whichever source did
/// better for that process.
pub fn merge_global_perfs(fp_script: Option<&str>, dwarf_script: Option<&str>) -> ProcessToStacks {
    merge_with_policy(fp_script, dwarf_script, &SelectionPolicy::default())
}

pub fn merge_with_policy(
    fp_script: Option<&str>,
    dwarf_script: Option<&str>,
    policy: &SelectionPolicy,
) -> ProcessToStacks {
    match (fp_script, dwarf_script) {
        (None, None) => ProcessToStacks::new(),
        (Some(script), None) | (None, Some(script)) => parse_perf_script(script),
        (Some(fp_script), Some(dwarf_script)) => merge_parsed(
            parse_perf_script(fp_script),
            parse_perf_script(dwarf_script),
            policy,
        ),
    }
}

pub fn merge_parsed(
    mut fp: ProcessToStacks,
    mut dwarf: ProcessToStacks,
    policy: &SelectionPolicy,
) -> ProcessToStacks {
    let pids: HashSet<_> = fp.keys().chain(dwarf.keys()).copied().collect();
    let mut merged = ProcessToStacks::with_capacity(pids.len());

    for pid in pids {
        let stacks = match (fp.remove(&pid), dwarf.remove(&pid)) {
            (Some(fp_stacks), Some(dwarf_stacks)) => match policy.choose(&fp_stacks, &dwarf_stacks) {
                Source::FramePointer => fp_stacks,
                Source::Dwarf => {
                    debug!("pid {}: using DWARF stacks", pid);
                    dwarf_stacks
                }
            },
            (Some(stacks), None) | (None, Some(stacks)) => stacks,
            (None, None) => continue,
        };
        merged.insert(pid, stacks);
    }

    merged
}
