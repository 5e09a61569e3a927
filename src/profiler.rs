use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use perfweave_metadata::metadata_provider::MetadataProvider;
use perfweave_metadata::namespace::LinuxNamespaces;
use perfweave_metadata::process::ProcessKey;
use thiserror::Error;
use tracing::{debug, error, info, span, warn, Level};

use crate::merge::{merge_with_policy, SelectionPolicy};
use crate::node::deploy::{DeployError, PayloadLayout};
use crate::node::inspector::{NodeInspector, RetryPolicy, DEFAULT_DEBUGGER_PORT};
use crate::node::{find_node_processes, AttachTarget, NodeAttacher};
use crate::perf::{PerfConfig, PerfMode, PerfProcess, SamplerError};
use crate::profile::{ProfileData, RoundResult};
use crate::resources::{perf_path, ResourceLocator};
use crate::stop::StopEvent;

/// Which perfs to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfModeSelection {
    FramePointer,
    Dwarf,
    /// Both, picking the better one per process every round.
    Smart,
}

impl PerfModeSelection {
    /// In start order.
    pub fn modes(&self) -> Vec<PerfMode> {
        match self {
            PerfModeSelection::FramePointer => vec![PerfMode::FramePointer],
            PerfModeSelection::Dwarf => vec![PerfMode::Dwarf],
            PerfModeSelection::Smart => vec![PerfMode::FramePointer, PerfMode::Dwarf],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemProfilerConfig {
    pub frequency: u64,
    pub round_duration: Duration,
    /// Where perf writes its traces.
    pub storage_dir: PathBuf,
    pub perf_mode: PerfModeSelection,
    pub dwarf_stack_size: u32,
    pub inject_jit: bool,
    pub node_attach: bool,
    /// Where Node.js payloads are deployed, inside each target.
    pub payload_root: PathBuf,
    pub start_timeout: Duration,
    pub dump_timeout: Duration,
    pub discovery_retry: RetryPolicy,
    pub debugger_port: u16,
    /// Takes precedence over the bundled perf.
    pub perf_path: Option<PathBuf>,
    pub selection: SelectionPolicy,
}

impl Default for SystemProfilerConfig {
    fn default() -> Self {
        Self {
            frequency: 11,
            round_duration: Duration::from_secs(60),
            storage_dir: PathBuf::from("/tmp/perfweave"),
            perf_mode: PerfModeSelection::Smart,
            dwarf_stack_size: 8192,
            inject_jit: false,
            node_attach: false,
            payload_root: PathBuf::from("/tmp/perfweave_tmp"),
            start_timeout: Duration::from_secs(5),
            dump_timeout: Duration::from_secs(5),
            discovery_retry: RetryPolicy::default(),
            debugger_port: DEFAULT_DEBUGGER_PORT,
            perf_path: None,
            selection: SelectionPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("stop requested")]
    Stopped,
    #[error("no perf produced any output")]
    NoSamplingSourceAvailable,
    #[error("node.js attach unavailable: {0}")]
    NodePayload(#[from] DeployError),
}

type LinuxNodeAttacher = NodeAttacher<LinuxNamespaces, NodeInspector>;

/// Runs perf system wide in rounds, merging its modes' outputs and tagging
/// every process with its metadata.
pub struct SystemProfiler {
    config: SystemProfilerConfig,
    /// Frame pointer first, when present.
    perfs: Vec<PerfProcess>,
    node_attacher: Option<LinuxNodeAttacher>,
    node_targets: NodeTargets,
    metadata: MetadataProvider,
    stop_event: StopEvent,
    round_start: Instant,
}

impl SystemProfiler {
    pub fn new(
        config: SystemProfilerConfig,
        resources: &dyn ResourceLocator,
        stop_event: StopEvent,
    ) -> Result<Self, SnapshotError> {
        let perf_path = perf_path(resources, config.perf_path.as_deref());
        debug!("using perf at {}", perf_path.display());

        let perfs = config
            .perf_mode
            .modes()
            .into_iter()
            .map(|mode| {
                PerfProcess::new(
                    PerfConfig {
                        perf_path: perf_path.clone(),
                        mode,
                        frequency: config.frequency,
                        output_dir: config.storage_dir.clone(),
                        dwarf_stack_size: config.dwarf_stack_size,
                        inject_jit: config.inject_jit,
                        start_timeout: config.start_timeout,
                        dump_timeout: config.dump_timeout,
                    },
                    stop_event.clone(),
                )
            })
            .collect();

        let node_attacher = if config.node_attach {
            let layout = PayloadLayout::load(resources, &config.payload_root)?;
            info!("node.js attach enabled, payload build {}", layout.build());
            Some(NodeAttacher::new(
                LinuxNamespaces,
                NodeInspector::new(config.debugger_port),
                layout,
                config.discovery_retry,
            ))
        } else {
            None
        };

        Ok(SystemProfiler {
            config,
            perfs,
            node_attacher,
            node_targets: NodeTargets::default(),
            metadata: MetadataProvider::default(),
            stop_event,
            round_start: Instant::now(),
        })
    }

    /// Attaches to running Node.js processes and starts the perfs. Perfs that
    /// fail to start are dropped, it's only an error if none starts.
    pub fn start(&mut self) -> Result<(), SnapshotError> {
        self.refresh_node_targets();

        let mut stopped = false;
        for perf in self.perfs.iter_mut() {
            match perf.start() {
                Ok(()) => {}
                Err(SamplerError::Stopped) => stopped = true,
                Err(err) => error!("perf ({} mode) failed to start: {}", perf.mode(), err),
            }
        }
        if stopped {
            return Err(SnapshotError::Stopped);
        }

        self.perfs.retain_mut(|perf| perf.is_running());
        if self.perfs.is_empty() {
            return Err(SnapshotError::NoSamplingSourceAvailable);
        }
        self.round_start = Instant::now();
        Ok(())
    }

    /// Waits for the current round to end and returns its stacks.
    pub fn snapshot(&mut self) -> Result<RoundResult, SnapshotError> {
        let _span = span!(Level::DEBUG, "snapshot").entered();

        if self.stop_event.is_set() {
            return Err(SnapshotError::Stopped);
        }
        self.refresh_node_targets();

        let remaining = self
            .config
            .round_duration
            .saturating_sub(self.round_start.elapsed());
        if self.stop_event.wait(remaining) {
            return Err(SnapshotError::Stopped);
        }
        self.round_start = Instant::now();

        // Every perf rotates before any is collected, so all outputs cover the
        // same window.
        let mut rotated = Vec::with_capacity(self.perfs.len());
        for (index, perf) in self.perfs.iter_mut().enumerate() {
            if !perf.is_running() {
                error!("perf ({} mode) is no longer running", perf.mode());
                continue;
            }
            match perf.switch_output() {
                Ok(()) => rotated.push(index),
                Err(err) => error!("failed to rotate perf ({} mode): {}", perf.mode(), err),
            }
        }

        let mut fp_script = None;
        let mut dwarf_script = None;
        for index in rotated {
            let perf = &mut self.perfs[index];
            match perf.wait_and_script() {
                Ok(script) => match perf.mode() {
                    PerfMode::FramePointer => fp_script = Some(script),
                    PerfMode::Dwarf => dwarf_script = Some(script),
                },
                Err(SamplerError::Stopped) => return Err(SnapshotError::Stopped),
                Err(err) => error!("failed to collect perf ({} mode): {}", perf.mode(), err),
            }
        }
        if fp_script.is_none() && dwarf_script.is_none() {
            return Err(SnapshotError::NoSamplingSourceAvailable);
        }

        let stacks = merge_with_policy(
            fp_script.as_deref(),
            dwarf_script.as_deref(),
            &self.config.selection,
        );
        debug!("round has stacks for {} processes", stacks.len());

        let result: RoundResult = stacks
            .into_iter()
            .map(|(pid, stacks)| {
                let metadata = self.metadata.get_metadata(pid);
                (
                    pid,
                    ProfileData {
                        stacks,
                        app_id: None,
                        metadata,
                    },
                )
            })
            .collect();
        Ok(result)
    }

    /// Detaches from Node.js processes, then stops the perfs in reverse start
    /// order.
    pub fn stop(&mut self) {
        if let Some(attacher) = &self.node_attacher {
            for (process, target) in self.node_targets.attached.iter_mut() {
                if !process.is_running() {
                    continue;
                }
                match attacher.detach(target) {
                    Ok(()) => {}
                    Err(err) if err.is_no_such_process() => {
                        debug!("{} exited before detaching", process)
                    }
                    Err(err) => warn!("failed to detach from {}: {}", process, err),
                }
            }
        }
        self.node_targets.attached.clear();

        for perf in self.perfs.iter_mut().rev() {
            perf.stop();
        }
    }

    /// Forgets exited targets and attaches to new ones.
    fn refresh_node_targets(&mut self) {
        let Some(attacher) = &self.node_attacher else {
            return;
        };

        self.node_targets.forget_exited();

        let processes = match find_node_processes() {
            Ok(processes) => processes,
            Err(err) => {
                warn!("failed to list node.js processes: {}", err);
                return;
            }
        };

        for process in processes {
            if !self.node_targets.is_eligible(&process) {
                continue;
            }

            let attached = AttachTarget::discover(process, attacher.namespaces()).and_then(
                |mut target| {
                    attacher.attach(&mut target)?;
                    Ok(target)
                },
            );
            match attached {
                Ok(target) => {
                    self.node_targets.attached.insert(process, target);
                }
                Err(err) if err.is_no_such_process() => {
                    debug!("{} exited before attaching", process);
                }
                Err(err) => {
                    warn!("failed to attach to {}: {}", process, err);
                    self.node_targets.rejected.insert(process);
                }
            }
        }
    }
}

/// Node.js processes we are attached to, and the ones we gave up on.
#[derive(Default)]
struct NodeTargets {
    attached: HashMap<ProcessKey, AttachTarget>,
    /// Failed attaches. Not retried while that incarnation lives.
    rejected: HashSet<ProcessKey>,
}

impl NodeTargets {
    fn forget_exited(&mut self) {
        self.attached.retain(|process, _| process.is_running());
        self.rejected.retain(|process| process.is_running());
    }

    fn is_eligible(&self, process: &ProcessKey) -> bool {
        !self.attached.contains_key(process) && !self.rejected.contains(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::DirectoryResources;
    use tempfile::TempDir;

    #[test]
    fn test_mode_selection_order() {
        assert_eq!(
            PerfModeSelection::Smart.modes(),
            vec![PerfMode::FramePointer, PerfMode::Dwarf]
        );
        assert_eq!(PerfModeSelection::Dwarf.modes(), vec![PerfMode::Dwarf]);
    }

    #[test]
    fn test_defaults() {
        let config = SystemProfilerConfig::default();
        assert_eq!(config.frequency, 11);
        assert_eq!(config.round_duration, Duration::from_secs(60));
        assert_eq!(config.perf_mode, PerfModeSelection::Smart);
        assert_eq!(config.debugger_port, 9229);
        assert!(!config.node_attach);
    }

    fn profiler(storage: &TempDir, perf: &str) -> SystemProfiler {
        let config = SystemProfilerConfig {
            storage_dir: storage.path().to_path_buf(),
            perf_path: Some(PathBuf::from(perf)),
            ..Default::default()
        };
        SystemProfiler::new(
            config,
            &DirectoryResources::new(storage.path().to_path_buf()),
            StopEvent::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_no_perf_can_start() {
        let storage = TempDir::new().unwrap();
        let mut profiler = profiler(&storage, "/nonexistent/perf");
        assert!(matches!(
            profiler.start(),
            Err(SnapshotError::NoSamplingSourceAvailable)
        ));
        profiler.stop();
    }

    #[test]
    fn test_snapshot_after_stop_event() {
        let storage = TempDir::new().unwrap();
        let mut profiler = profiler(&storage, "/nonexistent/perf");
        profiler.stop_event.set();
        assert!(matches!(profiler.snapshot(), Err(SnapshotError::Stopped)));
    }

    #[test]
    fn test_default_discovery_retry() {
        let retry = SystemProfilerConfig::default().discovery_retry;
        assert_eq!(retry.attempts, 5);
        assert_eq!(retry.delay, Duration::from_secs(1));
    }

    #[test]
    fn test_rejected_process_is_skipped_while_it_lives() {
        let own = ProcessKey::for_pid(std::process::id() as i32).unwrap();
        let mut targets = NodeTargets::default();
        assert!(targets.is_eligible(&own));

        targets.rejected.insert(own);
        targets.forget_exited();
        assert!(!targets.is_eligible(&own));

        // Same pid, new incarnation.
        let restarted = ProcessKey {
            start_time: own.start_time.wrapping_add(1),
            ..own
        };
        assert!(targets.is_eligible(&restarted));

        // Gone processes are forgotten.
        targets.rejected.insert(restarted);
        targets.forget_exited();
        assert!(!targets.rejected.contains(&restarted));
        assert!(targets.rejected.contains(&own));
    }

    #[test]
    fn test_node_attach_needs_payload() {
        let storage = TempDir::new().unwrap();
        let config = SystemProfilerConfig {
            node_attach: true,
            ..Default::default()
        };
        let result = SystemProfiler::new(
            config,
            &DirectoryResources::new(storage.path().to_path_buf()),
            StopEvent::new(),
        );
        assert!(matches!(result, Err(SnapshotError::NodePayload(_))));
    }
}
