use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use perfweave::profiler::{PerfModeSelection, SystemProfilerConfig};

use crate::validators::dwarf_stack_size_in_range;
use crate::validators::parse_duration;
use crate::validators::sample_freq_in_range;

#[derive(clap::ValueEnum, Debug, Clone, Default)]
pub(crate) enum LoggingLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(PartialEq, clap::ValueEnum, Debug, Clone, Copy, Default)]
pub(crate) enum PerfModeArg {
    /// Frame pointer unwinding only
    Fp,
    /// DWARF unwinding only
    Dwarf,
    /// Both, keeping the better one for each process
    #[default]
    Smart,
}

impl From<PerfModeArg> for PerfModeSelection {
    fn from(mode: PerfModeArg) -> Self {
        match mode {
            PerfModeArg::Fp => PerfModeSelection::FramePointer,
            PerfModeArg::Dwarf => PerfModeSelection::Dwarf,
            PerfModeArg::Smart => PerfModeSelection::Smart,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "System wide profiler built on perf")]
pub(crate) struct CliArgs {
    /// How long this agent will run in seconds
    #[arg(short = 'D', long, default_value = u64::MAX.to_string(),
        value_parser = parse_duration)]
    pub(crate) duration: Duration,
    /// Length of each sampling round in seconds
    #[arg(long, default_value = SystemProfilerConfig::default().round_duration.as_secs().to_string(),
        value_parser = parse_duration)]
    pub(crate) round_duration: Duration,
    /// Set perfweave's logging level
    #[arg(long, default_value_t, value_enum)]
    pub(crate) logging: LoggingLevel,
    // Verification for this option guarantees the only possible selections
    // are prime numbers up to and including 1009
    /// Per-CPU Sampling Frequency in Hz
    #[arg(long, default_value_t = SystemProfilerConfig::default().frequency, value_name = "FREQUENCY_IN_HZ",
      value_parser = sample_freq_in_range,
    )]
    pub(crate) frequency: u64,
    /// Which perf unwinding modes to run
    #[arg(long, default_value_t, value_enum)]
    pub(crate) perf_mode: PerfModeArg,
    /// Bytes of stack copied with every DWARF sample
    #[arg(long, default_value_t = SystemProfilerConfig::default().dwarf_stack_size,
        value_parser = dwarf_stack_size_in_range)]
    pub(crate) perf_dwarf_stack_size: u32,
    /// Merge JIT symbols emitted by runtimes into frame pointer traces
    #[arg(long)]
    pub(crate) perf_inject: bool,
    /// Attach to running Node.js processes so their JIT frames get symbols
    #[arg(long)]
    pub(crate) perf_node_attach: bool,
    /// Directory with the bundled perf binary and Node.js payload. Defaults to
    /// `resources/` next to the executable
    #[arg(long)]
    pub(crate) resources_dir: Option<PathBuf>,
    /// perf binary to use instead of the bundled one
    #[arg(long)]
    pub(crate) perf_path: Option<PathBuf>,
    /// Where perf writes its traces
    #[arg(long, default_value = SystemProfilerConfig::default().storage_dir.into_os_string())]
    pub(crate) storage_dir: PathBuf,
    /// Print each round's stacks in collapsed format
    #[arg(long)]
    pub(crate) print_stacks: bool,
    /// Override the default path to the killswitch file (/tmp/perfweave/killswitch) which prevents the profiler from starting
    #[arg(long)]
    pub(crate) killswitch_path_override: Option<String>,
    /// Force the profiler to start even if the system killswitch is enabled
    #[arg(long)]
    pub(crate) unsafe_start: bool,
}

impl CliArgs {
    pub(crate) fn profiler_config(&self) -> SystemProfilerConfig {
        SystemProfilerConfig {
            frequency: self.frequency,
            round_duration: self.round_duration,
            storage_dir: self.storage_dir.clone(),
            perf_mode: self.perf_mode.into(),
            dwarf_stack_size: self.perf_dwarf_stack_size,
            inject_jit: self.perf_inject,
            node_attach: self.perf_node_attach,
            perf_path: self.perf_path.clone(),
            ..Default::default()
        }
    }
}
