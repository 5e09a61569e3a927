use std::collections::VecDeque;
use std::ffi::OsStr;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid as NixPid;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::stop::StopEvent;
use crate::util::{find_by_prefix, wait_for_file, wait_for_file_by_prefix, WaitError, POLL_INTERVAL};

/// Bytes of perf's stdout and stderr kept around for diagnostics.
const CAPTURE_LIMIT: usize = 64 * 1024;
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PerfMode {
    FramePointer,
    Dwarf,
}

impl PerfMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerfMode::FramePointer => "fp",
            PerfMode::Dwarf => "dwarf",
        }
    }

    /// Pages passed to `-m`. perf would otherwise size its buffers from
    /// `perf_event_mlock_kb` and use all of it. DWARF samples carry a copy of
    /// the stack so they get twice as much.
    pub fn mmap_pages(&self) -> u32 {
        match self {
            PerfMode::FramePointer => 129,
            PerfMode::Dwarf => 257,
        }
    }
}

impl Display for PerfMode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("perf ({mode}) did not create its output within {timeout:?}\nstdout: {stdout}\nstderr: {stderr}")]
    StartTimeout {
        mode: PerfMode,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },
    #[error("perf ({mode}) did not dump its output within {timeout:?}\nstdout: {stdout}\nstderr: {stderr}")]
    DumpTimeout {
        mode: PerfMode,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },
    #[error("`{command}` failed with {status}\nstderr: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("failed to run `{command}`: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("failed to signal perf: {0}")]
    Signal(#[from] nix::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("perf ({mode}) is not running, it is {state}")]
    NotRunning { mode: PerfMode, state: &'static str },
    #[error("stop requested")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PerfConfig {
    pub perf_path: PathBuf,
    pub mode: PerfMode,
    pub frequency: u64,
    pub output_dir: PathBuf,
    pub dwarf_stack_size: u32,
    /// Merge JIT symbols written by runtimes into the trace before scripting.
    /// Only honoured for frame pointer mode.
    pub inject_jit: bool,
    pub start_timeout: Duration,
    pub dump_timeout: Duration,
}

/// Last bytes written by the child on one of its pipes. A reader thread keeps
/// draining the pipe so perf never blocks writing to it.
struct CapturedOutput {
    buffer: Arc<Mutex<VecDeque<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl CapturedOutput {
    fn spawn<R: Read + Send + 'static>(name: &str, mut pipe: R) -> io::Result<Self> {
        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(CAPTURE_LIMIT)));
        let sink = buffer.clone();
        let reader = thread::Builder::new()
            .name(format!("perf-{}", name))
            .spawn(move || {
                let mut chunk = [0u8; 4096];
                loop {
                    let read = match pipe.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(read) => read,
                    };
                    if let Ok(mut buffer) = sink.lock() {
                        buffer.extend(&chunk[..read]);
                        let excess = buffer.len().saturating_sub(CAPTURE_LIMIT);
                        buffer.drain(..excess);
                    }
                }
            })?;

        Ok(CapturedOutput {
            buffer,
            reader: Some(reader),
        })
    }

    fn snapshot(&self) -> String {
        match self.buffer.lock() {
            Ok(buffer) => {
                let (head, tail) = buffer.as_slices();
                let mut bytes = head.to_vec();
                bytes.extend_from_slice(tail);
                String::from_utf8_lossy(&bytes).into_owned()
            }
            Err(_) => String::new(),
        }
    }

    fn join(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

struct RunningPerf {
    child: Child,
    stdout: CapturedOutput,
    stderr: CapturedOutput,
}

enum PerfState {
    Idle,
    Running(RunningPerf),
    Stopped,
}

impl PerfState {
    fn name(&self) -> &'static str {
        match self {
            PerfState::Idle => "idle",
            PerfState::Running(_) => "running",
            PerfState::Stopped => "stopped",
        }
    }
}

/// One `perf record` subprocess writing rotating trace files.
pub struct PerfProcess {
    config: PerfConfig,
    output_path: PathBuf,
    stop_event: StopEvent,
    state: PerfState,
}

impl PerfProcess {
    pub fn new(mut config: PerfConfig, stop_event: StopEvent) -> Self {
        if config.inject_jit && config.mode == PerfMode::Dwarf {
            warn!("JIT injection is not supported with DWARF unwinding, disabling it");
            config.inject_jit = false;
        }
        let output_path = config.output_dir.join(format!("perf.{}", config.mode));
        PerfProcess {
            config,
            output_path,
            stop_event,
            state: PerfState::Idle,
        }
    }

    pub fn mode(&self) -> PerfMode {
        self.config.mode
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub(crate) fn record_args(&self) -> Vec<String> {
        let mut args = vec![
            "record".to_string(),
            "-F".to_string(),
            self.config.frequency.to_string(),
            "-a".to_string(),
            "-g".to_string(),
            "-o".to_string(),
            self.output_path.to_string_lossy().into_owned(),
            "--switch-output=signal".to_string(),
            "-m".to_string(),
            self.config.mode.mmap_pages().to_string(),
        ];
        if self.config.mode == PerfMode::Dwarf {
            args.push("--call-graph".to_string());
            args.push(format!("dwarf,{}", self.config.dwarf_stack_size));
        }
        if self.config.inject_jit {
            // `perf inject --jit` needs monotonic timestamps.
            args.push("-k".to_string());
            args.push("1".to_string());
        }
        args
    }

    fn output_prefix(&self) -> String {
        let name = self
            .output_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}.", name)
    }

    /// Removes traces left behind by a previous run so they aren't mistaken for
    /// ours.
    fn remove_stale_outputs(&self) -> io::Result<()> {
        let prefix = self.output_prefix();
        for entry in fs::read_dir(&self.config.output_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.path() == self.output_path || name.starts_with(&prefix) {
                debug!("removing stale perf output {}", entry.path().display());
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Launches perf and waits for it to create its output file.
    pub fn start(&mut self) -> Result<(), SamplerError> {
        if matches!(self.state, PerfState::Running(_)) {
            warn!("perf ({} mode) is already running", self.config.mode);
            return Ok(());
        }

        info!("starting perf ({} mode)", self.config.mode);
        fs::create_dir_all(&self.config.output_dir)?;
        self.remove_stale_outputs()?;

        let args = self.record_args();
        let mut command = Command::new(&self.config.perf_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so a terminal's Ctrl+C reaches us and not perf.
            .process_group(0);
        debug!("running {} {}", self.config.perf_path.display(), args.join(" "));

        let mut child = command.spawn().map_err(|e| SamplerError::Spawn {
            command: self.config.perf_path.display().to_string(),
            source: e,
        })?;
        let (stdout, stderr) = match capture_pipes(&mut child, CapturedOutput::spawn) {
            Ok(captured) => captured,
            Err(err) => {
                terminate(&mut child);
                return Err(err.into());
            }
        };
        self.state = PerfState::Running(RunningPerf {
            child,
            stdout,
            stderr,
        });

        match wait_for_file(
            &self.output_path,
            self.config.start_timeout,
            &self.stop_event,
        ) {
            Ok(()) => {
                info!("started perf ({} mode)", self.config.mode);
                Ok(())
            }
            Err(WaitError::Stopped) => {
                self.stop();
                Err(SamplerError::Stopped)
            }
            Err(err) => {
                let (stdout, stderr) = self.terminate_and_capture();
                error!(
                    "perf ({} mode) failed to start ({}). stdout {:?} stderr {:?}",
                    self.config.mode, err, stdout, stderr
                );
                Err(SamplerError::StartTimeout {
                    mode: self.config.mode,
                    timeout: self.config.start_timeout,
                    stdout,
                    stderr,
                })
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        match &mut self.state {
            PerfState::Running(running) => matches!(running.child.try_wait(), Ok(None)),
            _ => false,
        }
    }

    /// Asks perf to close the current trace and start a new one. Traces still
    /// on disk belong to windows that were given up on, they are discarded.
    pub fn switch_output(&mut self) -> Result<(), SamplerError> {
        let mode = self.config.mode;
        let pid = match &mut self.state {
            PerfState::Running(running) => match running.child.try_wait() {
                Ok(None) => NixPid::from_raw(running.child.id() as i32),
                _ => {
                    return Err(SamplerError::NotRunning {
                        mode,
                        state: "exited",
                    })
                }
            },
            other => {
                return Err(SamplerError::NotRunning {
                    mode,
                    state: other.name(),
                })
            }
        };

        for late in find_by_prefix(&self.config.output_dir, &self.output_prefix())? {
            warn!("discarding late perf ({} mode) trace {}", mode, late.display());
            remove_intermediate(&late);
        }
        kill(pid, Signal::SIGUSR2)?;
        Ok(())
    }

    /// Waits for the trace closed by the last rotation and converts it to
    /// `perf script` text. Intermediate files are removed either way.
    pub fn wait_and_script(&mut self) -> Result<String, SamplerError> {
        let trace = match wait_for_file_by_prefix(
            &self.config.output_dir,
            &self.output_prefix(),
            self.config.dump_timeout,
            &self.stop_event,
        ) {
            Ok(trace) => trace,
            Err(WaitError::Stopped) => return Err(SamplerError::Stopped),
            Err(err) => {
                let (stdout, stderr) = self.captured_output();
                error!(
                    "perf ({} mode) failed to dump output ({}). stdout {:?} stderr {:?}",
                    self.config.mode, err, stdout, stderr
                );
                return Err(SamplerError::DumpTimeout {
                    mode: self.config.mode,
                    timeout: self.config.dump_timeout,
                    stdout,
                    stderr,
                });
            }
        };
        debug!("perf ({} mode) rotated to {}", self.config.mode, trace.display());

        let inject_path = PathBuf::from(format!("{}.inject", trace.display()));
        let result = self.script_trace(&trace, &inject_path);

        for intermediate in [&trace, &inject_path] {
            remove_intermediate(intermediate);
        }

        result
    }

    fn script_trace(&self, trace: &Path, inject_path: &Path) -> Result<String, SamplerError> {
        let mut input = trace;
        if self.config.inject_jit {
            self.run_perf(&[
                OsStr::new("inject"),
                OsStr::new("--jit"),
                OsStr::new("-o"),
                inject_path.as_os_str(),
                OsStr::new("-i"),
                trace.as_os_str(),
            ])?;
            input = inject_path;
        }

        let stdout = self.run_perf(&[
            OsStr::new("script"),
            OsStr::new("-F"),
            OsStr::new("+pid"),
            OsStr::new("-i"),
            input.as_os_str(),
        ])?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    fn run_perf(&self, args: &[&OsStr]) -> Result<Vec<u8>, SamplerError> {
        let command = format!(
            "{} {}",
            self.config.perf_path.display(),
            args.iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        let output = Command::new(&self.config.perf_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SamplerError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(SamplerError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output.stdout)
    }

    fn captured_output(&self) -> (String, String) {
        match &self.state {
            PerfState::Running(running) => (running.stdout.snapshot(), running.stderr.snapshot()),
            _ => (String::new(), String::new()),
        }
    }

    fn terminate_and_capture(&mut self) -> (String, String) {
        let PerfState::Running(mut running) = std::mem::replace(&mut self.state, PerfState::Stopped)
        else {
            return (String::new(), String::new());
        };
        terminate(&mut running.child);
        running.stdout.join();
        running.stderr.join();
        (running.stdout.snapshot(), running.stderr.snapshot())
    }

    /// Terminates perf and reaps it. Does nothing if it isn't running.
    pub fn stop(&mut self) {
        if !matches!(self.state, PerfState::Running(_)) {
            return;
        }
        self.terminate_and_capture();
        info!("stopped perf ({} mode)", self.config.mode);
    }
}

impl Drop for PerfProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn remove_intermediate(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {}: {}", path.display(), e),
    }
}

/// Starts draining the child's stdout and stderr.
fn capture_pipes<F>(child: &mut Child, mut spawn: F) -> io::Result<(CapturedOutput, CapturedOutput)>
where
    F: FnMut(&str, Box<dyn Read + Send>) -> io::Result<CapturedOutput>,
{
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(io::Error::other("perf pipes unavailable"));
    };
    let stdout = spawn("stdout", Box::new(stdout))?;
    let stderr = spawn("stderr", Box::new(stderr))?;
    Ok((stdout, stderr))
}

/// Signals the child's process group, or just the child if it has none.
fn signal_group(child: &Child, signal: Signal) {
    let pid = NixPid::from_raw(child.id() as i32);
    if killpg(pid, signal).is_err() {
        let _ = kill(pid, signal);
    }
}

/// SIGTERM to the whole process group, SIGKILL if it lingers. Once the child
/// is reaped its pid may belong to someone else, so it is never signalled
/// after that.
fn terminate(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    signal_group(child, Signal::SIGTERM);
    let deadline = Instant::now() + STOP_TIMEOUT;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }

    // Not reaped yet, so the pid is still ours.
    warn!("perf did not exit after SIGTERM, killing it");
    signal_group(child, Signal::SIGKILL);
    let _ = child.wait();
}
