//! Live attach to Node.js processes.
//!
//! Node only emits symbols for its JIT-compiled code when asked to from the
//! inside. We drop a small module into the target's mount namespace, open the
//! target's inspector with SIGUSR1 and tell the module to start writing
//! `/tmp/perf-<pid>.map`, which perf picks up when symbolizing.

pub mod deploy;
pub mod inspector;

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use perfweave_metadata::namespace::{NamespaceError, NamespaceKind, NamespaceRunner};
use perfweave_metadata::process::{
    find_processes, libc_flavor, nspid, pid_namespace_link, LibcFlavor, ProcessError, ProcessKey,
};
use perfweave_metadata::types::MetadataError;
use perfweave_metadata::version::{exe_version, major_version};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::node::deploy::{deploy, DeployError, PayloadLayout};
use crate::node::inspector::{
    control_module, discover_debugger_url, validate_target, Inspector, ModuleAction, RetryPolicy,
};
use crate::profile::Pid;

const VERSION_TIMEOUT: Duration = Duration::from_secs(3);

/// The inspector conversation happens on the target's loopback interface and
/// loads files from the target's filesystem.
const SESSION_NAMESPACES: [NamespaceKind; 2] = [NamespaceKind::Mount, NamespaceKind::Net];

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("debugger endpoint not found after {attempts} attempts: {last_failure}")]
    DebuggerEndpointNotFound { attempts: u32, last_failure: String },
    #[error("unexpected debugger response: {0}")]
    UnexpectedProtocolResponse(String),
    #[error("connected to the wrong process, expected {expected} but got {actual}")]
    WrongTargetProcess { expected: String, actual: String },
    #[error("process {0} does not exist")]
    NoSuchProcess(Pid),
    #[error("unrecognized node version {0:?}")]
    UnknownVersion(String),
    #[error("failed to signal process: {0}")]
    Signal(nix::Error),
    #[error("debugger discovery failed: {0}")]
    Http(String),
    #[error("debugger session failed: {0}")]
    WebSocket(String),
    #[error("can't go from {from} to {to}")]
    InvalidTransition { from: AttachState, to: AttachState },
    #[error(transparent)]
    Deploy(#[from] DeployError),
    #[error(transparent)]
    Namespace(NamespaceError),
    #[error(transparent)]
    Metadata(MetadataError),
    #[error(transparent)]
    Process(ProcessError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl AttachError {
    /// The target went away under us, nothing to report.
    pub fn is_no_such_process(&self) -> bool {
        matches!(self, AttachError::NoSuchProcess(_))
    }
}

impl From<ProcessError> for AttachError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::NoSuchProcess(pid) => AttachError::NoSuchProcess(pid),
            other => AttachError::Process(other),
        }
    }
}

impl From<NamespaceError> for AttachError {
    fn from(err: NamespaceError) -> Self {
        match err {
            NamespaceError::NoSuchProcess(pid) => AttachError::NoSuchProcess(pid),
            other => AttachError::Namespace(other),
        }
    }
}

impl From<MetadataError> for AttachError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NoSuchProcess(pid) => AttachError::NoSuchProcess(pid),
            other => AttachError::Metadata(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Unattached,
    Deploying,
    Attached,
    Detaching,
    Failed,
}

impl AttachState {
    pub fn can_transition_to(&self, next: AttachState) -> bool {
        use AttachState::*;
        matches!(
            (self, next),
            (Unattached, Deploying)
                | (Deploying, Attached)
                | (Deploying, Failed)
                | (Attached, Detaching)
                | (Attached, Failed)
                | (Detaching, Unattached)
                | (Detaching, Failed)
        )
    }
}

impl Display for AttachState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            AttachState::Unattached => "unattached",
            AttachState::Deploying => "deploying",
            AttachState::Attached => "attached",
            AttachState::Detaching => "detaching",
            AttachState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A Node.js process under live instrumentation.
///
/// The pid namespace identity is captured once, when the target is
/// discovered. It is checked again on every attach, a target whose namespace
/// changed since is never trusted.
#[derive(Debug, Clone)]
pub struct AttachTarget {
    pub process: ProcessKey,
    pub nspid: Pid,
    pub ns_link: String,
    pub libc: LibcFlavor,
    pub major_version: String,
    /// Deployed payload, as seen from inside the target.
    pub module_path: Option<PathBuf>,
    state: AttachState,
}

impl AttachTarget {
    pub fn new(
        process: ProcessKey,
        nspid: Pid,
        ns_link: String,
        libc: LibcFlavor,
        major_version: String,
    ) -> Self {
        AttachTarget {
            process,
            nspid,
            ns_link,
            libc,
            major_version,
            module_path: None,
            state: AttachState::Unattached,
        }
    }

    pub fn discover<N: NamespaceRunner>(
        process: ProcessKey,
        namespaces: &N,
    ) -> Result<Self, AttachError> {
        let pid = process.pid;
        let nspid = nspid(pid)?;
        let ns_link = pid_namespace_link(pid)?;
        let libc = libc_flavor(pid)?;
        let version = exe_version(namespaces, pid, VERSION_TIMEOUT)?;
        let major_version =
            major_version(&version).ok_or_else(|| AttachError::UnknownVersion(version.clone()))?;

        Ok(Self::new(process, nspid, ns_link, libc, major_version))
    }

    pub fn state(&self) -> AttachState {
        self.state
    }

    fn transition(&mut self, next: AttachState) -> Result<(), AttachError> {
        if !self.state.can_transition_to(next) {
            return Err(AttachError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("{}: {} -> {}", self.process, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Runs `step`, leaving the target `Failed` when it fails.
    fn settle<T>(
        &mut self,
        step: impl FnOnce(&mut Self) -> Result<T, AttachError>,
        success: AttachState,
    ) -> Result<T, AttachError> {
        match step(self) {
            Ok(value) => {
                self.transition(success)?;
                Ok(value)
            }
            Err(err) => {
                self.transition(AttachState::Failed)?;
                Err(err)
            }
        }
    }
}

/// Symbol map the payload writes, as seen from inside the target.
pub fn perf_map_path(nspid: Pid) -> PathBuf {
    PathBuf::from(format!("/tmp/perf-{}.map", nspid))
}

/// Running processes that look like Node.js.
pub fn find_node_processes() -> Result<Vec<ProcessKey>, ProcessError> {
    find_processes(|exe| {
        exe.file_name()
            .is_some_and(|name| name.to_string_lossy().contains("node"))
    })
}

pub struct NodeAttacher<N, I> {
    namespaces: N,
    inspector: I,
    layout: PayloadLayout,
    retry: RetryPolicy,
}

impl<N: NamespaceRunner, I: Inspector> NodeAttacher<N, I> {
    pub fn new(namespaces: N, inspector: I, layout: PayloadLayout, retry: RetryPolicy) -> Self {
        NodeAttacher {
            namespaces,
            inspector,
            layout,
            retry,
        }
    }

    pub fn namespaces(&self) -> &N {
        &self.namespaces
    }

    /// Deploys the payload into the target and starts it.
    #[instrument(skip_all, fields(pid = target.process.pid))]
    pub fn attach(&self, target: &mut AttachTarget) -> Result<(), AttachError> {
        target.transition(AttachState::Deploying)?;
        target.settle(|target| self.deploy_and_start(target), AttachState::Attached)?;
        info!("attached to node process {}", target.process);
        Ok(())
    }

    fn deploy_and_start(&self, target: &mut AttachTarget) -> Result<(), AttachError> {
        let pid = target.process.pid;
        if !target.process.is_running() {
            return Err(AttachError::NoSuchProcess(pid));
        }
        // Checked before signalling, SIGUSR1 kills processes that aren't Node.
        let live_link = pid_namespace_link(pid)?;
        if live_link != target.ns_link {
            return Err(AttachError::WrongTargetProcess {
                expected: target.ns_link.clone(),
                actual: live_link,
            });
        }

        let outcome = deploy(&self.layout, pid, target.libc, &target.major_version)?;
        target.module_path = Some(outcome.path_in_namespace.clone());

        self.inspector.open_endpoint(pid)?;
        self.in_session(target, &outcome.path_in_namespace, ModuleAction::Start)
    }

    /// Stops the payload and removes the symbol map it wrote. The map is
    /// removed even if stopping fails.
    #[instrument(skip_all, fields(pid = target.process.pid))]
    pub fn detach(&self, target: &mut AttachTarget) -> Result<(), AttachError> {
        target.transition(AttachState::Detaching)?;
        target.settle(|target| self.stop_and_clean(target), AttachState::Unattached)?;
        info!("detached from node process {}", target.process);
        Ok(())
    }

    fn stop_and_clean(&self, target: &mut AttachTarget) -> Result<(), AttachError> {
        let module_path = target
            .module_path
            .clone()
            .unwrap_or_else(|| self.layout.destination_in_namespace(target.libc, &target.major_version));
        let stopped = self.in_session(target, &module_path, ModuleAction::Stop);

        let map = perf_map_path(target.nspid);
        let removed = self
            .namespaces
            .run_in_namespaces(target.process.pid, &[NamespaceKind::Mount], || {
                match fs::remove_file(&map) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                }
            });

        stopped?;
        removed??;
        Ok(())
    }

    /// A fresh discovery and session per call, the endpoint may have gone away
    /// since the last one.
    fn in_session(
        &self,
        target: &AttachTarget,
        module_path: &Path,
        action: ModuleAction,
    ) -> Result<(), AttachError> {
        let inspector = &self.inspector;
        let retry = &self.retry;
        let nspid = target.nspid;
        let ns_link = target.ns_link.as_str();
        let module_dir = module_path.to_string_lossy();

        self.namespaces
            .run_in_namespaces(target.process.pid, &SESSION_NAMESPACES, || {
                let url = discover_debugger_url(inspector, retry)?;
                debug!("debugger endpoint at {}", url);
                let mut session = inspector.connect(&url)?;
                validate_target(session.as_mut(), nspid, ns_link)?;
                control_module(session.as_mut(), &module_dir, action)
            })?
    }
}
