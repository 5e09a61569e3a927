use std::fmt::{self, Display, Formatter};
use std::fs::{self, File};
use std::io;
use std::thread;

use nix::sched::{setns, unshare, CloneFlags};
use thiserror::Error;
use tracing::debug;

use crate::process::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
    Pid,
    Mount,
    Net,
}

impl NamespaceKind {
    /// Name of the namespace under `/proc/<pid>/ns/`.
    pub fn proc_name(&self) -> &'static str {
        match self {
            NamespaceKind::Pid => "pid",
            NamespaceKind::Mount => "mnt",
            NamespaceKind::Net => "net",
        }
    }

    fn clone_flag(&self) -> CloneFlags {
        match self {
            NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
            NamespaceKind::Net => CloneFlags::CLONE_NEWNET,
        }
    }
}

impl Display for NamespaceKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("process {0} does not exist")]
    NoSuchProcess(Pid),
    #[error("failed to open {kind} namespace of process {pid}: {source}")]
    Open {
        pid: Pid,
        kind: NamespaceKind,
        source: io::Error,
    },
    #[error("failed to enter {kind} namespace of process {pid}: {source}")]
    Enter {
        pid: Pid,
        kind: NamespaceKind,
        source: nix::Error,
    },
    #[error("operation running in the namespaces of process {0} panicked")]
    Panicked(Pid),
}

/// Runs code inside (a subset of) the namespaces of another process.
///
/// Implementations must not leak the namespace switch to the caller: once
/// `run_in_namespaces` returns, the calling thread is where it was before.
pub trait NamespaceRunner {
    fn run_in_namespaces<T, F>(
        &self,
        pid: Pid,
        kinds: &[NamespaceKind],
        operation: F,
    ) -> Result<T, NamespaceError>
    where
        F: FnOnce() -> T + Send,
        T: Send;
}

/// Enters namespaces with `setns(2)` from a dedicated, short lived thread.
///
/// Namespaces the target already shares with us are skipped, which also means
/// no privileges are needed to "enter" our own namespaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxNamespaces;

impl LinuxNamespaces {
    fn open_foreign_namespaces(
        pid: Pid,
        kinds: &[NamespaceKind],
    ) -> Result<Vec<(NamespaceKind, File)>, NamespaceError> {
        let mut namespaces = Vec::with_capacity(kinds.len());

        for kind in kinds {
            let target = format!("/proc/{}/ns/{}", pid, kind.proc_name());
            let target_link = fs::read_link(&target).map_err(|e| open_error(pid, *kind, e))?;
            let own_link = fs::read_link(format!("/proc/self/ns/{}", kind.proc_name()))
                .map_err(|e| open_error(pid, *kind, e))?;
            if target_link == own_link {
                continue;
            }

            let file = File::open(&target).map_err(|e| open_error(pid, *kind, e))?;
            namespaces.push((*kind, file));
        }

        Ok(namespaces)
    }
}

fn open_error(pid: Pid, kind: NamespaceKind, err: io::Error) -> NamespaceError {
    if err.kind() == io::ErrorKind::NotFound {
        NamespaceError::NoSuchProcess(pid)
    } else {
        NamespaceError::Open {
            pid,
            kind,
            source: err,
        }
    }
}

impl NamespaceRunner for LinuxNamespaces {
    fn run_in_namespaces<T, F>(
        &self,
        pid: Pid,
        kinds: &[NamespaceKind],
        operation: F,
    ) -> Result<T, NamespaceError>
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        // Open the namespace files from our own mount namespace, the target's
        // /proc might not show its own pid.
        let namespaces = Self::open_foreign_namespaces(pid, kinds)?;
        debug!(
            "running in {} foreign namespaces of process {}",
            namespaces.len(),
            pid
        );

        thread::scope(|scope| {
            let handle = scope.spawn(move || -> Result<T, NamespaceError> {
                // A thread sharing its filesystem attributes can't switch mount
                // namespaces.
                if namespaces
                    .iter()
                    .any(|(kind, _)| *kind == NamespaceKind::Mount)
                {
                    unshare(CloneFlags::CLONE_FS).map_err(|e| NamespaceError::Enter {
                        pid,
                        kind: NamespaceKind::Mount,
                        source: e,
                    })?;
                }

                for (kind, file) in &namespaces {
                    setns(file, kind.clone_flag()).map_err(|e| NamespaceError::Enter {
                        pid,
                        kind: *kind,
                        source: e,
                    })?;
                }

                Ok(operation())
            });

            handle
                .join()
                .map_err(|_| NamespaceError::Panicked(pid))?
        })
    }
}
