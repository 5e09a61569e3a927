use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use procfs::process::{all_processes, MMapPath, Process};
use procfs::ProcError;
use thiserror::Error;

pub type Pid = i32;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process {0} does not exist")]
    NoSuchProcess(Pid),
    #[error("failed to read procfs for process {pid}: {source}")]
    Io { pid: Pid, source: io::Error },
    #[error("procfs error for process {pid}: {reason}")]
    Procfs { pid: Pid, reason: String },
}

impl ProcessError {
    pub(crate) fn from_proc(pid: Pid, err: ProcError) -> Self {
        match err {
            ProcError::NotFound(_) => ProcessError::NoSuchProcess(pid),
            other => ProcessError::Procfs {
                pid,
                reason: other.to_string(),
            },
        }
    }

    pub(crate) fn from_io(pid: Pid, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            ProcessError::NoSuchProcess(pid)
        } else {
            ProcessError::Io { pid, source: err }
        }
    }
}

/// Identifies one incarnation of a process. Pids are recycled by the kernel,
/// the start time (in clock ticks since boot) tells incarnations apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessKey {
    pub pid: Pid,
    pub start_time: u64,
}

impl ProcessKey {
    pub fn for_pid(pid: Pid) -> Result<Self, ProcessError> {
        let stat = Process::new(pid)
            .and_then(|process| process.stat())
            .map_err(|e| ProcessError::from_proc(pid, e))?;
        Ok(ProcessKey {
            pid,
            start_time: stat.starttime,
        })
    }

    /// Whether this exact incarnation is still alive. Zombies count as gone.
    pub fn is_running(&self) -> bool {
        match Process::new(self.pid).and_then(|process| process.stat()) {
            Ok(stat) => stat.starttime == self.start_time && stat.state != 'Z',
            Err(_) => false,
        }
    }
}

impl Display for ProcessKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "pid={}, start_time={}", self.pid, self.start_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibcFlavor {
    Glibc,
    Musl,
}

impl LibcFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibcFlavor::Glibc => "glibc",
            LibcFlavor::Musl => "musl",
        }
    }
}

impl Display for LibcFlavor {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pid of the process as seen from its innermost pid namespace.
pub fn nspid(pid: Pid) -> Result<Pid, ProcessError> {
    let status = Process::new(pid)
        .and_then(|process| process.status())
        .map_err(|e| ProcessError::from_proc(pid, e))?;
    // Kernels older than 4.1 don't report NSpid, there are no nested pids then.
    Ok(status
        .nspid
        .and_then(|nspids| nspids.last().copied())
        .unwrap_or(pid))
}

/// The pid namespace link, e.g. `pid:[4026531836]`. Two processes share a pid
/// namespace iff their links are equal.
pub fn pid_namespace_link(pid: Pid) -> Result<String, ProcessError> {
    let link = fs::read_link(format!("/proc/{}/ns/pid", pid))
        .map_err(|e| ProcessError::from_io(pid, e))?;
    Ok(link.to_string_lossy().into_owned())
}

/// Path of the executable as seen from inside the process' mount namespace.
pub fn exe_path(pid: Pid) -> Result<PathBuf, ProcessError> {
    fs::read_link(format!("/proc/{}/exe", pid)).map_err(|e| ProcessError::from_io(pid, e))
}

pub fn exe_basename(pid: Pid) -> Result<String, ProcessError> {
    let exe = exe_path(pid)?;
    Ok(exe
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default())
}

/// Path to reach a process' executable from our mount namespace.
pub fn proc_exe(pid: Pid) -> PathBuf {
    PathBuf::from(format!("/proc/{}/exe", pid))
}

/// Root of the process' mount namespace, reachable from ours.
pub fn proc_root(pid: Pid) -> PathBuf {
    PathBuf::from(format!("/proc/{}/root", pid))
}

fn is_musl_library(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy())
        .is_some_and(|name| name.starts_with("ld-musl") || name.starts_with("libc.musl"))
}

/// Which C library the process has loaded, judging by its memory mappings.
pub fn libc_flavor(pid: Pid) -> Result<LibcFlavor, ProcessError> {
    let maps = Process::new(pid)
        .and_then(|process| process.maps())
        .map_err(|e| ProcessError::from_proc(pid, e))?;

    let musl = maps.iter().any(|map| match &map.pathname {
        MMapPath::Path(path) => is_musl_library(path),
        _ => false,
    });

    Ok(if musl {
        LibcFlavor::Musl
    } else {
        LibcFlavor::Glibc
    })
}

/// All live processes whose executable path matches the predicate. Processes
/// racing with us (exiting, or whose exe we can't read) are skipped.
pub fn find_processes<F>(predicate: F) -> Result<Vec<ProcessKey>, ProcessError>
where
    F: Fn(&Path) -> bool,
{
    let processes = all_processes().map_err(|e| ProcessError::Procfs {
        pid: 0,
        reason: e.to_string(),
    })?;

    let mut keys = Vec::new();
    for process in processes.flatten() {
        let Ok(exe) = process.exe() else { continue };
        if !predicate(&exe) {
            continue;
        }
        if let Ok(stat) = process.stat() {
            keys.push(ProcessKey {
                pid: process.pid(),
                start_time: stat.starttime,
            });
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;
    use rstest::rstest;

    fn own_pid() -> Pid {
        unistd::getpid().as_raw()
    }

    #[test]
    fn test_own_process_is_running() {
        let key = ProcessKey::for_pid(own_pid()).unwrap();
        assert!(key.is_running());
    }

    #[test]
    fn test_restarted_process_is_a_different_incarnation() {
        let key = ProcessKey::for_pid(own_pid()).unwrap();
        let previous_incarnation = ProcessKey {
            start_time: key.start_time.wrapping_sub(1),
            ..key
        };
        assert!(!previous_incarnation.is_running());
    }

    #[test]
    fn test_missing_process() {
        assert!(matches!(
            ProcessKey::for_pid(Pid::MAX),
            Err(ProcessError::NoSuchProcess(pid)) if pid == Pid::MAX
        ));
        assert!(matches!(
            pid_namespace_link(Pid::MAX),
            Err(ProcessError::NoSuchProcess(pid)) if pid == Pid::MAX
        ));
    }

    #[test]
    fn test_nspid_in_own_namespace() {
        assert_eq!(nspid(own_pid()).unwrap(), own_pid());
    }

    #[test]
    fn test_pid_namespace_link() {
        let link = pid_namespace_link(own_pid()).unwrap();
        assert!(link.starts_with("pid:["), "unexpected link {}", link);
        assert_eq!(link, pid_namespace_link(own_pid()).unwrap());
    }

    #[test]
    fn test_find_own_process() {
        let own_exe = exe_path(own_pid()).unwrap();
        let found = find_processes(|exe| exe == own_exe).unwrap();
        assert!(found.iter().any(|key| key.pid == own_pid()));
    }

    #[rstest]
    #[case("/lib/ld-musl-x86_64.so.1", true)]
    #[case("/usr/lib/libc.musl-x86_64.so.1", true)]
    #[case("/lib/x86_64-linux-gnu/libc.so.6", false)]
    #[case("/opt/musl-tools/libfoo.so", false)]
    fn test_is_musl_library(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_musl_library(Path::new(path)), expected);
    }
}
