use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::namespace::{NamespaceKind, NamespaceRunner};
use crate::process::{exe_path, Pid};
use crate::types::MetadataError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs `<exe> --version` for the executable of `pid` from inside its mount
/// namespace and returns the first line of output.
pub fn exe_version<N: NamespaceRunner>(
    runner: &N,
    pid: Pid,
    timeout: Duration,
) -> Result<String, MetadataError> {
    let exe = exe_path(pid)?;
    debug!("probing version of {} for process {}", exe.display(), pid);

    let output = runner.run_in_namespaces(pid, &[NamespaceKind::Mount], || {
        let mut command = Command::new(&exe);
        command.arg("--version");
        run_with_timeout(command, timeout)
    })??;

    Ok(output)
}

/// Runs the command to completion, killing it if it takes longer than
/// `timeout`. Returns the first line of stdout, or of stderr when stdout is
/// empty. Both pipes are drained while it runs so a chatty command can't
/// stall on a full pipe.
pub(crate) fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<String, MetadataError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| MetadataError::VersionCommand(e.to_string()))?;

    let readers = child
        .stdout
        .take()
        .map(|pipe| drain("stdout", pipe))
        .zip(child.stderr.take().map(|pipe| drain("stderr", pipe)));
    let (stdout, stderr) = match readers {
        Some((Ok(stdout), Ok(stderr))) => (stdout, stderr),
        Some((Err(e), _)) | Some((_, Err(e))) => {
            kill_and_reap(&mut child);
            return Err(MetadataError::VersionCommand(e.to_string()));
        }
        None => {
            kill_and_reap(&mut child);
            return Err(MetadataError::VersionCommand("pipes unavailable".to_string()));
        }
    };

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if Instant::now() >= deadline => {
                kill_and_reap(&mut child);
                return Err(MetadataError::VersionCommand(format!(
                    "timed out after {:?}",
                    timeout
                )));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(MetadataError::VersionCommand(e.to_string())),
        }
    }

    let stdout = collect(stdout)?;
    let output = if stdout.trim().is_empty() {
        collect(stderr)?
    } else {
        stdout
    };

    Ok(output.lines().next().unwrap_or_default().trim().to_string())
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(name: &str, mut pipe: R) -> io::Result<JoinHandle<io::Result<Vec<u8>>>> {
    thread::Builder::new()
        .name(format!("version-{}", name))
        .spawn(move || {
            let mut buffer = Vec::new();
            pipe.read_to_end(&mut buffer)?;
            Ok(buffer)
        })
}

fn collect(reader: JoinHandle<io::Result<Vec<u8>>>) -> Result<String, MetadataError> {
    let bytes = reader
        .join()
        .map_err(|_| MetadataError::VersionCommand("output reader panicked".to_string()))?
        .map_err(|e| MetadataError::VersionCommand(e.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// `v16.3.2` -> `16`.
pub fn major_version(version: &str) -> Option<String> {
    let major = version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()
        .filter(|major| !major.is_empty() && major.chars().all(|c| c.is_ascii_digit()))?;
    Some(major.to_string())
}
