use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tracing::{debug, warn};

use crate::stop::StopEvent;

pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("stop requested")]
    Stopped,
    #[error("failed to list directory: {0}")]
    Io(#[from] io::Error),
}

/// Polls until `path` exists.
pub fn wait_for_file(path: &Path, timeout: Duration, stop: &StopEvent) -> Result<(), WaitError> {
    poll(timeout, stop, || Ok(path.exists().then_some(())))
}

/// Polls until `directory` holds a file whose name starts with `prefix`.
/// Returns the most recent one and removes the older ones.
pub fn wait_for_file_by_prefix(
    directory: &Path,
    prefix: &str,
    timeout: Duration,
    stop: &StopEvent,
) -> Result<PathBuf, WaitError> {
    let (newest, older) = poll(timeout, stop, || {
        let mut matches = find_by_prefix(directory, prefix)?;
        Ok(matches.pop().map(|newest| (newest, matches)))
    })?;

    for stale in older {
        debug!("removing stale {}", stale.display());
        match fs::remove_file(&stale) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {}", stale.display(), e),
        }
    }
    Ok(newest)
}

/// Files in `directory` whose name starts with `prefix`, oldest first by
/// modification time, then by name.
pub fn find_by_prefix(directory: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let mut matches = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        let modified = match entry.metadata().and_then(|metadata| metadata.modified()) {
            Ok(modified) => modified,
            // Consumed or removed since listing it.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(_) => SystemTime::UNIX_EPOCH,
        };
        matches.push((modified, entry.path()));
    }
    matches.sort();
    Ok(matches.into_iter().map(|(_, path)| path).collect())
}

fn poll<T, F>(timeout: Duration, stop: &StopEvent, mut check: F) -> Result<T, WaitError>
where
    F: FnMut() -> io::Result<Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(found) = check()? {
            return Ok(found);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout(timeout));
        }
        if stop.wait(POLL_INTERVAL.min(deadline - now)) {
            return Err(WaitError::Stopped);
        }
    }
}
