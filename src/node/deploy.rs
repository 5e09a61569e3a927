use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use perfweave_metadata::process::{proc_root, LibcFlavor};
use thiserror::Error;
use tracing::{debug, info};

use crate::profile::Pid;
use crate::resources::ResourceLocator;
use crate::util::{add_permission_dir, copy_dir_all, resolve_proc_root_links};

/// Where the payload variants live among the bundled resources.
pub const MODULE_RESOURCE_DIR: &str = "node/module";

const OTHERS_READ: u32 = 0o004;
const OTHERS_READ_EXECUTE: u32 = 0o005;

static STAGING_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("payload resource {0} is missing")]
    MissingResource(PathBuf),
    #[error("payload builds differ between glibc ({glibc}) and musl ({musl})")]
    BuildMismatch { glibc: String, musl: String },
    #[error("failed to resolve {path} in the target's mount namespace: {reason}")]
    Resolve { path: PathBuf, reason: String },
    #[error("failed to deploy to {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DeployError + '_ {
    move |source| DeployError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The payload variants shipped with the profiler and where they go inside
/// targets. Variants are keyed by libc flavor, payload build and Node major
/// version, so targets sharing all three share one deployed copy.
#[derive(Debug, Clone)]
pub struct PayloadLayout {
    source_root: PathBuf,
    build: String,
    storage_root: PathBuf,
}

impl PayloadLayout {
    /// Reads the payload build identity, which both libc variants must agree on.
    pub fn load(locator: &dyn ResourceLocator, storage_root: &Path) -> Result<Self, DeployError> {
        let source_root = locator
            .resource_path(Path::new(MODULE_RESOURCE_DIR))
            .ok_or_else(|| DeployError::MissingResource(PathBuf::from(MODULE_RESOURCE_DIR)))?;

        let read_build = |libc: LibcFlavor| -> Result<String, DeployError> {
            let path = source_root.join(libc.as_str()).join("version");
            let build = fs::read_to_string(&path).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    DeployError::MissingResource(path.clone())
                } else {
                    DeployError::Io {
                        path: path.clone(),
                        source: e,
                    }
                }
            })?;
            Ok(build.trim().to_string())
        };
        let glibc = read_build(LibcFlavor::Glibc)?;
        let musl = read_build(LibcFlavor::Musl)?;
        if glibc != musl {
            return Err(DeployError::BuildMismatch { glibc, musl });
        }

        Ok(PayloadLayout {
            source_root,
            build: glibc,
            storage_root: storage_root.to_path_buf(),
        })
    }

    pub fn build(&self) -> &str {
        &self.build
    }

    pub fn source_dir(&self, libc: LibcFlavor, major_version: &str) -> PathBuf {
        self.source_root
            .join(libc.as_str())
            .join(&self.build)
            .join(major_version)
    }

    /// Root of every deployed variant, as seen from inside a target.
    pub fn module_tree_in_namespace(&self) -> PathBuf {
        self.storage_root.join("node_module")
    }

    /// Deployment directory for a variant, as seen from inside a target.
    pub fn destination_in_namespace(&self, libc: LibcFlavor, major_version: &str) -> PathBuf {
        self.module_tree_in_namespace()
            .join(&self.build)
            .join(libc.as_str())
            .join(major_version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    /// Payload directory as the target sees it.
    pub path_in_namespace: PathBuf,
    /// Whether this call copied the payload, as opposed to finding it there.
    pub copied: bool,
}

/// Makes the payload variant for (`libc`, `major_version`) available inside the
/// mount namespace of `pid`.
///
/// Concurrent deployments of the same variant are harmless: each one copies
/// to its own staging directory and renames it into place, losers of the
/// rename throw their copy away.
pub fn deploy(
    layout: &PayloadLayout,
    pid: Pid,
    libc: LibcFlavor,
    major_version: &str,
) -> Result<DeployOutcome, DeployError> {
    let root = proc_root(pid);
    let path_in_namespace = layout.destination_in_namespace(libc, major_version);
    let resolve = |path: &Path| {
        resolve_proc_root_links(&root, path).map_err(|e| DeployError::Resolve {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    };

    let destination = resolve(&path_in_namespace)?;
    if destination.exists() {
        debug!("payload already deployed at {}", destination.display());
        return Ok(DeployOutcome {
            path_in_namespace,
            copied: false,
        });
    }

    let source = layout.source_dir(libc, major_version);
    if !source.is_dir() {
        return Err(DeployError::MissingResource(source));
    }

    let parent = destination
        .parent()
        .ok_or_else(|| DeployError::Resolve {
            path: path_in_namespace.clone(),
            reason: "no parent directory".to_string(),
        })?
        .to_path_buf();
    fs::create_dir_all(&parent).map_err(io_error(&parent))?;

    let staging = parent.join(format!(
        ".{}.{}.{}",
        major_version,
        std::process::id(),
        STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let copied = copy_dir_all(&source, &staging)
        .and_then(|_| add_permission_dir(&staging, OTHERS_READ, OTHERS_READ_EXECUTE))
        .map_err(io_error(&staging))
        .and_then(|_| match fs::rename(&staging, &destination) {
            Ok(()) => Ok(true),
            Err(_) if destination.exists() => Ok(false),
            Err(e) => Err(DeployError::Io {
                path: destination.clone(),
                source: e,
            }),
        });
    if staging.exists() {
        let _ = fs::remove_dir_all(&staging);
    }
    let copied = copied?;

    // The target may run as another user, it needs to traverse every level.
    let tree = resolve(&layout.module_tree_in_namespace())?;
    add_permission_dir(&tree, OTHERS_READ, OTHERS_READ_EXECUTE).map_err(io_error(&tree))?;

    if copied {
        info!(
            "deployed node payload to {} for process {}",
            path_in_namespace.display(),
            pid
        );
    }
    Ok(DeployOutcome {
        path_in_namespace,
        copied,
    })
}
