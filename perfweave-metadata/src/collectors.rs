use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use perfweave_object::{BuildId, ObjectFile};
use tracing::debug;

use crate::namespace::NamespaceRunner;
use crate::process::{exe_basename, libc_flavor, proc_exe, ProcessKey};
use crate::types::{AppMetadata, Linkage, MetadataCollector, MetadataError, RuntimeVersion};
use crate::version::exe_version;

const NODE_VERSION_TIMEOUT: Duration = Duration::from_secs(3);
const GO_VERSION_CACHE_SIZE: usize = 1024;

fn open_executable(process: &ProcessKey) -> Result<ObjectFile, MetadataError> {
    ObjectFile::from_path(&proc_exe(process.pid)).map_err(|e| {
        if e.is_not_found() {
            MetadataError::NoSuchProcess(process.pid)
        } else {
            MetadataError::Object(e)
        }
    })
}

/// Linkage and libc flavor, shared by every collector.
fn structural_metadata(
    process: &ProcessKey,
    executable: &ObjectFile,
) -> Result<AppMetadata, MetadataError> {
    let (link, libc) = if executable.is_statically_linked()? {
        (Linkage::Static, None)
    } else {
        (Linkage::Dynamic, Some(libc_flavor(process.pid)?))
    };

    Ok(AppMetadata {
        link,
        libc,
        runtime_version: None,
    })
}

/// Go executables embed the toolchain version in `runtime.buildVersion`.
pub struct GolangMetadata {
    versions: LruCache<BuildId, Option<String>>,
}

impl Default for GolangMetadata {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(GO_VERSION_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN))
    }
}

impl GolangMetadata {
    pub fn new(capacity: NonZeroUsize) -> Self {
        GolangMetadata {
            versions: LruCache::new(capacity),
        }
    }

    fn go_version(&mut self, executable: &ObjectFile) -> Option<String> {
        if !executable.is_go() {
            return None;
        }
        let build_id = executable.build_id();
        if let Some(version) = self.versions.get(build_id) {
            return version.clone();
        }

        let version = executable.go_build_version();
        self.versions.put(build_id.clone(), version.clone());
        version
    }
}

impl MetadataCollector for GolangMetadata {
    fn name(&self) -> &'static str {
        "golang"
    }

    fn relevant_for_process(&mut self, process: &ProcessKey) -> Result<bool, MetadataError> {
        let executable = open_executable(process)?;
        Ok(self.go_version(&executable).is_some())
    }

    fn get_metadata(&mut self, process: &ProcessKey) -> Result<AppMetadata, MetadataError> {
        let executable = open_executable(process)?;
        let mut metadata = structural_metadata(process, &executable)?;
        metadata.runtime_version = self.go_version(&executable).map(RuntimeVersion::Go);
        Ok(metadata)
    }
}

pub struct NodeMetadata<N> {
    namespaces: N,
}

impl<N: NamespaceRunner> NodeMetadata<N> {
    pub fn new(namespaces: N) -> Self {
        NodeMetadata { namespaces }
    }
}

impl<N: NamespaceRunner> MetadataCollector for NodeMetadata<N> {
    fn name(&self) -> &'static str {
        "node"
    }

    fn relevant_for_process(&mut self, process: &ProcessKey) -> Result<bool, MetadataError> {
        Ok(exe_basename(process.pid)? == "node")
    }

    fn get_metadata(&mut self, process: &ProcessKey) -> Result<AppMetadata, MetadataError> {
        let executable = open_executable(process)?;
        let mut metadata = structural_metadata(process, &executable)?;
        match exe_version(&self.namespaces, process.pid, NODE_VERSION_TIMEOUT) {
            Ok(version) => metadata.runtime_version = Some(RuntimeVersion::Node(version)),
            Err(err) if err.is_no_such_process() => return Err(err),
            Err(err) => debug!("no node version for {}: {}", process, err),
        }
        Ok(metadata)
    }
}

/// Describes any executable by its linkage alone.
#[derive(Debug, Default)]
pub struct NativeMetadata;

impl MetadataCollector for NativeMetadata {
    fn name(&self) -> &'static str {
        "native"
    }

    fn relevant_for_process(&mut self, _process: &ProcessKey) -> Result<bool, MetadataError> {
        Ok(true)
    }

    fn get_metadata(&mut self, process: &ProcessKey) -> Result<AppMetadata, MetadataError> {
        let executable = open_executable(process)?;
        structural_metadata(process, &executable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::LinuxNamespaces;
    use crate::process::Pid;
    use nix::unistd;

    fn own_process() -> ProcessKey {
        ProcessKey::for_pid(unistd::getpid().as_raw()).unwrap()
    }

    fn gone_process() -> ProcessKey {
        ProcessKey {
            pid: Pid::MAX,
            start_time: 0,
        }
    }

    #[test]
    fn test_native_metadata_of_test_binary() {
        let metadata = NativeMetadata.get_metadata(&own_process()).unwrap();
        assert_eq!(metadata.link, Linkage::Dynamic);
        assert!(metadata.libc.is_some());
        assert_eq!(metadata.runtime_version, None);
    }

    #[test]
    fn test_rust_binary_is_not_go() {
        let mut collector = GolangMetadata::default();
        assert!(!collector.relevant_for_process(&own_process()).unwrap());
        // Second lookup is served from the build id cache.
        assert!(!collector.relevant_for_process(&own_process()).unwrap());
        assert_eq!(collector.versions.len(), 1);
    }

    #[test]
    fn test_test_binary_is_not_node() {
        let mut collector = NodeMetadata::new(LinuxNamespaces);
        assert!(!collector.relevant_for_process(&own_process()).unwrap());
    }

    #[test]
    fn test_gone_process() {
        assert!(NativeMetadata
            .get_metadata(&gone_process())
            .unwrap_err()
            .is_no_such_process());
        assert!(GolangMetadata::default()
            .relevant_for_process(&gone_process())
            .unwrap_err()
            .is_no_such_process());
        assert!(NodeMetadata::new(LinuxNamespaces)
            .relevant_for_process(&gone_process())
            .unwrap_err()
            .is_no_such_process());
    }
}
