use std::env;
use std::path::{Path, PathBuf};

/// Finds helper files shipped alongside the profiler (the perf binary, the
/// Node.js payload module).
pub trait ResourceLocator {
    /// Absolute path of the resource, if it is present.
    fn resource_path(&self, relative: &Path) -> Option<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct DirectoryResources {
    root: PathBuf,
}

impl DirectoryResources {
    pub fn new(root: PathBuf) -> Self {
        DirectoryResources { root }
    }

    /// `resources/` next to the running executable.
    pub fn beside_executable() -> Self {
        let root = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|parent| parent.join("resources")))
            .unwrap_or_else(|| PathBuf::from("resources"));
        Self::new(root)
    }
}

impl ResourceLocator for DirectoryResources {
    fn resource_path(&self, relative: &Path) -> Option<PathBuf> {
        let path = self.root.join(relative);
        path.exists().then_some(path)
    }
}

/// The perf binary to run: an explicit override, the bundled one, or whatever
/// `perf` is on `PATH`.
pub fn perf_path(locator: &dyn ResourceLocator, override_path: Option<&Path>) -> PathBuf {
    if let Some(path) = override_path {
        return path.to_path_buf();
    }
    locator
        .resource_path(Path::new("perf"))
        .unwrap_or_else(|| PathBuf::from("perf"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_resource_lookup() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("node/module")).unwrap();
        let resources = DirectoryResources::new(root.path().to_path_buf());

        assert_eq!(
            resources.resource_path(Path::new("node/module")),
            Some(root.path().join("node/module"))
        );
        assert_eq!(resources.resource_path(Path::new("missing")), None);
    }

    #[test]
    fn test_perf_path_precedence() {
        let root = TempDir::new().unwrap();
        let resources = DirectoryResources::new(root.path().to_path_buf());
        assert_eq!(perf_path(&resources, None), PathBuf::from("perf"));

        fs::write(root.path().join("perf"), "").unwrap();
        assert_eq!(perf_path(&resources, None), root.path().join("perf"));
        assert_eq!(
            perf_path(&resources, Some(Path::new("/opt/perf"))),
            PathBuf::from("/opt/perf")
        );
    }
}
