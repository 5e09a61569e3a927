use std::path::{Path, PathBuf};

const DEFAULT_KILLSWITCH_PATH: &str = "/tmp/perfweave/killswitch";

/// A file whose presence keeps perfweave from sampling. It is checked before
/// perf starts and polled while running, where it raises the stop event.
pub struct KillSwitch {
    path: PathBuf,
    /// `--unsafe-start`: never trips.
    bypassed: bool,
}

impl KillSwitch {
    pub fn new(path_override: Option<String>, bypassed: bool) -> Self {
        let path = path_override
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KILLSWITCH_PATH));
        KillSwitch { path, bypassed }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file exists. A location we can't inspect counts as tripped.
    pub fn tripped(&self) -> bool {
        !self.bypassed && self.path.try_exists().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, remove_file, File};
    use std::os::unix::fs::PermissionsExt;
    use nix::unistd::Uid;
    use tempfile::TempDir;

    #[test]
    fn test_default_path() {
        assert_eq!(
            KillSwitch::new(None, false).path(),
            Path::new(DEFAULT_KILLSWITCH_PATH)
        );
        assert_eq!(
            KillSwitch::new(Some(String::new()), false).path(),
            Path::new(DEFAULT_KILLSWITCH_PATH)
        );
    }

    #[test]
    fn test_trips_while_file_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("killswitch");
        let killswitch = KillSwitch::new(Some(path.to_string_lossy().into_owned()), false);
        assert!(!killswitch.tripped());

        File::create(&path).unwrap();
        assert!(killswitch.tripped());

        remove_file(&path).unwrap();
        assert!(!killswitch.tripped());
    }

    #[test]
    fn test_bypassed() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let killswitch = KillSwitch::new(Some(file.path().to_string_lossy().into_owned()), true);
        assert!(!killswitch.tripped());
    }

    #[test]
    fn test_uninspectable_location_trips() {
        // Root can look into any directory.
        if Uid::effective().is_root() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        let killswitch = KillSwitch::new(
            Some(locked.join("killswitch").to_string_lossy().into_owned()),
            false,
        );

        let tripped = killswitch.tripped();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(tripped);
    }
}
