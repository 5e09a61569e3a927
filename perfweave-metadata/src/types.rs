use std::fmt::{self, Display, Formatter};

use perfweave_object::ObjectError;
use thiserror::Error;

use crate::namespace::NamespaceError;
use crate::process::{LibcFlavor, Pid, ProcessError, ProcessKey};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetadataLabel {
    pub key: String,
    pub value: String,
}

impl MetadataLabel {
    pub fn new(key: &str, value: &str) -> Self {
        MetadataLabel {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Static,
    Dynamic,
}

impl Display for Linkage {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Linkage::Static => f.write_str("static"),
            Linkage::Dynamic => f.write_str("dynamic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeVersion {
    Go(String),
    Node(String),
}

impl RuntimeVersion {
    pub fn label_key(&self) -> &'static str {
        match self {
            RuntimeVersion::Go(_) => "golang_version",
            RuntimeVersion::Node(_) => "node_version",
        }
    }

    pub fn version(&self) -> &str {
        match self {
            RuntimeVersion::Go(version) | RuntimeVersion::Node(version) => version,
        }
    }
}

/// Attributes of a process that don't depend on how it was sampled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMetadata {
    pub link: Linkage,
    /// Absent for statically linked executables.
    pub libc: Option<LibcFlavor>,
    pub runtime_version: Option<RuntimeVersion>,
}

impl AppMetadata {
    pub fn labels(&self) -> Vec<MetadataLabel> {
        let mut labels = vec![MetadataLabel::new("link", &self.link.to_string())];
        if let Some(libc) = self.libc {
            labels.push(MetadataLabel::new("libc", libc.as_str()));
        }
        if let Some(runtime_version) = &self.runtime_version {
            labels.push(MetadataLabel::new(
                runtime_version.label_key(),
                runtime_version.version(),
            ));
        }
        labels
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("process {0} does not exist")]
    NoSuchProcess(Pid),
    #[error(transparent)]
    Process(ProcessError),
    #[error("failed to inspect executable: {0}")]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Namespace(NamespaceError),
    #[error("version command failed: {0}")]
    VersionCommand(String),
}

impl MetadataError {
    /// The process exited while we were looking at it, a normal race.
    pub fn is_no_such_process(&self) -> bool {
        matches!(self, MetadataError::NoSuchProcess(_))
    }
}

impl From<ProcessError> for MetadataError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::NoSuchProcess(pid) => MetadataError::NoSuchProcess(pid),
            other => MetadataError::Process(other),
        }
    }
}

impl From<NamespaceError> for MetadataError {
    fn from(err: NamespaceError) -> Self {
        match err {
            NamespaceError::NoSuchProcess(pid) => MetadataError::NoSuchProcess(pid),
            other => MetadataError::Namespace(other),
        }
    }
}

/// A source of application metadata for a family of processes.
pub trait MetadataCollector {
    fn name(&self) -> &'static str;

    /// Whether this collector knows how to describe the process.
    fn relevant_for_process(&mut self, process: &ProcessKey) -> Result<bool, MetadataError>;

    fn get_metadata(&mut self, process: &ProcessKey) -> Result<AppMetadata, MetadataError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_binary_labels() {
        let metadata = AppMetadata {
            link: Linkage::Static,
            libc: None,
            runtime_version: Some(RuntimeVersion::Go("go1.21.4".to_string())),
        };
        assert_eq!(
            metadata.labels(),
            vec![
                MetadataLabel::new("link", "static"),
                MetadataLabel::new("golang_version", "go1.21.4"),
            ]
        );
    }

    #[test]
    fn test_dynamic_binary_labels() {
        let metadata = AppMetadata {
            link: Linkage::Dynamic,
            libc: Some(LibcFlavor::Musl),
            runtime_version: None,
        };
        assert_eq!(
            metadata.labels(),
            vec![
                MetadataLabel::new("link", "dynamic"),
                MetadataLabel::new("libc", "musl"),
            ]
        );
    }

    #[test]
    fn test_vanished_process_errors_are_flattened() {
        let err: MetadataError = ProcessError::NoSuchProcess(7).into();
        assert!(err.is_no_such_process());
        let err: MetadataError = NamespaceError::NoSuchProcess(7).into();
        assert!(err.is_no_such_process());
        let err: MetadataError = NamespaceError::Panicked(7).into();
        assert!(!err.is_no_such_process());
    }
}
