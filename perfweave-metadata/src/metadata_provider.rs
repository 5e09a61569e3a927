use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::{debug, warn};

use crate::collectors::{GolangMetadata, NativeMetadata, NodeMetadata};
use crate::namespace::LinuxNamespaces;
use crate::process::{Pid, ProcessKey};
use crate::types::{AppMetadata, MetadataCollector};

const DEFAULT_CACHE_SIZE: usize = 4096;

/// Computes [`AppMetadata`] for processes, asking collectors in registration
/// order and keeping the answer of the first relevant one.
///
/// Results are memoized per process incarnation. A pid seen again with a
/// different start time drops whatever was cached for the old incarnation.
pub struct MetadataProvider {
    cache: LruCache<ProcessKey, Option<AppMetadata>>,
    start_times: LruCache<Pid, u64>,
    collectors: Vec<Box<dyn MetadataCollector + Send>>,
}

impl Default for MetadataProvider {
    fn default() -> Self {
        Self::new(
            NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            vec![
                Box::new(GolangMetadata::default()),
                Box::new(NodeMetadata::new(LinuxNamespaces)),
                Box::new(NativeMetadata),
            ],
        )
    }
}

impl MetadataProvider {
    pub fn new(
        cache_size: NonZeroUsize,
        collectors: Vec<Box<dyn MetadataCollector + Send>>,
    ) -> Self {
        Self {
            cache: LruCache::new(cache_size),
            start_times: LruCache::new(cache_size),
            collectors,
        }
    }

    /// Metadata for whatever process currently owns `pid`. Pids 0 and -1 are
    /// what perf reports for samples it couldn't attribute.
    pub fn get_metadata(&mut self, pid: Pid) -> Option<AppMetadata> {
        if pid == 0 || pid == -1 {
            return None;
        }

        match ProcessKey::for_pid(pid) {
            Ok(process) => self.get_metadata_for(&process),
            Err(err) => {
                debug!("no metadata for pid {}: {}", pid, err);
                None
            }
        }
    }

    pub fn get_metadata_for(&mut self, process: &ProcessKey) -> Option<AppMetadata> {
        if process.pid == 0 || process.pid == -1 {
            return None;
        }

        if let Some(previous_start) = self.start_times.put(process.pid, process.start_time) {
            if previous_start != process.start_time {
                debug!("process {} restarted, dropping cached metadata", process.pid);
                self.cache.pop(&ProcessKey {
                    pid: process.pid,
                    start_time: previous_start,
                });
            }
        }

        if let Some(metadata) = self.cache.get(process) {
            return metadata.clone();
        }

        let (metadata, gone) = self.collect(process);
        if !gone {
            self.cache.put(*process, metadata.clone());
        }
        metadata
    }

    /// Returns the metadata and whether the process vanished meanwhile.
    fn collect(&mut self, process: &ProcessKey) -> (Option<AppMetadata>, bool) {
        for collector in self.collectors.iter_mut() {
            let relevant = match collector.relevant_for_process(process) {
                Ok(relevant) => relevant,
                Err(err) if err.is_no_such_process() => return (None, true),
                Err(err) => {
                    warn!(
                        "{} relevance check failed for {}: {}",
                        collector.name(),
                        process,
                        err
                    );
                    continue;
                }
            };
            if !relevant {
                continue;
            }

            match collector.get_metadata(process) {
                Ok(metadata) => return (Some(metadata), false),
                Err(err) if err.is_no_such_process() => return (None, true),
                Err(err) => warn!(
                    "{} metadata failed for {}: {}",
                    collector.name(),
                    process,
                    err
                ),
            }
        }
        (None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::LibcFlavor;
    use crate::types::{Linkage, MetadataError, RuntimeVersion};
    use nix::unistd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeCollector {
        name: &'static str,
        relevant: bool,
        vanished: bool,
        calls: Arc<AtomicUsize>,
    }

    impl FakeCollector {
        fn new(name: &'static str, relevant: bool) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                FakeCollector {
                    name,
                    relevant,
                    vanished: false,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl MetadataCollector for FakeCollector {
        fn name(&self) -> &'static str {
            self.name
        }

        fn relevant_for_process(&mut self, process: &ProcessKey) -> Result<bool, MetadataError> {
            if self.vanished {
                return Err(MetadataError::NoSuchProcess(process.pid));
            }
            Ok(self.relevant)
        }

        fn get_metadata(&mut self, _process: &ProcessKey) -> Result<AppMetadata, MetadataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AppMetadata {
                link: Linkage::Dynamic,
                libc: Some(LibcFlavor::Glibc),
                runtime_version: Some(RuntimeVersion::Node(self.name.to_string())),
            })
        }
    }

    fn provider(collectors: Vec<Box<dyn MetadataCollector + Send>>) -> MetadataProvider {
        MetadataProvider::new(NonZeroUsize::new(16).unwrap(), collectors)
    }

    fn key(pid: Pid, start_time: u64) -> ProcessKey {
        ProcessKey { pid, start_time }
    }

    #[test]
    fn test_first_relevant_collector_wins() {
        let (skipped, skipped_calls) = FakeCollector::new("skipped", false);
        let (first, first_calls) = FakeCollector::new("first", true);
        let (second, second_calls) = FakeCollector::new("second", true);
        let mut provider = provider(vec![Box::new(skipped), Box::new(first), Box::new(second)]);

        let metadata = provider.get_metadata_for(&key(100, 1)).unwrap();

        assert_eq!(
            metadata.runtime_version,
            Some(RuntimeVersion::Node("first".to_string()))
        );
        assert_eq!(skipped_calls.load(Ordering::SeqCst), 0);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_metadata_is_memoized() {
        let (collector, calls) = FakeCollector::new("node", true);
        let mut provider = provider(vec![Box::new(collector)]);

        let first = provider.get_metadata_for(&key(100, 1));
        let second = provider.get_metadata_for(&key(100, 1));

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restarted_process_is_collected_again() {
        let (collector, calls) = FakeCollector::new("node", true);
        let mut provider = provider(vec![Box::new(collector)]);

        provider.get_metadata_for(&key(100, 1));
        provider.get_metadata_for(&key(100, 2));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!provider.cache.contains(&key(100, 1)));
        assert!(provider.cache.contains(&key(100, 2)));
    }

    #[test]
    fn test_vanished_process_is_not_cached() {
        let (mut collector, _) = FakeCollector::new("node", true);
        collector.vanished = true;
        let mut provider = provider(vec![Box::new(collector)]);

        assert_eq!(provider.get_metadata_for(&key(100, 1)), None);
        assert!(!provider.cache.contains(&key(100, 1)));
    }

    #[test]
    fn test_unattributed_pids_have_no_metadata() {
        let (collector, calls) = FakeCollector::new("node", true);
        let mut provider = provider(vec![Box::new(collector)]);

        assert_eq!(provider.get_metadata(0), None);
        assert_eq!(provider.get_metadata(-1), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_default_collectors_describe_own_process() {
        let mut provider = MetadataProvider::default();
        let metadata = provider.get_metadata(unistd::getpid().as_raw()).unwrap();
        assert_eq!(metadata.link, Linkage::Dynamic);
        assert_eq!(metadata.runtime_version, None);
    }
}
