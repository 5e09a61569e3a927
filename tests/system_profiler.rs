mod common;

use std::thread;
use std::time::{Duration, Instant};

use perfweave::profiler::{PerfModeSelection, SnapshotError, SystemProfiler, SystemProfilerConfig};
use perfweave::resources::DirectoryResources;
use perfweave::stop::StopEvent;
use tempfile::TempDir;

use common::{sample, Behaviour, FakePerf};

fn own_pid() -> i32 {
    std::process::id() as i32
}

fn config(perf: &FakePerf, storage: &TempDir) -> SystemProfilerConfig {
    SystemProfilerConfig {
        storage_dir: storage.path().to_path_buf(),
        perf_path: Some(perf.path()),
        round_duration: Duration::from_millis(200),
        start_timeout: Duration::from_secs(5),
        dump_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[test]
fn test_rounds_merge_both_perfs_and_add_metadata() {
    let fp = [sample("app", 100, 10, 12), sample("tests", own_pid(), 1, 2)].concat();
    let dwarf = [
        sample("app", 100, 4, 12),
        sample("tests", own_pid(), 2, 2),
        sample("tests", own_pid(), 2, 2),
    ]
    .concat();
    let perf = FakePerf::new(Behaviour::Working, &fp, &dwarf);
    let storage = TempDir::new().unwrap();
    let resources = TempDir::new().unwrap();
    let mut profiler = SystemProfiler::new(
        config(&perf, &storage),
        &DirectoryResources::new(resources.path().to_path_buf()),
        StopEvent::new(),
    )
    .unwrap();

    profiler.start().unwrap();
    for _ in 0..2 {
        let result = profiler.snapshot().unwrap();

        assert_eq!(result.len(), 2);
        let app = &result[&100];
        assert_eq!(app.stacks.values().sum::<u64>(), 1);
        assert!(app.stacks.keys().all(|stack| stack.starts_with("app;")));
        assert_eq!(app.app_id, None);

        let own = &result[&own_pid()];
        assert_eq!(own.stacks["tests;func1;func0"], 2);
        assert!(own.metadata.is_some());
    }

    profiler.stop();
    assert_eq!(perf.running_instances(), 0);
}

#[test]
fn test_single_mode() {
    let fp = sample("app", 100, 3, 3);
    let perf = FakePerf::new(Behaviour::Working, &fp, "");
    let storage = TempDir::new().unwrap();
    let mut config = config(&perf, &storage);
    config.perf_mode = PerfModeSelection::FramePointer;
    let mut profiler = SystemProfiler::new(
        config,
        &DirectoryResources::new(storage.path().to_path_buf()),
        StopEvent::new(),
    )
    .unwrap();

    profiler.start().unwrap();
    let result = profiler.snapshot().unwrap();
    assert_eq!(result[&100].stacks["app;func2;func1;func0"], 1);
    profiler.stop();
}

#[test]
fn test_stop_event_interrupts_round() {
    let perf = FakePerf::new(Behaviour::Working, "", "");
    let storage = TempDir::new().unwrap();
    let mut config = config(&perf, &storage);
    config.round_duration = Duration::from_secs(60);
    let stop_event = StopEvent::new();
    let mut profiler = SystemProfiler::new(
        config,
        &DirectoryResources::new(storage.path().to_path_buf()),
        stop_event.clone(),
    )
    .unwrap();
    profiler.start().unwrap();

    let setter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        stop_event.set();
    });
    let started = Instant::now();
    assert!(matches!(profiler.snapshot(), Err(SnapshotError::Stopped)));
    assert!(started.elapsed() < Duration::from_secs(30));
    // Still stopped, without waiting.
    assert!(matches!(profiler.snapshot(), Err(SnapshotError::Stopped)));

    setter.join().unwrap();
    profiler.stop();
    assert_eq!(perf.running_instances(), 0);
}

#[test]
fn test_round_without_any_output() {
    let perf = FakePerf::new(Behaviour::NeverRotates, "", "");
    let storage = TempDir::new().unwrap();
    let mut config = config(&perf, &storage);
    config.round_duration = Duration::from_millis(10);
    config.dump_timeout = Duration::from_millis(300);
    let mut profiler = SystemProfiler::new(
        config,
        &DirectoryResources::new(storage.path().to_path_buf()),
        StopEvent::new(),
    )
    .unwrap();
    profiler.start().unwrap();

    assert!(matches!(
        profiler.snapshot(),
        Err(SnapshotError::NoSamplingSourceAvailable)
    ));

    profiler.stop();
    assert_eq!(perf.running_instances(), 0);
}
