use std::error::Error;
use std::io::IsTerminal;
use std::panic;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel::tick;
use itertools::Itertools;
use nix::unistd::Uid;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::FmtSubscriber;

use perfweave::profile::{fold_stacks, total_samples, RoundResult};
use perfweave::profiler::{SnapshotError, SystemProfiler};
use perfweave::resources::DirectoryResources;
use perfweave::stop::StopEvent;

mod args;
mod killswitch;
mod validators;

use crate::args::CliArgs;
use crate::args::LoggingLevel;
use crate::killswitch::KillSwitch;

static KILLSWITCH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Exit the main thread if any thread panics, perf would otherwise keep
/// running unattended.
fn panic_thread_hook() {
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        std::process::exit(1);
    }));
}

fn print_round(result: &RoundResult) {
    for pid in result.keys().sorted() {
        let data = &result[pid];
        let labels = data
            .metadata
            .as_ref()
            .map(|metadata| {
                metadata
                    .labels()
                    .iter()
                    .map(|label| format!("{}={}", label.key, label.value))
                    .join(",")
            })
            .unwrap_or_default();
        println!(
            "# pid {} samples {} {}",
            pid,
            total_samples(&data.stacks),
            labels
        );
        println!("{}", fold_stacks(&data.stacks));
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    panic_thread_hook();
    let args = CliArgs::parse();

    let level_filter = match args.logging {
        LoggingLevel::Trace => Level::TRACE,
        LoggingLevel::Debug => Level::DEBUG,
        LoggingLevel::Info => Level::INFO,
        LoggingLevel::Warn => Level::WARN,
        LoggingLevel::Error => Level::ERROR,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level_filter)
        .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
        .with_ansi(std::io::stdout().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if !Uid::current().is_root() {
        error!("root permissions are required to run perfweave");
        std::process::exit(1);
    }

    let killswitch = KillSwitch::new(args.killswitch_path_override.clone(), args.unsafe_start);
    if killswitch.tripped() {
        info!(
            "killswitch {} present, not starting. Pass --unsafe-start to ignore it.",
            killswitch.path().display()
        );
        return Ok(());
    }

    let stop_event = StopEvent::new();
    let ctrlc_stop_event = stop_event.clone();
    ctrlc::set_handler(move || {
        info!("interrupted, stopping");
        ctrlc_stop_event.set();
    })?;

    // The killswitch can also show up while we run.
    let killswitch_stop_event = stop_event.clone();
    let killswitch_ticker = tick(KILLSWITCH_POLL_INTERVAL);
    let _killswitch_thread = thread::Builder::new()
        .name("killswitch-poll-thread".to_string())
        .spawn(move || loop {
            if killswitch_ticker.recv().is_ok() && killswitch.tripped() {
                info!("killswitch appeared, stopping");
                killswitch_stop_event.set();
                break;
            }
        })?;

    let resources = match &args.resources_dir {
        Some(path) => DirectoryResources::new(path.clone()),
        None => DirectoryResources::beside_executable(),
    };
    let mut profiler = SystemProfiler::new(args.profiler_config(), &resources, stop_event.clone())?;

    if let Err(err) = profiler.start() {
        error!("failed to start profiling: {}", err);
        profiler.stop();
        return Err(err.into());
    }

    let deadline = Instant::now().checked_add(args.duration);
    let mut rounds = 0u64;
    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            info!("profiling duration elapsed");
            break;
        }

        match profiler.snapshot() {
            Ok(result) => {
                rounds += 1;
                let samples: u64 = result.values().map(|data| total_samples(&data.stacks)).sum();
                info!(
                    "round {} done: {} samples from {} processes",
                    rounds,
                    samples,
                    result.len()
                );
                if args.print_stacks {
                    print_round(&result);
                }
            }
            Err(SnapshotError::Stopped) => {
                info!("stop requested");
                break;
            }
            Err(err) => {
                warn!("round failed: {}", err);
                if matches!(err, SnapshotError::NoSamplingSourceAvailable) {
                    profiler.stop();
                    return Err(err.into());
                }
            }
        }
    }

    profiler.stop();
    Ok(())
}
