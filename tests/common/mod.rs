#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use perfweave::perf::{PerfConfig, PerfMode};
use tempfile::TempDir;

/// What the fake `perf record` does.
#[derive(Clone, Copy)]
pub enum Behaviour {
    /// Creates its output and rotates on SIGUSR2.
    Working,
    /// Never creates its output file.
    NeverStarts,
    /// Starts but ignores rotation requests.
    NeverRotates,
    /// Its first rotation lands a second late. Every trace holds
    /// `rotation-<n>` instead of a fixture.
    LateFirstRotation,
}

/// A shell script standing in for perf. Every rotation dumps the fixture for
/// the current mode, `perf script` prints its input back and `perf inject`
/// copies it.
pub struct FakePerf {
    dir: TempDir,
}

impl FakePerf {
    pub fn new(behaviour: Behaviour, fp_script: &str, dwarf_script: &str) -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("fp"), fp_script).unwrap();
        fs::write(dir.path().join("dwarf"), dwarf_script).unwrap();

        let create_output = match behaviour {
            Behaviour::NeverStarts => "",
            _ => ": > \"$output\"",
        };
        let on_rotate = match behaviour {
            Behaviour::NeverRotates => "trap '' USR2",
            _ => "trap rotate USR2",
        };
        let dump = match behaviour {
            Behaviour::LateFirstRotation => {
                r#"[ $rotations -eq 1 ] && sleep 1
        echo "rotation-$rotations" > "$output-partial""#
            }
            _ => r#"cp "$fixtures/$mode" "$output-partial""#,
        };
        let script = format!(
            r#"#!/bin/sh
command="$1"
shift
case "$command" in
record)
    echo "fake perf recording" >&2
    output=""
    mode=fp
    while [ $# -gt 0 ]; do
        case "$1" in
            -o) output="$2"; shift ;;
            --call-graph) mode=dwarf ;;
        esac
        shift
    done
    fixtures="{fixtures}"
    rotations=0
    rotate() {{
        rotations=$((rotations + 1))
        {dump}
        mv "$output-partial" "$output.$(printf '%04d' $rotations)"
    }}
    {on_rotate}
    trap 'exit 0' TERM
    {create_output}
    while true; do sleep 0.05; done
    ;;
inject)
    while [ $# -gt 0 ]; do
        case "$1" in
            -o) out="$2"; shift ;;
            -i) input="$2"; shift ;;
        esac
        shift
    done
    cp "$input" "$out"
    ;;
script)
    while [ $# -gt 0 ]; do
        if [ "$1" = "-i" ]; then
            cat "$2"
            exit 0
        fi
        shift
    done
    exit 1
    ;;
*)
    exit 1
    ;;
esac
"#,
            fixtures = dir.path().display(),
        );

        let path = dir.path().join("perf");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        FakePerf { dir }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("perf")
    }

    /// Live processes running this script.
    pub fn running_instances(&self) -> usize {
        let path = self.path();
        let path = path.to_string_lossy();
        procfs::process::all_processes()
            .unwrap()
            .flatten()
            .filter_map(|process| process.cmdline().ok())
            .filter(|cmdline| cmdline.iter().any(|arg| arg.contains(path.as_ref())))
            .count()
    }
}

pub fn perf_config(perf: &FakePerf, mode: PerfMode, output_dir: &Path) -> PerfConfig {
    PerfConfig {
        perf_path: perf.path(),
        mode,
        frequency: 11,
        output_dir: output_dir.to_path_buf(),
        dwarf_stack_size: 8192,
        inject_jit: false,
        start_timeout: Duration::from_secs(5),
        dump_timeout: Duration::from_secs(5),
    }
}

/// `perf script -F +pid` text for one sample of `pid` with `resolved` named
/// frames out of `total`, leaf first.
pub fn sample(comm: &str, pid: i32, resolved: usize, total: usize) -> String {
    let mut text = format!("{} {}/{} [000] 12.345678: 1 cpu-clock:pppH:\n", comm, pid, pid);
    for i in 0..total {
        let symbol = if i < resolved {
            format!("func{}", i)
        } else {
            "[unknown]".to_string()
        };
        text.push_str(&format!("\t{:x} {} (/usr/bin/{})\n", 0x4000 + i, symbol, comm));
    }
    text.push('\n');
    text
}
