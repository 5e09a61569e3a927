use tracing::debug;

use crate::profile::{Pid, ProcessToStacks};

pub const UNKNOWN_SYMBOL: &str = "[unknown]";
pub const KERNEL_SUFFIX: &str = "_[k]";

/// A frame perf couldn't name, in user or kernel space.
pub fn is_unresolved_frame(frame: &str) -> bool {
    frame.strip_suffix(KERNEL_SUFFIX).unwrap_or(frame) == UNKNOWN_SYMBOL
}

/// Frames of a folded stack, root first. The leading comm is not a frame.
pub fn stack_frames(folded: &str) -> impl Iterator<Item = &str> {
    folded.split(';').skip(1)
}

/// Parses `perf script -F +pid` output into collapsed stacks per pid.
///
/// Samples are blocks separated by blank lines: a header with the comm and
/// `pid/tid`, followed by one indented line per frame, leaf first. Frames
/// that were cut short (no `(dso)`) are dropped, a sample whose header can't
/// be parsed is dropped whole. A pid showing up in several places has its
/// stacks accumulated.
pub fn parse_perf_script(script: &str) -> ProcessToStacks {
    let mut stacks = ProcessToStacks::new();
    let mut sample: Option<SampleBuilder> = None;
    let mut skipping = false;

    for line in script.lines() {
        if line.trim().is_empty() {
            if let Some(finished) = sample.take() {
                finished.fold_into(&mut stacks);
            }
            skipping = false;
            continue;
        }
        if line.starts_with('#') || skipping {
            continue;
        }

        if line.starts_with(char::is_whitespace) {
            if let Some(sample) = sample.as_mut() {
                match parse_frame(line) {
                    Some(frame) => sample.frames.push(frame),
                    None => debug!("skipping truncated frame {:?}", line),
                }
            }
            continue;
        }

        if let Some(finished) = sample.take() {
            finished.fold_into(&mut stacks);
        }
        match parse_header(line) {
            Some((comm, pid)) => {
                sample = Some(SampleBuilder {
                    comm,
                    pid,
                    frames: Vec::new(),
                })
            }
            None => {
                debug!("dropping sample with unparseable header {:?}", line);
                skipping = true;
            }
        }
    }

    if let Some(finished) = sample.take() {
        finished.fold_into(&mut stacks);
    }
    stacks
}

struct SampleBuilder {
    comm: String,
    pid: Pid,
    /// Leaf first, as perf prints them.
    frames: Vec<String>,
}

impl SampleBuilder {
    fn fold_into(self, stacks: &mut ProcessToStacks) {
        let mut folded = self.comm;
        for frame in self.frames.iter().rev() {
            folded.push(';');
            folded.push_str(frame);
        }
        *stacks.entry(self.pid).or_default().entry(folded).or_insert(0) += 1;
    }
}

/// `<comm...> <pid>/<tid> [cpu] <time>: <period> <event>:`
fn parse_header(line: &str) -> Option<(String, Pid)> {
    let line = line.trim_start();
    // The comm takes at least the first token and keeps its inner spacing.
    let mut position = line.find(char::is_whitespace)?;
    loop {
        let rest = &line[position..];
        let start = position + (rest.len() - rest.trim_start().len());
        if start == line.len() {
            return None;
        }
        let end = line[start..]
            .find(char::is_whitespace)
            .map_or(line.len(), |offset| start + offset);
        if let Some(pid) = parse_pid_tid(&line[start..end]) {
            return Some((line[..start].trim_end().to_string(), pid));
        }
        position = end;
    }
}

fn parse_pid_tid(token: &str) -> Option<Pid> {
    let (pid, tid) = token.split_once('/')?;
    tid.parse::<Pid>().ok()?;
    pid.parse().ok()
}

/// `<hex address> <symbol> (<dso>)`
fn parse_frame(line: &str) -> Option<String> {
    let (address, rest) = line.trim().split_once(char::is_whitespace)?;
    if !address.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let rest = rest.trim();
    let (symbol, dso) = match rest.strip_prefix('(') {
        Some(dso) => ("", dso),
        None => {
            let (symbol, dso) = rest.rsplit_once(" (")?;
            (symbol.trim(), dso)
        }
    };
    let dso = dso.strip_suffix(')')?;

    let symbol = strip_offset(symbol);
    let mut frame = if symbol.is_empty() {
        UNKNOWN_SYMBOL.to_string()
    } else {
        symbol.to_string()
    };
    if dso.contains("kernel") || dso.contains("vmlinux") {
        frame.push_str(KERNEL_SUFFIX);
    }
    Some(frame)
}

/// `do_syscall_64+0x5b` -> `do_syscall_64`. Offsets would split otherwise
/// identical stacks.
fn strip_offset(symbol: &str) -> &str {
    match symbol.rsplit_once("+0x") {
        Some((name, offset))
            if !name.is_empty() && offset.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            name
        }
        _ => symbol,
    }
}
