use crate::archiver::config::ProgressConfig;
use crate::archiver::progress::{ProgressEvent, SizeProgress};
use crate::archiver::util::file_size;
use crate::tools::{CancelToken, Cancelled, ProgressSink};
use anyhow::{Context, Result, bail};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TAIL_LINES: usize = 20;

/// How a child is run: directly, through `sudo -n`, or through `sudo` with the
/// terminal attached so it can prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Direct,
    SudoNonInteractive,
    SudoInteractive,
}

pub fn build_command(bin: &Path, args: &[OsString], privilege: Privilege) -> Command {
    let mut cmd = match privilege {
        Privilege::Direct => Command::new(bin),
        Privilege::SudoNonInteractive => {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(bin);
            cmd
        }
        Privilege::SudoInteractive => {
            let mut cmd = Command::new("sudo");
            cmd.arg(bin);
            cmd
        }
    };
    cmd.args(args);
    cmd.stdin(if privilege == Privilege::SudoInteractive {
        Stdio::inherit()
    } else {
        Stdio::null()
    });
    cmd
}

/// Split a byte stream into lines on `\n` and `\r`; progress tools redraw
/// their status with bare carriage returns.
fn spawn_line_reader<R: Read + Send + 'static>(mut reader: R, tx: Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut pending = Vec::new();
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                if byte == b'\n' || byte == b'\r' {
                    if !pending.is_empty() {
                        let line = String::from_utf8_lossy(&pending).trim().to_string();
                        pending.clear();
                        if !line.is_empty() && tx.send(line).is_err() {
                            return;
                        }
                    }
                } else {
                    pending.push(byte);
                }
            }
        }
        if !pending.is_empty() {
            let line = String::from_utf8_lossy(&pending).trim().to_string();
            if !line.is_empty() {
                let _ = tx.send(line);
            }
        }
    })
}

/// Result of a watched child run.
#[derive(Debug)]
pub struct WatchOutcome {
    pub status: ExitStatus,
    /// Last output lines, oldest first.
    pub tail: Vec<String>,
}

impl WatchOutcome {
    pub fn last_line(&self) -> String {
        self.tail.last().cloned().unwrap_or_default()
    }

    pub fn ensure_success(&self, what: &str) -> Result<()> {
        if self.status.success() {
            return Ok(());
        }
        bail!(
            "{what} exited with {}: {}",
            self.status,
            self.tail.join(" | ")
        );
    }
}

/// What to poll while the child runs.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub poll: Duration,
    pub progress: ProgressConfig,
    pub watch_path: Option<PathBuf>,
    pub total_bytes: Option<u64>,
}

impl WatchOptions {
    pub fn new(progress: &ProgressConfig) -> Self {
        Self {
            poll: Duration::from_millis(progress.poll_interval_ms),
            progress: progress.clone(),
            watch_path: None,
            total_bytes: None,
        }
    }

    pub fn watching(mut self, path: &Path, total_bytes: Option<u64>) -> Self {
        self.watch_path = Some(path.to_path_buf());
        self.total_bytes = total_bytes;
        self
    }
}

fn interrupt_child(child: &mut Child) {
    let forwarded = Command::new("kill")
        .arg("-INT")
        .arg(child.id().to_string())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !forwarded {
        let _ = child.kill();
    }
}

fn drain(
    rx: &Receiver<String>,
    tail: &mut VecDeque<String>,
    parse: &mut dyn FnMut(&str) -> Option<ProgressEvent>,
    parsed: &mut Option<ProgressEvent>,
) {
    while let Ok(line) = rx.try_recv() {
        if let Some(event) = parse(&line) {
            *parsed = Some(event);
        }
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Run `cmd` to completion while polling its output.
///
/// Each cycle drains available output lines through `parse`, samples the
/// size of the watched file, publishes one progress event, sleeps the poll
/// interval and checks for exit. Parsed tool output takes precedence over
/// size polling for the message and percent. On cancellation the child gets
/// SIGINT, is waited for, and the call returns `Cancelled`.
pub fn run_watched(
    mut cmd: Command,
    opts: &WatchOptions,
    cancel: &CancelToken,
    parse: &mut dyn FnMut(&str) -> Option<ProgressEvent>,
    progress: ProgressSink<'_>,
) -> Result<WatchOutcome> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let program = format!("{:?}", cmd.get_program());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;

    let (tx, rx) = mpsc::channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_line_reader(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_line_reader(stderr, tx.clone()));
    }
    drop(tx);

    let mut sizes = SizeProgress::new(&opts.progress, opts.total_bytes);
    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    let mut parsed: Option<ProgressEvent> = None;

    let status = loop {
        drain(&rx, &mut tail, parse, &mut parsed);

        let polled = opts
            .watch_path
            .as_deref()
            .and_then(file_size)
            .map(|bytes| sizes.observe(Instant::now(), bytes));
        let event = match (parsed.take(), polled) {
            (Some(mut from_tool), Some(polled)) => {
                from_tool.percent = from_tool.percent.or(polled.percent);
                from_tool.bytes_per_sec = from_tool.bytes_per_sec.or(polled.bytes_per_sec);
                Some(from_tool)
            }
            (from_tool, polled) => from_tool.or(polled),
        };
        if let Some(event) = event {
            progress(&event);
        }

        if cancel.is_cancelled() {
            interrupt_child(&mut child);
            let _ = child.wait();
            for reader in readers {
                let _ = reader.join();
            }
            return Err(Cancelled.into());
        }

        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed to poll {program}"))?
        {
            break status;
        }
        thread::sleep(opts.poll);
    };

    for reader in readers {
        let _ = reader.join();
    }
    drain(&rx, &mut tail, parse, &mut parsed);
    if let Some(event) = parsed {
        progress(&event);
    }

    Ok(WatchOutcome {
        status,
        tail: tail.into_iter().collect(),
    })
}

/// Run a short command and capture stdout, or `None` if it could not run or
/// failed.
pub fn capture(bin: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(bin).args(args).stdin(Stdio::null()).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Probe whether `sudo` already holds cached credentials.
pub fn sudo_is_cached() -> bool {
    Command::new("sudo")
        .args(["-n", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Hand a root-owned output directory back to the invoking user.
pub fn reclaim_ownership(dir: &Path) {
    let id = |flag: &str| {
        Command::new("id")
            .arg(flag)
            .output()
            .ok()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let (Some(uid), Some(gid)) = (id("-u"), id("-g")) else {
        return;
    };
    let ok = Command::new("sudo")
        .arg("-n")
        .arg("chown")
        .arg("-R")
        .arg(format!("{uid}:{gid}"))
        .arg(dir)
        .stdin(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !ok {
        tracing::debug!("could not reclaim ownership of {}", dir.display());
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn opts() -> WatchOptions {
        let mut cfg = ProgressConfig::default();
        cfg.poll_interval_ms = 10;
        WatchOptions::new(&cfg)
    }

    #[test]
    fn carriage_returns_split_lines() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf 'a\\rb\\nc'");
        let mut lines = Vec::new();
        let outcome = run_watched(
            cmd,
            &opts(),
            &CancelToken::new(),
            &mut |line| {
                lines.push(line.to_string());
                None
            },
            &mut |_| {},
        )
        .expect("run");
        assert!(outcome.status.success());
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert_eq!(outcome.last_line(), "c");
    }

    #[test]
    fn failed_child_reports_its_tail() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo broken media >&2; exit 3");
        let outcome = run_watched(cmd, &opts(), &CancelToken::new(), &mut |_| None, &mut |_| {})
            .expect("run");
        let err = outcome.ensure_success("imager").unwrap_err();
        assert!(format!("{err}").contains("broken media"));
    }

    #[test]
    fn cancellation_stops_the_child() {
        let token = CancelToken::new();
        token.cancel();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exec sleep 30");
        let started = Instant::now();
        let err = run_watched(cmd, &opts(), &token, &mut |_| None, &mut |_| {}).unwrap_err();
        assert!(crate::tools::is_cancelled(&err));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn parsed_lines_become_progress_events() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'PERCENT:42'; sleep 0.1");
        let mut seen = Vec::new();
        run_watched(
            cmd,
            &opts(),
            &CancelToken::new(),
            &mut |line| {
                line.strip_prefix("PERCENT:").map(|p| ProgressEvent {
                    message: format!("{p}%"),
                    percent: p.parse().ok(),
                    bytes_per_sec: None,
                })
            },
            &mut |event| seen.push(event.clone()),
        )
        .expect("run");
        assert!(seen.iter().any(|e| e.percent == Some(42.0)));
    }
}
