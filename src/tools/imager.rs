use crate::archiver::config::ProgressConfig;
use crate::archiver::progress::ProgressEvent;
use crate::archiver::util::{format_rate, remove_file_if_exists};
use crate::tools::process::{
    Privilege, WatchOptions, build_command, reclaim_ownership, run_watched,
};
use crate::tools::{CancelToken, ImageStats, Imager, ProgressSink};
use anyhow::{Context, Result, bail};
use regex::Regex;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PCT_RESCUED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)pct rescued:\s*([0-9.]+)%").expect("valid regex"));
static RESCUED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[\s,])rescued:\s*([0-9.]+)\s*(B|kB|MB|GB|TB)\b").expect("valid regex")
});
static CURRENT_RATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)current rate:\s*([0-9.]+)\s*(B|kB|MB|GB)/s").expect("valid regex")
});
static AVERAGE_RATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)average rate:\s*([0-9.]+)\s*(B|kB|MB|GB)/s").expect("valid regex")
});
static PUPPET_PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"PERCENT:\s*(-?[0-9.]+)").expect("valid regex"));

/// ddrescue prints decimal units.
fn unit_scale(unit: &str) -> f64 {
    match unit.to_ascii_lowercase().as_str() {
        "kb" => 1e3,
        "mb" => 1e6,
        "gb" => 1e9,
        "tb" => 1e12,
        _ => 1.0,
    }
}

fn scaled(caps: &regex::Captures<'_>) -> Option<f64> {
    let value = caps.get(1)?.as_str().parse::<f64>().ok()?;
    Some(value * unit_scale(caps.get(2).map(|m| m.as_str()).unwrap_or("B")))
}

/// Running view of ddrescue's multi-line status block.
#[derive(Debug, Clone, Default)]
pub struct DdrescueStatus {
    rescued: Option<String>,
    current_rate: Option<f64>,
    average_rate: Option<f64>,
}

impl DdrescueStatus {
    pub fn feed(&mut self, line: &str) -> Option<ProgressEvent> {
        if let Some(caps) = RESCUED.captures(line) {
            self.rescued = Some(format!("{} {}", &caps[1], &caps[2]));
        }
        let mut rate_seen = false;
        if let Some(caps) = CURRENT_RATE.captures(line) {
            self.current_rate = scaled(&caps);
            rate_seen = true;
        }
        if let Some(caps) = AVERAGE_RATE.captures(line) {
            self.average_rate = scaled(&caps);
            rate_seen = true;
        }

        if let Some(caps) = PCT_RESCUED.captures(line) {
            let pct = caps[1].parse::<f64>().ok();
            let mut message = format!("{}% rescued", &caps[1]);
            if let Some(rescued) = &self.rescued {
                message.push_str(&format!(" ({rescued})"));
            }
            return Some(ProgressEvent {
                message,
                percent: pct,
                bytes_per_sec: self.current_rate,
            });
        }
        if rate_seen {
            let current = self.current_rate?;
            let mut message = format_rate(current);
            if let Some(avg) = self.average_rate {
                message.push_str(&format!(" avg {}", format_rate(avg)));
            }
            if let Some(rescued) = &self.rescued {
                message.push_str(&format!(" (rescued {rescued})"));
            }
            return Some(ProgressEvent {
                message,
                percent: None,
                bytes_per_sec: Some(current),
            });
        }
        None
    }
}

pub fn parse_puppet_percent(line: &str) -> Option<ProgressEvent> {
    let caps = PUPPET_PERCENT.captures(line)?;
    let pct = caps[1].parse::<f64>().ok().filter(|p| *p >= 0.0)?;
    Some(ProgressEvent {
        message: format!("{pct:.2}%"),
        percent: Some(pct),
        bytes_per_sec: None,
    })
}

fn privileges(use_sudo: bool) -> &'static [Privilege] {
    if use_sudo {
        &[Privilege::SudoNonInteractive, Privilege::SudoInteractive]
    } else {
        &[Privilege::Direct]
    }
}

struct Pass<'a> {
    phase: &'a str,
    bin: &'a Path,
    args: Vec<OsString>,
    watch: &'a Path,
    total_bytes: Option<u64>,
}

/// Run one imaging pass. With sudo, a failed `sudo -n` attempt is retried
/// through interactive `sudo`.
fn run_pass(
    pass: Pass<'_>,
    use_sudo: bool,
    progress_cfg: &ProgressConfig,
    cancel: &CancelToken,
    parse: &mut dyn FnMut(&str) -> Option<ProgressEvent>,
    progress: ProgressSink<'_>,
    stats: &mut ImageStats,
) -> Result<()> {
    let attempts = privileges(use_sudo);
    for (idx, privilege) in attempts.iter().enumerate() {
        let cmd = build_command(pass.bin, &pass.args, *privilege);
        let opts = WatchOptions::new(progress_cfg).watching(pass.watch, pass.total_bytes);
        let outcome = run_watched(cmd, &opts, cancel, parse, progress)
            .with_context(|| format!("{} pass failed to run", pass.phase))?;
        stats.insert(pass.phase.to_string(), outcome.last_line());
        if outcome.status.success() {
            return Ok(());
        }
        if idx + 1 == attempts.len() {
            return outcome.ensure_success(pass.phase);
        }
        progress(&ProgressEvent {
            message: "retrying with sudo (interactive)".to_string(),
            ..ProgressEvent::default()
        });
    }
    Ok(())
}

fn ensure_parent(output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

fn reclaim_if_sudo(use_sudo: bool, output: &Path) {
    if use_sudo && let Some(parent) = output.parent() {
        reclaim_ownership(parent);
    }
}

/// ddrescue: a fast no-scrape pass, then a retry pass, sharing one mapfile.
#[derive(Debug, Clone)]
pub struct DdrescueImager {
    bin: PathBuf,
    use_sudo: bool,
    progress: ProgressConfig,
}

impl DdrescueImager {
    pub fn new(bin: PathBuf, use_sudo: bool, progress: ProgressConfig) -> Self {
        Self {
            bin,
            use_sudo,
            progress,
        }
    }
}

pub fn mapfile_path(output: &Path) -> PathBuf {
    output.with_extension("log")
}

pub fn ddrescue_args(raw: &str, output: &Path, mapfile: &Path, retry: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-b".into(), "2048".into(), "-c".into(), "16384".into()];
    args.push(if retry { "-r3" } else { "-n" }.into());
    args.push(raw.into());
    args.push(output.as_os_str().to_owned());
    args.push(mapfile.as_os_str().to_owned());
    args
}

impl Imager for DdrescueImager {
    fn name(&self) -> &'static str {
        "ddrescue"
    }

    fn image(
        &self,
        raw_device_id: &str,
        output: &Path,
        total_bytes: Option<u64>,
        cancel: &CancelToken,
        progress: ProgressSink<'_>,
    ) -> Result<ImageStats> {
        ensure_parent(output)?;
        let mapfile = mapfile_path(output);
        let mut stats = ImageStats::new();

        for (phase, retry) in [("ddrescue_fast", false), ("ddrescue_retry", true)] {
            let mut status = DdrescueStatus::default();
            let pass = Pass {
                phase,
                bin: &self.bin,
                args: ddrescue_args(raw_device_id, output, &mapfile, retry),
                watch: output,
                total_bytes,
            };
            run_pass(
                pass,
                self.use_sudo,
                &self.progress,
                cancel,
                &mut |line| status.feed(line),
                &mut *progress,
                &mut stats,
            )?;
        }

        reclaim_if_sudo(self.use_sudo, output);
        if !output.is_file() {
            bail!("ddrescue finished but {} is missing", output.display());
        }
        Ok(stats)
    }
}

/// `hdiutil create -format UDTO`, renamed from `.cdr` to the target name.
#[derive(Debug, Clone)]
pub struct HdiutilImager {
    bin: PathBuf,
    use_sudo: bool,
    progress: ProgressConfig,
}

impl HdiutilImager {
    pub fn new(bin: PathBuf, use_sudo: bool, progress: ProgressConfig) -> Self {
        Self {
            bin,
            use_sudo,
            progress,
        }
    }
}

pub fn hdiutil_args(raw: &str, prefix: &Path) -> Vec<OsString> {
    vec![
        "create".into(),
        "-puppetstrings".into(),
        "-srcdevice".into(),
        raw.into(),
        "-format".into(),
        "UDTO".into(),
        "-o".into(),
        prefix.as_os_str().to_owned(),
    ]
}

impl Imager for HdiutilImager {
    fn name(&self) -> &'static str {
        "hdiutil"
    }

    fn image(
        &self,
        raw_device_id: &str,
        output: &Path,
        total_bytes: Option<u64>,
        cancel: &CancelToken,
        progress: ProgressSink<'_>,
    ) -> Result<ImageStats> {
        ensure_parent(output)?;
        let prefix = output.with_extension("");
        let cdr = prefix.with_extension("cdr");
        remove_file_if_exists(&cdr)?;

        let mut stats = ImageStats::new();
        let pass = Pass {
            phase: "hdiutil",
            bin: &self.bin,
            args: hdiutil_args(raw_device_id, &prefix),
            watch: &cdr,
            total_bytes,
        };
        run_pass(
            pass,
            self.use_sudo,
            &self.progress,
            cancel,
            &mut parse_puppet_percent,
            progress,
            &mut stats,
        )?;

        reclaim_if_sudo(self.use_sudo, output);
        if !cdr.is_file() {
            bail!("hdiutil finished but {} is missing", cdr.display());
        }
        remove_file_if_exists(output)?;
        fs::rename(&cdr, output).with_context(|| {
            format!("failed to rename {} to {}", cdr.display(), output.display())
        })?;
        Ok(stats)
    }
}
