//! Per-item step sequence: validate, acquire, checksum, protect.
//!
//! The pipeline writes output files and sidecars but never the ledger; the
//! caller commits a successful outcome once every output is durable.

use crate::archiver::config::{ArchiverConfig, ProgressConfig};
use crate::archiver::item::{
    CompletedUnit, FileUnit, SUPPORTED_FORMATS, UnitAction, WorkItem, extension_of,
};
use crate::archiver::ledger::Ledger;
use crate::archiver::locator::folder_sample;
use crate::archiver::progress::{
    PipelineObserver, ProgressEvent, SizeProgress, StepState, StepStatus,
};
use crate::archiver::util::{
    file_size, remove_file_if_exists, sync_dir, sync_file, write_text_atomic,
};
use crate::archiver::warn::{self, WarnEvent};
use crate::error::StepError;
use crate::tools::hasher::sidecar_line;
use crate::tools::{CancelToken, ImageStats, Toolset, is_cancelled};
use anyhow::{Context, Result, bail};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const COPY_CHUNK: usize = 8 * 1024 * 1024;
const FOLDER_SAMPLE: usize = 10;

pub const STEP_VALIDATE: &str = "validate";
pub const STEP_ACQUIRE: &str = "acquire";
pub const STEP_CHECKSUM: &str = "checksum";
pub const STEP_PROTECT: &str = "protect";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Validating,
    Acquiring,
    Checksumming,
    Protecting,
    Done,
    Error,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub min_conversion_ratio: f64,
    pub parity_enabled: bool,
    pub parity_percent: u32,
    pub progress: ProgressConfig,
}

impl PipelineSettings {
    pub fn from_config(cfg: &ArchiverConfig) -> Self {
        Self {
            min_conversion_ratio: cfg.batch.min_conversion_ratio,
            parity_enabled: cfg.parity.enabled,
            parity_percent: cfg.parity.redundancy_percent,
            progress: cfg.progress.clone(),
        }
    }
}

/// One item's planned work.
#[derive(Debug, Clone, Copy)]
pub struct ItemJob<'a> {
    pub item: &'a WorkItem,
    pub units: &'a [FileUnit],
    pub target_dir: &'a Path,
    pub device_capacity: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    /// Newly written outputs, ready for the ledger.
    pub produced: Vec<CompletedUnit>,
    /// Target names skipped because the ledger already had them.
    pub reused: Vec<String>,
    pub image_stats: ImageStats,
}

struct Produced {
    source: PathBuf,
    target: PathBuf,
    digest: Option<String>,
}

pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

pub fn sidecar_path(target: &Path) -> PathBuf {
    with_suffix(target, ".sha256")
}

pub fn parity_path(target: &Path) -> PathBuf {
    with_suffix(target, ".ecc")
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn io_error(path: &Path, err: impl std::fmt::Display) -> StepError {
    StepError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

/// Cancellation wins over whatever else the collaborator reported.
fn classify(err: anyhow::Error, make: impl FnOnce(String) -> StepError) -> StepError {
    if is_cancelled(&err) {
        StepError::Cancelled
    } else {
        make(format!("{err:#}"))
    }
}

pub struct Pipeline<'a> {
    settings: &'a PipelineSettings,
    tools: &'a Toolset,
    cancel: &'a CancelToken,
    state: PipelineState,
}

impl<'a> Pipeline<'a> {
    pub fn new(settings: &'a PipelineSettings, tools: &'a Toolset, cancel: &'a CancelToken) -> Self {
        Self {
            settings,
            tools,
            cancel,
            state: PipelineState::Pending,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Drive `job` to `Done`, or stop in `Error` with the first failure.
    pub fn run(
        &mut self,
        job: &ItemJob<'_>,
        ledger: &Ledger,
        observer: &mut dyn PipelineObserver,
    ) -> Result<PipelineOutcome, StepError> {
        self.state = PipelineState::Pending;
        let result = self.run_steps(job, ledger, observer);
        self.state = match &result {
            Ok(_) => PipelineState::Done,
            Err(_) => PipelineState::Error,
        };
        result
    }

    fn enter(&mut self, state: PipelineState, observer: &mut dyn PipelineObserver, step: &str) {
        self.state = state;
        observer.step(step, &StepState::new(StepStatus::Running, ""));
    }

    fn check_cancel(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        Ok(())
    }

    fn run_steps(
        &mut self,
        job: &ItemJob<'_>,
        ledger: &Ledger,
        observer: &mut dyn PipelineObserver,
    ) -> Result<PipelineOutcome, StepError> {
        let mut outcome = PipelineOutcome::default();

        self.enter(PipelineState::Validating, observer, STEP_VALIDATE);
        let validated = self.check_cancel().and_then(|_| validate(job));
        finish(observer, STEP_VALIDATE, validated.map(|_| {
            StepState::new(StepStatus::Done, format!("{} file(s)", job.units.len()))
        }))?;

        self.enter(PipelineState::Acquiring, observer, STEP_ACQUIRE);
        let acquired = self.acquire(job, ledger, observer, &mut outcome);
        let produced = finish(observer, STEP_ACQUIRE, acquired.map(|produced| {
            let message = format!(
                "{} acquired, {} already complete",
                produced.len(),
                outcome.reused.len()
            );
            (produced, StepState::new(StepStatus::Done, message))
        }))?;

        self.enter(PipelineState::Checksumming, observer, STEP_CHECKSUM);
        let hashed = self.checksum(produced);
        let hashed = finish(observer, STEP_CHECKSUM, hashed.map(|units| {
            let message = match units.as_slice() {
                [only] => only.checksum.chars().take(16).collect::<String>() + "...",
                many => format!("{} digest(s) written", many.len()),
            };
            (units, StepState::new(StepStatus::Done, message))
        }))?;

        self.enter(PipelineState::Protecting, observer, STEP_PROTECT);
        let protected = self.protect(job, hashed);
        outcome.produced = finish(observer, STEP_PROTECT, protected)?;

        Ok(outcome)
    }

    fn acquire(
        &self,
        job: &ItemJob<'_>,
        ledger: &Ledger,
        observer: &mut dyn PipelineObserver,
        outcome: &mut PipelineOutcome,
    ) -> Result<Vec<Produced>, StepError> {
        fs::create_dir_all(job.target_dir).map_err(|err| io_error(job.target_dir, err))?;

        let mut produced = Vec::new();
        for unit in job.units {
            self.check_cancel()?;
            let target = job.target_dir.join(&unit.target_name);
            // A disc's raw device path changes between insertions.
            let recorded_source = match unit.action {
                UnitAction::Image => None,
                UnitAction::Copy | UnitAction::Convert => Some(unit.source_path.as_path()),
            };
            if ledger.is_completed(&unit.target_name, recorded_source) {
                tracing::debug!("{} already archived; skipping", unit.target_name);
                outcome.reused.push(unit.target_name.clone());
                continue;
            }

            let digest = match unit.action {
                UnitAction::Copy => Some(self.copy_verified(unit, &target, observer)?),
                UnitAction::Convert => {
                    self.convert(unit, &target, observer)?;
                    None
                }
                UnitAction::Image => {
                    let stats = self.image(job, unit, &target, observer)?;
                    outcome.image_stats.extend(stats);
                    None
                }
            };
            if !target.is_file() {
                return Err(StepError::OutputMissing {
                    file: target.display().to_string(),
                });
            }
            // Copies are flushed before their rename; tool outputs are not.
            if unit.action != UnitAction::Copy {
                sync_file(&target).map_err(|err| io_error(&target, format!("{err:#}")))?;
            }
            produced.push(Produced {
                source: unit.source_path.clone(),
                target,
                digest,
            });
        }
        if !produced.is_empty() {
            sync_dir(job.target_dir).map_err(|err| io_error(job.target_dir, format!("{err:#}")))?;
        }
        Ok(produced)
    }

    fn copy_with_progress(
        &self,
        source: &Path,
        dest: &Path,
        observer: &mut dyn PipelineObserver,
    ) -> Result<()> {
        let part = with_suffix(dest, ".part");
        let result = self.write_part(source, &part, observer).and_then(|_| {
            fs::rename(&part, dest).with_context(|| {
                format!("failed to move {} into place", part.display())
            })
        });
        if result.is_err() {
            let _ = remove_file_if_exists(&part);
        }
        result
    }

    fn write_part(
        &self,
        source: &Path,
        part: &Path,
        observer: &mut dyn PipelineObserver,
    ) -> Result<()> {
        let mut reader =
            File::open(source).with_context(|| format!("failed to open {}", source.display()))?;
        let mut writer =
            File::create(part).with_context(|| format!("failed to create {}", part.display()))?;
        let mut sizes = SizeProgress::new(&self.settings.progress, file_size(source));
        let every = Duration::from_millis(self.settings.progress.poll_interval_ms);
        let mut last_tick = Instant::now();
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut written = 0u64;
        loop {
            self.cancel.check()?;
            let n = reader
                .read(&mut buf)
                .with_context(|| format!("failed to read {}", source.display()))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .with_context(|| format!("failed to write {}", part.display()))?;
            written += n as u64;
            let now = Instant::now();
            if now.duration_since(last_tick) >= every {
                observer.progress(STEP_ACQUIRE, &sizes.observe(now, written));
                last_tick = now;
            }
        }
        writer
            .sync_all()
            .with_context(|| format!("failed to flush {}", part.display()))?;
        Ok(())
    }

    /// Copy, then compare source and output digests. Returns the digest.
    fn copy_verified(
        &self,
        unit: &FileUnit,
        target: &Path,
        observer: &mut dyn PipelineObserver,
    ) -> Result<String, StepError> {
        let file = file_label(&unit.source_path);
        self.copy_with_progress(&unit.source_path, target, observer)
            .and_then(|_| self.verify_copy(&unit.source_path, target))
            .map_err(|err| {
                classify(err, |message| StepError::Acquire {
                    file: file.clone(),
                    message,
                })
            })
    }

    fn verify_copy(&self, source: &Path, target: &Path) -> Result<String> {
        let expected = self.tools.hasher.hash(source, self.cancel)?;
        let actual = self.tools.hasher.hash(target, self.cancel)?;
        if expected != actual {
            let _ = remove_file_if_exists(target);
            bail!("copy verification failed: source {expected}, output {actual}");
        }
        Ok(actual)
    }

    /// Stage the source beside the target, convert it, drop the staging copy
    /// and reject outputs too small to be a faithful conversion.
    fn convert(
        &self,
        unit: &FileUnit,
        target: &Path,
        observer: &mut dyn PipelineObserver,
    ) -> Result<(), StepError> {
        let file = file_label(&unit.source_path);
        let acquire_err = |message: String| StepError::Acquire {
            file: file.clone(),
            message,
        };
        let source_ext = extension_of(&unit.source_path).unwrap_or_else(|| "src".to_string());
        let staged = target.with_extension(&source_ext);

        self.copy_with_progress(&unit.source_path, &staged, observer)
            .map_err(|err| classify(err, acquire_err))?;
        let converted = self.tools.converter.convert(
            &staged,
            "iso",
            self.cancel,
            &mut |event: &ProgressEvent| observer.progress(STEP_ACQUIRE, event),
        );
        let _ = remove_file_if_exists(&staged);
        let converted = converted.map_err(|err| classify(err, acquire_err))?;
        if converted != target {
            fs::rename(&converted, target).map_err(|err| io_error(target, err))?;
        }

        let source_bytes = file_size(&unit.source_path).unwrap_or(0);
        let output_bytes = file_size(target).unwrap_or(0);
        let min_bytes = source_bytes as f64 * self.settings.min_conversion_ratio;
        if (output_bytes as f64) < min_bytes {
            let _ = remove_file_if_exists(target);
            return Err(StepError::UndersizedConversion {
                file: file_label(target),
                output_bytes,
                source_bytes,
                min_percent: (self.settings.min_conversion_ratio * 100.0).round() as u32,
            });
        }
        Ok(())
    }

    fn image(
        &self,
        job: &ItemJob<'_>,
        unit: &FileUnit,
        target: &Path,
        observer: &mut dyn PipelineObserver,
    ) -> Result<ImageStats, StepError> {
        let file = file_label(target);
        let Some(imager) = self.tools.imager.as_deref() else {
            return Err(StepError::Acquire {
                file,
                message: "no imaging tool configured".to_string(),
            });
        };
        let raw = unit.source_path.display().to_string();
        imager
            .image(
                &raw,
                target,
                job.device_capacity,
                self.cancel,
                &mut |event: &ProgressEvent| observer.progress(STEP_ACQUIRE, event),
            )
            .map_err(|err| {
                classify(err, |message| StepError::Acquire {
                    file: file.clone(),
                    message: format!("{}: {message}", imager.name()),
                })
            })
    }

    fn checksum(&self, produced: Vec<Produced>) -> Result<Vec<CompletedUnit>, StepError> {
        let mut out = Vec::with_capacity(produced.len());
        for p in produced {
            self.check_cancel()?;
            let file = file_label(&p.target);
            let digest = match p.digest {
                Some(digest) => digest,
                None => self.tools.hasher.hash(&p.target, self.cancel).map_err(|err| {
                    classify(err, |message| StepError::Checksum {
                        file: file.clone(),
                        message,
                    })
                })?,
            };
            let sidecar = sidecar_path(&p.target);
            write_text_atomic(&sidecar, &sidecar_line(&digest, &file)).map_err(|err| {
                StepError::Checksum {
                    file: file.clone(),
                    message: format!("{err:#}"),
                }
            })?;
            out.push(CompletedUnit {
                source_path: p.source,
                target_path: p.target,
                checksum: digest,
                parity_path: None,
            });
        }
        if let Some(dir) = out.first().and_then(|u| u.target_path.parent()) {
            sync_dir(dir).map_err(|err| io_error(dir, format!("{err:#}")))?;
        }
        Ok(out)
    }

    /// Parity never fails the item; only cancellation does.
    fn protect(
        &self,
        job: &ItemJob<'_>,
        mut units: Vec<CompletedUnit>,
    ) -> Result<(Vec<CompletedUnit>, StepState), StepError> {
        if units.is_empty() {
            return Ok((units, StepState::new(StepStatus::Skipped, "nothing new to protect")));
        }
        if !self.settings.parity_enabled {
            return Ok((units, StepState::new(StepStatus::Skipped, "parity disabled")));
        }
        if !self.tools.parity.available() {
            warn::emit(WarnEvent {
                code: "PARITY_SKIPPED",
                stage: STEP_PROTECT,
                item: &job.item.number,
                file: "",
                retry: "none",
                reason: "tool-unavailable",
                err: "",
            });
            return Ok((
                units,
                StepState::new(StepStatus::Skipped, "parity tool not available"),
            ));
        }

        let mut failures = 0usize;
        for unit in units.iter_mut() {
            self.check_cancel()?;
            let ecc = parity_path(&unit.target_path);
            let created = self
                .tools
                .parity
                .create_parity(&unit.target_path, &ecc, self.settings.parity_percent, self.cancel)
                .and_then(|_| sync_file(&ecc));
            match created {
                Ok(()) => unit.parity_path = Some(ecc),
                Err(err) if is_cancelled(&err) => {
                    let _ = remove_file_if_exists(&ecc);
                    return Err(StepError::Cancelled);
                }
                Err(err) => {
                    failures += 1;
                    let _ = remove_file_if_exists(&ecc);
                    warn::emit(WarnEvent {
                        code: "PARITY_FAILED",
                        stage: STEP_PROTECT,
                        item: &job.item.number,
                        file: &unit.target_path.display().to_string(),
                        retry: "none",
                        reason: "tool-error",
                        err: &format!("{err:#}"),
                    });
                }
            }
        }

        let state = if failures == 0 {
            StepState::new(StepStatus::Done, format!("{} parity file(s)", units.len()))
        } else {
            StepState::new(
                StepStatus::Skipped,
                format!("parity failed for {failures} of {} file(s)", units.len()),
            )
        };
        Ok((units, state))
    }
}

fn validate(job: &ItemJob<'_>) -> Result<(), StepError> {
    if !job.units.is_empty() {
        return Ok(());
    }
    let sample = folder_sample(&job.item.source_path, FOLDER_SAMPLE);
    Err(StepError::NoInputFiles {
        folder: job.item.source_path.display().to_string(),
        supported: SUPPORTED_FORMATS.join(", "),
        sample: if sample.is_empty() {
            "(nothing)".to_string()
        } else {
            sample.join(", ")
        },
    })
}

/// Publish a step's terminal state and hand back its value.
fn finish<T>(
    observer: &mut dyn PipelineObserver,
    step: &str,
    result: Result<T, StepError>,
) -> Result<T::Value, StepError>
where
    T: StepResult,
{
    match result {
        Ok(value) => {
            let (value, state) = value.split();
            observer.step(step, &state);
            Ok(value)
        }
        Err(err) => {
            observer.step(step, &StepState::new(StepStatus::Error, err.to_string()));
            Err(err)
        }
    }
}

/// A step's value paired with the state it reports.
trait StepResult {
    type Value;
    fn split(self) -> (Self::Value, StepState);
}

impl StepResult for StepState {
    type Value = ();
    fn split(self) -> ((), StepState) {
        ((), self)
    }
}

impl<V> StepResult for (V, StepState) {
    type Value = V;
    fn split(self) -> (V, StepState) {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::naming::{NamingOptions, disc_unit, plan_units};
    use crate::archiver::test_support::{
        FakeConverter, FakeImager, FakeParity, Recorder, SelectiveHasher, tools,
    };
    use crate::tools::hasher::Sha256Hasher;
    use tempfile::tempdir;

    fn settings(ratio: f64) -> PipelineSettings {
        PipelineSettings {
            min_conversion_ratio: ratio,
            parity_enabled: true,
            parity_percent: 10,
            progress: ProgressConfig::default(),
        }
    }

    fn movie(root: &Path, files: &[(&str, &[u8])]) -> WorkItem {
        let folder = root.join("0042 My Movie");
        fs::create_dir_all(&folder).expect("mkdir");
        let mut paths = Vec::new();
        for (name, data) in files {
            let path = folder.join(name);
            fs::write(&path, data).expect("write input");
            paths.push(path);
        }
        WorkItem {
            number: "0042".into(),
            title: "My Movie".into(),
            source_path: folder,
            files: paths,
        }
    }

    fn run_item(
        tools: &Toolset,
        settings: &PipelineSettings,
        item: &WorkItem,
        opts: NamingOptions,
        target_dir: &Path,
        ledger: &Ledger,
    ) -> (Result<PipelineOutcome, StepError>, Recorder, PipelineState) {
        let units = plan_units(item, &opts).expect("plan");
        let cancel = CancelToken::new();
        let mut pipeline = Pipeline::new(settings, tools, &cancel);
        let mut recorder = Recorder::default();
        let job = ItemJob {
            item,
            units: &units,
            target_dir,
            device_capacity: None,
        };
        let result = pipeline.run(&job, ledger, &mut recorder);
        (result, recorder, pipeline.state())
    }

    #[test]
    fn copies_verifies_and_writes_sidecar_and_parity() {
        let tmp = tempdir().expect("tempdir");
        let item = movie(&tmp.path().join("src"), &[("0042.iso", b"disc bytes")]);
        let target = tmp.path().join("out/0042_My_Movie");
        let ledger = Ledger::load(&tmp.path().join("state.json"));
        let tools = tools();
        let cfg = settings(0.85);

        let (result, recorder, state) =
            run_item(&tools, &cfg, &item, NamingOptions::default(), &target, &ledger);
        let outcome = result.expect("pipeline");

        assert_eq!(state, PipelineState::Done);
        assert_eq!(outcome.produced.len(), 1);
        let unit = &outcome.produced[0];
        assert_eq!(unit.target_path, target.join("0042.iso"));
        assert_eq!(fs::read(&unit.target_path).expect("read"), b"disc bytes");
        let sidecar = fs::read_to_string(target.join("0042.iso.sha256")).expect("sidecar");
        assert_eq!(sidecar, sidecar_line(&unit.checksum, "0042.iso"));
        assert_eq!(unit.parity_path.as_deref(), Some(target.join("0042.iso.ecc").as_path()));
        assert!(!target.join("0042.iso.part").exists());
        for step in [STEP_VALIDATE, STEP_ACQUIRE, STEP_CHECKSUM, STEP_PROTECT] {
            assert_eq!(recorder.last_status(step), Some(StepStatus::Done), "{step}");
        }
    }

    #[test]
    fn completed_units_are_reused() {
        let tmp = tempdir().expect("tempdir");
        let item = movie(&tmp.path().join("src"), &[("0042.iso", b"disc bytes")]);
        let target = tmp.path().join("out/0042_My_Movie");
        let mut ledger = Ledger::load(&tmp.path().join("state.json"));
        let tools = tools();
        let cfg = settings(0.85);

        let (first, _, _) =
            run_item(&tools, &cfg, &item, NamingOptions::default(), &target, &ledger);
        let produced = first.expect("first run").produced;
        ledger
            .commit_item("0042", "My Movie", &produced, "src")
            .expect("commit");

        let (second, recorder, _) =
            run_item(&tools, &cfg, &item, NamingOptions::default(), &target, &ledger);
        let outcome = second.expect("second run");
        assert!(outcome.produced.is_empty());
        assert_eq!(outcome.reused, vec!["0042.iso".to_string()]);
        assert_eq!(recorder.last_status(STEP_PROTECT), Some(StepStatus::Skipped));
    }

    #[test]
    fn undersized_conversion_is_discarded() {
        let tmp = tempdir().expect("tempdir");
        let item = movie(&tmp.path().join("src"), &[("0042.mdx", &[7u8; 1000])]);
        let target = tmp.path().join("out/0042_My_Movie");
        let ledger = Ledger::load(&tmp.path().join("state.json"));
        let mut tools = tools();
        tools.converter = Box::new(FakeConverter { ratio: 0.8 });
        let opts = NamingOptions {
            convert: true,
            ..NamingOptions::default()
        };

        let (result, recorder, state) =
            run_item(&tools, &settings(0.85), &item, opts, &target, &ledger);
        let err = result.expect_err("undersized");
        assert_eq!(
            err,
            StepError::UndersizedConversion {
                file: "0042.iso".into(),
                output_bytes: 800,
                source_bytes: 1000,
                min_percent: 85,
            }
        );
        assert_eq!(state, PipelineState::Error);
        assert_eq!(recorder.last_status(STEP_ACQUIRE), Some(StepStatus::Error));
        assert_eq!(recorder.last_status(STEP_CHECKSUM), None);
        assert!(!target.join("0042.iso").exists());
        assert!(!target.join("0042.mdx").exists());
    }

    #[test]
    fn conversion_leaves_only_the_converted_image() {
        let tmp = tempdir().expect("tempdir");
        let item = movie(&tmp.path().join("src"), &[("0042.mdx", &[7u8; 1000])]);
        let target = tmp.path().join("out/0042_My_Movie");
        let ledger = Ledger::load(&tmp.path().join("state.json"));
        let tools = tools();
        let opts = NamingOptions {
            convert: true,
            ..NamingOptions::default()
        };

        let (result, _, _) = run_item(&tools, &settings(0.85), &item, opts, &target, &ledger);
        let outcome = result.expect("convert");
        assert_eq!(outcome.produced[0].target_path, target.join("0042.iso"));
        assert!(outcome.produced[0].source_path.ends_with("0042.mdx"));
        assert!(!target.join("0042.mdx").exists());
        assert!(target.join("0042.iso.sha256").exists());
    }

    #[test]
    fn converted_output_dir_holds_only_durable_outputs() {
        let tmp = tempdir().expect("tempdir");
        let item = movie(&tmp.path().join("src"), &[("0042.mdx", &[7u8; 1000])]);
        let target = tmp.path().join("out/0042_My_Movie");
        let ledger = Ledger::load(&tmp.path().join("state.json"));
        let opts = NamingOptions {
            convert: true,
            ..NamingOptions::default()
        };

        let (result, _, _) = run_item(&tools(), &settings(0.85), &item, opts, &target, &ledger);
        let outcome = result.expect("convert");
        let mut names: Vec<String> = fs::read_dir(&target)
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["0042.iso", "0042.iso.ecc", "0042.iso.sha256"]);
        let sidecar = fs::read_to_string(target.join("0042.iso.sha256")).expect("sidecar");
        assert_eq!(sidecar, sidecar_line(&outcome.produced[0].checksum, "0042.iso"));
    }

    #[test]
    fn parity_problems_never_fail_the_item() {
        let tmp = tempdir().expect("tempdir");
        let item = movie(&tmp.path().join("src"), &[("0042.iso", b"disc bytes")]);
        let ledger = Ledger::load(&tmp.path().join("state.json"));
        let cfg = settings(0.85);

        let mut unavailable = tools();
        unavailable.parity = Box::new(FakeParity {
            available: false,
            fail: false,
        });
        let target = tmp.path().join("a");
        let (result, recorder, _) =
            run_item(&unavailable, &cfg, &item, NamingOptions::default(), &target, &ledger);
        assert!(result.expect("no tool").produced[0].parity_path.is_none());
        assert_eq!(recorder.last_status(STEP_PROTECT), Some(StepStatus::Skipped));

        let mut failing = tools();
        failing.parity = Box::new(FakeParity {
            available: true,
            fail: true,
        });
        let target = tmp.path().join("b");
        let (result, recorder, state) =
            run_item(&failing, &cfg, &item, NamingOptions::default(), &target, &ledger);
        assert!(result.expect("tool failed").produced[0].parity_path.is_none());
        assert_eq!(state, PipelineState::Done);
        assert_eq!(recorder.last_status(STEP_PROTECT), Some(StepStatus::Skipped));
        assert!(!target.join("0042.iso.ecc").exists());
    }

    #[test]
    fn empty_folder_reports_what_it_found() {
        let tmp = tempdir().expect("tempdir");
        let item = movie(&tmp.path().join("src"), &[("notes.txt", b"hi")]);
        let item = WorkItem {
            files: Vec::new(),
            ..item
        };
        let ledger = Ledger::load(&tmp.path().join("state.json"));
        let (result, recorder, _) = run_item(
            &tools(),
            &settings(0.85),
            &item,
            NamingOptions::default(),
            &tmp.path().join("out"),
            &ledger,
        );
        let err = result.expect_err("no input");
        let text = err.to_string();
        assert!(text.contains("notes.txt"), "{text}");
        assert!(text.contains("iso"), "{text}");
        assert_eq!(recorder.last_status(STEP_VALIDATE), Some(StepStatus::Error));
        assert_eq!(recorder.last_status(STEP_ACQUIRE), None);
    }

    #[test]
    fn hash_failure_fails_the_acquire_step() {
        let tmp = tempdir().expect("tempdir");
        let item = movie(&tmp.path().join("src"), &[("0042.iso", b"disc bytes")]);
        let ledger = Ledger::load(&tmp.path().join("state.json"));
        let mut tools = tools();
        tools.hasher = Box::new(SelectiveHasher {
            fail_on: "0042.iso".into(),
        });
        let (result, _, _) = run_item(
            &tools,
            &settings(0.85),
            &item,
            NamingOptions::default(),
            &tmp.path().join("out"),
            &ledger,
        );
        assert!(matches!(result, Err(StepError::Acquire { .. })));
    }

    #[test]
    fn cancellation_is_reported_as_such() {
        let tmp = tempdir().expect("tempdir");
        let item = movie(&tmp.path().join("src"), &[("0042.iso", b"disc bytes")]);
        let units = plan_units(&item, &NamingOptions::default()).expect("plan");
        let ledger = Ledger::load(&tmp.path().join("state.json"));
        let tools = tools();
        let cfg = settings(0.85);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut pipeline = Pipeline::new(&cfg, &tools, &cancel);
        let job = ItemJob {
            item: &item,
            units: &units,
            target_dir: &tmp.path().join("out"),
            device_capacity: None,
        };
        let err = pipeline
            .run(&job, &ledger, &mut Recorder::default())
            .expect_err("cancelled");
        assert!(err.is_cancelled());
    }

    #[test]
    fn disc_units_go_through_the_imager() {
        let tmp = tempdir().expect("tempdir");
        let item = WorkItem {
            number: "0042".into(),
            title: "MOVIE".into(),
            source_path: PathBuf::from("/dev/rdisk9"),
            files: Vec::new(),
        };
        let units = vec![disc_unit("0042", "/dev/rdisk9")];
        let ledger = Ledger::load(&tmp.path().join("state.json"));
        let tools = Toolset {
            hasher: Box::new(Sha256Hasher),
            parity: Box::new(FakeParity {
                available: true,
                fail: false,
            }),
            converter: Box::new(FakeConverter { ratio: 1.0 }),
            imager: Some(Box::new(FakeImager {
                bytes: b"raw sectors".to_vec(),
            })),
        };
        let cfg = settings(0.85);
        let cancel = CancelToken::new();
        let mut pipeline = Pipeline::new(&cfg, &tools, &cancel);
        let target = tmp.path().join("disc_0042");
        let job = ItemJob {
            item: &item,
            units: &units,
            target_dir: &target,
            device_capacity: Some(11),
        };
        let outcome = pipeline
            .run(&job, &ledger, &mut Recorder::default())
            .expect("image");
        assert_eq!(outcome.produced[0].target_path, target.join("disc_0042.iso"));
        assert_eq!(outcome.image_stats.get("fake").map(String::as_str), Some("done"));
        assert!(target.join("disc_0042.iso.ecc").exists());
    }
}
