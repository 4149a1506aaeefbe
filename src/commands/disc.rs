use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::archiver::audit;
use crate::archiver::ledger::Ledger;
use crate::archiver::locator::from_label;
use crate::archiver::lock::RunLock;
use crate::archiver::naming::disc_unit;
use crate::archiver::paths::{disc_dir, ledger_path, resolve_paths};
use crate::archiver::pipeline::{ItemJob, Pipeline, PipelineSettings};
use crate::archiver::progress::{LogObserver, PipelineObserver, ProgressEvent, StepState, StepStatus};
use crate::archiver::record::{DiscRecord, save_record};
use crate::archiver::retry::{ItemOutcome, RetryCoordinator};
use crate::archiver::util::{file_size, now_iso8601, remove_dir_if_exists};
use crate::archiver::warn::{self, WarnEvent};
use crate::commands::{CommandReport, command_config};
use crate::error::ArchiverError;
use crate::tools::device::DiskutilLocator;
use crate::tools::imager::mapfile_path;
use crate::tools::process::sudo_is_cached;
use crate::tools::{
    CancelToken, DeviceHandle, DeviceLocator, build_toolset, imaging_tool_name, imaging_tool_path,
};

/// Source-root key for disc runs in the ledger statistics.
const DISC_SOURCE: &str = "optical-drive";

#[derive(Debug, Clone, Default)]
pub struct DiscArgs {
    pub force: bool,
}

/// Logs like `LogObserver` and keeps each step's last state for the record.
struct RecordingObserver<'r> {
    record: &'r mut DiscRecord,
    log: LogObserver,
}

impl PipelineObserver for RecordingObserver<'_> {
    fn step(&mut self, name: &str, state: &StepState) {
        self.log.step(name, state);
        self.record.steps.insert(name.to_string(), state.clone());
    }

    fn progress(&mut self, name: &str, event: &ProgressEvent) {
        self.log.progress(name, event);
    }
}

/// Volume label, or a timestamp key for discs that carry none.
fn disc_label(locator: &dyn DeviceLocator, device: &DeviceHandle) -> String {
    locator
        .label(&device.device_id)
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| format!("UNTITLED_{}", chrono::Utc::now().format("%Y%m%d%H%M%S")))
}

fn eject(locator: &dyn DeviceLocator, device: &DeviceHandle, record: &mut DiscRecord) {
    if locator.eject(&device.device_id) {
        record.set_step("eject", StepStatus::Done, device.device_id.clone());
    } else {
        warn::emit(WarnEvent {
            code: "EJECT_FAILED",
            stage: "eject",
            item: &record.disc_number,
            file: &device.device_id,
            retry: "manual",
            reason: "diskutil-eject-failed",
            err: "",
        });
        record.set_step("eject", StepStatus::Error, "eject failed; remove the disc manually");
    }
}

fn save_drive_status(locator: &dyn DeviceLocator, dir: &Path, number: &str) -> Result<()> {
    let Some(status) = locator.status_report() else {
        return Ok(());
    };
    let path = dir.join(format!("disc_{number}_info.txt"));
    fs::write(&path, status).with_context(|| format!("failed to write {}", path.display()))
}

pub fn run(args: &DiscArgs, cancel: &CancelToken) -> Result<CommandReport> {
    let cfg = command_config()?;
    let paths = resolve_paths(&cfg);
    let locator = DiskutilLocator::from_config(&cfg.tools);
    let mut report = CommandReport::new("disc");

    let Some(device) = locator.locate() else {
        return Err(ArchiverError::NoDevice.into());
    };
    let started = now_iso8601();
    let label = disc_label(&locator, &device);
    let item = from_label(&label);
    let number = item.number.clone();
    report.detail(format!("device={} raw={}", device.device_id, device.raw_device_id));
    report.detail(format!("label={label} disc={number}"));

    if let Some(tool) = locator.missing_tools().first() {
        return Err(ArchiverError::MissingTool((*tool).to_string()).into());
    }
    if imaging_tool_path(&cfg).is_none() {
        return Err(
            ArchiverError::MissingTool(imaging_tool_name(cfg.imaging.mode).to_string()).into(),
        );
    }

    if cfg.imaging.use_sudo && !sudo_is_cached() {
        tracing::info!("sudo credentials are not cached; imaging may prompt for a password");
    }

    let _lock = RunLock::acquire(&paths.archive_base)?;
    let mut ledger = Ledger::load(&ledger_path(&paths.archive_base));
    let unit = disc_unit(&number, &device.raw_device_id);
    let target_dir = disc_dir(&paths.archive_base, &number);
    let mut record = DiscRecord::new(number.clone(), started);
    record.device_disk = Some(device.device_id.clone());
    record.device_rdisk = Some(device.raw_device_id.clone());
    record.set_step("detect", StepStatus::Done, label.clone());

    if ledger.is_completed(&unit.target_name, None) {
        if !args.force {
            report.detail(format!("disc {number} already archived; use --force to re-image"));
            eject(&locator, &device, &mut record);
            return Ok(report);
        }
        report.detail(format!("--force: re-imaging disc {number}"));
    }
    if args.force {
        ledger.reset_item(&number)?;
    }

    if remove_dir_if_exists(&target_dir)? {
        tracing::info!("cleared stale {}", target_dir.display());
    }
    fs::create_dir_all(&target_dir)
        .with_context(|| format!("failed to create {}", target_dir.display()))?;
    if let Err(err) = save_drive_status(&locator, &target_dir, &number) {
        tracing::warn!("drive status not saved: {err:#}");
    }

    if locator.unmount(&device.device_id) {
        record.set_step("unmount", StepStatus::Done, device.device_id.clone());
    } else {
        warn::emit(WarnEvent {
            code: "UNMOUNT_FAILED",
            stage: "unmount",
            item: &number,
            file: &device.device_id,
            retry: "none",
            reason: "diskutil-unmount-failed",
            err: "",
        });
        record.set_step("unmount", StepStatus::Skipped, "unmount failed; imaging anyway");
    }

    let tools = build_toolset(&cfg, true);
    let settings = PipelineSettings::from_config(&cfg);
    let units = [unit];
    let job = ItemJob {
        item: &item,
        units: &units,
        target_dir: &target_dir,
        device_capacity: locator.capacity_bytes(&device.device_id),
    };
    let coordinator = RetryCoordinator::new(cfg.batch.max_retries, &paths.logs_dir);
    let mut pipeline = Pipeline::new(&settings, &tools, cancel);
    let outcome = {
        let mut observer = RecordingObserver {
            record: &mut record,
            log: LogObserver::new(format!("disc {number}")),
        };
        coordinator.process(&mut pipeline, &job, &mut ledger, DISC_SOURCE, &mut observer)?
    };

    eject(&locator, &device, &mut record);
    record.end_time = Some(now_iso8601());

    let image = target_dir.join(&units[0].target_name);
    record.success = outcome.is_success();
    match &outcome {
        ItemOutcome::Completed { image_stats, .. } => {
            record.ddrescue_stats = image_stats.clone();
            record.iso_path = Some(image.display().to_string());
            let mapfile = mapfile_path(&image);
            if mapfile.is_file() {
                record.log_path = Some(mapfile.display().to_string());
            }
            if let Some(entry) = ledger.document().entries.get(&units[0].target_name) {
                record.checksum_sha256 = Some(entry.checksum.clone());
                record.parity_path =
                    (!entry.parity_path.is_empty()).then(|| entry.parity_path.clone());
            }
            report.detail(format!(
                "image={} bytes={}",
                image.display(),
                file_size(&image).unwrap_or(0)
            ));
            if let Some(sum) = &record.checksum_sha256 {
                report.detail(format!("sha256={sum}"));
            }
        }
        ItemOutcome::RetryLimit { retry_count } => report.fail(ArchiverError::OutputMissing(
            format!("disc {number} failed {retry_count} times; run `clear {number}` to retry"),
        )),
        ItemOutcome::Failed { error, .. } => {
            report.fail(ArchiverError::OutputMissing(error.to_string()))
        }
        ItemOutcome::Cancelled { .. } => report.fail(ArchiverError::Cancelled),
    }

    save_record(&paths.disc_records_file, &record)?;
    audit::record(
        &paths.logs_dir,
        "disc",
        if record.success { "ok" } else { "failed" },
        &format!("disc={number} device={}", device.device_id),
    );
    Ok(report)
}
