use anyhow::{Context, Result};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;

use crate::archiver::audit;
use crate::archiver::batch::{
    AutoConfirm, BatchOptions, BatchReport, BatchRunner, Confirm, StopReason,
};
use crate::archiver::item::WorkItem;
use crate::archiver::ledger::Ledger;
use crate::archiver::lock::RunLock;
use crate::archiver::naming::NamingOptions;
use crate::archiver::paths::{ledger_path, resolve_paths};
use crate::archiver::pipeline::PipelineSettings;
use crate::archiver::retry::RetryCoordinator;
use crate::archiver::util::truncate_with_ellipsis;
use crate::commands::{CommandReport, command_config};
use crate::error::ArchiverError;
use crate::tools::converter::DEFAULT_CONVERTER;
use crate::tools::{CancelToken, build_toolset, resolve_tool};

#[derive(Debug, Clone, Default)]
pub struct BatchArgs {
    pub auto: bool,
    pub convert: bool,
    pub start_from: Option<String>,
}

/// Interactive y/N prompt on stderr, answered on stdin.
struct PromptConfirm;

impl Confirm for PromptConfirm {
    fn confirm(&mut self, item: &WorkItem, target_dir: &Path) -> bool {
        eprint!(
            "archive {} \"{}\" ({} file(s)) into {}? [y/N] ",
            item.number,
            item.title,
            item.files.len(),
            target_dir.display()
        );
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

fn check_start_point(raw: &str) -> Result<()> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(ArchiverError::InvalidConfig(format!(
            "start point must be an item number, got {raw:?}"
        ))
        .into());
    }
    Ok(())
}

pub fn run(args: &BatchArgs, cancel: &CancelToken) -> Result<CommandReport> {
    let cfg = command_config()?;
    let paths = resolve_paths(&cfg);
    let mut report = CommandReport::new("batch");

    let target = paths.require_batch_target()?.to_path_buf();
    if paths.batch_sources.is_empty() {
        return Err(ArchiverError::InvalidConfig(
            "no batch source roots; set DVD_SOURCE_PATHS".to_string(),
        )
        .into());
    }
    if let Some(start) = args.start_from.as_deref() {
        check_start_point(start)?;
    }
    if args.convert && resolve_tool(cfg.tools.converter_bin.as_deref(), DEFAULT_CONVERTER).is_none()
    {
        return Err(ArchiverError::MissingTool(DEFAULT_CONVERTER.to_string()).into());
    }
    fs::create_dir_all(&target)
        .with_context(|| format!("failed to create target root {}", target.display()))?;

    let _lock = RunLock::acquire(&target)?;
    let mut ledger = Ledger::load(&ledger_path(&target));
    let tools = build_toolset(&cfg, false);
    if cfg.parity.enabled && !tools.parity.available() {
        tracing::warn!("parity tool not found; protection will be skipped");
    }

    let settings = PipelineSettings::from_config(&cfg);
    let options = BatchOptions {
        start_from: args.start_from.clone(),
        naming: NamingOptions {
            convert: args.convert,
            ignore_trailing_numbers: cfg.naming.ignore_trailing_numbers,
        },
    };
    let runner = BatchRunner::new(
        &settings,
        &tools,
        cancel,
        RetryCoordinator::new(cfg.batch.max_retries, &paths.logs_dir),
        &target,
        options,
    );

    report.detail(format!("target={}", target.display()));
    report.detail(format!("mode={}", if args.convert { "convert" } else { "copy" }));
    let outcome = if args.auto {
        runner.run(&paths.batch_sources, &mut ledger, &mut AutoConfirm)?
    } else {
        runner.run(&paths.batch_sources, &mut ledger, &mut PromptConfirm)?
    };

    summarize(&outcome, &mut report);
    audit::record(
        &paths.logs_dir,
        "batch",
        if report.ok { "ok" } else { "issues" },
        &format!(
            "sources={} failed={} attention={}",
            outcome.sources.len(),
            outcome.run_failures(),
            outcome.attention.len()
        ),
    );
    if outcome.was_cancelled() {
        report.fail(ArchiverError::Cancelled);
    }
    Ok(report)
}

fn summarize(outcome: &BatchReport, report: &mut CommandReport) {
    if !outcome.purged.is_empty() {
        report.detail(format!("purged={}", outcome.purged.join(",")));
    }
    for source in &outcome.sources {
        report.detail(format!(
            "source={} processed={} failed={} skipped_complete={} skipped_before_start={} skipped_retry_limit={} skipped_duplicate={}",
            source.root,
            source.processed,
            source.failed,
            source.skipped_complete,
            source.skipped_before_start,
            source.skipped_retry_limit,
            source.skipped_duplicate
        ));
        report.detail(format!(
            "source={} folders_processed={} folders_failed={} discs_processed={}",
            source.root,
            source.stats.folders_processed,
            source.stats.folders_failed,
            source.stats.discs_processed
        ));
    }
    report.detail(format!(
        "totals folders_processed={} folders_failed={} discs_processed={}",
        outcome.totals.folders_processed,
        outcome.totals.folders_failed,
        outcome.totals.discs_processed
    ));

    match &outcome.stopped {
        Some(StopReason::Declined { number }) => {
            report.detail(format!("stopped at {number} on operator request"))
        }
        Some(StopReason::Cancelled { number }) => {
            report.detail(format!("interrupted during {number}"))
        }
        None => {}
    }

    let failed = outcome.run_failures();
    if failed > 0 {
        report.issue(format!("{failed} item(s) failed this run"));
    }
    for item in &outcome.attention {
        report.issue(format!(
            "needs attention: {} \"{}\" after {} attempts: {}",
            item.number,
            item.title,
            item.retry_count,
            truncate_with_ellipsis(item.last_error.as_deref().unwrap_or("unknown error"), 200)
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_point_must_be_numeric() {
        assert!(check_start_point("0042").is_ok());
        assert!(check_start_point("42").is_ok());
        assert!(check_start_point("").is_err());
        assert!(check_start_point("4x").is_err());
    }
}
