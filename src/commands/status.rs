use anyhow::Result;
use std::path::Path;

use crate::archiver::ledger::Ledger;
use crate::archiver::lock::current_holder;
use crate::archiver::paths::{ledger_path, resolve_paths};
use crate::archiver::record::load_records;
use crate::commands::{CommandReport, command_config};

fn describe_root(label: &str, root: &Path, max_retries: u32, report: &mut CommandReport) {
    report.detail(format!("{label}={}", root.display()));
    let path = ledger_path(root);
    if !path.exists() {
        report.detail(format!("{label}_ledger=absent"));
        return;
    }

    let ledger = Ledger::load(&path);
    let doc = ledger.document();
    let completed = doc.entries.values().filter(|e| e.completed).count();
    let missing = doc
        .entries
        .values()
        .filter(|e| e.completed && !Path::new(&e.target_path).exists())
        .count();
    report.detail(format!(
        "{label}_entries={} completed={completed} items={} last_updated={}",
        doc.entries.len(),
        doc.metadata.len(),
        doc.last_updated.as_deref().unwrap_or("never")
    ));
    if missing > 0 {
        report.detail(format!(
            "{label}_missing_outputs={missing} (will be re-archived)"
        ));
    }
    for (source, stats) in &doc.stats {
        report.detail(format!(
            "{label}_source={source} folders_processed={} folders_failed={} discs_processed={}",
            stats.folders_processed, stats.folders_failed, stats.discs_processed
        ));
    }
    for item in ledger.attention_items(max_retries) {
        report.issue(format!(
            "needs attention: {} \"{}\" after {} attempts: {}",
            item.number,
            item.title,
            item.retry_count,
            item.last_error.as_deref().unwrap_or("unknown error")
        ));
    }
    if let Some(holder) = current_holder(root) {
        report.detail(format!(
            "{label}_locked_by=pid {} since {} (build {})",
            holder.pid, holder.start_time, holder.build_uuid
        ));
    }
}

pub fn run() -> Result<CommandReport> {
    let cfg = command_config()?;
    let paths = resolve_paths(&cfg);
    let mut report = CommandReport::new("status");

    report.detail(format!("mode={}", cfg.imaging.mode.as_str()));
    describe_root("archive", &paths.archive_base, cfg.batch.max_retries, &mut report);
    let discs = load_records(&paths.disc_records_file);
    let archived = discs.values().filter(|d| d.disc.success).count();
    report.detail(format!("disc_records={} successful={archived}", discs.len()));

    if let Some(target) = paths.batch_target.as_deref() {
        describe_root("batch_target", target, cfg.batch.max_retries, &mut report);
    }
    for source in &paths.batch_sources {
        if !source.is_dir() {
            report.issue(format!("batch source root missing: {}", source.display()));
        }
    }
    Ok(report)
}
