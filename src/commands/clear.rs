use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::archiver::audit;
use crate::archiver::item::{extract_key, pad_number};
use crate::archiver::ledger::Ledger;
use crate::archiver::lock::RunLock;
use crate::archiver::paths::{disc_dir, ledger_path, resolve_paths};
use crate::archiver::util::remove_dir_if_exists;
use crate::commands::{CommandReport, command_config};

#[derive(Debug, Clone, Default)]
pub struct ClearArgs {
    pub number: String,
    pub delete_output: bool,
}

/// Folders under `root` whose key is `number` (`0042_My_Movie`, `disc_0042`).
fn output_dirs(root: &Path, number: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut out = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(extract_key)
                .is_some_and(|key| key == number)
        })
        .collect::<Vec<_>>();
    out.sort();
    out
}

fn clear_root(
    label: &str,
    root: &Path,
    args: &ClearArgs,
    number: &str,
    report: &mut CommandReport,
) -> Result<()> {
    let path = ledger_path(root);
    if !path.exists() {
        return Ok(());
    }
    let _lock = RunLock::acquire(root)?;
    let mut ledger = Ledger::load(&path);
    let had_state = ledger.metadata(number).is_some();
    let removed = ledger.reset_item(number)?;
    report.detail(format!(
        "{label}: removed {removed} entr{} for {number}{}",
        if removed == 1 { "y" } else { "ies" },
        if had_state { ", retry state reset" } else { "" }
    ));

    if args.delete_output {
        for dir in output_dirs(root, number) {
            remove_dir_if_exists(&dir)
                .with_context(|| format!("failed to delete {}", dir.display()))?;
            report.detail(format!("{label}: deleted {}", dir.display()));
        }
    }
    Ok(())
}

pub fn run(args: &ClearArgs) -> Result<CommandReport> {
    let cfg = command_config()?;
    let paths = resolve_paths(&cfg);
    let mut report = CommandReport::new("clear");
    let number = if args.number.chars().all(|c| c.is_ascii_digit()) {
        pad_number(&args.number)
    } else {
        args.number.clone()
    };

    clear_root("archive", &paths.archive_base, args, &number, &mut report)?;
    if args.delete_output {
        let disc = disc_dir(&paths.archive_base, &number);
        if remove_dir_if_exists(&disc)? {
            report.detail(format!("archive: deleted {}", disc.display()));
        }
    }
    if let Some(target) = paths.batch_target.as_deref() {
        clear_root("batch_target", target, args, &number, &mut report)?;
    }
    audit::record(
        &paths.logs_dir,
        "clear",
        "ok",
        &format!("number={number} delete_output={}", args.delete_output),
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn output_dirs_match_on_padded_key() {
        let tmp = tempdir().expect("tempdir");
        for name in ["0042_My_Movie", "disc_0042", "0043_Other", "42_Legacy"] {
            fs::create_dir_all(tmp.path().join(name)).expect("mkdir");
        }
        let found = output_dirs(tmp.path(), "0042");
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["0042_My_Movie", "42_Legacy", "disc_0042"]);
    }
}
