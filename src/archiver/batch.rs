//! Multi-source batch run over numbered source folders.

use crate::archiver::item::{WorkItem, cmp_numbers, extract_key, pad_number};
use crate::archiver::ledger::{AttentionItem, Ledger, PathStatistics};
use crate::archiver::locator::discover;
use crate::archiver::naming::{NamingOptions, plan_units};
use crate::archiver::pipeline::{ItemJob, Pipeline, PipelineSettings};
use crate::archiver::progress::LogObserver;
use crate::archiver::retry::{ItemOutcome, RetryCoordinator};
use crate::archiver::util::remove_dir_if_exists;
use crate::archiver::warn::{self, WarnEvent};
use crate::error::StepError;
use crate::tools::{CancelToken, Toolset};
use anyhow::{Context, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Asked before each item outside automatic mode. `false` stops the run.
pub trait Confirm {
    fn confirm(&mut self, item: &WorkItem, target_dir: &Path) -> bool;
}

pub struct AutoConfirm;

impl Confirm for AutoConfirm {
    fn confirm(&mut self, _item: &WorkItem, _target_dir: &Path) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub start_from: Option<String>,
    pub naming: NamingOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceReport {
    pub root: String,
    pub processed: u64,
    pub failed: u64,
    pub skipped_complete: u64,
    pub skipped_before_start: u64,
    pub skipped_retry_limit: u64,
    /// Numbers already owned by an earlier root.
    pub skipped_duplicate: u64,
    /// Cumulative counters from the ledger, across runs.
    pub stats: PathStatistics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Declined { number: String },
    Cancelled { number: String },
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub sources: Vec<SourceReport>,
    pub totals: PathStatistics,
    pub attention: Vec<AttentionItem>,
    pub purged: Vec<String>,
    pub stopped: Option<StopReason>,
}

impl BatchReport {
    pub fn run_failures(&self) -> u64 {
        self.sources.iter().map(|s| s.failed).sum()
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(self.stopped, Some(StopReason::Cancelled { .. }))
    }
}

pub struct BatchRunner<'a> {
    settings: &'a PipelineSettings,
    tools: &'a Toolset,
    cancel: &'a CancelToken,
    coordinator: RetryCoordinator<'a>,
    target_root: &'a Path,
    options: BatchOptions,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        settings: &'a PipelineSettings,
        tools: &'a Toolset,
        cancel: &'a CancelToken,
        coordinator: RetryCoordinator<'a>,
        target_root: &'a Path,
        options: BatchOptions,
    ) -> Self {
        Self {
            settings,
            tools,
            cancel,
            coordinator,
            target_root,
            options,
        }
    }

    fn start(&self) -> Option<String> {
        self.options.start_from.as_deref().map(pad_number)
    }

    pub fn run(
        &self,
        sources: &[PathBuf],
        ledger: &mut Ledger,
        confirm: &mut dyn Confirm,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        if let Some(start) = self.start() {
            report.purged = self.purge_from(&start, ledger)?;
        }
        // Item number -> root that claimed it first in this run.
        let mut claimed = BTreeMap::new();

        'sources: for root in sources {
            let root_key = root.display().to_string();
            let mut source = SourceReport {
                root: root_key.clone(),
                ..SourceReport::default()
            };
            tracing::info!("scanning {root_key}");

            for item in discover(root) {
                let stop = self.process_item(
                    item,
                    root,
                    &mut claimed,
                    ledger,
                    confirm,
                    &mut source,
                )?;
                match stop {
                    None => {}
                    Some(stop) => {
                        report.stopped = Some(stop);
                        source.stats = ledger.stats(&root_key);
                        report.sources.push(source);
                        break 'sources;
                    }
                }
            }
            source.stats = ledger.stats(&root_key);
            report.sources.push(source);
        }

        for source in &report.sources {
            report.totals.folders_processed += source.stats.folders_processed;
            report.totals.folders_failed += source.stats.folders_failed;
            report.totals.discs_processed += source.stats.discs_processed;
        }
        report.attention = ledger.attention_items(self.coordinator.max_retries());
        Ok(report)
    }

    fn process_item(
        &self,
        mut item: WorkItem,
        root: &Path,
        claimed: &mut BTreeMap<String, String>,
        ledger: &mut Ledger,
        confirm: &mut dyn Confirm,
        source: &mut SourceReport,
    ) -> Result<Option<StopReason>> {
        // Nothing is in flight yet, so nothing is charged to this item.
        if self.cancel.is_cancelled() {
            tracing::info!("interrupted before item {}", item.number);
            return Ok(Some(StopReason::Cancelled {
                number: item.number,
            }));
        }
        if let Some(start) = self.start()
            && cmp_numbers(&item.number, &start) == Ordering::Less
        {
            source.skipped_before_start += 1;
            return Ok(None);
        }

        let root_key = source.root.clone();
        let owner = match claimed.get(&item.number) {
            Some(first) => Some(first.clone()),
            None => ledger
                .archived_from_elsewhere(&item.number, root)
                .map(str::to_string),
        };
        if let Some(owner) = owner {
            warn::emit(WarnEvent {
                code: "DUPLICATE_ITEM_NUMBER",
                stage: "batch",
                item: &item.number,
                file: &item.source_path.display().to_string(),
                retry: "none",
                reason: "number-owned-by-other-root",
                err: &owner,
            });
            source.skipped_duplicate += 1;
            return Ok(None);
        }
        claimed.insert(item.number.clone(), root_key.clone());

        item.title = ledger.update_title_if_longer(&item.number, &item.title)?;
        let target_dir = self.target_root.join(item.target_dir_name());

        let units = match plan_units(&item, &self.options.naming) {
            Ok(units) => units,
            Err(err) => {
                let job = ItemJob {
                    item: &item,
                    units: &[],
                    target_dir: &target_dir,
                    device_capacity: None,
                };
                let outcome = self.coordinator.fail_before_start(
                    &job,
                    ledger,
                    &root_key,
                    &StepError::from(err),
                )?;
                tally(source, &outcome);
                return Ok(None);
            }
        };

        let complete = units
            .iter()
            .filter(|u| ledger.is_completed(&u.target_name, Some(&u.source_path)))
            .count();
        if !units.is_empty() && complete == units.len() {
            tracing::debug!("item {} already archived", item.number);
            source.skipped_complete += 1;
            return Ok(None);
        }
        if complete == 0 && remove_dir_if_exists(&target_dir)? {
            tracing::info!("removed stale output {}", target_dir.display());
        }

        if !confirm.confirm(&item, &target_dir) {
            tracing::info!("stopping at item {} on operator request", item.number);
            return Ok(Some(StopReason::Declined {
                number: item.number,
            }));
        }
        if self.cancel.is_cancelled() {
            tracing::info!("interrupted before item {}", item.number);
            return Ok(Some(StopReason::Cancelled {
                number: item.number,
            }));
        }

        let job = ItemJob {
            item: &item,
            units: &units,
            target_dir: &target_dir,
            device_capacity: None,
        };
        let mut pipeline = Pipeline::new(self.settings, self.tools, self.cancel);
        let mut observer = LogObserver::new(item.number.clone());
        let outcome = self
            .coordinator
            .process(&mut pipeline, &job, ledger, &root_key, &mut observer)?;
        tally(source, &outcome);
        if let ItemOutcome::Cancelled { .. } = outcome {
            return Ok(Some(StopReason::Cancelled {
                number: item.number,
            }));
        }
        Ok(None)
    }

    /// Forget and delete everything at or after `start` so it runs again.
    fn purge_from(&self, start: &str, ledger: &mut Ledger) -> Result<Vec<String>> {
        let touched = ledger.purge_from(start)?;
        let Ok(entries) = fs::read_dir(self.target_root) else {
            return Ok(touched);
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(key) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(extract_key)
            else {
                continue;
            };
            if cmp_numbers(&key, start) != Ordering::Less {
                remove_dir_if_exists(&path)
                    .with_context(|| format!("failed to purge {}", path.display()))?;
                tracing::info!("purged {}", path.display());
            }
        }
        Ok(touched)
    }
}

fn tally(source: &mut SourceReport, outcome: &ItemOutcome) {
    match outcome {
        ItemOutcome::Completed { .. } => source.processed += 1,
        ItemOutcome::RetryLimit { .. } => source.skipped_retry_limit += 1,
        ItemOutcome::Failed { .. } | ItemOutcome::Cancelled { .. } => source.failed += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::config::ProgressConfig;
    use crate::archiver::test_support::{SelectiveHasher, tools};
    use tempfile::{TempDir, tempdir};

    struct Env {
        tmp: TempDir,
        settings: PipelineSettings,
        cancel: CancelToken,
    }

    impl Env {
        fn new() -> Self {
            Self {
                tmp: tempdir().expect("tempdir"),
                settings: PipelineSettings {
                    min_conversion_ratio: 0.85,
                    parity_enabled: true,
                    parity_percent: 10,
                    progress: ProgressConfig::default(),
                },
                cancel: CancelToken::new(),
            }
        }

        fn source(&self) -> PathBuf {
            self.tmp.path().join("src")
        }

        fn target(&self) -> PathBuf {
            self.tmp.path().join("out")
        }

        fn logs(&self) -> PathBuf {
            self.tmp.path().join("logs")
        }

        fn add(&self, folder: &str, file: &str) {
            add_to(&self.source(), folder, file, &format!("{folder}/{file}"));
        }

        fn ledger(&self) -> Ledger {
            Ledger::load(&self.target().join("archive_state.json"))
        }

        fn run(
            &self,
            tools: &Toolset,
            options: BatchOptions,
            confirm: &mut dyn Confirm,
        ) -> BatchReport {
            self.run_roots(&[self.source()], tools, options, confirm)
        }

        fn run_roots(
            &self,
            roots: &[PathBuf],
            tools: &Toolset,
            options: BatchOptions,
            confirm: &mut dyn Confirm,
        ) -> BatchReport {
            let target = self.target();
            let logs = self.logs();
            let runner = BatchRunner::new(
                &self.settings,
                tools,
                &self.cancel,
                RetryCoordinator::new(5, &logs),
                &target,
                options,
            );
            let mut ledger = self.ledger();
            runner
                .run(roots, &mut ledger, confirm)
                .expect("batch run")
        }
    }

    fn add_to(root: &Path, folder: &str, file: &str, contents: &str) {
        let dir = root.join(folder);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join(file), contents).expect("write");
    }

    fn counts(report: &BatchReport, pick: fn(&SourceReport) -> u64) -> Vec<u64> {
        report.sources.iter().map(pick).collect()
    }

    struct DeclineAt(String);

    impl Confirm for DeclineAt {
        fn confirm(&mut self, item: &WorkItem, _target_dir: &Path) -> bool {
            item.number != self.0
        }
    }

    #[test]
    fn second_run_processes_nothing() {
        let env = Env::new();
        env.add("0042 My Movie", "42.iso");
        env.add("7 Short", "7.iso");
        let tools = tools();

        let first = env.run(&tools, BatchOptions::default(), &mut AutoConfirm);
        assert_eq!(first.sources[0].processed, 2);
        assert!(env.target().join("0042_My_Movie/0042.iso").is_file());
        assert!(env.target().join("0007_Short/0007.iso.sha256").is_file());
        assert!(env.ledger().is_completed("0042.iso", None));

        let second = env.run(&tools, BatchOptions::default(), &mut AutoConfirm);
        assert_eq!(second.sources[0].processed, 0);
        assert_eq!(second.sources[0].skipped_complete, 2);
        assert_eq!(second.totals.folders_processed, 2);
    }

    #[test]
    fn failures_stay_inside_the_item() {
        let env = Env::new();
        env.add("0001 Good", "1.iso");
        env.add("0002 Bad", "2.iso");
        env.add("0003 Good", "3.iso");
        let mut tools = tools();
        tools.hasher = Box::new(SelectiveHasher {
            fail_on: "2.iso".into(),
        });

        let report = env.run(&tools, BatchOptions::default(), &mut AutoConfirm);
        let source = &report.sources[0];
        assert_eq!((source.processed, source.failed), (2, 1));
        assert_eq!(report.run_failures(), 1);
        assert!(!env.target().join("0002_Bad").exists());
        assert_eq!(env.ledger().retry_count("0002"), 1);
    }

    #[test]
    fn exhausted_items_are_listed_for_attention() {
        let env = Env::new();
        env.add("0002 Bad", "2.iso");
        let mut tools = tools();
        tools.hasher = Box::new(SelectiveHasher {
            fail_on: "2.iso".into(),
        });
        for _ in 0..5 {
            env.run(&tools, BatchOptions::default(), &mut AutoConfirm);
        }
        let report = env.run(&tools, BatchOptions::default(), &mut AutoConfirm);
        assert_eq!(report.sources[0].skipped_retry_limit, 1);
        assert_eq!(report.attention.len(), 1);
        assert_eq!(report.attention[0].number, "0002");
        assert!(report.attention[0].last_error.is_some());
    }

    #[test]
    fn declining_stops_the_run() {
        let env = Env::new();
        env.add("0001 One", "1.iso");
        env.add("0002 Two", "2.iso");
        env.add("0003 Three", "3.iso");
        let tools = tools();

        let report = env.run(
            &tools,
            BatchOptions::default(),
            &mut DeclineAt("0002".into()),
        );
        assert_eq!(
            report.stopped,
            Some(StopReason::Declined {
                number: "0002".into()
            })
        );
        assert_eq!(report.sources[0].processed, 1);
        assert!(!env.target().join("0003_Three").exists());
    }

    #[test]
    fn start_point_purges_and_reruns_later_items() {
        let env = Env::new();
        env.add("0001 One", "1.iso");
        env.add("0002 Two", "2.iso");
        env.add("0003 Three", "3.iso");
        let tools = tools();
        env.run(&tools, BatchOptions::default(), &mut AutoConfirm);

        let options = BatchOptions {
            start_from: Some("2".into()),
            ..BatchOptions::default()
        };
        let report = env.run(&tools, options, &mut AutoConfirm);
        let source = &report.sources[0];
        assert_eq!(source.skipped_before_start, 1);
        assert_eq!(source.processed, 2);
        assert_eq!(report.purged, vec!["0002".to_string(), "0003".to_string()]);
        assert!(env.ledger().is_completed("0001.iso", None));
        assert!(env.ledger().is_completed("0003.iso", None));
    }

    #[test]
    fn stale_partial_output_is_cleared_first() {
        let env = Env::new();
        env.add("0042 My Movie", "42.iso");
        let stale = env.target().join("0042_My_Movie");
        fs::create_dir_all(&stale).expect("mkdir");
        fs::write(stale.join("0042.iso.part"), b"half").expect("write");

        let report = env.run(&tools(), BatchOptions::default(), &mut AutoConfirm);
        assert_eq!(report.sources[0].processed, 1);
        assert!(!stale.join("0042.iso.part").exists());
        assert!(stale.join("0042.iso").is_file());
    }

    #[test]
    fn conversion_mode_never_copies_the_plain_alternative() {
        let env = Env::new();
        env.add("700 Film", "700.mdx");
        env.add("700 Film", "700.iso");
        let options = BatchOptions {
            naming: NamingOptions {
                convert: true,
                ..NamingOptions::default()
            },
            ..BatchOptions::default()
        };
        let report = env.run(&tools(), options, &mut AutoConfirm);
        assert_eq!(report.sources[0].processed, 1);
        let ledger = env.ledger();
        assert_eq!(ledger.document().entries.len(), 1);
        let entry = &ledger.document().entries["0700.iso"];
        assert!(entry.source_path.ends_with("700.mdx"));
    }

    #[test]
    fn interrupt_before_an_item_leaves_its_state_alone() {
        let env = Env::new();
        env.add("0001 One", "1.iso");
        env.add("0002 Two", "2.iso");
        env.cancel.cancel();

        let report = env.run(&tools(), BatchOptions::default(), &mut AutoConfirm);
        assert_eq!(
            report.stopped,
            Some(StopReason::Cancelled {
                number: "0001".into()
            })
        );
        assert!(report.was_cancelled());
        assert_eq!(report.sources[0].failed, 0);
        let ledger = env.ledger();
        assert_eq!(ledger.retry_count("0001"), 0);
        assert!(ledger.metadata("0001").is_none_or(|m| m.last_error.is_none()));
        assert_eq!(ledger.stats(&env.source().display().to_string()).folders_failed, 0);
        assert!(!env.target().join("0001_One").exists());
    }

    struct InterruptOnConfirm<'c>(&'c CancelToken);

    impl Confirm for InterruptOnConfirm<'_> {
        fn confirm(&mut self, _item: &WorkItem, _target_dir: &Path) -> bool {
            self.0.cancel();
            true
        }
    }

    #[test]
    fn interrupt_during_the_prompt_stops_without_a_failure() {
        let env = Env::new();
        env.add("0001 One", "1.iso");
        let cancel = env.cancel.clone();

        let report = env.run(
            &tools(),
            BatchOptions::default(),
            &mut InterruptOnConfirm(&cancel),
        );
        assert!(report.was_cancelled());
        assert_eq!(report.run_failures(), 0);
        assert_eq!(env.ledger().retry_count("0001"), 0);
    }

    #[test]
    fn shared_number_across_roots_is_archived_once() {
        let env = Env::new();
        let a = env.tmp.path().join("a");
        let b = env.tmp.path().join("b");
        add_to(&a, "0042 Movie", "42.iso", "from-a");
        add_to(&b, "0042 Movie", "42.iso", "from-b");
        let roots = [a.clone(), b.clone()];
        let tools = tools();
        let output = env.target().join("0042_Movie/0042.iso");

        let first = env.run_roots(&roots, &tools, BatchOptions::default(), &mut AutoConfirm);
        assert_eq!(counts(&first, |s| s.processed), vec![1, 0]);
        assert_eq!(counts(&first, |s| s.skipped_duplicate), vec![0, 1]);

        for _ in 0..2 {
            let again = env.run_roots(&roots, &tools, BatchOptions::default(), &mut AutoConfirm);
            assert_eq!(counts(&again, |s| s.processed), vec![0, 0]);
            assert_eq!(counts(&again, |s| s.skipped_complete), vec![1, 0]);
            assert_eq!(fs::read_to_string(&output).expect("read"), "from-a");
        }

        // Listing the other root first must not displace the archived copy.
        let swapped = env.run_roots(
            &[b, a],
            &tools,
            BatchOptions::default(),
            &mut AutoConfirm,
        );
        assert_eq!(counts(&swapped, |s| s.processed), vec![0, 0]);
        assert_eq!(counts(&swapped, |s| s.skipped_duplicate), vec![1, 0]);
        assert_eq!(fs::read_to_string(&output).expect("read"), "from-a");
    }

    #[test]
    fn start_point_orders_wide_numbers_by_value() {
        let env = Env::new();
        env.add("0999 Early", "999.iso");
        env.add("10000 Late", "10000.iso");
        let tools = tools();
        env.run(&tools, BatchOptions::default(), &mut AutoConfirm);

        let options = BatchOptions {
            start_from: Some("2000".into()),
            ..BatchOptions::default()
        };
        let report = env.run(&tools, options, &mut AutoConfirm);
        assert_eq!(report.sources[0].skipped_before_start, 1);
        assert_eq!(report.sources[0].processed, 1);
        assert_eq!(report.purged, vec!["10000".to_string()]);
    }
}
