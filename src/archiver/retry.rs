use crate::archiver::audit;
use crate::archiver::ledger::Ledger;
use crate::archiver::pipeline::{ItemJob, Pipeline};
use crate::archiver::progress::PipelineObserver;
use crate::archiver::util::remove_dir_if_exists;
use crate::archiver::warn::{self, WarnEvent};
use crate::error::StepError;
use crate::tools::ImageStats;
use anyhow::Result;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Completed {
        produced: usize,
        reused: usize,
        image_stats: ImageStats,
    },
    /// Not attempted: the retry limit was already reached.
    RetryLimit { retry_count: u32 },
    Failed { error: StepError, retry_count: u32 },
    /// Rolled back and counted like a failure; the caller stops the run.
    Cancelled { retry_count: u32 },
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Bounded retries around one pipeline run, with rollback on failure.
///
/// Ledger write errors are returned as `Err`; they are root-scope and abort
/// the invocation. Item failures come back as `Ok(ItemOutcome::Failed)`.
pub struct RetryCoordinator<'a> {
    max_retries: u32,
    logs_dir: &'a Path,
}

impl<'a> RetryCoordinator<'a> {
    pub fn new(max_retries: u32, logs_dir: &'a Path) -> Self {
        Self {
            max_retries,
            logs_dir,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn process(
        &self,
        pipeline: &mut Pipeline<'_>,
        job: &ItemJob<'_>,
        ledger: &mut Ledger,
        source_root: &str,
        observer: &mut dyn PipelineObserver,
    ) -> Result<ItemOutcome> {
        let number = job.item.number.as_str();
        let retry_count = ledger.retry_count(number);
        if retry_count >= self.max_retries {
            tracing::info!(
                "item {number} skipped: {retry_count} failed attempts (limit {})",
                self.max_retries
            );
            return Ok(ItemOutcome::RetryLimit { retry_count });
        }

        let result = pipeline.run(job, ledger, observer);
        tracing::debug!("item {number} pipeline ended in {:?}", pipeline.state());
        match result {
            Ok(outcome) => {
                ledger.commit_item(number, &job.item.title, &outcome.produced, source_root)?;
                let message = format!(
                    "{} new file(s), {} already archived",
                    outcome.produced.len(),
                    outcome.reused.len()
                );
                tracing::info!("item {number} archived: {message}");
                audit::record(self.logs_dir, "item", "ok", &format!("{number}: {message}"));
                Ok(ItemOutcome::Completed {
                    produced: outcome.produced.len(),
                    reused: outcome.reused.len(),
                    image_stats: outcome.image_stats,
                })
            }
            Err(error) => {
                let retry_count = self.roll_back(job, ledger, source_root, &error)?;
                if error.is_cancelled() {
                    return Ok(ItemOutcome::Cancelled { retry_count });
                }
                Ok(ItemOutcome::Failed { error, retry_count })
            }
        }
    }

    /// Count a failure that happened before the pipeline could start.
    pub fn fail_before_start(
        &self,
        job: &ItemJob<'_>,
        ledger: &mut Ledger,
        source_root: &str,
        error: &StepError,
    ) -> Result<ItemOutcome> {
        let number = job.item.number.as_str();
        let retry_count = ledger.retry_count(number);
        if retry_count >= self.max_retries {
            return Ok(ItemOutcome::RetryLimit { retry_count });
        }
        let retry_count = self.roll_back(job, ledger, source_root, error)?;
        Ok(ItemOutcome::Failed {
            error: error.clone(),
            retry_count,
        })
    }

    fn roll_back(
        &self,
        job: &ItemJob<'_>,
        ledger: &mut Ledger,
        source_root: &str,
        error: &StepError,
    ) -> Result<u32> {
        let number = job.item.number.as_str();
        if let Err(err) = remove_dir_if_exists(job.target_dir) {
            warn::emit(WarnEvent {
                code: "ROLLBACK_INCOMPLETE",
                stage: "rollback",
                item: number,
                file: &job.target_dir.display().to_string(),
                retry: "next-run",
                reason: "remove-failed",
                err: &format!("{err:#}"),
            });
        }
        ledger.clear_item(number)?;
        let retry_count = ledger.record_failure(number, &error.to_string())?;
        ledger.record_failed_folder(source_root)?;

        let status = if error.is_cancelled() {
            "cancelled"
        } else {
            "failed"
        };
        tracing::error!(
            "item {number} {status} (attempt {retry_count}/{}): {error}",
            self.max_retries
        );
        audit::record(
            self.logs_dir,
            "item",
            status,
            &format!("{number}: {error} (attempt {retry_count})"),
        );
        Ok(retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::config::ProgressConfig;
    use crate::archiver::item::{FileUnit, WorkItem};
    use crate::archiver::naming::{NamingOptions, plan_units};
    use crate::archiver::pipeline::PipelineSettings;
    use crate::archiver::test_support::{Recorder, SelectiveHasher, tools};
    use crate::tools::{CancelToken, Toolset};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    struct Fixture {
        _tmp: tempfile::TempDir,
        item: WorkItem,
        units: Vec<FileUnit>,
        target: PathBuf,
        logs: PathBuf,
        ledger: Ledger,
        settings: PipelineSettings,
    }

    fn fixture() -> Fixture {
        let tmp = tempdir().expect("tempdir");
        let folder = tmp.path().join("src/0042 My Movie");
        fs::create_dir_all(&folder).expect("mkdir");
        let files = vec![folder.join("42 part 1.iso"), folder.join("42 part 2.iso")];
        for f in &files {
            fs::write(f, b"disc bytes").expect("write");
        }
        let item = WorkItem {
            number: "0042".into(),
            title: "My Movie".into(),
            source_path: folder,
            files,
        };
        let units = plan_units(&item, &NamingOptions::default()).expect("plan");
        Fixture {
            target: tmp.path().join("out/0042_My_Movie"),
            logs: tmp.path().join("logs"),
            ledger: Ledger::load(&tmp.path().join("state.json")),
            settings: PipelineSettings {
                min_conversion_ratio: 0.85,
                parity_enabled: true,
                parity_percent: 10,
                progress: ProgressConfig::default(),
            },
            item,
            units,
            _tmp: tmp,
        }
    }

    fn attempt(fx: &mut Fixture, tools: &Toolset, cancel: &CancelToken) -> ItemOutcome {
        let mut pipeline = Pipeline::new(&fx.settings, tools, cancel);
        let job = ItemJob {
            item: &fx.item,
            units: &fx.units,
            target_dir: &fx.target,
            device_capacity: None,
        };
        RetryCoordinator::new(5, &fx.logs)
            .process(&mut pipeline, &job, &mut fx.ledger, "src", &mut Recorder::default())
            .expect("ledger writes")
    }

    #[test]
    fn success_commits_every_unit() {
        let mut fx = fixture();
        let outcome = attempt(&mut fx, &tools(), &CancelToken::new());
        assert!(outcome.is_success());
        assert!(fx.ledger.is_completed("0042_1.iso", None));
        assert!(fx.ledger.is_completed("0042_2.iso", None));
        let stats = fx.ledger.stats("src");
        assert_eq!((stats.folders_processed, stats.discs_processed), (1, 2));
        let audit = fs::read_to_string(fx.logs.join("audit.log")).expect("audit");
        assert!(audit.contains("\"status\":\"ok\""));
    }

    #[test]
    fn failure_rolls_back_everything() {
        let mut fx = fixture();
        let mut tools = tools();
        tools.hasher = Box::new(SelectiveHasher {
            fail_on: "part 2".into(),
        });
        let outcome = attempt(&mut fx, &tools, &CancelToken::new());

        assert!(matches!(outcome, ItemOutcome::Failed { retry_count: 1, .. }));
        assert!(!fx.target.exists());
        assert!(fx.ledger.document().entries.is_empty());
        let meta = fx.ledger.metadata("0042").expect("metadata");
        assert!(meta.last_error.as_deref().is_some_and(|e| e.contains("part 2")));
        assert_eq!(fx.ledger.stats("src").folders_failed, 1);
    }

    #[test]
    fn retry_limit_skips_without_running() {
        let mut fx = fixture();
        let mut failing = tools();
        failing.hasher = Box::new(SelectiveHasher {
            fail_on: "part".into(),
        });
        for expected in 1..=5 {
            let outcome = attempt(&mut fx, &failing, &CancelToken::new());
            assert!(
                matches!(outcome, ItemOutcome::Failed { retry_count, .. } if retry_count == expected)
            );
        }
        let outcome = attempt(&mut fx, &tools(), &CancelToken::new());
        assert_eq!(outcome, ItemOutcome::RetryLimit { retry_count: 5 });
        assert!(!fx.target.exists());
        assert_eq!(fx.ledger.attention_items(5).len(), 1);
    }

    #[test]
    fn cancellation_rolls_back_and_counts() {
        let mut fx = fixture();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = attempt(&mut fx, &tools(), &cancel);
        assert_eq!(outcome, ItemOutcome::Cancelled { retry_count: 1 });
        assert!(!fx.target.exists());
    }
}
