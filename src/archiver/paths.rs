use crate::archiver::config::ArchiverConfig;
use crate::error::ArchiverError;
use anyhow::Result;
use std::path::{Path, PathBuf};

pub const LEDGER_FILE: &str = "archive_state.json";
pub const DISC_RECORDS_FILE: &str = "archive_log.json";
pub const LOCK_FILE: &str = ".disc-archiver.lock";

#[derive(Debug, Clone)]
pub struct ArchiverPaths {
    pub archive_base: PathBuf,
    pub disc_records_file: PathBuf,
    pub logs_dir: PathBuf,
    pub batch_target: Option<PathBuf>,
    pub batch_sources: Vec<PathBuf>,
}

/// Ledger document for an archive root.
pub fn ledger_path(root: &Path) -> PathBuf {
    root.join(LEDGER_FILE)
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

pub fn disc_dir(base: &Path, number: &str) -> PathBuf {
    base.join(format!("disc_{number}"))
}

pub fn resolve_paths(cfg: &ArchiverConfig) -> ArchiverPaths {
    let archive_base = cfg.archive.base_dir.clone();
    ArchiverPaths {
        disc_records_file: archive_base.join(DISC_RECORDS_FILE),
        logs_dir: archive_base.join("logs"),
        batch_target: cfg.batch.target_path.as_deref().map(PathBuf::from),
        batch_sources: cfg.batch.source_paths.iter().map(PathBuf::from).collect(),
        archive_base,
    }
}

impl ArchiverPaths {
    /// Batch target root, or a config error when none was configured.
    pub fn require_batch_target(&self) -> Result<&Path> {
        match self.batch_target.as_deref() {
            Some(path) => Ok(path),
            None => Err(ArchiverError::InvalidConfig(
                "batch target root is not set; set DVD_TARGET_PATH".to_string(),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_archive_base() {
        let mut cfg = ArchiverConfig::default();
        cfg.archive.base_dir = PathBuf::from("/archive");
        cfg.batch.source_paths = vec!["/src/a".into()];
        let paths = resolve_paths(&cfg);
        assert_eq!(paths.disc_records_file, PathBuf::from("/archive/archive_log.json"));
        assert_eq!(paths.logs_dir, PathBuf::from("/archive/logs"));
        assert_eq!(paths.batch_sources, vec![PathBuf::from("/src/a")]);
        assert!(paths.require_batch_target().is_err());
        assert_eq!(
            disc_dir(&paths.archive_base, "0042"),
            PathBuf::from("/archive/disc_0042")
        );
    }
}
