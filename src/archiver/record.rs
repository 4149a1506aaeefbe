//! Per-disc archive records kept in `<archive base>/archive_log.json`.

use crate::archiver::progress::{StepState, StepStatus};
use crate::archiver::util::write_json_atomic;
use crate::tools::ImageStats;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const DISC_STEPS: &[&str] = &[
    "detect", "unmount", "validate", "acquire", "checksum", "protect", "eject",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscRecord {
    pub disc_number: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub device_disk: Option<String>,
    pub device_rdisk: Option<String>,
    pub iso_path: Option<String>,
    pub log_path: Option<String>,
    pub checksum_sha256: Option<String>,
    pub parity_path: Option<String>,
    pub ddrescue_stats: ImageStats,
    pub steps: BTreeMap<String, StepState>,
    pub success: bool,
}

impl DiscRecord {
    pub fn new(disc_number: impl Into<String>, start_time: impl Into<String>) -> Self {
        let steps = DISC_STEPS
            .iter()
            .map(|name| (name.to_string(), StepState::new(StepStatus::Pending, "")))
            .collect();
        Self {
            disc_number: disc_number.into(),
            start_time: start_time.into(),
            steps,
            ..Self::default()
        }
    }

    pub fn set_step(&mut self, name: &str, status: StepStatus, message: impl Into<String>) {
        self.steps
            .insert(name.to_string(), StepState::new(status, message));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscEntry {
    pub disc: DiscRecord,
}

/// Every disc archived under one base, keyed by disc number.
pub type DiscArchive = BTreeMap<String, DiscEntry>;

/// Missing or unreadable files start an empty archive.
pub fn load_records(path: &Path) -> DiscArchive {
    let Ok(raw) = fs::read_to_string(path) else {
        return DiscArchive::new();
    };
    match serde_json::from_str(&raw) {
        Ok(records) => records,
        Err(err) => {
            tracing::warn!("ignoring unreadable disc records {}: {err}", path.display());
            DiscArchive::new()
        }
    }
}

/// Insert or replace `record` and rewrite the file atomically.
pub fn save_record(path: &Path, record: &DiscRecord) -> Result<()> {
    let mut records = load_records(path);
    records.insert(
        record.disc_number.clone(),
        DiscEntry {
            disc: record.clone(),
        },
    );
    write_json_atomic(path, &records)
        .with_context(|| format!("failed to write disc record {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_accumulate_by_disc_number() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("archive_log.json");

        let mut first = DiscRecord::new("0042", "2024-01-01T00:00:00Z");
        first.set_step("acquire", StepStatus::Done, "4.38 GB");
        first.success = true;
        save_record(&path, &first).expect("first");
        save_record(&path, &DiscRecord::new("0043", "2024-01-02T00:00:00Z")).expect("second");

        let records = load_records(&path);
        assert_eq!(records.len(), 2);
        let disc = &records["0042"].disc;
        assert!(disc.success);
        assert_eq!(disc.steps["acquire"].status, StepStatus::Done);
        assert_eq!(disc.steps["eject"].status, StepStatus::Pending);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["0042"]["disc"]["steps"]["acquire"]["status"], "done");
    }
}
