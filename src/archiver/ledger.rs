//! Durable record of completed file units, retry metadata and per-source
//! statistics for one archive root.
//!
//! The on-disk document is a cache of filesystem truth: an entry only counts
//! as complete while the output it points at still exists. Every mutation
//! rewrites the whole document atomically.

use crate::archiver::item::{CompletedUnit, cmp_numbers, pad_number};
use crate::archiver::util::{now_epoch_secs, now_iso8601, write_json_atomic};
use crate::archiver::warn::{self, WarnEvent};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LedgerEntry {
    pub source_path: String,
    pub target_path: String,
    pub parent_item_number: String,
    pub parent_title: String,
    pub checksum: String,
    pub parity_path: String,
    pub completed: bool,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FolderMetadata {
    pub title: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: FolderStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PathStatistics {
    pub folders_processed: u64,
    pub folders_failed: u64,
    pub discs_processed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LedgerDocument {
    pub entries: BTreeMap<String, LedgerEntry>,
    pub metadata: BTreeMap<String, FolderMetadata>,
    pub stats: BTreeMap<String, PathStatistics>,
    pub last_updated: Option<String>,
}

/// An item that hit the retry limit, for the end-of-run attention list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionItem {
    pub number: String,
    pub title: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// Compare-form of a filename or path: every digit run loses its leading
/// zeros, so `0675.cdr` and `675.cdr` normalize identically.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut digits = String::new();
    let flush = |digits: &mut String, out: &mut String| {
        if digits.is_empty() {
            return;
        }
        let trimmed = digits.trim_start_matches('0');
        out.push_str(if trimmed.is_empty() { "0" } else { trimmed });
        digits.clear();
    };
    for ch in name.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else {
            flush(&mut digits, &mut out);
            out.push(ch);
        }
    }
    flush(&mut digits, &mut out);
    out
}

fn same_number(a: &str, b: &str) -> bool {
    a == b || normalize_name(a) == normalize_name(b)
}

/// `number` sorts at or after `start` in padded form. Verbatim labels without
/// digits never do.
fn at_or_after(number: &str, start: &str) -> bool {
    !number.is_empty()
        && number.chars().all(|c| c.is_ascii_digit())
        && cmp_numbers(number, start) != Ordering::Less
}

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    doc: LedgerDocument,
}

impl Ledger {
    /// Read the document at `path`. Absence, unreadable or unparseable data
    /// all yield an empty ledger; a corrupt file is set aside, not deleted.
    pub fn load(path: &Path) -> Self {
        let doc = match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<LedgerDocument>(&raw) {
                Ok(doc) => doc,
                Err(err) => {
                    let kept = quarantine_corrupt(path);
                    warn::emit(WarnEvent {
                        code: "LEDGER_CORRUPT",
                        stage: "ledger-load",
                        item: "",
                        file: &path.display().to_string(),
                        retry: "none",
                        reason: if kept { "moved-aside" } else { "ignored" },
                        err: &err.to_string(),
                    });
                    LedgerDocument::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => LedgerDocument::default(),
            Err(err) => {
                warn::emit(WarnEvent {
                    code: "LEDGER_UNREADABLE",
                    stage: "ledger-load",
                    item: "",
                    file: &path.display().to_string(),
                    retry: "none",
                    reason: "read-failed",
                    err: &err.to_string(),
                });
                LedgerDocument::default()
            }
        };
        Self {
            path: path.to_path_buf(),
            doc,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &LedgerDocument {
        &self.doc
    }

    /// Stamp `lastUpdated` and atomically replace the on-disk document.
    pub fn save(&mut self) -> Result<()> {
        self.doc.last_updated = Some(now_iso8601());
        write_json_atomic(&self.path, &self.doc)
    }

    fn find_entries(&self, filename: &str) -> Vec<&LedgerEntry> {
        if let Some(entry) = self.doc.entries.get(filename) {
            return vec![entry];
        }
        let wanted = normalize_name(filename);
        self.doc
            .entries
            .iter()
            .filter(|(key, _)| normalize_name(key) == wanted)
            .map(|(_, entry)| entry)
            .collect()
    }

    /// True only when a completed entry matches `filename` (modulo leading
    /// zeros), its output still exists, and `source` (when given) matches the
    /// source recorded at completion.
    pub fn is_completed(&self, filename: &str, source: Option<&Path>) -> bool {
        let wanted_source = source.map(|s| normalize_name(&s.display().to_string()));
        self.find_entries(filename).into_iter().any(|entry| {
            if !entry.completed || !Path::new(&entry.target_path).exists() {
                return false;
            }
            match &wanted_source {
                Some(wanted) => normalize_name(&entry.source_path) == *wanted,
                None => true,
            }
        })
    }

    fn upsert_entry(&mut self, filename: &str, unit: &CompletedUnit, number: &str, title: &str) {
        let entry = LedgerEntry {
            source_path: unit.source_path.display().to_string(),
            target_path: unit.target_path.display().to_string(),
            parent_item_number: number.to_string(),
            parent_title: title.to_string(),
            checksum: unit.checksum.clone(),
            parity_path: unit
                .parity_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            completed: true,
            timestamp: now_iso8601(),
        };
        self.doc.entries.insert(filename.to_string(), entry);
    }

    /// Source file of a completed, still-present output recorded for `number`
    /// from outside `root`, if any.
    pub fn archived_from_elsewhere(&self, number: &str, root: &Path) -> Option<&str> {
        self.doc
            .entries
            .values()
            .find(|entry| {
                entry.completed
                    && same_number(&entry.parent_item_number, number)
                    && !Path::new(&entry.source_path).starts_with(root)
                    && Path::new(&entry.target_path).is_file()
            })
            .map(|entry| entry.source_path.as_str())
    }

    pub fn mark_completed(
        &mut self,
        filename: &str,
        unit: &CompletedUnit,
        number: &str,
        title: &str,
    ) -> Result<()> {
        self.upsert_entry(filename, unit, number, title);
        self.save()
    }

    pub fn metadata(&self, number: &str) -> Option<&FolderMetadata> {
        self.doc.metadata.get(number)
    }

    pub fn retry_count(&self, number: &str) -> u32 {
        self.metadata(number).map(|m| m.retry_count).unwrap_or(0)
    }

    /// Bump the retry counter and remember the failure. Returns the new count.
    pub fn record_failure(&mut self, number: &str, error: &str) -> Result<u32> {
        let meta = self.doc.metadata.entry(number.to_string()).or_default();
        meta.retry_count = meta.retry_count.saturating_add(1);
        meta.last_error = Some(error.to_string());
        meta.status = FolderStatus::Failed;
        let count = meta.retry_count;
        self.save()?;
        Ok(count)
    }

    fn apply_success(&mut self, number: &str, title: &str) {
        let meta = self.doc.metadata.entry(number.to_string()).or_default();
        meta.retry_count = 0;
        meta.last_error = None;
        meta.status = FolderStatus::Completed;
        if title.chars().count() > meta.title.chars().count() {
            meta.title = title.to_string();
        }
    }

    pub fn record_success(&mut self, number: &str, title: &str) -> Result<()> {
        self.apply_success(number, title);
        self.save()
    }

    fn remove_entries_for(&mut self, number: &str) -> usize {
        let before = self.doc.entries.len();
        self.doc
            .entries
            .retain(|_, entry| !same_number(&entry.parent_item_number, number));
        before - self.doc.entries.len()
    }

    /// Drop every entry owned by item `number`. Returns how many went.
    pub fn clear_item(&mut self, number: &str) -> Result<usize> {
        let removed = self.remove_entries_for(number);
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }

    /// Explicit state-clear: entries go, retry state resets, the title stays.
    pub fn reset_item(&mut self, number: &str) -> Result<usize> {
        let removed = self.remove_entries_for(number);
        if let Some(meta) = self.doc.metadata.get_mut(number) {
            meta.retry_count = 0;
            meta.last_error = None;
            meta.status = FolderStatus::Pending;
        }
        self.save()?;
        Ok(removed)
    }

    /// Keep the longer of the stored and candidate titles and return it.
    pub fn update_title_if_longer(&mut self, number: &str, candidate: &str) -> Result<String> {
        let meta = self.doc.metadata.entry(number.to_string()).or_default();
        if candidate.chars().count() > meta.title.chars().count() {
            meta.title = candidate.to_string();
            let title = meta.title.clone();
            self.save()?;
            return Ok(title);
        }
        Ok(meta.title.clone())
    }

    pub fn stats(&self, source_root: &str) -> PathStatistics {
        self.doc.stats.get(source_root).copied().unwrap_or_default()
    }

    pub fn record_failed_folder(&mut self, source_root: &str) -> Result<()> {
        let stats = self.doc.stats.entry(source_root.to_string()).or_default();
        stats.folders_failed += 1;
        self.save()
    }

    /// Commit a successful item: each unit is recorded as it is confirmed,
    /// then the item's metadata and the per-source counters in one write.
    pub fn commit_item(
        &mut self,
        number: &str,
        title: &str,
        units: &[CompletedUnit],
        source_root: &str,
    ) -> Result<()> {
        for unit in units {
            self.mark_completed(&unit.file_name(), unit, number, title)?;
        }
        let stats = self.doc.stats.entry(source_root.to_string()).or_default();
        stats.folders_processed += 1;
        stats.discs_processed += units.len() as u64;
        self.record_success(number, title)
    }

    /// Forget every item numbered at or after `start`, keeping learned titles.
    /// Returns the item numbers that were touched.
    pub fn purge_from(&mut self, start: &str) -> Result<Vec<String>> {
        let start = pad_number(start);
        let mut touched = std::collections::BTreeSet::new();
        self.doc.entries.retain(|_, entry| {
            if at_or_after(&entry.parent_item_number, &start) {
                touched.insert(pad_number(&entry.parent_item_number));
                false
            } else {
                true
            }
        });
        for (number, meta) in self.doc.metadata.iter_mut() {
            if at_or_after(number, &start) {
                meta.retry_count = 0;
                meta.last_error = None;
                meta.status = FolderStatus::Pending;
                touched.insert(number.clone());
            }
        }
        self.save()?;
        let mut touched: Vec<String> = touched.into_iter().collect();
        touched.sort_by(|a, b| cmp_numbers(a, b));
        Ok(touched)
    }

    /// Items whose retry counter has reached `max_retries`.
    pub fn attention_items(&self, max_retries: u32) -> Vec<AttentionItem> {
        self.doc
            .metadata
            .iter()
            .filter(|(_, meta)| meta.retry_count >= max_retries)
            .map(|(number, meta)| AttentionItem {
                number: number.clone(),
                title: meta.title.clone(),
                retry_count: meta.retry_count,
                last_error: meta.last_error.clone(),
            })
            .collect()
    }
}

fn quarantine_corrupt(path: &Path) -> bool {
    let stamp = now_epoch_secs().unwrap_or(0);
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".corrupt-{stamp}"));
    fs::rename(path, PathBuf::from(aside)).is_ok()
}
