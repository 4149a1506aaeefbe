use crate::archiver::item::{WorkItem, extension_of, extract_key, first_digit_run, is_supported_format};
use crate::archiver::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// Title left over once the key digits are cut out of a folder name.
fn title_from_name(name: &str) -> String {
    let stripped = match first_digit_run(name) {
        Some(digits) => name.replacen(digits, "", 1),
        None => name.to_string(),
    };
    stripped
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, '-' | '_' | '.' | '#'))
        .to_string()
}

fn collect_files(root: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))?;
    for entry in entries {
        let path = entry?.path();
        if is_hidden(&path) {
            continue;
        }
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Recognized image files under `folder`, recursively, sorted by path.
pub fn image_files(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut all = Vec::new();
    collect_files(folder, &mut all)?;
    let mut out = all
        .into_iter()
        .filter(|p| extension_of(p).is_some_and(|ext| is_supported_format(&ext)))
        .collect::<Vec<_>>();
    out.sort();
    Ok(out)
}

/// Up to `limit` entry names directly under `folder`, for diagnostics.
pub fn folder_sample(folder: &Path, limit: usize) -> Vec<String> {
    let Ok(entries) = fs::read_dir(folder) else {
        return Vec::new();
    };
    let mut names = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect::<Vec<_>>();
    names.sort();
    names.truncate(limit);
    names
}

/// Numbered work items under `root`, ordered by numeric key.
///
/// Folders without digits are left out. A missing or non-directory root is a
/// soft condition: it is reported and yields no items.
pub fn discover(root: &Path) -> Vec<WorkItem> {
    if !root.is_dir() {
        warn::emit(WarnEvent {
            code: "SOURCE_ROOT_MISSING",
            stage: "discover",
            item: "",
            file: &root.display().to_string(),
            retry: "next-run",
            reason: if root.exists() { "not-a-directory" } else { "not-found" },
            err: "",
        });
        return Vec::new();
    }

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            warn::emit(WarnEvent {
                code: "SOURCE_ROOT_UNREADABLE",
                stage: "discover",
                item: "",
                file: &root.display().to_string(),
                retry: "next-run",
                reason: "read-dir-failed",
                err: &err.to_string(),
            });
            return Vec::new();
        }
    };

    let mut folders = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && !is_hidden(p))
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            let number = extract_key(&name)?;
            Some((number, name, path))
        })
        .collect::<Vec<_>>();
    folders.sort_by(|a, b| {
        let av = a.0.parse::<u64>().unwrap_or(u64::MAX);
        let bv = b.0.parse::<u64>().unwrap_or(u64::MAX);
        av.cmp(&bv).then_with(|| a.1.cmp(&b.1))
    });

    let mut seen = BTreeSet::new();
    let mut items = Vec::with_capacity(folders.len());
    for (number, name, path) in folders {
        if !seen.insert(number.clone()) {
            warn::emit(WarnEvent {
                code: "DUPLICATE_ITEM_NUMBER",
                stage: "discover",
                item: &number,
                file: &path.display().to_string(),
                retry: "none",
                reason: "number-already-claimed",
                err: "",
            });
            continue;
        }
        let files = match image_files(&path) {
            Ok(files) => files,
            Err(err) => {
                tracing::warn!("failed to list {}: {err:#}", path.display());
                Vec::new()
            }
        };
        items.push(WorkItem {
            number,
            title: title_from_name(&name),
            source_path: path,
            files,
        });
    }
    items
}

/// Work item for a single inserted disc, keyed off its volume label. Labels
/// without digits are used verbatim.
pub fn from_label(label: &str) -> WorkItem {
    let label = label.trim();
    let number = extract_key(label).unwrap_or_else(|| label.to_string());
    WorkItem {
        number,
        title: title_from_name(label),
        source_path: PathBuf::from(label),
        files: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn discovery_orders_by_numeric_value() {
        let tmp = tempdir().expect("tempdir");
        for name in ["100 C", "10 B", "2 A", "Extras"] {
            fs::create_dir_all(tmp.path().join(name)).expect("mkdir");
        }
        let items = discover(tmp.path());
        let numbers: Vec<_> = items.iter().map(|i| i.number.as_str()).collect();
        assert_eq!(numbers, vec!["0002", "0010", "0100"]);
        assert_eq!(items[0].title, "A");
    }

    #[test]
    fn discovery_collects_recognized_files_only() {
        let tmp = tempdir().expect("tempdir");
        let folder = tmp.path().join("0042 My Movie");
        fs::create_dir_all(folder.join("extra")).expect("mkdir");
        fs::write(folder.join("42.iso"), b"x").expect("iso");
        fs::write(folder.join("notes.txt"), b"x").expect("txt");
        fs::write(folder.join("._42.iso"), b"x").expect("appledouble");
        fs::write(folder.join("extra").join("42 bonus.MDX"), b"x").expect("mdx");

        let items = discover(tmp.path());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].number, "0042");
        assert_eq!(items[0].title, "My Movie");
        let names: Vec<_> = items[0]
            .files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["42.iso", "42 bonus.MDX"]);
    }

    #[test]
    fn missing_root_yields_nothing() {
        let tmp = tempdir().expect("tempdir");
        assert!(discover(&tmp.path().join("absent")).is_empty());
    }

    #[test]
    fn duplicate_numbers_keep_the_first_folder() {
        let tmp = tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("0042 A")).expect("mkdir");
        fs::create_dir_all(tmp.path().join("42 B")).expect("mkdir");
        let items = discover(tmp.path());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "A");
    }

    #[test]
    fn labels_without_digits_are_verbatim() {
        assert_eq!(from_label("DVD_0675").number, "0675");
        assert_eq!(from_label("HOLIDAY").number, "HOLIDAY");
    }
}
