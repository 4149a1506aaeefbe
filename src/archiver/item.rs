use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// Process-wide width of canonical item numbers.
pub const ITEM_NUMBER_WIDTH: usize = 4;

/// Image container formats the archiver recognizes, lower-case.
pub const SUPPORTED_FORMATS: &[&str] = &[
    "iso", "img", "bin", "cue", "cdr", "dmg", "mdf", "mds", "mdx", "nrg", "ccd",
];

/// Mountable proprietary formats that conversion mode turns into ISO.
pub const CONVERTIBLE_FORMATS: &[&str] = &["mdx", "mdf", "nrg"];

pub fn is_supported_format(ext: &str) -> bool {
    SUPPORTED_FORMATS.contains(&ext.to_ascii_lowercase().as_str())
}

pub fn is_convertible_format(ext: &str) -> bool {
    CONVERTIBLE_FORMATS.contains(&ext.to_ascii_lowercase().as_str())
}

/// First run of ASCII digits in `name`, if any.
pub fn first_digit_run(name: &str) -> Option<&str> {
    let start = name.find(|c: char| c.is_ascii_digit())?;
    let rest = &name[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Zero-pad a digit string to the canonical width. Longer keys are kept whole.
pub fn pad_number(digits: &str) -> String {
    let trimmed = digits.trim_start_matches('0');
    let core = if trimmed.is_empty() { "0" } else { trimmed };
    format!("{core:0>width$}", width = ITEM_NUMBER_WIDTH)
}

/// Order item numbers by numeric value, so keys wider than the canonical
/// width sort after narrower ones. Verbatim labels fall back to text order.
pub fn cmp_numbers(a: &str, b: &str) -> Ordering {
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit());
    if numeric(a) && numeric(b) {
        let (a, b) = (a.trim_start_matches('0'), b.trim_start_matches('0'));
        return a.len().cmp(&b.len()).then_with(|| a.cmp(b));
    }
    a.cmp(b)
}

/// Canonical key for a folder or label name: its first digit run, padded.
pub fn extract_key(name: &str) -> Option<String> {
    first_digit_run(name).map(pad_number)
}

pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// One archivable unit: a numbered source folder or an inserted disc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub number: String,
    pub title: String,
    pub source_path: PathBuf,
    pub files: Vec<PathBuf>,
}

impl WorkItem {
    /// Directory name under the target root: `0042_My_Movie`, or `0042`.
    pub fn target_dir_name(&self) -> String {
        let title = normalize_separators(&self.title);
        if title.is_empty() {
            self.number.clone()
        } else {
            format!("{}_{}", self.number, title)
        }
    }
}

/// Replace whitespace runs with `_`, collapse repeated `_` and trim them.
pub fn normalize_separators(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_sep = false;
    for ch in input.chars() {
        if ch.is_whitespace() || ch == '_' {
            if !out.is_empty() && !prev_sep {
                out.push('_');
            }
            prev_sep = true;
        } else {
            out.push(ch);
            prev_sep = false;
        }
    }
    out.trim_end_matches('_').to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitAction {
    Copy,
    Convert,
    Image,
}

/// One physical image file belonging to a work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUnit {
    pub source_path: PathBuf,
    pub target_name: String,
    pub action: UnitAction,
}

/// A file unit whose output exists, is hashed, and maybe protected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedUnit {
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub checksum: String,
    pub parity_path: Option<PathBuf>,
}

impl CompletedUnit {
    pub fn file_name(&self) -> String {
        self.target_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_order_by_value_not_text() {
        assert_eq!(cmp_numbers("10000", "2000"), Ordering::Greater);
        assert_eq!(cmp_numbers("0042", "42"), Ordering::Equal);
        assert_eq!(cmp_numbers("0009", "0010"), Ordering::Less);
        assert_eq!(cmp_numbers("ALPHA", "BETA"), Ordering::Less);
    }

    #[test]
    fn key_is_first_digit_run_padded() {
        assert_eq!(extract_key("0042 My Movie").as_deref(), Some("0042"));
        assert_eq!(extract_key("Movie 7 (1999)").as_deref(), Some("0007"));
        assert_eq!(extract_key("12345 Box Set").as_deref(), Some("12345"));
        assert_eq!(extract_key("no digits"), None);
    }

    #[test]
    fn padding_strips_then_restores_leading_zeros() {
        assert_eq!(pad_number("675"), "0675");
        assert_eq!(pad_number("000675"), "0675");
        assert_eq!(pad_number("0"), "0000");
    }

    #[test]
    fn separators_collapse() {
        assert_eq!(normalize_separators("  My   Movie _ 2 "), "My_Movie_2");
        assert_eq!(normalize_separators(""), "");
    }

    #[test]
    fn target_dir_includes_normalized_title() {
        let item = WorkItem {
            number: "0042".into(),
            title: "My Movie".into(),
            source_path: PathBuf::from("/src/0042 My Movie"),
            files: Vec::new(),
        };
        assert_eq!(item.target_dir_name(), "0042_My_Movie");
    }

    #[test]
    fn formats_are_case_insensitive() {
        assert!(is_supported_format("ISO"));
        assert!(is_convertible_format("MDX"));
        assert!(!is_convertible_format("iso"));
        assert!(!is_supported_format("txt"));
    }
}
