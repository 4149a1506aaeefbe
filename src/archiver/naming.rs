//! Target file names for the image files of one work item.
//!
//! Each file's stem is normalized and loses the item key. What is left may end
//! in a part marker (`part 2`, `disc_3`, or a bare trailing number). Files
//! that agree on the remaining text and the part marker are alternatives of
//! one physical disc and form a group. A lone group is named after the key; a
//! multi-part item gets a part number per group.

use crate::archiver::item::{
    FileUnit, UnitAction, WorkItem, extension_of, first_digit_run, is_convertible_format,
    normalize_separators, pad_number,
};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

/// Plain images that lose to a convertible alternative in conversion mode.
const PLAIN_FORMATS: &[&str] = &["iso", "img", "cdr"];
const CONVERTED_FORMAT: &str = "iso";

static EXPLICIT_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|_)(?:part|pt|disc|disk|cd|dvd)_?(\d+)$").expect("valid regex")
});
static TRAILING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|_)(\d+)$").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamingError {
    #[error("inputs {first} and {second} both resolve to target {target}")]
    DuplicateTarget {
        target: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NamingOptions {
    pub convert: bool,
    pub ignore_trailing_numbers: bool,
}

#[derive(Debug, Clone)]
struct Candidate {
    source: PathBuf,
    ext: String,
    base: String,
    part: Option<u32>,
}

#[derive(Debug, Clone)]
struct Group {
    base: String,
    part: Option<u32>,
    members: Vec<Candidate>,
}

fn trim_separators(s: &str) -> &str {
    s.trim_matches(|c: char| matches!(c, '_' | '-' | '.'))
}

/// Stem with the item key's digit run cut out, when the first digit run is
/// the key.
fn strip_key(stem: &str, number: &str) -> String {
    let Some(digits) = first_digit_run(stem) else {
        return trim_separators(stem).to_string();
    };
    if pad_number(digits) != number {
        return trim_separators(stem).to_string();
    }
    let without = stem.replacen(digits, " ", 1);
    trim_separators(&normalize_separators(&without)).to_string()
}

fn split_part(leftover: &str, ignore_trailing: bool) -> (String, Option<u32>) {
    let caps = EXPLICIT_PART.captures(leftover).or_else(|| {
        (!ignore_trailing)
            .then(|| TRAILING_NUMBER.captures(leftover))
            .flatten()
    });
    let Some(caps) = caps else {
        return (leftover.to_string(), None);
    };
    let (Some(whole), Some(num)) = (caps.get(0), caps.get(1)) else {
        return (leftover.to_string(), None);
    };
    match num.as_str().parse::<u32>() {
        Ok(part) => (
            trim_separators(&leftover[..whole.start()]).to_string(),
            Some(part),
        ),
        Err(_) => (leftover.to_string(), None),
    }
}

fn candidate(path: &Path, number: &str, opts: &NamingOptions) -> Candidate {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let leftover = strip_key(&normalize_separators(stem), number);
    let (base, part) = split_part(&leftover, opts.ignore_trailing_numbers);
    Candidate {
        source: path.to_path_buf(),
        ext: extension_of(path).unwrap_or_default(),
        base,
        part,
    }
}

fn group_candidates(candidates: Vec<Candidate>) -> Vec<Group> {
    let mut groups: BTreeMap<(String, Option<u32>), Group> = BTreeMap::new();
    for c in candidates {
        groups
            .entry((c.base.to_ascii_lowercase(), c.part))
            .or_insert_with(|| Group {
                base: c.base.clone(),
                part: c.part,
                members: Vec::new(),
            })
            .members
            .push(c);
    }
    groups.into_values().collect()
}

/// In conversion mode a convertible member makes its plain alternatives
/// redundant.
fn drop_plain_alternatives(group: &mut Group) {
    if group.members.iter().any(|m| is_convertible_format(&m.ext)) {
        group
            .members
            .retain(|m| !PLAIN_FORMATS.contains(&m.ext.as_str()));
    }
}

/// Assign part numbers: explicit ones stay, the rest take the smallest
/// unused numbers in (explicit, value, base) order.
fn assign_parts(groups: &mut [Group]) -> Vec<u32> {
    groups.sort_by(|a, b| {
        (a.part.is_some(), a.part, a.base.to_ascii_lowercase()).cmp(&(
            b.part.is_some(),
            b.part,
            b.base.to_ascii_lowercase(),
        ))
    });
    let mut used: BTreeSet<u32> = groups.iter().filter_map(|g| g.part).collect();
    let mut next = 1u32;
    groups
        .iter()
        .map(|g| match g.part {
            Some(part) => part,
            None => {
                while used.contains(&next) {
                    next += 1;
                }
                used.insert(next);
                next
            }
        })
        .collect()
}

fn stem_for(number: &str, base: &str, part: Option<u32>) -> String {
    let mut stem = number.to_string();
    if !base.is_empty() {
        stem.push('_');
        stem.push_str(base);
    }
    if let Some(part) = part {
        stem.push('_');
        stem.push_str(&part.to_string());
    }
    stem
}

/// Resolve target names for every file of `item`.
pub fn plan_units(item: &WorkItem, opts: &NamingOptions) -> Result<Vec<FileUnit>, NamingError> {
    let candidates = item
        .files
        .iter()
        .map(|path| candidate(path, &item.number, opts))
        .collect::<Vec<_>>();
    let mut groups = group_candidates(candidates);
    if opts.convert {
        groups.iter_mut().for_each(drop_plain_alternatives);
    }

    let stems: Vec<String> = if groups.len() == 1 {
        vec![stem_for(&item.number, &groups[0].base, None)]
    } else {
        let parts = assign_parts(&mut groups);
        groups
            .iter()
            .zip(parts)
            .map(|(g, part)| stem_for(&item.number, &g.base, Some(part)))
            .collect()
    };

    let mut units = Vec::new();
    let mut claimed: BTreeMap<String, PathBuf> = BTreeMap::new();
    for (group, stem) in groups.iter().zip(stems) {
        for member in &group.members {
            let (action, ext) = if opts.convert && is_convertible_format(&member.ext) {
                (UnitAction::Convert, CONVERTED_FORMAT)
            } else {
                (UnitAction::Copy, member.ext.as_str())
            };
            let target_name = if ext.is_empty() {
                stem.clone()
            } else {
                format!("{stem}.{ext}")
            };
            if let Some(first) = claimed.get(&target_name) {
                return Err(NamingError::DuplicateTarget {
                    target: target_name,
                    first: first.display().to_string(),
                    second: member.source.display().to_string(),
                });
            }
            claimed.insert(target_name.clone(), member.source.clone());
            units.push(FileUnit {
                source_path: member.source.clone(),
                target_name,
                action,
            });
        }
    }
    Ok(units)
}

/// The single imaging unit of a disc run.
pub fn disc_unit(number: &str, raw_device: &str) -> FileUnit {
    FileUnit {
        source_path: PathBuf::from(raw_device),
        target_name: format!("disc_{number}.iso"),
        action: UnitAction::Image,
    }
}
