use crate::archiver::config::ToolsConfig;
use crate::tools::process::capture;
use crate::tools::{DeviceHandle, DeviceLocator, resolve_tool};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;

const SECTOR_BYTES: u64 = 2048;
const MIN_DISC_GB: f64 = 3.5;
const MAX_DISC_GB: f64 = 9.5;

static DRUTIL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Name:\s*(/dev/disk\d+)").expect("valid regex"));
static LIST_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(/dev/disk\d+)\s*\(([^)]*)\)").expect("valid regex"));
static LIST_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\s*([0-9]+(?:\.[0-9]+)?)\s+GB").expect("valid regex"));
static TOTAL_SIZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:Total|Disk) Size:\s+.*\((\d+) Bytes\)").expect("valid regex")
});
static SPACE_USED_BLOCKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Space Used:.*?blocks:\s*(\d+)").expect("valid regex"));
static BARE_BLOCKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"blocks\s*:\s*(\d+)\s*/").expect("valid regex"));

/// Drive vendors whose model strings show up as a "Media Name".
const DRIVE_MODEL_MARKERS: &[&str] = &[
    "HL-DT-ST",
    "MATSHITA",
    "PIONEER",
    "TSSTCORP",
    "ASUS",
    "SUPERDRIVE",
    "OPTIARC",
    "PLEXTOR",
];

pub fn raw_device_for(device: &str) -> String {
    device.replacen("/dev/disk", "/dev/rdisk", 1)
}

pub fn device_from_drutil(status: &str) -> Option<String> {
    status
        .lines()
        .find_map(|line| DRUTIL_NAME.captures(line).map(|caps| caps[1].to_string()))
}

/// First external physical disk whose size looks like a DVD.
pub fn device_from_diskutil_list(list: &str) -> Option<String> {
    let mut current: Option<String> = None;
    for line in list.lines() {
        if let Some(caps) = LIST_HEADER.captures(line) {
            let kind = caps[2].to_ascii_lowercase();
            current = (kind.contains("external") && kind.contains("physical"))
                .then(|| caps[1].to_string());
            continue;
        }
        let Some(disk) = current.as_ref() else {
            continue;
        };
        if let Some(caps) = LIST_SIZE.captures(line) {
            if let Ok(gb) = caps[1].parse::<f64>()
                && (MIN_DISC_GB..=MAX_DISC_GB).contains(&gb)
            {
                return Some(disk.clone());
            }
            current = None;
        }
    }
    None
}

pub fn capacity_from_info(info: &str) -> Option<u64> {
    TOTAL_SIZE
        .captures(info)
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .filter(|bytes| *bytes > 0)
}

pub fn capacity_from_drutil(status: &str) -> Option<u64> {
    SPACE_USED_BLOCKS
        .captures(status)
        .or_else(|| BARE_BLOCKS.captures(status))
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .filter(|blocks| *blocks > 0)
        .map(|blocks| blocks * SECTOR_BYTES)
}

fn field_value(info: &str, key: &str) -> Option<String> {
    info.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim() != key {
            return None;
        }
        let v = v.trim();
        (!v.is_empty() && !v.eq_ignore_ascii_case("Not applicable (no file system)"))
            .then(|| v.to_string())
    })
}

fn looks_like_drive_model(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    DRIVE_MODEL_MARKERS.iter().any(|m| upper.contains(m))
}

/// Label from a disk's `diskutil info`: the volume name, else a media name
/// that is not just the drive model.
pub fn label_from_info(info: &str) -> Option<String> {
    if let Some(volume) = field_value(info, "Volume Name") {
        return Some(volume);
    }
    field_value(info, "Media Name").filter(|name| !looks_like_drive_model(name))
}

/// Partition identifiers (`/dev/disk4s1`) listed for `device`.
pub fn partitions_of(list: &str, device: &str) -> Vec<String> {
    let ident = device.trim_start_matches("/dev/");
    let mut out = Vec::new();
    for token in list.split_whitespace() {
        let token = token.trim_start_matches("/dev/");
        if let Some(rest) = token.strip_prefix(ident)
            && let Some(num) = rest.strip_prefix('s')
            && !num.is_empty()
            && num.chars().all(|c| c.is_ascii_digit())
        {
            let id = format!("/dev/{token}");
            if !out.contains(&id) {
                out.push(id);
            }
        }
    }
    out
}

/// macOS optical drive access through `drutil` and `diskutil`. A missing
/// binary reads as "no device".
#[derive(Debug, Clone)]
pub struct DiskutilLocator {
    drutil: Option<PathBuf>,
    diskutil: Option<PathBuf>,
}

impl DiskutilLocator {
    pub fn new(drutil: Option<PathBuf>, diskutil: Option<PathBuf>) -> Self {
        Self { drutil, diskutil }
    }

    pub fn from_config(tools: &ToolsConfig) -> Self {
        Self::new(
            resolve_tool(tools.drutil_bin.as_deref(), "drutil"),
            resolve_tool(tools.diskutil_bin.as_deref(), "diskutil"),
        )
    }

    pub fn missing_tools(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.drutil.is_none() {
            out.push("drutil");
        }
        if self.diskutil.is_none() {
            out.push("diskutil");
        }
        out
    }

    fn diskutil(&self, args: &[&str]) -> Option<String> {
        capture(self.diskutil.as_deref()?, args)
    }

    fn diskutil_ok(&self, args: &[&str]) -> bool {
        let Some(bin) = self.diskutil.as_deref() else {
            return false;
        };
        run_quiet(bin, args)
    }
}

fn run_quiet(bin: &Path, args: &[&str]) -> bool {
    Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

impl DeviceLocator for DiskutilLocator {
    fn locate(&self) -> Option<DeviceHandle> {
        let list = self.diskutil(&["list"])?;
        let from_drive = self
            .status_report()
            .and_then(|status| device_from_drutil(&status))
            .filter(|disk| list.contains(disk.as_str()));
        let device_id = from_drive.or_else(|| device_from_diskutil_list(&list))?;
        Some(DeviceHandle {
            raw_device_id: raw_device_for(&device_id),
            device_id,
        })
    }

    fn unmount(&self, device_id: &str) -> bool {
        self.diskutil_ok(&["unmountDisk", device_id])
    }

    fn eject(&self, device_id: &str) -> bool {
        self.diskutil_ok(&["eject", device_id])
    }

    fn capacity_bytes(&self, device_id: &str) -> Option<u64> {
        let disk = device_id.replacen("/dev/rdisk", "/dev/disk", 1);
        self.diskutil(&["info", &disk])
            .and_then(|info| capacity_from_info(&info))
            .or_else(|| {
                self.status_report()
                    .and_then(|status| capacity_from_drutil(&status))
            })
    }

    fn label(&self, device_id: &str) -> Option<String> {
        if let Some(list) = self.diskutil(&["list", device_id]) {
            for part in partitions_of(&list, device_id) {
                if let Some(name) = self
                    .diskutil(&["info", &part])
                    .and_then(|info| field_value(&info, "Volume Name"))
                {
                    return Some(name);
                }
            }
        }
        self.diskutil(&["info", device_id])
            .and_then(|info| label_from_info(&info))
    }

    fn status_report(&self) -> Option<String> {
        capture(self.drutil.as_deref()?, &["status"])
    }
}
