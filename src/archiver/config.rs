use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

mod allowlist {
    include!(concat!(env!("OUT_DIR"), "/env_allowlist.rs"));
}

pub const ENV_PREFIX: &str = "DVD_";

/// Failed attempts after which an item is left for the operator.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImagingMode {
    Ddrescue,
    Hdiutil,
}

impl ImagingMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ddrescue" => Some(Self::Ddrescue),
            "hdiutil" => Some(Self::Hdiutil),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ddrescue => "ddrescue",
            Self::Hdiutil => "hdiutil",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub base_dir: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            base_dir: home.join("DVD_Archive"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub source_paths: Vec<String>,
    pub target_path: Option<String>,
    pub max_retries: u32,
    #[serde(default = "default_min_conversion_ratio")]
    pub min_conversion_ratio: f64,
}

fn default_min_conversion_ratio() -> f64 {
    0.85
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            source_paths: Vec::new(),
            target_path: None,
            max_retries: DEFAULT_MAX_RETRIES,
            min_conversion_ratio: default_min_conversion_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagingConfig {
    pub mode: ImagingMode,
    pub use_sudo: bool,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            mode: ImagingMode::Ddrescue,
            use_sudo: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParityConfig {
    pub enabled: bool,
    pub redundancy_percent: u32,
}

impl Default for ParityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redundancy_percent: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    pub poll_interval_ms: u64,
    pub window_samples: usize,
    pub anchor_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            window_samples: 20,
            anchor_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Only `part N` / `disc N` tokens mark multi-part sets; bare trailing
    /// numbers stay part of the title.
    pub ignore_trailing_numbers: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub ddrescue_bin: Option<String>,
    pub hdiutil_bin: Option<String>,
    pub dvdisaster_bin: Option<String>,
    pub converter_bin: Option<String>,
    pub diskutil_bin: Option<String>,
    pub drutil_bin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ArchiverConfig {
    pub archive: ArchiveConfig,
    pub batch: BatchConfig,
    pub imaging: ImagingConfig,
    pub parity: ParityConfig,
    pub progress: ProgressConfig,
    pub naming: NamingConfig,
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialArchiverConfig {
    archive: Option<ArchiveConfig>,
    batch: Option<BatchConfig>,
    imaging: Option<ImagingConfig>,
    parity: Option<ParityConfig>,
    progress: Option<ProgressConfig>,
    naming: Option<NamingConfig>,
    tools: Option<ToolsConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_f64(var: &str, fallback: f64) -> f64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => {
            let trimmed = v.trim();
            match trimmed {
                "1" | "true" | "TRUE" | "yes" | "on" => true,
                "0" | "false" | "FALSE" | "no" | "off" => false,
                _ => fallback,
            }
        }
        Err(_) => fallback,
    }
}

fn env_or_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

fn env_or_opt_string(var: &str, fallback: Option<String>) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => fallback,
    }
}

pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn env_or_csv_paths(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = split_csv(&v);
            if out.is_empty() {
                fallback.to_vec()
            } else {
                out
            }
        }
        Err(_) => fallback.to_vec(),
    }
}

pub fn validate(cfg: &ArchiverConfig) -> Result<()> {
    if cfg.archive.base_dir.as_os_str().is_empty() {
        return Err(anyhow!("invalid archive base dir: cannot be empty"));
    }
    if cfg.batch.max_retries == 0 {
        return Err(anyhow!("invalid max retries: must be >= 1"));
    }
    let ratio = cfg.batch.min_conversion_ratio;
    if !(ratio > 0.0 && ratio <= 1.0) {
        return Err(anyhow!(
            "invalid min conversion ratio: require 0 < ratio <= 1.0"
        ));
    }
    let percent = cfg.parity.redundancy_percent;
    if !(1..=100).contains(&percent) {
        return Err(anyhow!("invalid parity percent: require 1..=100"));
    }
    if cfg.progress.poll_interval_ms == 0 {
        return Err(anyhow!("invalid poll interval: must be >= 1 ms"));
    }
    if cfg.progress.window_samples < 2 {
        return Err(anyhow!("invalid progress window: must hold >= 2 samples"));
    }
    Ok(())
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("DVD_ARCHIVER_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let config_dir = dirs::config_dir()?;
    Some(config_dir.join("disc-archiver").join("config.toml"))
}

fn merge_partial(base: &mut ArchiverConfig, parsed: PartialArchiverConfig) {
    if let Some(archive) = parsed.archive {
        base.archive = archive;
    }
    if let Some(batch) = parsed.batch {
        base.batch = batch;
    }
    if let Some(imaging) = parsed.imaging {
        base.imaging = imaging;
    }
    if let Some(parity) = parsed.parity {
        base.parity = parity;
    }
    if let Some(progress) = parsed.progress {
        base.progress = progress;
    }
    if let Some(naming) = parsed.naming {
        base.naming = naming;
    }
    if let Some(tools) = parsed.tools {
        base.tools = tools;
    }
}

fn merge_file_config(base: &mut ArchiverConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    let parsed: PartialArchiverConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse archiver config {}: {err}", path.display()))?;
    merge_partial(base, parsed);
    Ok(())
}

fn apply_env(cfg: &mut ArchiverConfig) -> Result<()> {
    cfg.archive.base_dir = env_or_path("DVD_ARCHIVE_BASE", cfg.archive.base_dir.clone());

    if let Ok(raw) = env::var("DVD_MODE")
        && !raw.trim().is_empty()
    {
        cfg.imaging.mode = ImagingMode::parse(&raw).ok_or_else(|| {
            anyhow!("invalid imaging mode `{}`; use `ddrescue` or `hdiutil`", raw.trim())
        })?;
    }
    cfg.imaging.use_sudo = env_or_bool("DVD_USE_SUDO", cfg.imaging.use_sudo);

    cfg.batch.source_paths = env_or_csv_paths("DVD_SOURCE_PATHS", &cfg.batch.source_paths);
    cfg.batch.target_path = env_or_opt_string("DVD_TARGET_PATH", cfg.batch.target_path.take());
    cfg.batch.max_retries =
        env_or_u64("DVD_MAX_RETRIES", u64::from(cfg.batch.max_retries)).min(u64::from(u32::MAX))
            as u32;
    cfg.batch.min_conversion_ratio =
        env_or_f64("DVD_MIN_CONVERSION_RATIO", cfg.batch.min_conversion_ratio);

    cfg.parity.enabled = env_or_bool("DVD_PARITY_ENABLED", cfg.parity.enabled);
    cfg.parity.redundancy_percent = env_or_u64(
        "DVD_PARITY_PERCENT",
        u64::from(cfg.parity.redundancy_percent),
    )
    .min(u64::from(u32::MAX)) as u32;

    cfg.progress.poll_interval_ms =
        env_or_u64("DVD_POLL_INTERVAL_MS", cfg.progress.poll_interval_ms);
    cfg.progress.window_samples =
        env_or_u64("DVD_PROGRESS_WINDOW", cfg.progress.window_samples as u64) as usize;

    cfg.naming.ignore_trailing_numbers = env_or_bool(
        "DVD_IGNORE_TRAILING_NUMBERS",
        cfg.naming.ignore_trailing_numbers,
    );

    let tools = &mut cfg.tools;
    tools.ddrescue_bin = env_or_opt_string("DVD_DDRESCUE_BIN", tools.ddrescue_bin.take());
    tools.hdiutil_bin = env_or_opt_string("DVD_HDIUTIL_BIN", tools.hdiutil_bin.take());
    tools.dvdisaster_bin = env_or_opt_string("DVD_DVDISASTER_BIN", tools.dvdisaster_bin.take());
    tools.converter_bin = env_or_opt_string("DVD_CONVERTER_BIN", tools.converter_bin.take());
    tools.diskutil_bin = env_or_opt_string("DVD_DISKUTIL_BIN", tools.diskutil_bin.take());
    tools.drutil_bin = env_or_opt_string("DVD_DRUTIL_BIN", tools.drutil_bin.take());
    Ok(())
}

/// `DVD_*` variables set in the environment that nothing reads.
pub fn unknown_env_keys() -> Vec<String> {
    let mut out = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with(ENV_PREFIX))
        .filter(|key| !allowlist::GENERATED_ENV_ALLOWLIST.contains(&key.as_str()))
        .collect::<Vec<_>>();
    out.sort();
    out
}

pub fn load_config() -> Result<ArchiverConfig> {
    let mut cfg = ArchiverConfig::default();
    merge_file_config(&mut cfg)?;
    apply_env(&mut cfg)?;
    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ArchiverConfig::default();
        assert!(validate(&cfg).is_ok());
        assert_eq!(cfg.batch.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(DEFAULT_MAX_RETRIES, 5);
        assert_eq!(cfg.imaging.mode, ImagingMode::Ddrescue);
        assert!(cfg.archive.base_dir.ends_with("DVD_Archive"));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut cfg = ArchiverConfig::default();
        cfg.batch.min_conversion_ratio = 1.5;
        assert!(validate(&cfg).is_err());

        let mut cfg = ArchiverConfig::default();
        cfg.parity.redundancy_percent = 0;
        assert!(validate(&cfg).is_err());

        let mut cfg = ArchiverConfig::default();
        cfg.progress.window_samples = 1;
        assert!(validate(&cfg).is_err());

        let mut cfg = ArchiverConfig::default();
        cfg.batch.max_retries = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn csv_split_drops_blank_segments() {
        assert_eq!(
            split_csv(" /a , ,/b,"),
            vec!["/a".to_string(), "/b".to_string()]
        );
    }

    #[test]
    fn partial_file_replaces_only_named_tables() {
        let raw = r#"
[batch]
source_paths = ["/mnt/a", "/mnt/b"]
target_path = "/mnt/out"
max_retries = 3

[imaging]
mode = "hdiutil"
use_sudo = true
"#;
        let parsed: PartialArchiverConfig = toml::from_str(raw).expect("parse");
        let mut cfg = ArchiverConfig::default();
        merge_partial(&mut cfg, parsed);
        assert_eq!(cfg.batch.source_paths.len(), 2);
        assert_eq!(cfg.batch.max_retries, 3);
        assert_eq!(cfg.batch.min_conversion_ratio, 0.85);
        assert_eq!(cfg.imaging.mode, ImagingMode::Hdiutil);
        assert_eq!(cfg.parity.redundancy_percent, 10);
    }

    #[test]
    fn imaging_mode_parse_is_case_insensitive() {
        assert_eq!(ImagingMode::parse(" HDIUTIL "), Some(ImagingMode::Hdiutil));
        assert_eq!(ImagingMode::parse("dd"), None);
    }
}
