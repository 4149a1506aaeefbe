use crate::archiver::config::ProgressConfig;
use crate::archiver::util::{file_size, remove_file_if_exists};
use crate::tools::process::{Privilege, WatchOptions, build_command, run_watched};
use crate::tools::{CancelToken, ImageConverter, ProgressSink};
use anyhow::{Context, Result, bail};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONVERTER: &str = "iat";

/// Container-format converter run as an external process
/// (`<bin> -i <source> -o <output> --iso`).
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    bin: Option<PathBuf>,
    progress: ProgressConfig,
}

impl ExternalConverter {
    pub fn new(bin: Option<PathBuf>, progress: ProgressConfig) -> Self {
        Self { bin, progress }
    }
}

pub fn converted_path(source: &Path, target_format: &str) -> PathBuf {
    source.with_extension(target_format.to_ascii_lowercase())
}

impl ImageConverter for ExternalConverter {
    fn convert(
        &self,
        source: &Path,
        target_format: &str,
        cancel: &CancelToken,
        progress: ProgressSink<'_>,
    ) -> Result<PathBuf> {
        let Some(bin) = self.bin.as_deref() else {
            bail!("image converter `{DEFAULT_CONVERTER}` not available; set DVD_CONVERTER_BIN");
        };
        let output = converted_path(source, target_format);
        if output == source {
            bail!("{} is already {target_format}", source.display());
        }
        remove_file_if_exists(&output)?;

        let args: Vec<OsString> = vec![
            "-i".into(),
            source.as_os_str().to_owned(),
            "-o".into(),
            output.as_os_str().to_owned(),
            format!("--{}", target_format.to_ascii_lowercase()).into(),
        ];
        let cmd = build_command(bin, &args, Privilege::Direct);
        let opts = WatchOptions::new(&self.progress).watching(&output, file_size(source));
        let outcome = run_watched(cmd, &opts, cancel, &mut |_| None, progress)
            .with_context(|| format!("conversion failed for {}", source.display()))?;
        outcome.ensure_success("converter")?;
        if !output.is_file() {
            bail!("converter produced no output for {}", source.display());
        }
        Ok(output)
    }
}
