use crate::archiver::config::ProgressConfig;
use crate::tools::process::{Privilege, WatchOptions, build_command, run_watched};
use crate::tools::{CancelToken, ParityTool};
use anyhow::{Context, Result, bail};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// dvdisaster RS01 error-correction files.
#[derive(Debug, Clone)]
pub struct DvdisasterParity {
    bin: Option<PathBuf>,
    progress: ProgressConfig,
}

impl DvdisasterParity {
    pub fn new(bin: Option<PathBuf>, progress: ProgressConfig) -> Self {
        Self { bin, progress }
    }
}

pub fn parity_args(image: &Path, output: &Path, redundancy_percent: u32) -> Vec<OsString> {
    vec![
        "-mRS01".into(),
        "-c".into(),
        "-i".into(),
        image.as_os_str().to_owned(),
        "-e".into(),
        output.as_os_str().to_owned(),
        "-n".into(),
        format!("{redundancy_percent}%").into(),
    ]
}

impl ParityTool for DvdisasterParity {
    fn available(&self) -> bool {
        self.bin.is_some()
    }

    fn create_parity(
        &self,
        image: &Path,
        output: &Path,
        redundancy_percent: u32,
        cancel: &CancelToken,
    ) -> Result<()> {
        let Some(bin) = self.bin.as_deref() else {
            bail!("dvdisaster not available");
        };
        let cmd = build_command(
            bin,
            &parity_args(image, output, redundancy_percent),
            Privilege::Direct,
        );
        let opts = WatchOptions::new(&self.progress);
        let outcome = run_watched(cmd, &opts, cancel, &mut |_| None, &mut |_| {})
            .with_context(|| format!("dvdisaster failed for {}", image.display()))?;
        outcome.ensure_success("dvdisaster")?;
        if !output.is_file() {
            bail!("dvdisaster reported success but {} is missing", output.display());
        }
        Ok(())
    }
}
