use crate::archiver::progress::{PipelineObserver, StepState, StepStatus};
use crate::tools::hasher::Sha256Hasher;
use crate::tools::{
    CancelToken, Hasher, ImageConverter, ImageStats, Imager, ParityTool, ProgressSink, Toolset,
};
use anyhow::{Result, bail};
use std::fs;
use std::path::{Path, PathBuf};

/// Writes `ratio` of the source bytes as the converted image.
pub struct FakeConverter {
    pub ratio: f64,
}

impl ImageConverter for FakeConverter {
    fn convert(
        &self,
        source: &Path,
        target_format: &str,
        cancel: &CancelToken,
        _progress: ProgressSink<'_>,
    ) -> Result<PathBuf> {
        cancel.check()?;
        let data = fs::read(source)?;
        let keep = ((data.len() as f64) * self.ratio) as usize;
        let out = source.with_extension(target_format);
        fs::write(&out, &data[..keep.min(data.len())])?;
        Ok(out)
    }
}

pub struct FakeParity {
    pub available: bool,
    pub fail: bool,
}

impl ParityTool for FakeParity {
    fn available(&self) -> bool {
        self.available
    }

    fn create_parity(
        &self,
        _image: &Path,
        output: &Path,
        _redundancy_percent: u32,
        _cancel: &CancelToken,
    ) -> Result<()> {
        if self.fail {
            fs::write(output, b"partial")?;
            bail!("parity generation crashed");
        }
        fs::write(output, b"ecc")?;
        Ok(())
    }
}

pub struct FakeImager {
    pub bytes: Vec<u8>,
}

impl Imager for FakeImager {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn image(
        &self,
        _raw_device_id: &str,
        output: &Path,
        _total_bytes: Option<u64>,
        cancel: &CancelToken,
        _progress: ProgressSink<'_>,
    ) -> Result<ImageStats> {
        cancel.check()?;
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(output, &self.bytes)?;
        let mut stats = ImageStats::new();
        stats.insert("fake".into(), "done".into());
        Ok(stats)
    }
}

/// SHA-256 that fails for files whose name contains `fail_on`.
pub struct SelectiveHasher {
    pub fail_on: String,
}

impl Hasher for SelectiveHasher {
    fn hash(&self, path: &Path, cancel: &CancelToken) -> Result<String> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if !self.fail_on.is_empty() && name.contains(&self.fail_on) {
            bail!("read error on {name}");
        }
        Sha256Hasher.hash(path, cancel)
    }
}

pub fn tools() -> Toolset {
    Toolset {
        hasher: Box::new(Sha256Hasher),
        parity: Box::new(FakeParity {
            available: true,
            fail: false,
        }),
        converter: Box::new(FakeConverter { ratio: 1.0 }),
        imager: None,
    }
}

#[derive(Default)]
pub struct Recorder {
    pub steps: Vec<(String, StepStatus, String)>,
}

impl Recorder {
    pub fn last_status(&self, name: &str) -> Option<StepStatus> {
        self.steps
            .iter()
            .rev()
            .find(|(n, _, _)| n == name)
            .map(|(_, status, _)| *status)
    }
}

impl PipelineObserver for Recorder {
    fn step(&mut self, name: &str, state: &StepState) {
        self.steps
            .push((name.to_string(), state.status, state.message.clone()));
    }
}
