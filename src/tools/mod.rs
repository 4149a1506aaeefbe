//! External collaborators: device discovery, imaging, hashing, parity and
//! format conversion. The engine only sees these traits; the process-backed
//! implementations own argument building and output parsing.

pub mod converter;
pub mod device;
pub mod hasher;
pub mod imager;
pub mod parity;
pub mod process;

use crate::archiver::config::{ArchiverConfig, ImagingMode};
use crate::archiver::progress::ProgressEvent;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Raised by collaborators that stopped because the operator interrupted.
#[derive(Debug, Error)]
#[error("cancelled by operator")]
pub struct Cancelled;

/// Shared interrupt flag, set from the Ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }
}

/// True when `err` or anything it wraps is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}

pub type ProgressSink<'a> = &'a mut dyn FnMut(&ProgressEvent);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub device_id: String,
    pub raw_device_id: String,
}

pub trait DeviceLocator {
    fn locate(&self) -> Option<DeviceHandle>;
    fn unmount(&self, device_id: &str) -> bool;
    fn eject(&self, device_id: &str) -> bool;
    fn capacity_bytes(&self, device_id: &str) -> Option<u64>;
    fn label(&self, device_id: &str) -> Option<String>;
    /// Free-form drive status text, saved beside the image.
    fn status_report(&self) -> Option<String>;
}

/// Final status lines per imaging pass, kept in the disc record.
pub type ImageStats = BTreeMap<String, String>;

pub trait Imager {
    fn name(&self) -> &'static str;

    fn image(
        &self,
        raw_device_id: &str,
        output: &Path,
        total_bytes: Option<u64>,
        cancel: &CancelToken,
        progress: ProgressSink<'_>,
    ) -> Result<ImageStats>;
}

pub trait Hasher {
    /// Lower-case hex digest of the file at `path`.
    fn hash(&self, path: &Path, cancel: &CancelToken) -> Result<String>;
}

pub trait ParityTool {
    fn available(&self) -> bool;

    fn create_parity(
        &self,
        image: &Path,
        output: &Path,
        redundancy_percent: u32,
        cancel: &CancelToken,
    ) -> Result<()>;
}

pub trait ImageConverter {
    /// Convert `source` into `target_format`, returning the produced path.
    fn convert(
        &self,
        source: &Path,
        target_format: &str,
        cancel: &CancelToken,
        progress: ProgressSink<'_>,
    ) -> Result<PathBuf>;
}

/// The collaborators one run works with.
pub struct Toolset {
    pub hasher: Box<dyn Hasher>,
    pub parity: Box<dyn ParityTool>,
    pub converter: Box<dyn ImageConverter>,
    pub imager: Option<Box<dyn Imager>>,
}

/// An explicit binary path if it exists, else a `PATH` lookup of `default`.
pub fn resolve_tool(explicit: Option<&str>, default: &str) -> Option<PathBuf> {
    if let Some(raw) = explicit {
        let candidate = Path::new(raw);
        if candidate.is_file() {
            return Some(candidate.to_path_buf());
        }
        return which::which(raw).ok();
    }
    which::which(default).ok()
}

pub fn imaging_tool_name(mode: ImagingMode) -> &'static str {
    match mode {
        ImagingMode::Ddrescue => "ddrescue",
        ImagingMode::Hdiutil => "hdiutil",
    }
}

pub fn imaging_tool_path(cfg: &ArchiverConfig) -> Option<PathBuf> {
    let tools = &cfg.tools;
    match cfg.imaging.mode {
        ImagingMode::Ddrescue => resolve_tool(tools.ddrescue_bin.as_deref(), "ddrescue"),
        ImagingMode::Hdiutil => resolve_tool(tools.hdiutil_bin.as_deref(), "hdiutil"),
    }
}

pub fn build_imager(cfg: &ArchiverConfig) -> Option<Box<dyn Imager>> {
    let bin = imaging_tool_path(cfg)?;
    let sudo = cfg.imaging.use_sudo;
    let progress = cfg.progress.clone();
    let imager: Box<dyn Imager> = match cfg.imaging.mode {
        ImagingMode::Ddrescue => Box::new(imager::DdrescueImager::new(bin, sudo, progress)),
        ImagingMode::Hdiutil => Box::new(imager::HdiutilImager::new(bin, sudo, progress)),
    };
    Some(imager)
}

/// Process-backed collaborators for `cfg`. The imager is only built when a
/// disc run asks for one.
pub fn build_toolset(cfg: &ArchiverConfig, with_imager: bool) -> Toolset {
    let tools = &cfg.tools;
    Toolset {
        hasher: Box::new(hasher::Sha256Hasher),
        parity: Box::new(parity::DvdisasterParity::new(
            resolve_tool(tools.dvdisaster_bin.as_deref(), "dvdisaster"),
            cfg.progress.clone(),
        )),
        converter: Box::new(converter::ExternalConverter::new(
            resolve_tool(tools.converter_bin.as_deref(), converter::DEFAULT_CONVERTER),
            cfg.progress.clone(),
        )),
        imager: if with_imager { build_imager(cfg) } else { None },
    }
}
