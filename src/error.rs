use crate::archiver::naming::NamingError;
use std::path::PathBuf;
use thiserror::Error;

/// Root-scope failures. These abort the whole invocation and pick the exit code.
#[derive(Debug, Clone, Error)]
pub enum ArchiverError {
    #[error("no optical disc detected; insert a disc and try again")]
    NoDevice,
    #[error("required external tool missing: {0}")]
    MissingTool(String),
    #[error("output was not produced: {0}")]
    OutputMissing(String),
    #[error("config invalid or unreadable: {0}")]
    InvalidConfig(String),
    #[error("archive root {path} is locked by another run: {holder}")]
    Locked { path: PathBuf, holder: String },
    #[error("interrupted by operator")]
    Cancelled,
}

/// Why one work item failed. The display text is what the ledger keeps as
/// the item's last error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error("no image files in {folder}; supported formats: {supported}; folder contains: {sample}")]
    NoInputFiles {
        folder: String,
        supported: String,
        sample: String,
    },
    #[error("naming failed: {0}")]
    Naming(#[from] NamingError),
    #[error("acquire failed for {file}: {message}")]
    Acquire { file: String, message: String },
    #[error(
        "converted {file} is {output_bytes} bytes, under {min_percent}% of the {source_bytes}-byte source; discarded"
    )]
    UndersizedConversion {
        file: String,
        output_bytes: u64,
        source_bytes: u64,
        min_percent: u32,
    },
    #[error("output was not produced: {file}")]
    OutputMissing { file: String },
    #[error("checksum failed for {file}: {message}")]
    Checksum { file: String, message: String },
    #[error("interrupted by operator")]
    Cancelled,
    #[error("filesystem error at {path}: {message}")]
    Io { path: String, message: String },
}

impl StepError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Generic,
    NoDevice,
    OutputMissing,
    MissingTool,
    Locked,
    Interrupted,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Generic => 1,
            Self::NoDevice => 2,
            Self::OutputMissing => 3,
            Self::MissingTool => 4,
            Self::Locked => 5,
            Self::Interrupted => 130,
        }
    }
}

impl ArchiverError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::NoDevice => ExitCode::NoDevice,
            Self::MissingTool(_) => ExitCode::MissingTool,
            Self::OutputMissing(_) => ExitCode::OutputMissing,
            Self::InvalidConfig(_) => ExitCode::Generic,
            Self::Locked { .. } => ExitCode::Locked,
            Self::Cancelled => ExitCode::Interrupted,
        }
    }
}

/// Exit code for any error that reached `main`.
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ArchiverError>())
        .map(ArchiverError::exit_code)
        .unwrap_or(ExitCode::Generic)
}
