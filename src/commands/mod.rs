pub mod batch;
pub mod clear;
pub mod disc;
pub mod status;

use crate::archiver::config::{ArchiverConfig, load_config};
use crate::error::ArchiverError;
use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
    /// Root-scope failure that decides the exit code once the report is out.
    #[serde(skip)]
    pub failure: Option<ArchiverError>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
            failure: None,
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn fail(&mut self, err: ArchiverError) {
        self.issue(err.to_string());
        self.failure = Some(err);
    }
}

/// Config for a command; any load or validation problem is root-scope.
pub fn command_config() -> Result<ArchiverConfig> {
    load_config().map_err(|err| ArchiverError::InvalidConfig(format!("{err:#}")).into())
}
