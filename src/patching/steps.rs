//! Patch steps, their records, and child process execution.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::CvegateError;

/// The pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchStep {
    Archive,
    Promote,
    InstallLanguage,
    InstallOs,
    DeriveHistory,
    ExtractAptPatchData,
    Compliance,
    Cleanup,
}

impl PatchStep {
    pub const ALL: [PatchStep; 8] = [
        PatchStep::Archive,
        PatchStep::Promote,
        PatchStep::InstallLanguage,
        PatchStep::InstallOs,
        PatchStep::DeriveHistory,
        PatchStep::ExtractAptPatchData,
        PatchStep::Compliance,
        PatchStep::Cleanup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PatchStep::Archive => "archive",
            PatchStep::Promote => "promote",
            PatchStep::InstallLanguage => "install-language",
            PatchStep::InstallOs => "install-os",
            PatchStep::DeriveHistory => "derive-history",
            PatchStep::ExtractAptPatchData => "extract-apt-patch-data",
            PatchStep::Compliance => "compliance",
            PatchStep::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for PatchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Planned,
    Completed,
    Skipped,
    Failed,
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: PatchStep,
    pub status: StepStatus,
    pub detail: String,
    pub duration_seconds: f64,
}

/// A program and its arguments, run from `current_dir` when set.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
}

impl StepCommand {
    pub fn new<S: Into<OsString>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg<S: Into<OsString>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }
}

impl fmt::Display for StepCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Run a command with inherited stdout/stderr. A non-zero exit fails the step.
pub async fn run_command(step: &str, command: &StepCommand) -> Result<()> {
    let start_time = Instant::now();
    debug!(step, command = %command, "Running command");

    let mut process = Command::new(&command.program);
    process
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if let Some(dir) = &command.current_dir {
        process.current_dir(dir);
    }

    let status = process.status().await.map_err(|e| CvegateError::StepFailed {
        step: step.to_string(),
        details: format!("failed to spawn '{}': {}", command, e),
    })?;

    if !status.success() {
        return Err(CvegateError::StepFailed {
            step: step.to_string(),
            details: format!("'{}' exited with {}", command, status),
        }
        .into());
    }

    info!(
        step,
        command = %command,
        duration_seconds = start_time.elapsed().as_secs_f64(),
        "Command finished"
    );
    Ok(())
}
