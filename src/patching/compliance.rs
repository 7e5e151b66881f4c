//! OSS compliance bundle: download, install, run and clean up.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::steps::{StepCommand, run_command};

pub const DEFAULT_BUNDLE_URL: &str =
    "https://aws-dlinfra-utilities.s3.amazonaws.com/oss_compliance.zip";

const ARTIFACT_PREFIX: &str = "oss_compliance";
const BUNDLE_DIR: &str = "oss_compliance";
const TOOL_NAME: &str = "testOSSCompliance";

/// Where the bundle is unpacked and which interpreter runs it.
#[derive(Debug, Clone)]
pub struct ComplianceBundle {
    pub url: String,
    pub home: PathBuf,
    pub install_dir: PathBuf,
    pub python: String,
}

impl ComplianceBundle {
    pub fn zip_path(&self) -> PathBuf {
        self.home.join(format!("{}.zip", ARTIFACT_PREFIX))
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.home.join(BUNDLE_DIR)
    }

    /// Download, unpack, install the test tool and generate the report.
    pub async fn run(&self) -> Result<()> {
        self.download().await?;
        run_command(
            "compliance",
            &StepCommand::new("unzip")
                .arg("-o")
                .arg(self.zip_path())
                .arg("-d")
                .arg(&self.home),
        )
        .await?;
        self.install_tool()?;
        run_command(
            "compliance",
            &StepCommand::new("bash")
                .arg(self.bundle_dir().join("generate_oss_compliance.sh"))
                .arg(&self.home)
                .arg(&self.python),
        )
        .await
    }

    async fn download(&self) -> Result<()> {
        let start_time = Instant::now();
        let zip_path = self.zip_path();
        info!(url = %self.url, destination = %zip_path.display(), "Downloading compliance bundle");

        let response = reqwest::get(&self.url)
            .await
            .with_context(|| format!("Failed to download {}", self.url))?
            .error_for_status()
            .with_context(|| format!("Compliance bundle request rejected: {}", self.url))?;
        let bytes = response
            .bytes()
            .await
            .context("Failed to read compliance bundle body")?;

        tokio::fs::write(&zip_path, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", zip_path.display()))?;

        info!(
            size_bytes = bytes.len(),
            duration_seconds = start_time.elapsed().as_secs_f64(),
            "Compliance bundle downloaded"
        );
        Ok(())
    }

    /// Copy `testOSSCompliance` into the install dir and make it executable.
    pub fn install_tool(&self) -> Result<PathBuf> {
        let source = self.bundle_dir().join("test").join(TOOL_NAME);
        let target = self.install_dir.join(TOOL_NAME);

        fs::copy(&source, &target).with_context(|| {
            format!("Failed to copy {} to {}", source.display(), target.display())
        })?;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to chmod {}", target.display()))?;

        debug!(tool = %target.display(), "Installed compliance test tool");
        Ok(target)
    }
}

/// Remove `oss_compliance*` entries under `home`. Returns what was removed.
pub fn remove_artifacts(home: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(home) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", home.display())),
    };

    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {}", home.display()))?;
        if !entry.file_name().to_string_lossy().starts_with(ARTIFACT_PREFIX) {
            continue;
        }
        let path = entry.path();
        remove_path(&path)?;
        removed.push(path);
    }
    removed.sort();
    Ok(removed)
}

/// Remove a file or directory tree. Missing paths are fine.
pub fn remove_path(path: &Path) -> Result<bool> {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => Err(e),
    };
    result.with_context(|| format!("Failed to remove {}", path.display()))?;
    Ok(true)
}
