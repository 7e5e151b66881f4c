//! Patch bookkeeping for a released DLC image.
//!
//! Steps run strictly in order and the first failure stops the run. The
//! archive and promote steps are idempotent per released image SHA: a rerun
//! after a later step failed skips them instead of failing on the missing
//! `patch-details-current` directory.

pub mod compliance;
pub mod layout;
pub mod steps;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tracing::{Instrument, error, info, info_span};

use compliance::ComplianceBundle;
use layout::{PatchLayout, PromotionState};
use steps::{PatchStep, StepCommand, StepRecord, StepStatus, run_command};

/// Everything a patch run needs.
#[derive(Debug, Clone)]
pub struct PatchOptions {
    pub released_image_sha: String,
    pub base_path: PathBuf,
    /// Directory holding `derive_history.py` and `extract_apt_patch_data.py`.
    pub scripts_dir: PathBuf,
    pub python: String,
    pub home: PathBuf,
    pub install_dir: PathBuf,
    pub compliance_url: String,
    pub skip_compliance: bool,
    /// Extra directories removed by the cleanup step.
    pub temp_dirs: Vec<PathBuf>,
    pub dry_run: bool,
}

/// Whether a step runs, and why not when it does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDecision {
    Run(String),
    Skip(String),
}

#[derive(Debug, Serialize)]
pub struct PatchSummary {
    pub status: String,
    pub released_image_sha: String,
    pub base_path: PathBuf,
    pub dry_run: bool,
    pub total_execution_time_seconds: f64,
    pub steps: Vec<StepRecord>,
}

impl PatchSummary {
    pub fn new(options: &PatchOptions, status: &str, elapsed: f64, steps: Vec<StepRecord>) -> Self {
        Self {
            status: status.to_string(),
            released_image_sha: options.released_image_sha.clone(),
            base_path: options.base_path.clone(),
            dry_run: options.dry_run,
            total_execution_time_seconds: elapsed,
            steps,
        }
    }
}

/// Decide every step up front. Fails before anything is touched when the
/// promotion cannot happen.
pub fn plan(options: &PatchOptions) -> Result<Vec<(PatchStep, StepDecision)>> {
    let layout = PatchLayout::new(&options.base_path);
    let state = layout.promotion_state(&options.released_image_sha)?;
    let details = layout.details_dir();

    let decisions = PatchStep::ALL
        .iter()
        .map(|step| {
            let decision = match (step, state) {
                (PatchStep::Archive | PatchStep::Promote, PromotionState::AlreadyPromoted) => {
                    StepDecision::Skip(format!(
                        "already promoted for {}",
                        options.released_image_sha
                    ))
                }
                (PatchStep::Archive, PromotionState::Pending { archive_existing: false }) => {
                    StepDecision::Skip("no previous patch details".to_string())
                }
                (PatchStep::Archive, _) => StepDecision::Run(format!(
                    "move {} to {}",
                    details.display(),
                    layout.archive_dir().display()
                )),
                (PatchStep::Promote, _) => StepDecision::Run(format!(
                    "move {} to {}",
                    layout.current_dir().display(),
                    details.display()
                )),
                (PatchStep::Compliance, _) if options.skip_compliance => {
                    StepDecision::Skip("compliance disabled".to_string())
                }
                (PatchStep::Cleanup, _) => StepDecision::Run(format!(
                    "remove {}/oss_compliance* and {} temp dir(s)",
                    options.home.display(),
                    options.temp_dirs.len()
                )),
                (PatchStep::Compliance, _) => {
                    StepDecision::Run(format!("download and run {}", options.compliance_url))
                }
                _ => StepDecision::Run(
                    step_command(*step, options, &layout)
                        .map(|command| command.to_string())
                        .unwrap_or_default(),
                ),
            };
            (*step, decision)
        })
        .collect();

    Ok(decisions)
}

/// Run the pipeline, appending a record per step as it goes.
pub async fn execute(options: &PatchOptions, records: &mut Vec<StepRecord>) -> Result<()> {
    let decisions = plan(options)?;
    let layout = PatchLayout::new(&options.base_path);

    for (step, decision) in decisions {
        let detail = match decision {
            StepDecision::Skip(reason) => {
                info!(step = step.name(), reason = %reason, "Skipping patch step");
                records.push(StepRecord {
                    step,
                    status: StepStatus::Skipped,
                    detail: reason,
                    duration_seconds: 0.0,
                });
                continue;
            }
            StepDecision::Run(detail) => detail,
        };

        if options.dry_run {
            records.push(StepRecord {
                step,
                status: StepStatus::Planned,
                detail,
                duration_seconds: 0.0,
            });
            continue;
        }

        let step_start_time = Instant::now();
        let result = run_step(step, options, &layout)
            .instrument(info_span!("patch_step", step = step.name()))
            .await;
        let duration_seconds = step_start_time.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                info!(step = step.name(), duration_seconds, "Patch step completed");
                records.push(StepRecord {
                    step,
                    status: StepStatus::Completed,
                    detail,
                    duration_seconds,
                });
            }
            Err(e) => {
                error!(step = step.name(), duration_seconds, error = %e, "Patch step failed");
                records.push(StepRecord {
                    step,
                    status: StepStatus::Failed,
                    detail: e.to_string(),
                    duration_seconds,
                });
                return Err(e);
            }
        }
    }

    Ok(())
}

async fn run_step(step: PatchStep, options: &PatchOptions, layout: &PatchLayout) -> Result<()> {
    match step {
        PatchStep::Archive => layout.archive_details().map(|_| ()),
        PatchStep::Promote => layout.promote_current(&options.released_image_sha),
        PatchStep::Compliance => compliance_bundle(options).run().await,
        PatchStep::Cleanup => cleanup(options),
        _ => match step_command(step, options, layout) {
            Some(command) => run_command(step.name(), &command).await,
            None => Ok(()),
        },
    }
}

/// External command behind a script step.
fn step_command(step: PatchStep, options: &PatchOptions, layout: &PatchLayout) -> Option<StepCommand> {
    let details = layout.details_dir();
    let command = match step {
        PatchStep::InstallLanguage => {
            StepCommand::new("bash").arg(details.join("install_script_language.sh"))
        }
        PatchStep::InstallOs => StepCommand::new("bash").arg(details.join("install_script_os.sh")),
        PatchStep::DeriveHistory => {
            StepCommand::new(&options.python).arg(options.scripts_dir.join("derive_history.py"))
        }
        PatchStep::ExtractAptPatchData => StepCommand::new(&options.python)
            .arg(options.scripts_dir.join("extract_apt_patch_data.py"))
            .arg("--save-result-path")
            .arg(details.join("os_summary.json"))
            .arg("--mode_type")
            .arg("modify"),
        _ => return None,
    };
    Some(command.current_dir(layout.base()))
}

fn compliance_bundle(options: &PatchOptions) -> ComplianceBundle {
    ComplianceBundle {
        url: options.compliance_url.clone(),
        home: options.home.clone(),
        install_dir: options.install_dir.clone(),
        python: options.python.clone(),
    }
}

fn cleanup(options: &PatchOptions) -> Result<()> {
    let removed = compliance::remove_artifacts(&options.home)?;
    let mut removed_count = removed.len();
    for dir in &options.temp_dirs {
        if compliance::remove_path(dir)? {
            removed_count += 1;
        }
    }
    info!(removed = removed_count, "Removed temporary files");
    Ok(())
}
