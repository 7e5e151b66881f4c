//! cvegate - ECR scan allowlist gate and DLC patch bookkeeping CLI.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{Instrument, debug, error, info, info_span, warn};

use cvegate::aws::{self, ecr, ecr::EcrClient, s3::S3Uploader};
use cvegate::config::{Args, Command, Config, ScanFormat};
use cvegate::image::{ImageUri, minimum_severity_threshold, os_scan_allowlist_path};
use cvegate::logging;
use cvegate::output;
use cvegate::patching::{self, PatchOptions, PatchSummary};
use cvegate::remediation::{AptPatchEvaluation, ImpactedPackages, ignorable_packages, run_failure_routine};
use cvegate::scan::allowlist::{AllowlistFormat, BasicScan, EnhancedScan, EnhancedScanList, VulnerabilityList};
use cvegate::scan::finding::ScanFindingsDocument;
use cvegate::scan::validate::validate_report;
use cvegate::scan::{read_findings, to_indented_json};
use cvegate::severity::CveSeverity;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = Config::from_args(args);

    if let Err(e) = logging::init(config.log_format, &config.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    debug!("Starting cvegate");

    match run(&config).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Dispatch the subcommand. `Ok(false)` means the gate failed.
async fn run(config: &Config) -> Result<bool> {
    let sdk_config = if config.needs_aws() {
        Some(aws::load_config(config.profile.as_deref(), config.region.as_deref()).await)
    } else {
        None
    };

    match &config.command {
        Command::Validate { report, json } => run_validate(report, *json),
        Command::Convert {
            findings,
            format,
            minimum_severity,
            output,
        } => {
            let document = read_findings(findings)?;
            match format {
                ScanFormat::Basic => {
                    convert_with::<BasicScan>(&document, *minimum_severity, output.as_deref())
                }
                ScanFormat::Enhanced => {
                    convert_with::<EnhancedScan>(&document, *minimum_severity, output.as_deref())
                }
            }
        }
        Command::Fetch {
            image,
            format,
            start_scan,
            wait,
            output,
        } => {
            let image: ImageUri = image.parse()?;
            let client = EcrClient::new(require_sdk(&sdk_config)?);
            let document = fetch(&client, &image, *format, *start_scan, *wait).await?;
            let content = to_indented_json(&document)?;
            match output {
                Some(path) => {
                    fs::write(path, content)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!(path = %path.display(), "Scan findings saved");
                }
                None => println!("{}", content),
            }
            Ok(true)
        }
        Command::Check {
            image,
            findings,
            format,
            allowlist,
            dockerfile,
            generic_image,
            minimum_severity,
            json,
        } => {
            let image: ImageUri = image.parse()?;
            let threshold =
                minimum_severity.unwrap_or_else(|| minimum_severity_threshold(&image, *generic_image));
            let allowlist = allowlist.clone().or_else(|| {
                dockerfile
                    .as_deref()
                    .map(|dockerfile| os_scan_allowlist_path(dockerfile, &image))
            });

            let document = match findings {
                Some(path) => read_findings(path)?,
                None => {
                    let client = EcrClient::new(require_sdk(&sdk_config)?);
                    fetch(&client, &image, *format, false, true).await?
                }
            };

            let _span = info_span!("check", image = %image, threshold = %threshold).entered();
            match format {
                ScanFormat::Basic => {
                    check_with::<BasicScan>(&document, allowlist.as_deref(), threshold, *json)
                }
                ScanFormat::Enhanced => {
                    check_with::<EnhancedScan>(&document, allowlist.as_deref(), threshold, *json)
                }
            }
        }
        Command::Fixable {
            image,
            format,
            current,
            upgraded,
            dockerfile,
            allowlist,
            output_dir,
            s3_bucket,
            generic_image,
        } => {
            let image: ImageUri = image.parse()?;
            let inputs = FixableInputs {
                threshold: minimum_severity_threshold(&image, *generic_image),
                allowlist: allowlist
                    .clone()
                    .unwrap_or_else(|| os_scan_allowlist_path(dockerfile, &image)),
                image,
                current,
                upgraded,
                dockerfile,
                output_dir,
            };

            let output_files = match format {
                ScanFormat::Basic => fixable_with::<BasicScan>(&inputs)?,
                ScanFormat::Enhanced => fixable_with::<EnhancedScan>(&inputs)?,
            };

            if let Some(bucket) = s3_bucket {
                let uploader = S3Uploader::new(require_sdk(&sdk_config)?, bucket);
                uploader.upload_files(&output_files).await?;
            }
            Ok(true)
        }
        Command::Ignorable {
            remaining,
            fresh,
            embedded,
            json,
        } => run_ignorable(remaining, fresh, embedded.as_deref(), *json),
        Command::Patch {
            released_image_sha,
            base_path,
            scripts_dir,
            python,
            home,
            install_dir,
            compliance_url,
            skip_compliance,
            temp_dirs,
        } => {
            let options = PatchOptions {
                released_image_sha: released_image_sha.clone(),
                base_path: base_path.clone(),
                scripts_dir: scripts_dir.clone().unwrap_or_else(|| base_path.clone()),
                python: python.clone(),
                home: home.clone(),
                install_dir: install_dir.clone(),
                compliance_url: compliance_url.clone(),
                skip_compliance: *skip_compliance,
                temp_dirs: temp_dirs.clone(),
                dry_run: config.dry_run,
            };
            run_patch(&options).await
        }
    }
}

fn require_sdk(sdk_config: &Option<aws_config::SdkConfig>) -> Result<&aws_config::SdkConfig> {
    sdk_config
        .as_ref()
        .context("AWS configuration was not loaded for this command")
}

fn run_validate(report: &Path, json: bool) -> Result<bool> {
    let content = fs::read_to_string(report)
        .with_context(|| format!("Failed to read report: {}", report.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Report is not valid JSON: {}", report.display()))?;

    let result = validate_report(&value);
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        output::print_validation_report(&result);
    }

    info!(
        report = %report.display(),
        packages = result.packages,
        records = result.records,
        issues = result.issues.len(),
        "Validation finished"
    );
    Ok(result.is_valid())
}

fn convert_with<F: AllowlistFormat>(
    document: &ScanFindingsDocument,
    minimum_severity: CveSeverity,
    output: Option<&Path>,
) -> Result<bool> {
    let list = VulnerabilityList::<F>::from_scan_findings(document, minimum_severity);

    match output {
        Some(_) if list.is_empty() => {
            warn!(
                minimum_severity = %minimum_severity,
                "No vulnerabilities at or above threshold, nothing written"
            );
        }
        Some(path) => {
            list.save(path)?;
            info!(
                path = %path.display(),
                format = F::LABEL,
                packages = list.packages().len(),
                records = list.len(),
                "Allowlist report saved"
            );
        }
        None => println!("{}", list.to_json()?),
    }
    Ok(true)
}

async fn fetch(
    client: &EcrClient,
    image: &ImageUri,
    format: ScanFormat,
    start_scan: bool,
    wait: bool,
) -> Result<ScanFindingsDocument> {
    match format {
        ScanFormat::Basic => {
            if start_scan {
                client.start_basic_scan(image).await?;
            }
            if start_scan || wait {
                client
                    .wait_for_basic_scan(image, ecr::BASIC_SCAN_TIMEOUT, ecr::BASIC_SCAN_INTERVAL)
                    .await?;
            }
        }
        ScanFormat::Enhanced => {
            if start_scan {
                warn!("Enhanced scanning is continuous, ignoring --start-scan");
            }
            if wait {
                client
                    .wait_for_enhanced_scan(
                        image,
                        ecr::ENHANCED_SCAN_TIMEOUT,
                        ecr::ENHANCED_SCAN_INTERVAL,
                    )
                    .await?;
            }
        }
    }
    client.fetch_findings(image).await
}

/// Allowlist at `path`, or `None` when the file does not exist.
fn load_allowlist<F: AllowlistFormat>(
    path: Option<&Path>,
    minimum_severity: CveSeverity,
) -> Result<Option<VulnerabilityList<F>>> {
    match path {
        Some(path) if path.exists() => {
            let allowlist = VulnerabilityList::<F>::from_file(path, minimum_severity)?;
            info!(
                path = %path.display(),
                packages = allowlist.packages().len(),
                records = allowlist.len(),
                "Using allowlist"
            );
            Ok(Some(allowlist))
        }
        Some(path) => {
            warn!(path = %path.display(), "Allowlist not found, checking without one");
            Ok(None)
        }
        None => Ok(None),
    }
}

fn check_with<F: AllowlistFormat>(
    document: &ScanFindingsDocument,
    allowlist_path: Option<&Path>,
    threshold: CveSeverity,
    json: bool,
) -> Result<bool> {
    let scan = VulnerabilityList::<F>::from_scan_findings(document, threshold);
    let allowlist = load_allowlist::<F>(allowlist_path, threshold)?;
    let remaining = scan.difference(allowlist.as_ref());

    match &remaining {
        Some(remaining) if json => println!("{}", remaining.to_json()?),
        Some(remaining) => output::print_vulnerability_list("Remaining vulnerabilities", remaining),
        None if json => println!("{{}}"),
        None => println!("No vulnerabilities above the threshold remain."),
    }

    let remaining_count = remaining.as_ref().map(VulnerabilityList::len).unwrap_or(0);
    info!(
        format = F::LABEL,
        scanned = scan.len(),
        remaining = remaining_count,
        "Allowlist check finished"
    );
    Ok(remaining.is_none())
}

struct FixableInputs<'a> {
    image: ImageUri,
    threshold: CveSeverity,
    allowlist: PathBuf,
    current: &'a Path,
    upgraded: &'a Path,
    dockerfile: &'a Path,
    output_dir: &'a Path,
}

fn fixable_with<F: AllowlistFormat>(inputs: &FixableInputs<'_>) -> Result<Vec<PathBuf>> {
    let allowlist = load_allowlist::<F>(Some(&inputs.allowlist), inputs.threshold)?
        .unwrap_or_else(|| VulnerabilityList::new(inputs.threshold));
    let current =
        VulnerabilityList::<F>::from_scan_findings(&read_findings(inputs.current)?, inputs.threshold);
    let upgraded =
        VulnerabilityList::<F>::from_scan_findings(&read_findings(inputs.upgraded)?, inputs.threshold);

    let summary = run_failure_routine(
        &inputs.image,
        inputs.dockerfile,
        &allowlist,
        &current,
        &upgraded,
        inputs.output_dir,
    )?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary.output_files)
}

fn run_ignorable(
    remaining: &Path,
    fresh: &Path,
    embedded: Option<&Path>,
    json: bool,
) -> Result<bool> {
    let remaining = EnhancedScanList::from_file(remaining, CveSeverity::Undefined)?;
    let impacted = ImpactedPackages::from_list(&remaining);
    let fresh = AptPatchEvaluation::from_file(fresh)?;
    let embedded = match embedded {
        Some(path) => AptPatchEvaluation::from_file(path)?,
        None => AptPatchEvaluation::default(),
    };

    let messages = ignorable_packages(&impacted, &fresh, &embedded);
    if json {
        let report = json!({
            "impacted_os_packages": impacted.os,
            "impacted_python_packages": impacted.python,
            "ignorable_packages": messages,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        output::print_ignorable(&messages);
    }

    info!(
        impacted_os = impacted.os.len(),
        impacted_python = impacted.python.len(),
        ignorable = messages.len(),
        "Ignorable package evaluation finished"
    );
    Ok(true)
}

async fn run_patch(options: &PatchOptions) -> Result<bool> {
    let span = info_span!(
        "patch",
        released_image_sha = %options.released_image_sha,
        base_path = %options.base_path.display()
    );
    span.in_scope(|| info!(dry_run = options.dry_run, "Patch bookkeeping started"));

    let start_time = Instant::now();
    let mut records = Vec::new();
    let result = patching::execute(options, &mut records)
        .instrument(span.clone())
        .await;
    let _span = span.entered();
    let total_time = start_time.elapsed().as_secs_f64();

    match result {
        Ok(()) => {
            let status = if options.dry_run { "DryRun" } else { "Success" };
            let summary = PatchSummary::new(options, status, total_time, records);
            if options.dry_run {
                output::print_patch_steps(&summary.steps);
            } else {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            info!(
                status = "success",
                total_execution_seconds = total_time,
                "Patch bookkeeping completed"
            );
            Ok(true)
        }
        Err(e) => {
            let summary = PatchSummary::new(options, "Failed", total_time, records);
            println!("{}", serde_json::to_string_pretty(&summary)?);
            error!(
                status = "failed",
                total_execution_seconds = total_time,
                "Patch bookkeeping failed"
            );
            Err(e)
        }
    }
}
