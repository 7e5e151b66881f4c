//! ECR image scanning: findings download and scan status polling.

use std::time::{Duration, Instant};

use anyhow::Result;
use aws_config::SdkConfig;
use aws_sdk_ecr::Client;
use aws_sdk_ecr::types::{
    EnhancedImageScanFinding, ImageIdentifier, ImageScanFinding,
    PackageVulnerabilityDetails as SdkPackageDetails, Remediation as SdkRemediation,
};
use tracing::{debug, info};

use crate::error::CvegateError;
use crate::image::ImageUri;
use crate::scan::finding::{
    BasicFinding, CvssScore, EnhancedFinding, FindingAttribute, ImageId, ImageScanFindings,
    ImageScanStatus, PackageVulnerabilityDetails, Recommendation, Remediation, ScanFindingsDocument,
    VulnerablePackage,
};
use crate::severity::CveSeverity;

/// Basic scans finish quickly; poll every second for up to ten minutes.
pub const BASIC_SCAN_TIMEOUT: Duration = Duration::from_secs(600);
pub const BASIC_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Enhanced scans of newly pushed images sit in PENDING for a while.
pub const ENHANCED_SCAN_TIMEOUT: Duration = Duration::from_secs(1200);
pub const ENHANCED_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Progress of a basic scan as reported by `imageScanStatus.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicScanProgress {
    InProgress,
    Complete,
    Failed,
}

impl BasicScanProgress {
    /// No status yet counts as in progress. Anything unexpected is a failure.
    pub fn from_status(status: Option<&str>) -> Self {
        match status {
            None | Some("IN_PROGRESS") => Self::InProgress,
            Some("COMPLETE") => Self::Complete,
            Some(_) => Self::Failed,
        }
    }
}

/// ECR client wrapper for scan operations.
#[derive(Clone)]
pub struct EcrClient {
    client: Client,
}

impl EcrClient {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }

    /// Download every page of scan findings for an image.
    pub async fn fetch_findings(&self, image: &ImageUri) -> Result<ScanFindingsDocument> {
        let start_time = Instant::now();
        let mut document = ScanFindingsDocument {
            repository_name: Some(image.repository.clone()),
            image_id: Some(ImageId {
                image_digest: None,
                image_tag: Some(image.tag.clone()),
            }),
            image_scan_status: None,
            image_scan_findings: ImageScanFindings::default(),
        };
        let mut next_token: Option<String> = None;
        let mut pages = 0;

        loop {
            let response = self
                .client
                .describe_image_scan_findings()
                .registry_id(&image.account_id)
                .repository_name(&image.repository)
                .image_id(image_identifier(image))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| CvegateError::aws("ecr::describe_image_scan_findings", e))?;
            pages += 1;

            if let Some(status) = response.image_scan_status() {
                document.image_scan_status = Some(ImageScanStatus {
                    status: status.status().map(|s| s.as_str().to_string()),
                    description: status.description().map(str::to_string),
                });
            }

            if let Some(findings) = response.image_scan_findings() {
                document
                    .image_scan_findings
                    .findings
                    .extend(findings.findings().iter().map(convert_basic_finding));
                document
                    .image_scan_findings
                    .enhanced_findings
                    .extend(findings.enhanced_findings().iter().map(convert_enhanced_finding));
            }

            match response.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        info!(
            image = %image,
            pages,
            findings = document.image_scan_findings.findings.len(),
            enhanced_findings = document.image_scan_findings.enhanced_findings.len(),
            duration_seconds = start_time.elapsed().as_secs_f64(),
            "Fetched scan findings"
        );

        Ok(document)
    }

    pub async fn start_basic_scan(&self, image: &ImageUri) -> Result<()> {
        info!(image = %image, "Starting ECR basic scan");

        self.client
            .start_image_scan()
            .registry_id(&image.account_id)
            .repository_name(&image.repository)
            .image_id(image_identifier(image))
            .send()
            .await
            .map_err(|e| CvegateError::aws("ecr::start_image_scan", e))?;

        Ok(())
    }

    /// Poll until the basic scan reports COMPLETE.
    pub async fn wait_for_basic_scan(
        &self,
        image: &ImageUri,
        max_wait: Duration,
        check_interval: Duration,
    ) -> Result<()> {
        poll_basic_scan(image, max_wait, check_interval, || self.scan_status(image)).await
    }

    /// Poll until continuous enhanced scanning reports the image ACTIVE.
    ///
    /// `ScanNotFoundException` is expected right after a push and is retried.
    pub async fn wait_for_enhanced_scan(
        &self,
        image: &ImageUri,
        max_wait: Duration,
        check_interval: Duration,
    ) -> Result<()> {
        poll_enhanced_scan(image, max_wait, check_interval, || self.scan_status(image)).await
    }

    async fn scan_status(&self, image: &ImageUri) -> Result<ScanStatus, ScanStatusError> {
        let response = self
            .client
            .describe_image_scan_findings()
            .registry_id(&image.account_id)
            .repository_name(&image.repository)
            .image_id(image_identifier(image))
            .max_results(1)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .is_some_and(|service| service.is_scan_not_found_exception());
                if not_found {
                    ScanStatusError::NotFound
                } else {
                    ScanStatusError::Other(
                        CvegateError::aws("ecr::describe_image_scan_findings", e).into(),
                    )
                }
            })?;

        let status = response.image_scan_status();
        Ok((
            status
                .and_then(|s| s.status())
                .map(|s| s.as_str().to_string()),
            status.and_then(|s| s.description()).map(str::to_string),
        ))
    }
}

/// Status and description from `imageScanStatus`.
type ScanStatus = (Option<String>, Option<String>);

async fn poll_basic_scan<S, Fut>(
    image: &ImageUri,
    max_wait: Duration,
    check_interval: Duration,
    mut fetch_status: S,
) -> Result<()>
where
    S: FnMut() -> Fut,
    Fut: Future<Output = Result<ScanStatus, ScanStatusError>>,
{
    let wait_start_time = Instant::now();
    let mut checks_performed = 0;
    let mut last_status: Option<String> = None;

    while wait_start_time.elapsed() <= max_wait {
        let (status, description) = fetch_status().await.map_err(|e| e.into_error(image))?;
        checks_performed += 1;

        debug!(
            check_number = checks_performed,
            status = status.as_deref().unwrap_or("NONE"),
            elapsed_seconds = wait_start_time.elapsed().as_secs_f64(),
            "Basic scan status check"
        );

        match BasicScanProgress::from_status(status.as_deref()) {
            BasicScanProgress::Complete => {
                info!(
                    image = %image,
                    checks_performed,
                    duration_seconds = wait_start_time.elapsed().as_secs_f64(),
                    "ECR basic scan completed"
                );
                return Ok(());
            }
            BasicScanProgress::Failed => {
                return Err(CvegateError::ScanFailed {
                    image: image.to_string(),
                    description: description.unwrap_or_else(|| {
                        format!("status {}", status.as_deref().unwrap_or("unknown"))
                    }),
                }
                .into());
            }
            BasicScanProgress::InProgress => {}
        }

        last_status = status;
        tokio::time::sleep(check_interval).await;
    }

    Err(CvegateError::Timeout {
        operation: "ECR basic scan".to_string(),
        details: format!(
            "still in {} state after {:.1}s",
            last_status.as_deref().unwrap_or("unknown"),
            wait_start_time.elapsed().as_secs_f64()
        ),
    }
    .into())
}

async fn poll_enhanced_scan<S, Fut>(
    image: &ImageUri,
    max_wait: Duration,
    check_interval: Duration,
    mut fetch_status: S,
) -> Result<()>
where
    S: FnMut() -> Fut,
    Fut: Future<Output = Result<ScanStatus, ScanStatusError>>,
{
    let wait_start_time = Instant::now();
    let mut checks_performed = 0;
    let mut last_status: Option<String> = None;
    let mut last_description: Option<String> = None;

    while wait_start_time.elapsed() <= max_wait {
        checks_performed += 1;
        match fetch_status().await {
            Ok((status, description)) => {
                debug!(
                    check_number = checks_performed,
                    status = status.as_deref().unwrap_or("NONE"),
                    elapsed_seconds = wait_start_time.elapsed().as_secs_f64(),
                    "Enhanced scan status check"
                );
                if status.as_deref() == Some("ACTIVE") {
                    info!(
                        image = %image,
                        checks_performed,
                        duration_seconds = wait_start_time.elapsed().as_secs_f64(),
                        "ECR enhanced scan is active"
                    );
                    return Ok(());
                }
                last_status = status;
                last_description = description;
            }
            Err(ScanStatusError::NotFound) => {
                info!(
                    image = %image,
                    check_number = checks_performed,
                    "Scan not registered yet for newly pushed image"
                );
            }
            Err(ScanStatusError::Other(e)) => return Err(e),
        }

        tokio::time::sleep(check_interval).await;
    }

    Err(CvegateError::Timeout {
        operation: "ECR enhanced scan".to_string(),
        details: format!(
            "still in {} state with description: {}",
            last_status.as_deref().unwrap_or("unknown"),
            last_description.as_deref().unwrap_or("")
        ),
    }
    .into())
}

enum ScanStatusError {
    NotFound,
    Other(anyhow::Error),
}

impl ScanStatusError {
    fn into_error(self, image: &ImageUri) -> anyhow::Error {
        match self {
            ScanStatusError::NotFound => CvegateError::ScanFailed {
                image: image.to_string(),
                description: "no scan found for image".to_string(),
            }
            .into(),
            ScanStatusError::Other(e) => e,
        }
    }
}

fn image_identifier(image: &ImageUri) -> ImageIdentifier {
    ImageIdentifier::builder().image_tag(&image.tag).build()
}

fn convert_basic_finding(finding: &ImageScanFinding) -> BasicFinding {
    BasicFinding {
        name: finding.name().unwrap_or_default().to_string(),
        description: finding.description().map(str::to_string),
        uri: finding.uri().map(str::to_string),
        severity: finding
            .severity()
            .and_then(|s| s.as_str().parse().ok())
            .unwrap_or(CveSeverity::Undefined),
        attributes: finding
            .attributes()
            .iter()
            .map(|attribute| FindingAttribute {
                key: attribute.key().to_string(),
                value: attribute.value().map(str::to_string),
            })
            .collect(),
    }
}

fn convert_enhanced_finding(finding: &EnhancedImageScanFinding) -> EnhancedFinding {
    EnhancedFinding {
        description: finding.description().unwrap_or_default().to_string(),
        package_vulnerability_details: finding
            .package_vulnerability_details()
            .map(convert_package_details)
            .unwrap_or_default(),
        remediation: finding
            .remediation()
            .map(convert_remediation)
            .unwrap_or_default(),
        severity: finding.severity().unwrap_or_default().to_string(),
        status: finding.status().unwrap_or_default().to_string(),
        title: finding.title().unwrap_or_default().to_string(),
    }
}

fn convert_package_details(details: &SdkPackageDetails) -> PackageVulnerabilityDetails {
    PackageVulnerabilityDetails {
        vulnerability_id: details.vulnerability_id().unwrap_or_default().to_string(),
        source: details.source().unwrap_or_default().to_string(),
        source_url: details.source_url().unwrap_or_default().to_string(),
        cvss: details
            .cvss()
            .iter()
            .map(|score| CvssScore {
                base_score: score.base_score(),
                version: score.version().unwrap_or_default().to_string(),
                scoring_vector: score.scoring_vector().map(str::to_string),
                source: score.source().map(str::to_string),
            })
            .collect(),
        vulnerable_packages: details
            .vulnerable_packages()
            .iter()
            .map(|package| VulnerablePackage {
                name: package.name().unwrap_or_default().to_string(),
                version: package.version().unwrap_or_default().to_string(),
                file_path: package.file_path().map(str::to_string),
                package_manager: package.package_manager().map(str::to_string),
                release: package.release().map(str::to_string),
            })
            .collect(),
    }
}

fn convert_remediation(remediation: &SdkRemediation) -> Remediation {
    Remediation {
        recommendation: remediation.recommendation().map(|recommendation| Recommendation {
            text: recommendation.text().map(str::to_string),
            url: recommendation.url().map(str::to_string),
        }),
    }
}
