//! CVE records in allowlist format.

use serde::{Deserialize, Serialize};

use super::finding::{EnhancedFinding, Remediation, VulnerablePackage};
use crate::severity::CveSeverity;

/// One CVE against one package, as stored in `*.os_scan_allowlist.json` reports.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AllowlistVulnerability {
    pub description: String,
    pub vulnerability_id: String,
    pub name: String,
    pub package_name: String,
    pub package_details: PackageDetails,
    #[serde(default)]
    pub remediation: Remediation,
    pub cvss_v3_score: f64,
    pub cvss_v30_score: f64,
    pub cvss_v2_score: f64,
    pub cvss_v3_severity: CveSeverity,
    pub source_url: String,
    pub source: String,
    pub severity: String,
    pub status: String,
    pub title: String,
}

/// The `package_details` block of an allowlist record.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PackageDetails {
    pub file_path: Option<String>,
    pub name: String,
    pub package_manager: Option<String>,
    pub version: String,
    pub release: Option<String>,
}

impl PackageDetails {
    /// Equal apart from `version`, which tracks whatever is installed in the image.
    pub fn same_package(&self, other: &PackageDetails) -> bool {
        self.file_path == other.file_path
            && self.name == other.name
            && self.package_manager == other.package_manager
            && self.release == other.release
    }
}

impl From<&VulnerablePackage> for PackageDetails {
    fn from(package: &VulnerablePackage) -> Self {
        Self {
            file_path: package.file_path.clone(),
            name: package.name.clone(),
            package_manager: package.package_manager.clone(),
            version: package.version.clone(),
            release: package.release.clone(),
        }
    }
}

impl AllowlistVulnerability {
    /// Build one allowlist record per vulnerable package of an enhanced finding.
    pub fn from_enhanced_finding(finding: &EnhancedFinding) -> Vec<Self> {
        let details = &finding.package_vulnerability_details;
        let cvss_v3_score = details.cvss_score("3.1");

        details
            .vulnerable_packages
            .iter()
            .map(|package| Self {
                description: finding.description.clone(),
                vulnerability_id: details.vulnerability_id.clone(),
                name: details.vulnerability_id.clone(),
                package_name: package.name.clone(),
                package_details: PackageDetails::from(package),
                remediation: finding.remediation.clone(),
                cvss_v3_score,
                cvss_v30_score: details.cvss_score("3.0"),
                cvss_v2_score: details.cvss_score("2.0"),
                cvss_v3_severity: CveSeverity::from_cvss_v3(cvss_v3_score),
                source_url: details.source_url.clone(),
                source: details.source.clone(),
                severity: finding.severity.clone(),
                status: finding.status.clone(),
                title: finding.title.clone(),
            })
            .collect()
    }

    /// Same CVE on the same package, regardless of the installed version.
    pub fn is_equivalent(&self, other: &AllowlistVulnerability) -> bool {
        self.package_details.same_package(&other.package_details)
            && self.description == other.description
            && self.vulnerability_id == other.vulnerability_id
            && self.name == other.name
            && self.package_name == other.package_name
            && self.remediation == other.remediation
            && self.cvss_v3_score == other.cvss_v3_score
            && self.cvss_v30_score == other.cvss_v30_score
            && self.cvss_v2_score == other.cvss_v2_score
            && self.cvss_v3_severity == other.cvss_v3_severity
            && self.source_url == other.source_url
            && self.source == other.source
            && self.severity == other.severity
            && self.status == other.status
            && self.title == other.title
    }

    pub fn is_os_package(&self) -> bool {
        self.package_details.package_manager.as_deref() == Some("OS")
    }

    pub fn is_python_package(&self) -> bool {
        self.package_details.package_manager.as_deref() == Some("PYTHONPKG")
    }
}
